use std::convert::TryInto;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use crate::id::LengthError;

/// The secret changes every 10 minutes and tokens issued under the current or the previous
/// secret are accepted, so a token is valid for somewhere between 10 and 20 minutes. Issued
/// tokens are not stored; a token is the hash of the requester's address and the secret.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub const SECURITY_TOKEN_LEN: usize = 20;

/// Proof handed out in `FindNode` responses that must accompany a later store request to
/// the same node from the same address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SecurityToken([u8; SECURITY_TOKEN_LEN]);

impl SecurityToken {
    pub fn new(bytes: &[u8]) -> Result<Self, LengthError> {
        Ok(Self(bytes.try_into().map_err(|_| LengthError)?))
    }
}

impl From<[u8; SECURITY_TOKEN_LEN]> for SecurityToken {
    fn from(bytes: [u8; SECURITY_TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for SecurityToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ----------------------------------------------------------------------------//

/// Issues and verifies security tokens.
#[derive(Copy, Clone)]
pub struct TokenStore {
    curr_secret: u32,
    last_secret: u32,
    last_refresh: Instant,
}

impl TokenStore {
    pub fn new() -> TokenStore {
        // A fixed placeholder for the last secret would let anyone forge tokens against a
        // freshly started node, so both secrets start out random.
        TokenStore {
            curr_secret: rand::random(),
            last_secret: rand::random(),
            last_refresh: Instant::now(),
        }
    }

    /// Token for the node at `addr`.
    pub fn checkout(&mut self, addr: SocketAddr) -> SecurityToken {
        self.checkout_at(addr, Instant::now())
    }

    /// Is `token` valid for a request coming from `addr`?
    pub fn checkin(&mut self, addr: SocketAddr, token: SecurityToken) -> bool {
        self.checkin_at(addr, token, Instant::now())
    }

    fn checkout_at(&mut self, addr: SocketAddr, now: Instant) -> SecurityToken {
        self.refresh_check(now);
        generate_token(addr, self.curr_secret)
    }

    fn checkin_at(&mut self, addr: SocketAddr, token: SecurityToken, now: Instant) -> bool {
        self.refresh_check(now);
        generate_token(addr, self.curr_secret) == token
            || generate_token(addr, self.last_secret) == token
    }

    fn refresh_check(&mut self, now: Instant) {
        match intervals_passed(self.last_refresh, now) {
            0 => (),
            1 => {
                self.last_secret = self.curr_secret;
                self.curr_secret = rand::random();
                self.last_refresh = now;
            }
            _ => {
                self.last_secret = rand::random();
                self.curr_secret = rand::random();
                self.last_refresh = now;
            }
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Secrets are rotated lazily, so more than one interval may have passed since the last
/// refresh, in which case both secrets are stale.
fn intervals_passed(last_refresh: Instant, now: Instant) -> u64 {
    let elapsed = now.saturating_duration_since(last_refresh);
    elapsed.as_secs() / REFRESH_INTERVAL.as_secs()
}

fn generate_token(addr: SocketAddr, secret: u32) -> SecurityToken {
    let mut hasher = Sha1::new();

    match addr.ip() {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.update(addr.port().to_be_bytes());
    hasher.update(secret.to_be_bytes());

    SecurityToken(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_accept_valid_v4_token() {
        let mut store = TokenStore::new();
        let addr = test::dummy_socket_addr_v4();

        let valid_token = store.checkout(addr);

        assert!(store.checkin(addr, valid_token));
    }

    #[test]
    fn positive_accept_valid_v6_token() {
        let mut store = TokenStore::new();
        let addr = SocketAddr::new(test::dummy_ipv6_addr(), 6881);

        let valid_token = store.checkout(addr);

        assert!(store.checkin(addr, valid_token));
    }

    #[test]
    fn positive_accept_token_from_second_secret() {
        let mut store = TokenStore::new();
        let addr = test::dummy_socket_addr_v4();
        let now = Instant::now();

        let valid_token = store.checkout_at(addr, now);
        let later = now + REFRESH_INTERVAL + Duration::from_secs(60);

        assert!(store.checkin_at(addr, valid_token, later));
    }

    #[test]
    fn negative_reject_expired_token() {
        let mut store = TokenStore::new();
        let addr = test::dummy_socket_addr_v4();
        let now = Instant::now();

        let valid_token = store.checkout_at(addr, now);
        let later = now + REFRESH_INTERVAL * 2 + Duration::from_secs(1);

        assert!(!store.checkin_at(addr, valid_token, later));
    }

    #[test]
    fn negative_reject_token_from_other_address() {
        let mut store = TokenStore::new();
        let addrs = test::dummy_block_socket_addrs(2);

        let token = store.checkout(addrs[0]);

        assert!(!store.checkin(addrs[1], token));
    }

    #[test]
    fn negative_wrong_token_length() {
        assert!(SecurityToken::new(&[0u8; 8]).is_err());
        assert!(SecurityToken::new(&[0u8; SECURITY_TOKEN_LEN]).is_ok());
    }
}
