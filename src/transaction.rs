use sha1::{Digest, Sha1};
use std::{convert::TryInto, net::SocketAddr};

use crate::compact;

const COUNTER_LEN: usize = 8;
const TAG_LEN: usize = 4;

pub(crate) const MESSAGE_ID_LEN: usize = COUNTER_LEN + TAG_LEN;

/// Id of an outgoing request, echoed back in the response.
///
/// The id carries a keyed tag of the destination address, so a response can be attributed to
/// one of our own requests even after its receipt has expired.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub(crate) struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn from_bytes(bytes: &[u8]) -> Option<MessageId> {
        Some(MessageId(bytes.try_into().ok()?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Generates and verifies message ids.
pub(crate) struct MessageIdFactory {
    secret: [u8; 16],
    next: u64,
}

impl MessageIdFactory {
    pub fn new() -> Self {
        Self {
            secret: rand::random(),
            next: rand::random(),
        }
    }

    pub fn generate(&mut self, dst: SocketAddr) -> MessageId {
        let counter = self.next.to_be_bytes();
        self.next = self.next.wrapping_add(1);

        let mut bytes = [0u8; MESSAGE_ID_LEN];
        bytes[..COUNTER_LEN].copy_from_slice(&counter);
        bytes[COUNTER_LEN..].copy_from_slice(&self.tag(&counter, dst));

        MessageId(bytes)
    }

    /// Parses `bytes` as a message id we generated for a request to `src`.
    pub fn verify(&self, bytes: &[u8], src: SocketAddr) -> Option<MessageId> {
        let id = MessageId::from_bytes(bytes)?;
        let (counter, tag) = id.0.split_at(COUNTER_LEN);

        if self.tag(counter, src)[..] == *tag {
            Some(id)
        } else {
            None
        }
    }

    fn tag(&self, counter: &[u8], addr: SocketAddr) -> [u8; TAG_LEN] {
        let hash = Sha1::new()
            .chain_update(self.secret)
            .chain_update(counter)
            .chain_update(compact::encode_socket_addr(&addr))
            .finalize();

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&hash[..TAG_LEN]);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_verify_own_id() {
        let mut factory = MessageIdFactory::new();
        let addr = test::dummy_socket_addr_v4();

        let id = factory.generate(addr);

        assert_eq!(factory.verify(id.as_bytes(), addr), Some(id));
    }

    #[test]
    fn positive_ids_are_unique() {
        let mut factory = MessageIdFactory::new();
        let addr = test::dummy_socket_addr_v4();

        assert_ne!(factory.generate(addr), factory.generate(addr));
    }

    #[test]
    fn negative_verify_other_address() {
        let mut factory = MessageIdFactory::new();
        let addrs = test::dummy_block_socket_addrs(2);

        let id = factory.generate(addrs[0]);

        assert_eq!(factory.verify(id.as_bytes(), addrs[1]), None);
    }

    #[test]
    fn negative_verify_foreign_id() {
        let mut factory = MessageIdFactory::new();
        let other = MessageIdFactory::new();
        let addr = test::dummy_socket_addr_v4();

        let id = factory.generate(addr);

        assert_eq!(other.verify(id.as_bytes(), addr), None);
        assert_eq!(factory.verify(b"aa", addr), None);
    }
}
