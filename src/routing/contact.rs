use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Instant;

use crate::id::Kuid;

/// Wire flag: the contact cannot accept unsolicited messages.
pub const FIREWALLED_FLAG: u8 = 0x01;

/// Wire flag: the contact is shutting down.
pub const SHUTDOWN_FLAG: u8 = 0x02;

/// Liveness of a contact.
/// Ordering of the enumerations is important, variants higher
/// up are considered to be less than those further down.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub enum ContactState {
    Dead,
    Unknown,
    Alive,
}

/// Participant of the DHT as seen by the local node.
///
/// Contacts are plain values. The copy living in the `RouteTable` is only ever changed through
/// the table's methods, everyone else works on clones.
#[derive(Clone)]
pub struct Contact {
    id: Kuid,
    addr: SocketAddr,
    instance_id: u8,
    firewalled: bool,
    shutdown: bool,
    state: ContactState,
    last_seen: Option<Instant>,
    failures: u32,
}

impl Contact {
    /// Contact that just talked to us directly.
    pub fn as_alive(id: Kuid, addr: SocketAddr) -> Contact {
        Contact {
            id,
            addr,
            instance_id: 0,
            firewalled: false,
            shutdown: false,
            state: ContactState::Alive,
            last_seen: Some(Instant::now()),
            failures: 0,
        }
    }

    /// Contact we only heard about from somebody else.
    pub fn as_unknown(id: Kuid, addr: SocketAddr) -> Contact {
        Contact {
            id,
            addr,
            instance_id: 0,
            firewalled: false,
            shutdown: false,
            state: ContactState::Unknown,
            last_seen: None,
            failures: 0,
        }
    }

    pub fn with_instance_id(mut self, instance_id: u8) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_firewalled(mut self, firewalled: bool) -> Self {
        self.firewalled = firewalled;
        self
    }

    pub fn with_shutdown(mut self, shutdown: bool) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Applies the wire flags (`FIREWALLED_FLAG`, `SHUTDOWN_FLAG`).
    pub fn with_flags(self, flags: u8) -> Self {
        self.with_firewalled(flags & FIREWALLED_FLAG != 0)
            .with_shutdown(flags & SHUTDOWN_FLAG != 0)
    }

    pub fn id(&self) -> Kuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.firewalled {
            flags |= FIREWALLED_FLAG;
        }
        if self.shutdown {
            flags |= SHUTDOWN_FLAG;
        }
        flags
    }

    pub fn state(&self) -> ContactState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_dead(&self) -> bool {
        self.state == ContactState::Dead
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Alive and not on its way out.
    pub(crate) fn is_selectable(&self) -> bool {
        self.is_alive() && !self.shutdown
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    /// Fold a fresh observation of the same node into this entry.
    ///
    /// Second hand (unknown) observations never move an alive contact to another address and
    /// never clear its failure count.
    pub(crate) fn merge(&mut self, observed: &Contact) {
        debug_assert_eq!(self.id, observed.id);

        if observed.is_alive() {
            self.addr = observed.addr;
            self.instance_id = observed.instance_id;
            self.firewalled = observed.firewalled;
            self.shutdown = observed.shutdown;
            self.state = ContactState::Alive;
            self.last_seen = observed.last_seen.or_else(|| Some(Instant::now()));
            self.failures = 0;
        } else if !self.is_alive() {
            self.addr = observed.addr;
            self.instance_id = observed.instance_id;
        }
    }

    /// Record a failed request. Returns true once the contact is considered dead.
    pub(crate) fn handle_failure(&mut self, max_unknown_failures: u32, max_alive_failures: u32) -> bool {
        self.failures = self.failures.saturating_add(1);

        // Nodes that answered before get a little more slack.
        let max_failures = if self.last_seen.is_some() {
            max_alive_failures
        } else {
            max_unknown_failures
        };

        if self.failures >= max_failures {
            self.state = ContactState::Dead;
        }

        self.is_dead()
    }

    /// Reset to the unknown state, used when a cached contact gets promoted.
    pub(crate) fn set_unknown(&mut self) {
        self.state = ContactState::Unknown;
        self.failures = 0;
    }
}

impl Eq for Contact {}

impl PartialEq<Contact> for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Hash for Contact {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.id.hash(state);
        self.addr.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .field("flags", &self.flags())
            .field("failures", &self.failures)
            .finish()
    }
}
