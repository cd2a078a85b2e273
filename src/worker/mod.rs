pub(crate) use self::{dispatcher::Dispatcher, messenger::ChannelMessenger, socket::Socket};
pub use self::socket::SocketTrait;

use crate::{
    error::Result, id::Kuid, routing::contact::Contact, storage::DhtValueEntity,
    token::SecurityToken,
};
use std::{fmt, io, net::SocketAddr};
use thiserror::Error;
use tokio::sync::oneshot;

mod dispatcher;
mod messenger;
mod socket;
mod timer;

/// Snapshot of the node's state, can be used for debugging.
#[derive(Copy, Clone, Debug)]
pub struct State {
    pub bootstrapped: bool,
    pub alive_contacts: usize,
    pub unknown_contacts: usize,
    pub dead_contacts: usize,
    pub cached_contacts: usize,
    pub bucket_count: usize,
    pub key_count: usize,
    pub value_count: usize,
    pub internal_errors: usize,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Task that our DHT will execute immediately.
pub(crate) enum OneshotTask {
    /// Ping the node at the address. A collision ping hides the local id so that a node using
    /// the same id answers instead of flagging us.
    Ping {
        addr: SocketAddr,
        collision: bool,
        tx: oneshot::Sender<Result<Contact>>,
    },
    /// Ask the node at the address for the contacts closest to `target`.
    FindNode {
        addr: SocketAddr,
        target: Kuid,
        tx: oneshot::Sender<Result<Vec<Contact>>>,
    },
    /// Ask the node at the address for the values stored under `key`.
    FindValue {
        addr: SocketAddr,
        key: Kuid,
        tx: oneshot::Sender<Result<Vec<DhtValueEntity>>>,
    },
    /// Send values to a contact.
    Store(StoreTask),
    /// Get the local address the socket is bound to.
    GetLocalAddr(oneshot::Sender<SocketAddr>),
}

/// Values to deliver to `dst`, fetching a security token first if there is none.
#[derive(Debug)]
pub(crate) struct StoreTask {
    pub dst: Contact,
    pub token: Option<SecurityToken>,
    pub values: Vec<DhtValueEntity>,
}

#[derive(Error, Debug)]
pub(crate) enum WorkerError {
    #[error("received unsolicited response")]
    UnsolicitedResponse,
    #[error("socket error")]
    SocketError(#[from] io::Error),
}
