//! Kademlia routing table and store-forward replication core of a DHT node.
//!
//! The [`RouteTable`] keeps track of live and cached contacts in prefix-split buckets. The
//! [`DefaultMessageHandler`] feeds it from every message exchange and, when a contact joins the
//! neighbourhood of a stored key, forwards the values it should now hold. [`Dht`] runs the whole
//! thing over a UDP socket.

mod builder;
mod compact;
mod config;
mod error;
mod handler;
mod id;
mod message;
mod routing;
mod storage;
mod store_forward;
mod token;
mod transaction;
mod worker;

pub use crate::builder::{Dht, DhtBuilder};
pub use crate::config::{Config, DEFAULT_K};
pub use crate::error::{Error, Result};
pub use crate::handler::{
    is_private_address, DefaultMessageHandler, DispatchEvent, Messenger, ResponseKind,
};
pub use crate::id::{Kuid, LengthError, KUID_BITS, KUID_LEN};
pub use crate::routing::{
    bucket::Bucket,
    contact::{Contact, ContactState, FIREWALLED_FLAG, SHUTDOWN_FLAG},
    table::{AddOutcome, RouteTable, SelectMode},
};
pub use crate::storage::{Database, DhtValueEntity};
pub use crate::store_forward::{Decision, StoreForward};
pub use crate::token::{SecurityToken, TokenStore, SECURITY_TOKEN_LEN};
pub use crate::worker::{IpVersion, SocketTrait, State};
