//! Replication of stored values to contacts that join a key's neighbourhood.
//!
//! Whenever a new (or restarted) contact shows up, every key of the local database is
//! classified against the k closest alive contacts, the local node included:
//!
//! * if the local node is the closest holder of the key (or second to the new contact itself)
//!   and the new contact belongs to the k closest, the local copy is handed to the new contact;
//! * if the local node is the furthest of a full set of k holders and the genuinely new contact
//!   is nearer than the local node, the local replica is dropped.

use crate::{
    config::Config,
    id::Kuid,
    routing::{
        contact::{Contact, ContactState},
        table::{RouteTable, SelectMode},
    },
    storage::{Database, DhtValueEntity},
};
use std::time::Instant;

/// What to do with the values of one key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Send the local copies to the new contact.
    Forward,
    /// Drop the replicated copies; locally published values stay.
    Delete,
    /// Leave the key alone.
    Keep,
}

/// Result of a store-forward pass.
#[derive(Debug, Default)]
pub struct StoreForward {
    /// Values to send to the new contact in a single store request.
    pub forward: Vec<DhtValueEntity>,
    /// Number of replicas removed from the database.
    pub deleted: usize,
}

/// Classify `key` for the contact `node`, whose routing table entry prior to this observation
/// is `existing`.
pub fn classify(
    table: &RouteTable,
    config: &Config,
    key: &Kuid,
    node: &Contact,
    existing: Option<&Contact>,
) -> Decision {
    let k = table.k();
    let nodes = table.select(key, k, SelectMode::AliveWithLocal);

    let (closest, furthest) = match (nodes.first(), nodes.last()) {
        (Some(closest), Some(furthest)) => (closest, furthest),
        _ => return Decision::Keep,
    };

    let local_id = table.local_id();
    let node_id = node.id();

    let local_is_closest = closest.id() == local_id;
    let local_is_second = nodes.get(1).map_or(false, |second| second.id() == local_id);
    let node_is_closest = closest.id() == node_id;

    // Not strictly nearer than the furthest holder means the distances are equal, which only
    // happens when the new contact is the furthest holder itself.
    let node_qualifies = nodes.len() < k || !key.is_nearer_to(&furthest.id(), &node_id);

    if (local_is_closest || (node_is_closest && local_is_second)) && node_qualifies {
        return Decision::Forward;
    }

    let genuinely_new = existing.map_or(true, |existing| existing.state() == ContactState::Unknown);

    if config.delete_on_displacement
        && nodes.len() >= k
        && furthest.id() == local_id
        && genuinely_new
        && key.is_nearer_to(&node_id, &local_id)
    {
        return Decision::Delete;
    }

    Decision::Keep
}

/// Classify every key of the database and apply the deletions.
///
/// The caller holds the routing table for the whole pass. Values originated by `node` are
/// never forwarded back to it and expired values are skipped.
pub fn run(
    table: &RouteTable,
    database: &mut Database,
    config: &Config,
    node: &Contact,
    existing: Option<&Contact>,
) -> StoreForward {
    let now = Instant::now();
    let mut result = StoreForward::default();
    let mut to_delete = Vec::new();

    for (key, values) in database.iter() {
        match classify(table, config, key, node, existing) {
            Decision::Forward => result.forward.extend(
                values
                    .filter(|value| value.secondary_key() != node.id())
                    .filter(|value| !value.is_expired(now))
                    .cloned(),
            ),
            Decision::Delete => to_delete.extend(
                values
                    .filter(|value| !value.is_local())
                    .map(|value| (value.primary_key(), value.secondary_key())),
            ),
            Decision::Keep => (),
        }
    }

    for (primary_key, secondary_key) in to_delete {
        if database.remove(&primary_key, &secondary_key).is_some() {
            result.deleted += 1;
        }
    }

    if !result.forward.is_empty() || result.deleted > 0 {
        log::debug!(
            "Store-forward for {:?}: {} values to forward, {} replicas dropped",
            node,
            result.forward.len(),
            result.deleted
        );
    }

    result
}

// ----------------------------------------------------------------------------//
