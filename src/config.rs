use std::time::Duration;

/// Default replication parameter (bucket size and replica count).
pub const DEFAULT_K: usize = 20;

/// Tunables shared by the routing table, the database, the message handler and the worker.
#[derive(Clone, Debug)]
pub struct Config {
    /// Replication parameter `k`: maximum live contacts per bucket and number of nodes that
    /// should hold a copy of each value.
    pub k: usize,
    /// Maximum number of contacts held in each bucket's replacement cache.
    pub max_cache_size: usize,
    /// Consecutive failures after which a contact that has never answered is dead.
    pub max_unknown_failures: u32,
    /// Consecutive failures after which a contact that has answered before is dead.
    pub max_alive_failures: u32,
    /// Failures in a row, without any successful contact in between, after which further
    /// failures are ignored because the local node is most likely offline.
    pub max_consecutive_failures: u32,
    /// Deepest bucket split; a bucket at this depth is never split again.
    pub max_bucket_depth: usize,
    /// Forward values to new or restarted contacts.
    pub store_forward: bool,
    /// Drop replicated values when a new contact pushes the local node out of a key's
    /// k-closest set.
    pub delete_on_displacement: bool,
    /// Store requests need a valid security token.
    pub require_security_token: bool,
    /// Accept contacts with loopback, private or link-local addresses.
    pub allow_private_addresses: bool,
    /// How long the dispatcher waits for a response before raising a timeout.
    pub request_timeout: Duration,
    /// Lifetime of a stored value.
    pub value_lifetime: Duration,
    /// Maximum number of keys in the database, `None` for no limit.
    pub max_database_keys: Option<usize>,
    /// Maximum number of values per key, `None` for no limit.
    pub max_values_per_key: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            max_cache_size: 16,
            max_unknown_failures: 2,
            max_alive_failures: 4,
            max_consecutive_failures: 100,
            max_bucket_depth: crate::id::KUID_BITS - 1,
            store_forward: true,
            delete_on_displacement: true,
            require_security_token: true,
            allow_private_addresses: false,
            request_timeout: Duration::from_secs(5),
            value_lifetime: Duration::from_secs(60 * 60),
            max_database_keys: None,
            max_values_per_key: None,
        }
    }
}
