use std::collections::{hash_map::Entry, HashMap};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::id::Kuid;

/// A single stored value.
///
/// Values are addressed by their `primary_key` (the DHT key) and, within a key, by their
/// `secondary_key` which is the id of the node that originated the value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtValueEntity {
    primary_key: Kuid,
    secondary_key: Kuid,
    payload: Vec<u8>,
    is_local: bool,
    created: Instant,
    expires: Instant,
}

impl DhtValueEntity {
    /// Value published by the local node.
    pub fn local(primary_key: Kuid, originator: Kuid, payload: Vec<u8>, lifetime: Duration) -> Self {
        Self::new(primary_key, originator, payload, true, lifetime)
    }

    /// Replica received from another node.
    pub fn remote(primary_key: Kuid, originator: Kuid, payload: Vec<u8>, lifetime: Duration) -> Self {
        Self::new(primary_key, originator, payload, false, lifetime)
    }

    fn new(
        primary_key: Kuid,
        secondary_key: Kuid,
        payload: Vec<u8>,
        is_local: bool,
        lifetime: Duration,
    ) -> Self {
        let created = Instant::now();

        Self {
            primary_key,
            secondary_key,
            payload,
            is_local,
            created,
            expires: created + lifetime,
        }
    }

    pub fn primary_key(&self) -> Kuid {
        self.primary_key
    }

    pub fn secondary_key(&self) -> Kuid {
        self.secondary_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

/// Local key/value store: primary key -> originator id -> value.
#[derive(Debug)]
pub struct Database {
    values: HashMap<Kuid, HashMap<Kuid, DhtValueEntity>>,
    max_keys: Option<usize>,
    max_values_per_key: Option<usize>,
}

impl Database {
    pub fn new(config: &Config) -> Self {
        Self {
            values: HashMap::new(),
            max_keys: config.max_database_keys,
            max_values_per_key: config.max_values_per_key,
        }
    }

    /// Store the value, replacing the previous value of the same originator under the same key.
    ///
    /// A local value is never replaced by a remote copy. Remote values are rejected once the
    /// configured limits are reached, local values are always accepted.
    ///
    /// Returns whether the value was stored.
    pub fn store(&mut self, entity: DhtValueEntity) -> bool {
        let key_count = self.values.len();

        let bag = match self.values.entry(entity.primary_key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !entity.is_local && self.max_keys.map_or(false, |max| key_count >= max) {
                    log::debug!("Database is full, rejecting {:?}", entity.primary_key);
                    return false;
                }
                entry.insert(HashMap::new())
            }
        };

        match bag.get(&entity.secondary_key) {
            Some(existing) if existing.is_local && !entity.is_local => {
                log::trace!(
                    "Not replacing local value {:?}/{:?} with a remote copy",
                    entity.primary_key,
                    entity.secondary_key
                );
                return false;
            }
            Some(_) => (),
            None => {
                if !entity.is_local
                    && self
                        .max_values_per_key
                        .map_or(false, |max| bag.len() >= max)
                {
                    log::debug!("Too many values for {:?}", entity.primary_key);

                    if bag.is_empty() {
                        self.values.remove(&entity.primary_key);
                    }
                    return false;
                }
            }
        }

        bag.insert(entity.secondary_key, entity);
        true
    }

    pub fn get(&self, primary_key: &Kuid, secondary_key: &Kuid) -> Option<&DhtValueEntity> {
        self.values.get(primary_key)?.get(secondary_key)
    }

    /// All values stored under `primary_key`.
    pub fn values<'a>(&'a self, primary_key: &Kuid) -> impl Iterator<Item = &'a DhtValueEntity> + 'a {
        self.values.get(primary_key).into_iter().flat_map(|bag| bag.values())
    }

    /// Every key along with its values.
    pub fn iter<'a>(
        &'a self,
    ) -> impl Iterator<Item = (&'a Kuid, impl Iterator<Item = &'a DhtValueEntity> + 'a)> + 'a {
        self.values.iter().map(|(key, bag)| (key, bag.values()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Kuid> {
        self.values.keys()
    }

    pub fn contains_key(&self, primary_key: &Kuid) -> bool {
        self.values.contains_key(primary_key)
    }

    pub fn remove(&mut self, primary_key: &Kuid, secondary_key: &Kuid) -> Option<DhtValueEntity> {
        let bag = self.values.get_mut(primary_key)?;
        let removed = bag.remove(secondary_key);

        if bag.is_empty() {
            self.values.remove(primary_key);
        }

        removed
    }

    /// Drop every expired value. Returns the number of values removed.
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;

        self.values.retain(|_, bag| {
            let before = bag.len();
            bag.retain(|_, entity| !entity.is_expired(now));
            removed += before - bag.len();
            !bag.is_empty()
        });

        removed
    }

    pub fn key_count(&self) -> usize {
        self.values.len()
    }

    pub fn value_count(&self) -> usize {
        self.values.values().map(HashMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    const LIFETIME: Duration = Duration::from_secs(60);

    fn database() -> Database {
        Database::new(&Config::default())
    }

    #[test]
    fn positive_store_and_get() {
        let mut db = database();
        let key = Kuid::sha1(b"key");
        let originator = test::dummy_node_id();

        assert!(db.store(DhtValueEntity::remote(key, originator, b"v1".to_vec(), LIFETIME)));

        let stored = db.get(&key, &originator).unwrap();
        assert_eq!(stored.payload(), b"v1");
        assert!(!stored.is_local());
        assert_eq!(db.key_count(), 1);
        assert_eq!(db.value_count(), 1);
    }

    #[test]
    fn positive_same_originator_replaces() {
        let mut db = database();
        let key = Kuid::sha1(b"key");
        let originator = test::dummy_node_id();

        db.store(DhtValueEntity::remote(key, originator, b"v1".to_vec(), LIFETIME));
        db.store(DhtValueEntity::remote(key, originator, b"v2".to_vec(), LIFETIME));

        assert_eq!(db.value_count(), 1);
        assert_eq!(db.get(&key, &originator).unwrap().payload(), b"v2");
    }

    #[test]
    fn negative_remote_never_overwrites_local() {
        let mut db = database();
        let key = Kuid::sha1(b"key");
        let originator = test::dummy_node_id();

        db.store(DhtValueEntity::local(key, originator, b"mine".to_vec(), LIFETIME));
        let stored = db.store(DhtValueEntity::remote(key, originator, b"theirs".to_vec(), LIFETIME));

        assert!(!stored);
        let entity = db.get(&key, &originator).unwrap();
        assert!(entity.is_local());
        assert_eq!(entity.payload(), b"mine");
    }

    #[test]
    fn positive_multiple_originators_per_key() {
        let mut db = database();
        let key = Kuid::sha1(b"key");
        let originators = test::dummy_block_node_ids(3);

        for originator in &originators {
            db.store(DhtValueEntity::remote(key, *originator, b"v".to_vec(), LIFETIME));
        }

        assert_eq!(db.key_count(), 1);
        assert_eq!(db.values(&key).count(), 3);
    }

    #[test]
    fn negative_key_limit_rejects_remote_only() {
        let mut db = Database::new(&Config {
            max_database_keys: Some(1),
            ..Config::default()
        });
        let originator = test::dummy_node_id();

        assert!(db.store(DhtValueEntity::remote(Kuid::sha1(b"a"), originator, vec![1], LIFETIME)));
        assert!(!db.store(DhtValueEntity::remote(Kuid::sha1(b"b"), originator, vec![2], LIFETIME)));
        assert!(db.store(DhtValueEntity::local(Kuid::sha1(b"c"), originator, vec![3], LIFETIME)));

        assert_eq!(db.key_count(), 2);
        assert!(!db.contains_key(&Kuid::sha1(b"b")));
    }

    #[test]
    fn negative_values_per_key_limit() {
        let mut db = Database::new(&Config {
            max_values_per_key: Some(2),
            ..Config::default()
        });
        let key = Kuid::sha1(b"key");
        let originators = test::dummy_block_node_ids(3);

        assert!(db.store(DhtValueEntity::remote(key, originators[0], vec![0], LIFETIME)));
        assert!(db.store(DhtValueEntity::remote(key, originators[1], vec![1], LIFETIME)));
        assert!(!db.store(DhtValueEntity::remote(key, originators[2], vec![2], LIFETIME)));

        // Refreshing an existing value is still allowed.
        assert!(db.store(DhtValueEntity::remote(key, originators[1], vec![9], LIFETIME)));
        assert_eq!(db.values(&key).count(), 2);
    }

    #[test]
    fn positive_remove_drops_empty_key() {
        let mut db = database();
        let key = Kuid::sha1(b"key");
        let originator = test::dummy_node_id();

        db.store(DhtValueEntity::remote(key, originator, vec![1], LIFETIME));

        assert!(db.remove(&key, &originator).is_some());
        assert!(db.remove(&key, &originator).is_none());
        assert!(!db.contains_key(&key));
    }

    #[test]
    fn positive_remove_expired() {
        let mut db = database();
        let originator = test::dummy_node_id();

        db.store(DhtValueEntity::remote(Kuid::sha1(b"old"), originator, vec![1], Duration::ZERO));
        db.store(DhtValueEntity::remote(Kuid::sha1(b"new"), originator, vec![2], LIFETIME));

        assert_eq!(db.remove_expired(Instant::now()), 1);
        assert_eq!(db.key_count(), 1);
        assert!(db.contains_key(&Kuid::sha1(b"new")));
    }
}
