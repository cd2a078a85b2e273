use super::{
    bucket::Bucket,
    contact::{Contact, ContactState},
};
use crate::config::Config;
use std::net::SocketAddr;
use crate::id::{Kuid, KUID_BITS};

/// Which contacts `RouteTable::select` may return.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Every live contact regardless of its state.
    All,
    /// Only contacts known to be alive and not shutting down.
    Alive,
    /// Like `Alive`, with the local node competing as a virtual candidate.
    AliveWithLocal,
}

/// What `RouteTable::add` did with a contact.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted as a live contact.
    Added,
    /// Merged into an existing entry.
    Updated,
    /// The bucket was full, the contact went into its replacement cache.
    Cached,
    /// Firewalled contacts and the local node are never added.
    Ignored,
}

/// Routing table containing a table of contacts as well as the local node's contact.
pub struct RouteTable {
    // Important: Our node id will always fall within the range
    // of the last bucket in the buckets array.
    buckets: Vec<Bucket>,
    local: Contact,
    k: usize,
    max_cache_size: usize,
    max_unknown_failures: u32,
    max_alive_failures: u32,
    max_consecutive_failures: u32,
    max_bucket_depth: usize,
    consecutive_failures: u32,
}

impl RouteTable {
    pub fn new(local: Contact, config: &Config) -> RouteTable {
        RouteTable {
            buckets: vec![Bucket::new()],
            local,
            k: config.k.max(1),
            max_cache_size: config.max_cache_size,
            max_unknown_failures: config.max_unknown_failures.max(1),
            max_alive_failures: config.max_alive_failures.max(1),
            max_consecutive_failures: config.max_consecutive_failures,
            max_bucket_depth: config.max_bucket_depth.min(KUID_BITS - 1),
            consecutive_failures: 0,
        }
    }

    pub fn local_id(&self) -> Kuid {
        self.local.id()
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn is_local_node_id(&self, id: &Kuid) -> bool {
        self.local.id() == *id
    }

    /// Change the local instance id, typically after a restart that kept the node id.
    pub fn set_local_instance_id(&mut self, instance_id: u8) {
        self.local = self.local.clone().with_instance_id(instance_id);
    }

    /// Replication parameter the table was built with.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Iterator over all buckets in the routing table.
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> + ExactSizeIterator {
        self.buckets.iter()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of live contacts, dead ones included.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(Bucket::live_count).sum()
    }

    pub fn live_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.live_contacts().cloned())
            .collect()
    }

    pub fn cached_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.cached_contacts().cloned())
            .collect()
    }

    /// Exact lookup among live and cached contacts.
    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    /// Id of the live or cached contact known at `addr`.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Kuid> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.live_contacts().chain(bucket.cached_contacts()))
            .find(|contact| contact.addr() == addr)
            .map(|contact| contact.id())
    }

    /// True when every bucket holds `k` live contacts.
    pub fn is_full(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_live_full(self.k))
    }

    /// Insert or refresh a contact.
    ///
    /// Known contacts are updated in place. New contacts are inserted as live if their bucket
    /// has room or can be split, replace a dead live contact if there is one, and otherwise
    /// land in the bucket's replacement cache.
    ///
    /// Dead contacts are the only live contacts `add` ever evicts.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        if contact.is_firewalled() {
            log::trace!("Not adding firewalled contact {:?}", contact);
            return AddOutcome::Ignored;
        }

        if self.is_local_node_id(&contact.id()) {
            log::trace!("Not adding contact with the local node id {:?}", contact);
            return AddOutcome::Ignored;
        }

        if contact.is_alive() {
            self.consecutive_failures = 0;
        }

        loop {
            let index = self.bucket_index(&contact.id());
            let k = self.k;
            let bucket = &mut self.buckets[index];

            if bucket.update(&contact) {
                // A cached contact that turns out to be alive takes a free live slot.
                if !bucket.is_live_full(k) {
                    if let Some(cached) = bucket.remove_cached(&contact.id()) {
                        bucket.add_live(cached);
                    }
                }
                return AddOutcome::Updated;
            }

            if !bucket.is_live_full(k) {
                bucket.add_live(contact);
                return AddOutcome::Added;
            }

            if self.split_bucket(index) {
                continue;
            }

            let bucket = &mut self.buckets[index];
            if let Some(dead) = bucket.dead_live_contact() {
                log::debug!("Replacing dead contact {:?} with {:?}", dead, contact);
                bucket.remove_live(&dead);
                bucket.add_live(contact);
                return AddOutcome::Added;
            }

            log::trace!("Adding {:?} to the replacement cache", contact);
            if let Some(evicted) = bucket.add_cached(contact, self.max_cache_size) {
                log::trace!("Evicted {:?} from the replacement cache", evicted);
            }
            return AddOutcome::Cached;
        }
    }

    /// Record a failed request to `id` at `addr`.
    ///
    /// Once the contact reaches its failure threshold it is dead; a dead live contact is
    /// replaced by the most recently seen contact of the bucket's replacement cache, a dead
    /// cached contact is dropped.
    pub fn handle_failure(&mut self, id: &Kuid, addr: SocketAddr) {
        // This should never happen.
        if self.is_local_node_id(id) {
            log::error!("Local node marked as failed");
            return;
        }

        let index = self.bucket_index(id);
        let (max_unknown, max_alive) = (self.max_unknown_failures, self.max_alive_failures);
        let bucket = &mut self.buckets[index];

        let contact = match bucket.get_mut(id) {
            Some(contact) => contact,
            None => return,
        };

        if contact.addr() != addr {
            log::debug!(
                "Ignoring failure of {:?} at {}, it has moved to {}",
                id,
                addr,
                contact.addr()
            );
            return;
        }

        if self.consecutive_failures >= self.max_consecutive_failures {
            log::trace!("Ignoring failure of {:?} as it appears we are disconnected", id);
            return;
        }
        self.consecutive_failures += 1;

        if !contact.handle_failure(max_unknown, max_alive) {
            return;
        }

        if bucket.contains_live(id) {
            if let Some(mut replacement) = bucket.take_most_recently_seen_cached() {
                log::debug!("Replacing dead contact {:?} with cached {:?}", id, replacement);
                bucket.remove_live(id);
                replacement.set_unknown();
                bucket.add_live(replacement);
            }
        } else {
            log::trace!("Removing dead contact {:?} from the replacement cache", id);
            bucket.remove_cached(id);
        }
    }

    /// Refresh the last seen time of a known contact without touching membership.
    pub fn update_timestamp(&mut self, contact: &Contact) {
        let index = self.bucket_index(&contact.id());
        let bucket = &mut self.buckets[index];

        if let Some(existing) = bucket.get_mut(&contact.id()) {
            existing.touch();
            bucket.touch();
        }
    }

    /// Up to `count` contacts ordered by XOR distance to `target`, nearest first.
    pub fn select(&self, target: &Kuid, count: usize, mode: SelectMode) -> Vec<Contact> {
        let mut contacts: Vec<&Contact> = self
            .buckets
            .iter()
            .flat_map(Bucket::live_contacts)
            .filter(|contact| match mode {
                SelectMode::All => true,
                SelectMode::Alive | SelectMode::AliveWithLocal => contact.is_selectable(),
            })
            .collect();

        if mode == SelectMode::AliveWithLocal {
            contacts.push(&self.local);
        }

        contacts.sort_by(|a, b| target.cmp_distance(&a.id(), &b.id()));
        contacts.into_iter().take(count).cloned().collect()
    }

    /// Number of contacts in the given state.
    pub fn count(&self, state: ContactState) -> usize {
        self.buckets
            .iter()
            .flat_map(Bucket::live_contacts)
            .filter(|contact| contact.state() == state)
            .count()
    }

    pub fn clear(&mut self) {
        self.buckets = vec![Bucket::new()];
        self.consecutive_failures = 0;
    }

    fn bucket_index(&self, id: &Kuid) -> usize {
        bucket_placement(self.local.id().common_prefix_len(id), self.buckets.len())
    }

    /// Tries to split the bucket at the specified index.
    ///
    /// Returns false if the split cannot be performed.
    fn split_bucket(&mut self, bucket_index: usize) -> bool {
        if !can_split_bucket(self.buckets.len(), bucket_index, self.max_bucket_depth) {
            return false;
        }

        let split_bucket = match self.buckets.pop() {
            Some(bucket) => bucket,
            None => return false,
        };

        log::trace!("Splitting bucket {}", bucket_index);

        // Push two more buckets to distribute contacts between
        self.buckets.push(Bucket::new());
        self.buckets.push(Bucket::new());

        let (live, cached) = split_bucket.drain();
        for contact in live {
            let index = self.bucket_index(&contact.id());
            self.buckets[index].add_live(contact);
        }

        for contact in cached {
            let index = self.bucket_index(&contact.id());
            let bucket = &mut self.buckets[index];

            if bucket.is_live_full(self.k) {
                bucket.add_cached(contact, self.max_cache_size);
            } else {
                bucket.add_live(contact);
            }
        }

        true
    }
}

/// Returns true if the bucket can be split: only the last bucket covers the local id.
fn can_split_bucket(num_buckets: usize, bucket_index: usize, max_depth: usize) -> bool {
    bucket_index == num_buckets - 1 && bucket_index < max_depth
}

/// Take the number of leading bits that are the same between our node and the remote
/// node and calculate a bucket index for that node id.
fn bucket_placement(num_same_bits: usize, num_buckets: usize) -> usize {
    num_same_bits.min(num_buckets - 1)
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::KUID_LEN;
    use crate::test;

    fn config(k: usize) -> Config {
        Config {
            k,
            max_cache_size: 4,
            max_unknown_failures: 2,
            max_alive_failures: 2,
            ..Config::default()
        }
    }

    fn table(local_id: Kuid, k: usize) -> RouteTable {
        RouteTable::new(test::alive_contact(local_id, 1000), &config(k))
    }

    /// Ids that all share their first bit with each other but not with `Kuid::MIN`.
    fn far_ids(count: u8) -> Vec<Kuid> {
        (0..count)
            .map(|index| {
                let mut bytes = [0u8; KUID_LEN];
                bytes[0] = 0x80;
                bytes[KUID_LEN - 1] = index;
                Kuid::from(bytes)
            })
            .collect()
    }

    #[test]
    fn positive_initial_empty_table() {
        let table = table(Kuid::MIN, 3);

        assert_eq!(table.bucket_count(), 1);
        assert_eq!(table.size(), 0);
        assert!(!table.is_full());
    }

    #[test]
    fn positive_far_bucket_overflows_into_cache() {
        let mut table = table(Kuid::MIN, 3);

        let outcomes: Vec<_> = far_ids(6)
            .into_iter()
            .enumerate()
            .map(|(port, id)| table.add(test::alive_contact(id, 2000 + port as u16)))
            .collect();

        // The fourth contact splits the local bucket, the far half then fills up.
        assert_eq!(&outcomes[..3], &[AddOutcome::Added; 3]);
        assert_eq!(&outcomes[3..], &[AddOutcome::Cached; 3]);
        assert_eq!(table.bucket_count(), 2);

        for bucket in table.buckets() {
            assert!(bucket.live_count() <= 3);
        }
        assert_eq!(table.cached_contacts().len(), 3);
    }

    #[test]
    fn positive_live_contacts_never_evicted_by_add() {
        let mut table = table(Kuid::MIN, 2);
        let ids = far_ids(10);

        for (port, id) in ids.iter().enumerate() {
            table.add(test::alive_contact(*id, 2000 + port as u16));

            for bucket in table.buckets() {
                assert!(bucket.live_count() <= 2);
            }
        }

        // The first two far contacts are still there.
        let live: Vec<_> = table.live_contacts().iter().map(|c| c.id()).collect();
        assert!(live.contains(&ids[0]));
        assert!(live.contains(&ids[1]));
    }

    #[test]
    fn positive_local_bucket_splits_recursively() {
        let local_id = Kuid::from([1u8; KUID_LEN]);
        let mut table = table(local_id, 2);

        // Differ from the local id only in the last bit.
        let near_id = local_id.flip_bit(KUID_LEN * 8 - 1);
        table.add(test::alive_contact(near_id, 2000));
        table.add(test::alive_contact(local_id.flip_bit(0), 2001));
        table.add(test::alive_contact(local_id.flip_bit(1), 2002));

        assert!(table.bucket_count() > 1);
        assert!(table.get(&near_id).is_some());
        assert_eq!(table.size(), 3);
    }

    #[test]
    fn negative_local_and_firewalled_not_added() {
        let local_id = test::dummy_node_id();
        let mut table = table(local_id, 3);

        assert_eq!(table.add(test::alive_contact(local_id, 2000)), AddOutcome::Ignored);

        let firewalled = test::alive_contact(Kuid::random(), 2001).with_firewalled(true);
        assert_eq!(table.add(firewalled.clone()), AddOutcome::Ignored);

        assert_eq!(table.size(), 0);
        assert!(table.get(&firewalled.id()).is_none());
    }

    #[test]
    fn positive_add_existing_updates_in_place() {
        let mut table = table(Kuid::MIN, 3);
        let id = far_ids(1)[0];

        assert_eq!(table.add(test::alive_contact(id, 2000)), AddOutcome::Added);
        let outcome = table.add(test::alive_contact(id, 2001).with_instance_id(3));

        assert_eq!(outcome, AddOutcome::Updated);
        assert_eq!(table.size(), 1);
        let contact = table.get(&id).unwrap();
        assert_eq!(contact.addr().port(), 2001);
        assert_eq!(contact.instance_id(), 3);
    }

    #[test]
    fn positive_stale_contact_replaced_from_cache() {
        let mut table = table(Kuid::MIN, 2);
        let ids = far_ids(4);
        let contacts: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(port, id)| test::alive_contact(*id, 2000 + port as u16))
            .collect();

        for contact in &contacts {
            table.add(contact.clone());
        }

        let victim = &contacts[0];
        assert!(table.buckets().any(|b| b.contains_live(&victim.id())));

        // The most recently seen cached contact is the last one added.
        table.handle_failure(&victim.id(), victim.addr());
        assert!(table.get(&victim.id()).is_some());

        table.handle_failure(&victim.id(), victim.addr());
        assert!(table.get(&victim.id()).is_none());

        let promoted = table.get(&ids[3]).unwrap();
        assert_eq!(promoted.state(), ContactState::Unknown);
        assert!(table.buckets().any(|b| b.contains_live(&ids[3])));
        assert!(table.buckets().any(|b| b.contains_cached(&ids[2])));
    }

    #[test]
    fn positive_dead_contact_kept_without_replacement() {
        let mut table = table(Kuid::MIN, 3);
        let contact = test::alive_contact(far_ids(1)[0], 2000);
        table.add(contact.clone());

        table.handle_failure(&contact.id(), contact.addr());
        table.handle_failure(&contact.id(), contact.addr());

        assert!(table.get(&contact.id()).unwrap().is_dead());
        assert!(table.select(&Kuid::MIN, 3, SelectMode::Alive).is_empty());
        assert_eq!(table.select(&Kuid::MIN, 3, SelectMode::All).len(), 1);
    }

    #[test]
    fn negative_failure_at_other_address_ignored() {
        let mut table = table(Kuid::MIN, 3);
        let contact = test::alive_contact(far_ids(1)[0], 2000);
        table.add(contact.clone());

        let other_addr = test::dummy_block_socket_addrs(1)[0];
        for _ in 0..5 {
            table.handle_failure(&contact.id(), other_addr);
        }

        assert!(table.get(&contact.id()).unwrap().is_alive());
    }

    #[test]
    fn positive_consecutive_failure_guard() {
        let mut table = RouteTable::new(
            test::alive_contact(Kuid::MIN, 1000),
            &Config {
                max_consecutive_failures: 1,
                ..config(3)
            },
        );
        let ids = far_ids(2);
        let first = test::alive_contact(ids[0], 2000);
        let second = test::alive_contact(ids[1], 2001);
        table.add(first.clone());
        table.add(second.clone());

        table.handle_failure(&first.id(), first.addr());
        table.handle_failure(&second.id(), second.addr());

        assert_eq!(table.get(&first.id()).unwrap().failures(), 1);
        assert_eq!(table.get(&second.id()).unwrap().failures(), 0);

        // A successful contact resets the guard.
        table.add(first.clone());
        table.handle_failure(&second.id(), second.addr());
        assert_eq!(table.get(&second.id()).unwrap().failures(), 1);
    }

    #[test]
    fn positive_select_distance_order() {
        let mut table = table(Kuid::MAX, 20);
        let distances = [40u64, 5, 17, 9, 33, 1];

        for (port, distance) in distances.iter().enumerate() {
            table.add(test::alive_contact(test::id_at_distance(*distance), 2000 + port as u16));
        }

        let selected = table.select(&Kuid::MIN, 4, SelectMode::All);
        let ids: Vec<_> = selected.iter().map(|c| c.id()).collect();

        assert_eq!(
            ids,
            vec![
                test::id_at_distance(1),
                test::id_at_distance(5),
                test::id_at_distance(9),
                test::id_at_distance(17),
            ]
        );
    }

    #[test]
    fn positive_select_alive_with_local() {
        let local_id = test::id_at_distance(5);
        let mut table = table(local_id, 20);
        table.add(test::alive_contact(test::id_at_distance(10), 2000));
        table.add(Contact::as_unknown(test::id_at_distance(2), test::dummy_socket_addr_v4()));
        table.add(test::alive_contact(test::id_at_distance(3), 2001).with_shutdown(true));

        let alive = table.select(&Kuid::MIN, 5, SelectMode::Alive);
        assert_eq!(alive.len(), 1);

        let with_local = table.select(&Kuid::MIN, 5, SelectMode::AliveWithLocal);
        let ids: Vec<_> = with_local.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![local_id, test::id_at_distance(10)]);

        assert_eq!(table.select(&Kuid::MIN, 5, SelectMode::All).len(), 3);
    }

    #[test]
    fn positive_is_full() {
        let local_id = Kuid::MIN;
        let mut table = table(local_id, 1);

        table.add(test::alive_contact(far_ids(1)[0], 2000));
        assert!(table.is_full());

        table.add(test::alive_contact(local_id.flip_bit(5), 2001));
        assert_eq!(table.bucket_count(), 2);
        assert!(table.is_full());

        // Splitting down to the new contact leaves empty buckets in between.
        table.add(test::alive_contact(local_id.flip_bit(7), 2002));
        assert_eq!(table.bucket_count(), 7);
        assert!(!table.is_full());
    }

    #[test]
    fn positive_update_timestamp_keeps_membership() {
        let mut table = table(Kuid::MIN, 3);
        let contact = Contact::as_unknown(far_ids(1)[0], test::dummy_socket_addr_v4());
        table.add(contact.clone());

        table.update_timestamp(&contact);
        table.update_timestamp(&test::alive_contact(far_ids(2)[1], 2000));

        assert_eq!(table.size(), 1);
        assert!(table.get(&contact.id()).unwrap().last_seen().is_some());
    }

    #[test]
    fn positive_add_replaces_dead_live_contact() {
        let mut table = table(Kuid::MIN, 2);
        let ids = far_ids(3);

        table.add(test::alive_contact(ids[0], 2000));
        table.add(test::alive_contact(ids[1], 2001));

        // Nothing cached to take its place, so the dead contact stays live.
        table.handle_failure(&ids[0], test::alive_contact(ids[0], 2000).addr());
        table.handle_failure(&ids[0], test::alive_contact(ids[0], 2000).addr());
        assert!(table.get(&ids[0]).unwrap().is_dead());

        assert_eq!(table.add(test::alive_contact(ids[2], 2002)), AddOutcome::Added);

        assert!(table.get(&ids[0]).is_none());
        assert!(table.buckets().any(|b| b.contains_live(&ids[1])));
        assert!(table.buckets().any(|b| b.contains_live(&ids[2])));
        assert!(table.cached_contacts().is_empty());
    }

    #[test]
    fn positive_find_by_addr() {
        let mut table = table(Kuid::MIN, 1);
        let ids = far_ids(2);
        let live = test::alive_contact(ids[0], 2000);
        let cached = test::alive_contact(ids[1], 2001);

        table.add(live.clone());
        table.add(cached.clone());

        assert_eq!(table.find_by_addr(live.addr()), Some(live.id()));
        assert_eq!(table.find_by_addr(cached.addr()), Some(cached.id()));
        assert_eq!(table.find_by_addr(test::dummy_socket_addr_v4()), None);
    }
}
