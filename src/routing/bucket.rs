use std::collections::VecDeque;
use std::time::Instant;

use crate::id::Kuid;
use crate::routing::contact::{Contact, ContactState};

/// Bucket containing contacts with identical bit prefixes.
///
/// Holds up to `k` live contacts plus a bounded replacement cache of overflow contacts. The
/// cache is kept in least recently seen to most recently seen order.
#[derive(Debug)]
pub struct Bucket {
    live: Vec<Contact>,
    cache: VecDeque<Contact>,
    last_touched: Instant,
}

impl Bucket {
    pub fn new() -> Bucket {
        Bucket {
            live: Vec::new(),
            cache: VecDeque::new(),
            last_touched: Instant::now(),
        }
    }

    /// Iterator over the live contacts of the bucket, dead ones included.
    pub fn live_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.live.iter()
    }

    /// Iterator over the replacement cache, least recently seen first.
    pub fn cached_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.cache.iter()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn cache_count(&self) -> usize {
        self.cache.len()
    }

    pub fn is_live_full(&self, k: usize) -> bool {
        self.live.len() >= k
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.live
            .iter()
            .chain(self.cache.iter())
            .find(|contact| contact.id() == *id)
    }

    pub fn contains_live(&self, id: &Kuid) -> bool {
        self.live.iter().any(|contact| contact.id() == *id)
    }

    pub fn contains_cached(&self, id: &Kuid) -> bool {
        self.cache.iter().any(|contact| contact.id() == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &Kuid) -> Option<&mut Contact> {
        self.live
            .iter_mut()
            .chain(self.cache.iter_mut())
            .find(|contact| contact.id() == *id)
    }

    /// Merge `observed` into an existing entry. A refreshed cached contact moves to the most
    /// recently seen end of the cache.
    ///
    /// Returns false if the contact is not in the bucket.
    pub(crate) fn update(&mut self, observed: &Contact) -> bool {
        if let Some(existing) = self.live.iter_mut().find(|c| c.id() == observed.id()) {
            existing.merge(observed);
            if existing.is_alive() {
                self.last_touched = Instant::now();
            }
            return true;
        }

        if let Some(index) = self.cache.iter().position(|c| c.id() == observed.id()) {
            if let Some(mut existing) = self.cache.remove(index) {
                existing.merge(observed);
                self.cache.push_back(existing);
            }
            return true;
        }

        false
    }

    pub(crate) fn add_live(&mut self, contact: Contact) {
        debug_assert!(!self.contains_live(&contact.id()));

        if contact.is_alive() {
            self.last_touched = Instant::now();
        }
        self.live.push(contact);
    }

    /// Put the contact into the replacement cache, evicting the least recently seen cached
    /// contact if the cache is full.
    ///
    /// Returns the evicted contact, if any.
    pub(crate) fn add_cached(&mut self, contact: Contact, max_cache_size: usize) -> Option<Contact> {
        if max_cache_size == 0 {
            return Some(contact);
        }

        self.cache.push_back(contact);

        if self.cache.len() > max_cache_size {
            self.cache.pop_front()
        } else {
            None
        }
    }

    pub(crate) fn remove_live(&mut self, id: &Kuid) -> Option<Contact> {
        let index = self.live.iter().position(|c| c.id() == *id)?;
        Some(self.live.remove(index))
    }

    pub(crate) fn remove_cached(&mut self, id: &Kuid) -> Option<Contact> {
        let index = self.cache.iter().position(|c| c.id() == *id)?;
        self.cache.remove(index)
    }

    /// Take the most recently seen cached contact out of the cache.
    pub(crate) fn take_most_recently_seen_cached(&mut self) -> Option<Contact> {
        self.cache.pop_back()
    }

    /// Id of a live contact that is dead and can be replaced right away.
    pub(crate) fn dead_live_contact(&self) -> Option<Kuid> {
        self.live
            .iter()
            .find(|contact| contact.state() == ContactState::Dead)
            .map(|contact| contact.id())
    }

    pub(crate) fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    /// Moves every contact out of the bucket, live contacts first.
    pub(crate) fn drain(self) -> (Vec<Contact>, VecDeque<Contact>) {
        (self.live, self.cache)
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    const K: usize = 4;

    #[test]
    fn positive_initial_no_contacts() {
        let bucket = Bucket::new();

        assert_eq!(bucket.live_count(), 0);
        assert_eq!(bucket.cache_count(), 0);
        assert!(!bucket.is_live_full(K));
    }

    #[test]
    fn positive_update_moves_cached_to_most_recent() {
        let mut bucket = Bucket::new();
        let addr = test::dummy_socket_addr_v4();
        let ids = test::dummy_block_node_ids(3);

        for id in &ids {
            bucket.add_cached(Contact::as_unknown(*id, addr), K);
        }

        assert!(bucket.update(&Contact::as_alive(ids[0], addr)));

        let order: Vec<_> = bucket.cached_contacts().map(|c| c.id()).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
        assert_eq!(bucket.take_most_recently_seen_cached().map(|c| c.id()), Some(ids[0]));
    }

    #[test]
    fn positive_cache_evicts_least_recently_seen() {
        let mut bucket = Bucket::new();
        let addr = test::dummy_socket_addr_v4();
        let ids = test::dummy_block_node_ids(3);

        assert!(bucket.add_cached(Contact::as_unknown(ids[0], addr), 2).is_none());
        assert!(bucket.add_cached(Contact::as_unknown(ids[1], addr), 2).is_none());

        let evicted = bucket.add_cached(Contact::as_unknown(ids[2], addr), 2);

        assert_eq!(evicted.map(|c| c.id()), Some(ids[0]));
        assert_eq!(bucket.cache_count(), 2);
    }

    #[test]
    fn negative_update_unknown_contact() {
        let mut bucket = Bucket::new();
        let contact = Contact::as_alive(test::dummy_node_id(), test::dummy_socket_addr_v4());

        assert!(!bucket.update(&contact));
    }

    #[test]
    fn positive_remove_live_and_cached() {
        let mut bucket = Bucket::new();
        let addr = test::dummy_socket_addr_v4();
        let ids = test::dummy_block_node_ids(2);

        bucket.add_live(Contact::as_alive(ids[0], addr));
        bucket.add_cached(Contact::as_unknown(ids[1], addr), K);

        assert!(bucket.contains_live(&ids[0]));
        assert!(bucket.contains_cached(&ids[1]));
        assert!(bucket.remove_live(&ids[0]).is_some());
        assert!(bucket.remove_cached(&ids[1]).is_some());
        assert!(bucket.get(&ids[0]).is_none());
        assert!(bucket.get(&ids[1]).is_none());
    }
}
