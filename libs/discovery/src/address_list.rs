//! Address bookkeeping for one service.
//!
//! The watch loop owns an [`AddressTracker`] and is its only writer. Whenever the
//! tracked set changes it publishes an immutable [`AddressList`] snapshot through an
//! `ArcSwap`, so balancer-side readers never contend with the writer.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::DiscoveryError;
use crate::model::{InstanceAddress, KeyValue, WatchEvent, instance_from_key};

/// Immutable view of a service's addresses at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressList {
    addresses: Vec<InstanceAddress>,
    version: u64,
}

impl AddressList {
    #[must_use]
    pub fn new(addresses: Vec<InstanceAddress>, version: u64) -> Self {
        Self { addresses, version }
    }

    /// Addresses in the order they were first seen.
    #[must_use]
    pub fn addresses(&self) -> &[InstanceAddress] {
        &self.addresses
    }

    /// Incremented on every publish.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    #[must_use]
    pub fn contains(&self, addr: &InstanceAddress) -> bool {
        self.addresses.contains(addr)
    }

    /// `host:port` strings, handy for logs and assertions.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.addresses.iter().map(ToString::to_string).collect()
    }
}

/// Receives every published address list.
///
/// Called once synchronously with the initial snapshot, then from the resolver's
/// background task after every net change. Implementations must not block.
pub trait AddressUpdater: Send + Sync {
    fn update_addresses(&self, list: &AddressList);
}

impl<F> AddressUpdater for F
where
    F: Fn(&AddressList) + Send + Sync,
{
    fn update_addresses(&self, list: &AddressList) {
        self(list);
    }
}

/// Ordered, deduplicated working set driven by snapshots and watch events.
#[derive(Debug, Default, Clone)]
pub struct AddressTracker {
    addresses: Vec<InstanceAddress>,
}

impl AddressTracker {
    /// Build the working set from a prefix read.
    ///
    /// Values that do not parse are skipped and returned so the caller can log them.
    #[must_use]
    pub fn from_snapshot(kvs: &[KeyValue]) -> (Self, Vec<DiscoveryError>) {
        let mut tracker = Self::default();
        let mut rejected = Vec::new();
        for kv in kvs {
            match kv.value.parse::<InstanceAddress>() {
                Ok(addr) => {
                    tracker.insert(addr);
                }
                Err(_) => rejected.push(DiscoveryError::KeyDecode(kv.key.clone())),
            }
        }
        (tracker, rejected)
    }

    #[must_use]
    pub fn addresses(&self) -> &[InstanceAddress] {
        &self.addresses
    }

    #[must_use]
    pub fn contains(&self, addr: &InstanceAddress) -> bool {
        self.addresses.contains(addr)
    }

    /// Returns `true` if `addr` was not present yet.
    pub fn insert(&mut self, addr: InstanceAddress) -> bool {
        if self.contains(&addr) {
            return false;
        }
        self.addresses.push(addr);
        true
    }

    /// Returns `true` if `addr` was present. Keeps the order of the rest.
    pub fn remove(&mut self, addr: &InstanceAddress) -> bool {
        match self.addresses.iter().position(|a| a == addr) {
            Some(pos) => {
                self.addresses.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Apply one watch event. Returns whether the set changed.
    ///
    /// A `Put` carries the address in its value; a `Delete` only has the key, so the
    /// address is taken from the key suffix.
    ///
    /// # Errors
    /// Returns `DiscoveryError::KeyDecode` when no address can be derived. The set is
    /// left untouched.
    pub fn apply(&mut self, event: &WatchEvent) -> Result<bool, DiscoveryError> {
        match event {
            WatchEvent::Put { key, value } => {
                let addr: InstanceAddress = value
                    .parse()
                    .map_err(|_| DiscoveryError::KeyDecode(key.clone()))?;
                Ok(self.insert(addr))
            }
            WatchEvent::Delete { key } => {
                let addr = instance_from_key(key)?;
                Ok(self.remove(&addr))
            }
        }
    }

    /// Replace the set with a fresh snapshot.
    ///
    /// Addresses present in both keep their position, vanished ones are dropped and new
    /// ones are appended in snapshot order. Returns whether the set changed.
    pub fn reconcile(&mut self, snapshot: AddressTracker) -> bool {
        let mut next: Vec<InstanceAddress> = self
            .addresses
            .iter()
            .filter(|a| snapshot.contains(a))
            .cloned()
            .collect();
        for addr in snapshot.addresses {
            if !next.contains(&addr) {
                next.push(addr);
            }
        }
        let changed = next != self.addresses;
        self.addresses = next;
        changed
    }
}

/// Publishes tracker states to readers and to the balancer callback.
pub(crate) struct AddressPublisher {
    current: Arc<ArcSwap<AddressList>>,
    updater: Arc<dyn AddressUpdater>,
}

impl AddressPublisher {
    pub(crate) fn new(updater: Arc<dyn AddressUpdater>) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(AddressList::default())),
            updater,
        }
    }

    pub(crate) fn shared(&self) -> Arc<ArcSwap<AddressList>> {
        Arc::clone(&self.current)
    }

    pub(crate) fn publish(&self, tracker: &AddressTracker) -> Arc<AddressList> {
        let version = self.current.load().version() + 1;
        let list = Arc::new(AddressList::new(tracker.addresses().to_vec(), version));
        self.current.store(Arc::clone(&list));
        self.updater.update_addresses(&list);
        list
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    fn addr(s: &str) -> InstanceAddress {
        s.parse().unwrap()
    }

    fn put(addr: &str) -> WatchEvent {
        WatchEvent::Put {
            key: format!("svc/{addr}"),
            value: addr.to_owned(),
        }
    }

    fn del(addr: &str) -> WatchEvent {
        WatchEvent::Delete {
            key: format!("svc/{addr}"),
        }
    }

    fn strings(t: &AddressTracker) -> Vec<String> {
        t.addresses().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn duplicate_put_is_noop() {
        let mut t = AddressTracker::default();
        assert!(t.apply(&put("1.1.1.1:1")).unwrap());
        assert!(!t.apply(&put("1.1.1.1:1")).unwrap());
        assert_eq!(strings(&t), vec!["1.1.1.1:1"]);
    }

    #[test]
    fn delete_of_unknown_is_noop() {
        let mut t = AddressTracker::default();
        assert!(!t.apply(&del("9.9.9.9:9")).unwrap());
    }

    #[test]
    fn malformed_delete_leaves_set_unchanged() {
        let mut t = AddressTracker::default();
        t.apply(&put("1.1.1.1:1")).unwrap();

        let err = t
            .apply(&WatchEvent::Delete {
                key: "garbage".to_owned(),
            })
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::KeyDecode(_)));
        assert_eq!(strings(&t), vec!["1.1.1.1:1"]);
    }

    #[test]
    fn removal_preserves_insertion_order() {
        let mut t = AddressTracker::default();
        for a in ["a:1", "b:2", "c:3"] {
            t.apply(&put(a)).unwrap();
        }
        t.apply(&del("a:1")).unwrap();
        assert_eq!(strings(&t), vec!["b:2", "c:3"]);
    }

    #[test]
    fn converges_to_last_event_per_address() {
        // Final set = addresses whose last event was a put.
        let events = [
            put("a:1"),
            put("b:2"),
            del("a:1"),
            put("c:3"),
            put("a:1"),
            del("b:2"),
            del("c:3"),
            put("c:3"),
            put("b:2"),
            del("b:2"),
        ];
        let mut t = AddressTracker::default();
        for e in &events {
            t.apply(e).unwrap();
        }
        assert_eq!(strings(&t), vec!["a:1", "c:3"]);
    }

    #[test]
    fn every_short_event_sequence_converges() {
        const MAX_LEN: usize = 6;
        let alphabet = [
            ("a:1", true),
            ("a:1", false),
            ("b:2", true),
            ("b:2", false),
        ];

        let mut sequences: Vec<Vec<(&str, bool)>> = vec![Vec::new()];
        let mut frontier = sequences.clone();
        for _ in 0..MAX_LEN {
            frontier = frontier
                .iter()
                .flat_map(|seq| {
                    alphabet.iter().map(move |step| {
                        let mut next = seq.clone();
                        next.push(*step);
                        next
                    })
                })
                .collect();
            sequences.extend(frontier.iter().cloned());
        }
        assert_eq!(sequences.len(), 5461);

        for seq in &sequences {
            let mut tracker = AddressTracker::default();
            let mut last_put: BTreeMap<&str, bool> = BTreeMap::new();
            for &(address, is_put) in seq {
                let was_present = last_put.get(address).copied().unwrap_or(false);
                let event = if is_put { put(address) } else { del(address) };
                let changed = tracker.apply(&event).unwrap();
                last_put.insert(address, is_put);
                assert_eq!(changed, was_present != is_put, "sequence {seq:?}");
            }

            let expected: Vec<String> = last_put
                .iter()
                .filter(|(_, is_put)| **is_put)
                .map(|(address, _)| (*address).to_owned())
                .collect();
            let mut actual = strings(&tracker);
            actual.sort();
            assert_eq!(actual, expected, "sequence {seq:?}");
        }
    }

    #[test]
    fn snapshot_skips_bad_values() {
        let kvs = vec![
            KeyValue {
                key: "svc/1.1.1.1:1".to_owned(),
                value: "1.1.1.1:1".to_owned(),
            },
            KeyValue {
                key: "svc/bad".to_owned(),
                value: "not an address".to_owned(),
            },
        ];
        let (t, rejected) = AddressTracker::from_snapshot(&kvs);
        assert_eq!(strings(&t), vec!["1.1.1.1:1"]);
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn reconcile_keeps_survivors_in_place() {
        let mut t = AddressTracker::default();
        for a in ["a:1", "b:2", "c:3"] {
            t.insert(addr(a));
        }
        let mut snap = AddressTracker::default();
        for a in ["d:4", "c:3", "a:1"] {
            snap.insert(addr(a));
        }

        assert!(t.reconcile(snap.clone()));
        assert_eq!(strings(&t), vec!["a:1", "c:3", "d:4"]);
        assert!(!t.reconcile(snap));
    }

    #[test]
    fn publisher_bumps_version_and_notifies() {
        let seen: Arc<Mutex<Vec<(u64, Vec<String>)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let publisher = AddressPublisher::new(Arc::new(move |l: &AddressList| {
            sink.lock().push((l.version(), l.to_strings()));
        }));
        let shared = publisher.shared();

        let mut t = AddressTracker::default();
        publisher.publish(&t);
        t.insert(addr("1.1.1.1:1"));
        publisher.publish(&t);

        assert_eq!(shared.load().version(), 2);
        assert_eq!(
            *seen.lock(),
            vec![(1, vec![]), (2, vec!["1.1.1.1:1".to_owned()])]
        );
    }
}
