// Bounded LRU cache module
// Hash map for O(1) lookup plus an index-linked recency list over a slot vector
// (no unsafe, no pointer juggling). The list head is the most recently used
// entry, the tail is the next eviction candidate.
//
// Not internally synchronized: callers serialize access. The scheduler's
// single-worker design already does this for the caches it owns.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Sentinel for "no link".
const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Fixed-capacity cache with least-recently-used eviction.
///
/// `add` and `try_get` count as uses and move the entry to the head of the
/// recency list; `try_peek` and `contains` never touch recency. All operations
/// are O(1) amortized.
#[derive(Debug)]
pub struct BoundedLruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedLruCache<K, V> {
    /// Create a cache holding at most `capacity` entries. Capacity is non-zero
    /// by construction.
    pub fn new(capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        Self {
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    /// Insert or update. An existing key is unlinked first so no stale
    /// duplicate can survive; a new key at capacity evicts the current tail.
    /// The entry always ends up at the head of the recency list.
    pub fn add(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            let entry = self.slots[idx]
                .as_mut()
                .expect("mapped slot must be occupied");
            entry.value = value;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        if self.map.len() == self.capacity {
            self.evict_tail();
        }

        let idx = self.alloc(Entry {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.push_front(idx);
        self.map.insert(key, idx);
    }

    /// Look up and promote: a hit counts as a use.
    pub fn try_get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.unlink(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// Look up without promoting, for introspection only.
    pub fn try_peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// O(1) existence check, no recency effect.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Drop every entry; capacity is unchanged.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn alloc(&mut self, entry: Entry<K, V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(entry);
            idx
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        }
    }

    /// Detach `idx` from the recency list, fixing up neighbours and ends.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.slots[idx].as_ref().expect("unlink of empty slot");
            (entry.prev, entry.next)
        };
        match prev {
            NIL => self.head = next,
            p => {
                if let Some(e) = self.slots[p].as_mut() {
                    e.next = next;
                }
            }
        }
        match next {
            NIL => self.tail = prev,
            n => {
                if let Some(e) = self.slots[n].as_mut() {
                    e.prev = prev;
                }
            }
        }
        if let Some(e) = self.slots[idx].as_mut() {
            e.prev = NIL;
            e.next = NIL;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(e) = self.slots[idx].as_mut() {
            e.prev = NIL;
            e.next = old_head;
        }
        match old_head {
            NIL => self.tail = idx,
            h => {
                if let Some(e) = self.slots[h].as_mut() {
                    e.prev = idx;
                }
            }
        }
        self.head = idx;
    }

    fn evict_tail(&mut self) {
        let tail = self.tail;
        if tail == NIL {
            return;
        }
        self.unlink(tail);
        if let Some(entry) = self.slots[tail].take() {
            self.map.remove(&entry.key);
        }
        self.free.push(tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cache(cap: usize) -> BoundedLruCache<u32, String> {
        BoundedLruCache::new(NonZeroUsize::new(cap).unwrap())
    }

    #[test]
    fn add_and_get() {
        let mut c = cache(4);
        c.add(1, "one".into());
        assert_eq!(c.try_get(&1).map(String::as_str), Some("one"));
        assert!(c.try_get(&2).is_none());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn capacity_plus_one_evicts_lru() {
        let mut c = cache(3);
        for k in 0..4u32 {
            c.add(k, format!("v{k}"));
        }
        // 0 was least recently used
        assert!(!c.contains(&0));
        assert!(c.contains(&1));
        assert!(c.contains(&2));
        assert!(c.contains(&3));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn try_get_protects_from_eviction() {
        let mut c = cache(3);
        c.add(1, "a".into());
        c.add(2, "b".into());
        c.add(3, "c".into());
        // Promote 1, then push in two new keys: 2 and 3 go, 1 stays.
        assert!(c.try_get(&1).is_some());
        c.add(4, "d".into());
        c.add(5, "e".into());
        assert!(c.contains(&1));
        assert!(!c.contains(&2));
        assert!(!c.contains(&3));
    }

    #[test]
    fn try_peek_does_not_affect_eviction_order() {
        let mut c = cache(2);
        c.add(1, "a".into());
        c.add(2, "b".into());
        // Peeking 1 must not rescue it.
        assert!(c.try_peek(&1).is_some());
        c.add(3, "c".into());
        assert!(!c.contains(&1));
        assert!(c.contains(&2));
        assert!(c.contains(&3));
    }

    #[test]
    fn re_add_updates_value_without_duplicate() {
        let mut c = cache(2);
        c.add(1, "old".into());
        c.add(2, "b".into());
        c.add(1, "new".into());
        assert_eq!(c.len(), 2);
        assert_eq!(c.try_peek(&1).map(String::as_str), Some("new"));
        // 1 is now most recent; adding a third key evicts 2.
        c.add(3, "c".into());
        assert!(c.contains(&1));
        assert!(!c.contains(&2));
    }

    #[test]
    fn clear_empties_everything() {
        let mut c = cache(2);
        c.add(1, "a".into());
        c.add(2, "b".into());
        c.clear();
        assert!(c.is_empty());
        assert!(!c.contains(&1));
        // Still usable after clear
        c.add(7, "g".into());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn capacity_one_behaves() {
        let mut c = cache(1);
        c.add(1, "a".into());
        c.add(2, "b".into());
        assert!(!c.contains(&1));
        assert!(c.contains(&2));
        assert_eq!(c.len(), 1);
    }

    proptest! {
        /// For any sequence of adds, len never exceeds capacity and every key
        /// reported present is actually retrievable.
        #[test]
        fn count_never_exceeds_capacity(keys in proptest::collection::vec(0u32..64, 0..256), cap in 1usize..16) {
            let mut c = BoundedLruCache::new(NonZeroUsize::new(cap).unwrap());
            for k in keys {
                c.add(k, k.to_string());
                prop_assert!(c.len() <= cap);
            }
        }

        /// The most recently added key is always present.
        #[test]
        fn newest_key_survives(keys in proptest::collection::vec(0u32..64, 1..256), cap in 1usize..16) {
            let mut c = BoundedLruCache::new(NonZeroUsize::new(cap).unwrap());
            for k in &keys {
                c.add(*k, k.to_string());
            }
            prop_assert!(c.contains(keys.last().unwrap()));
        }
    }
}
