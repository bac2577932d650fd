//! Handle table
//!
//! Maps the integer ids handed to the remote party onto retained engine
//! values. Ids grow monotonically from 1 and are never reused, so a
//! disposed id stays stale forever instead of aliasing a newer value.

use std::collections::HashMap;

/// Callback id reserved for the standing `fetch` callback.
pub const FETCH_CALLBACK_ID: u64 = 0;

#[derive(Debug)]
pub struct HandleTable<T> {
    entries: HashMap<u64, T>,
    next_id: u64,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Retains `value` and returns its new id.
    pub fn store(&mut self, value: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, value);
        id
    }

    pub fn resolve(&self, id: u64) -> Option<&T> {
        self.entries.get(&id)
    }

    /// Drops the retention of `id`, returning the value if it was live.
    pub fn release(&mut self, id: u64) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Drops every entry except those listed in `keep`.
    ///
    /// The id counter is not rewound: ids cleared here never come back.
    pub fn retain_only(&mut self, keep: &[u64]) {
        self.entries.retain(|id, _| keep.contains(id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ids_start_at_one() {
        let mut table = HandleTable::new();
        assert_eq!(table.store("a"), 1);
        assert_eq!(table.store("b"), 2);
        assert_eq!(table.resolve(1), Some(&"a"));
        assert_eq!(table.resolve(FETCH_CALLBACK_ID), None);
    }

    #[test]
    fn test_release_makes_id_stale() {
        let mut table = HandleTable::new();
        let id = table.store(10);
        assert_eq!(table.release(id), Some(10));
        assert_eq!(table.resolve(id), None);
        assert_eq!(table.release(id), None);
        assert_ne!(table.store(11), id);
    }

    #[test]
    fn test_retain_only_keeps_root() {
        let mut table = HandleTable::new();
        let root = table.store("root");
        let other = table.store("other");
        table.retain_only(&[root]);
        assert!(table.contains(root));
        assert!(!table.contains(other));
        assert_eq!(table.len(), 1);
        assert_eq!(table.store("next"), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Store,
        Release(usize),
        Reset,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Store),
            2 => (0usize..32).prop_map(Op::Release),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #[test]
        fn prop_id_resolvable_only_while_live(ops in proptest::collection::vec(op_strategy(), 1..64)) {
            let mut table = HandleTable::new();
            let root = table.store(0u64);
            let mut issued: Vec<u64> = vec![root];
            let mut live: Vec<u64> = vec![root];

            for op in ops {
                match op {
                    Op::Store => {
                        let id = table.store(issued.len() as u64);
                        prop_assert!(!issued.contains(&id));
                        issued.push(id);
                        live.push(id);
                    }
                    Op::Release(index) => {
                        if let Some(&id) = issued.get(index) {
                            if id != root {
                                table.release(id);
                                live.retain(|live_id| *live_id != id);
                            }
                        }
                    }
                    Op::Reset => {
                        table.retain_only(&[root]);
                        live.retain(|id| *id == root);
                    }
                }

                for id in &issued {
                    prop_assert_eq!(table.contains(*id), live.contains(id));
                }
            }
        }
    }
}
