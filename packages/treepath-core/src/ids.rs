use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;

/// Primary key of a tree row.
///
/// Paths store the `Display` form of every ancestor key and decode it back with `FromStr`,
/// so the two must round-trip. Any totally ordered, hashable key that does so qualifies.
pub trait NodeKey: Clone + Eq + Ord + Hash + Debug + Display + FromStr {}

impl<T> NodeKey for T where T: Clone + Eq + Ord + Hash + Debug + Display + FromStr {}

/// Source of primary keys for rows inserted without an explicit id.
pub trait KeyGenerator {
    type Key: NodeKey;

    fn next_key(&mut self) -> Self::Key;

    /// Informs the generator that `key` is taken so it never hands it out again.
    fn observe(&mut self, _key: &Self::Key) {}
}

/// Monotonic integer keys, starting at 1.
#[derive(Clone, Debug, Default)]
pub struct SequentialKeys {
    last: i64,
}

impl SequentialKeys {
    pub fn starting_after(last: i64) -> Self {
        Self { last }
    }
}

impl KeyGenerator for SequentialKeys {
    type Key = i64;

    fn next_key(&mut self) -> i64 {
        self.last += 1;
        self.last
    }

    fn observe(&mut self, key: &i64) {
        self.last = self.last.max(*key);
    }
}

/// Random version 4 UUID keys.
#[cfg(feature = "uuid")]
#[derive(Clone, Debug, Default)]
pub struct UuidKeys;

#[cfg(feature = "uuid")]
impl KeyGenerator for UuidKeys {
    type Key = uuid::Uuid;

    fn next_key(&mut self) -> uuid::Uuid {
        uuid::Uuid::new_v4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_keys_skip_observed_ids() {
        let mut keys = SequentialKeys::default();
        assert_eq!(keys.next_key(), 1);
        keys.observe(&10);
        assert_eq!(keys.next_key(), 11);
        keys.observe(&3);
        assert_eq!(keys.next_key(), 12);
    }

    #[cfg(feature = "uuid")]
    #[test]
    fn uuid_keys_are_distinct() {
        let mut keys = UuidKeys;
        assert_ne!(keys.next_key(), keys.next_key());
    }
}
