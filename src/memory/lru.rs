//! LRU ordering of stale entries.
//!
//! Each stale entry holds a sequence number as its LRU token. Lower numbers
//! are older. A replacement entry may take over the token of the entry it
//! replaces, keeping its place in line.

use super::arena::EntryId;
use std::collections::BTreeMap;

#[derive(Default)]
pub(crate) struct LruList {
    order: BTreeMap<u64, EntryId>,
    next_seq: u64,
}

impl LruList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append at the most-recently-stale end. Returns the entry's token.
    pub(crate) fn push_back(&mut self, id: EntryId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id);
        seq
    }

    /// Re-occupy a token released by [`remove`](Self::remove).
    pub(crate) fn insert_at(&mut self, seq: u64, id: EntryId) -> u64 {
        self.order.insert(seq, id);
        seq
    }

    pub(crate) fn remove(&mut self, seq: u64) -> Option<EntryId> {
        self.order.remove(&seq)
    }

    pub(crate) fn pop_front(&mut self) -> Option<(u64, EntryId)> {
        self.order.pop_first()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries from oldest to newest.
    pub(crate) fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.order.values().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
    }
}
