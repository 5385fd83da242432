//! Address-ordered interval index.
//!
//! Entries are ordered by start address only. Registrations that share a
//! start address land in the same bucket, ordered by decreasing length, so
//! the head of a bucket is always the largest registration at that address.
//!
//! A disjoint index (the in-use partition, whose entries never overlap)
//! finds the left-most overlap from the predecessor of the query address:
//! nothing further left can reach past it. This costs two ordered lookups.
//!
//! A general index may hold overlapping entries. There the largest stored
//! length bounds the scan: an entry can only overlap `[a, b]` if it starts
//! in `[a - max_len, b]`.

use super::arena::EntryId;
use super::key::CacheKey;
use crate::error::Result;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One registration at a bucket's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketEntry {
    pub(crate) length: u64,
    pub(crate) id: EntryId,
}

type Bucket = SmallVec<[BucketEntry; 2]>;

/// Position of an entry in the index, as returned by lookups and used to
/// continue an ordered traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) key: CacheKey,
    pub(crate) id: EntryId,
}

#[derive(Default)]
pub(crate) struct IntervalIndex {
    buckets: BTreeMap<u64, Bucket>,
    /// Multiset of stored lengths, for the overlap scan bound.
    lengths: BTreeMap<u64, usize>,
    len: usize,
    /// Entries never overlap each other.
    disjoint: bool,
}

impl IntervalIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// An index whose entries the caller keeps pairwise non-overlapping.
    pub(crate) fn disjoint() -> Self {
        Self {
            disjoint: true,
            ..Self::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn max_length(&self) -> u64 {
        self.lengths.last_key_value().map(|(len, _)| *len).unwrap_or(0)
    }

    /// Insert `id` under `key`.
    ///
    /// On allocation failure the index is left exactly as it was.
    pub(crate) fn insert(&mut self, key: CacheKey, id: EntryId) -> Result<()> {
        let created = !self.buckets.contains_key(&key.address);
        let bucket = self.buckets.entry(key.address).or_default();
        if let Err(err) = bucket.try_reserve(1) {
            if created {
                self.buckets.remove(&key.address);
            }
            return Err(crate::Error::OutOfMemory(format!(
                "index bucket for {key}: {err:?}"
            )));
        }

        let position = bucket
            .iter()
            .position(|existing| existing.length < key.length)
            .unwrap_or(bucket.len());
        bucket.insert(
            position,
            BucketEntry {
                length: key.length,
                id,
            },
        );

        *self.lengths.entry(key.length).or_insert(0) += 1;
        self.len += 1;
        Ok(())
    }

    /// Remove `id` stored under `key`. Returns false if it was not present.
    pub(crate) fn remove(&mut self, key: &CacheKey, id: EntryId) -> bool {
        let Some(bucket) = self.buckets.get_mut(&key.address) else {
            return false;
        };
        let Some(position) = bucket
            .iter()
            .position(|e| e.id == id && e.length == key.length)
        else {
            return false;
        };

        bucket.remove(position);
        if bucket.is_empty() {
            self.buckets.remove(&key.address);
        }

        if let Some(count) = self.lengths.get_mut(&key.length) {
            *count -= 1;
            if *count == 0 {
                self.lengths.remove(&key.length);
            }
        }
        self.len -= 1;
        true
    }

    pub(crate) fn contains(&self, key: &CacheKey, id: EntryId) -> bool {
        self.find_exact_bucket(key.address)
            .iter()
            .any(|e| e.id == id && e.length == key.length)
    }

    /// All entries starting at `address`, largest first.
    pub(crate) fn find_exact_bucket(&self, address: u64) -> &[BucketEntry] {
        self.buckets
            .get(&address)
            .map(|bucket| bucket.as_slice())
            .unwrap_or(&[])
    }

    /// The left-most entry overlapping `query`.
    pub(crate) fn find_leftmost_overlap(&self, query: &CacheKey) -> Option<Cursor> {
        if self.disjoint {
            return self.find_leftmost_overlap_disjoint(query);
        }

        let lower = query.address.saturating_sub(self.max_length());
        let upper = query.end();

        for (&address, bucket) in self.buckets.range(lower..=upper) {
            // The head is the longest; if it misses, its siblings do too.
            let head = bucket.first()?;
            let key = CacheKey::new(address, head.length);
            if key.overlaps(query) {
                return Some(Cursor { key, id: head.id });
            }
        }
        None
    }

    fn find_leftmost_overlap_disjoint(&self, query: &CacheKey) -> Option<Cursor> {
        if let Some((&address, bucket)) = self.buckets.range(..=query.address).next_back() {
            if let Some(head) = bucket.first() {
                let key = CacheKey::new(address, head.length);
                if key.overlaps(query) {
                    return Some(Cursor { key, id: head.id });
                }
            }
        }

        let (&address, bucket) = self
            .buckets
            .range((Bound::Excluded(query.address), Bound::Included(query.end())))
            .next()?;
        let head = bucket.first()?;
        Some(Cursor {
            key: CacheKey::new(address, head.length),
            id: head.id,
        })
    }

    /// The entry following `cursor` in (address, decreasing length) order.
    pub(crate) fn next_in_order(&self, cursor: &Cursor) -> Option<Cursor> {
        if let Some(bucket) = self.buckets.get(&cursor.key.address) {
            if let Some(position) = bucket.iter().position(|e| e.id == cursor.id) {
                if let Some(next) = bucket.get(position + 1) {
                    return Some(Cursor {
                        key: CacheKey::new(cursor.key.address, next.length),
                        id: next.id,
                    });
                }
            }
        }

        let (&address, bucket) = self
            .buckets
            .range((Bound::Excluded(cursor.key.address), Bound::Unbounded))
            .next()?;
        let head = bucket.first()?;
        Some(Cursor {
            key: CacheKey::new(address, head.length),
            id: head.id,
        })
    }

    /// Every entry overlapping `query`, in address order.
    pub(crate) fn overlapping(&self, query: &CacheKey) -> Vec<Cursor> {
        let mut found = Vec::new();
        let mut cursor = self.find_leftmost_overlap(query);
        while let Some(current) = cursor {
            if current.key.address > query.end() {
                break;
            }
            if current.key.overlaps(query) {
                found.push(current);
            }
            cursor = self.next_in_order(&current);
        }
        found
    }

    /// Every entry, in address order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Cursor> + '_ {
        self.buckets.iter().flat_map(|(&address, bucket)| {
            bucket.iter().map(move |e| Cursor {
                key: CacheKey::new(address, e.length),
                id: e.id,
            })
        })
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.lengths.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::arena::Arena;

    fn ids(n: usize) -> Vec<EntryId> {
        let mut arena = Arena::new();
        (0..n).map(|i| arena.insert(i).unwrap()).collect()
    }

    #[test]
    fn test_bucket_ordered_by_decreasing_length() {
        let id = ids(3);
        let mut index = IntervalIndex::new();
        index.insert(CacheKey::new(0x1000, 0x1000), id[0]).unwrap();
        index.insert(CacheKey::new(0x1000, 0x4000), id[1]).unwrap();
        index.insert(CacheKey::new(0x1000, 0x2000), id[2]).unwrap();

        let lengths: Vec<u64> = index
            .find_exact_bucket(0x1000)
            .iter()
            .map(|e| e.length)
            .collect();
        assert_eq!(lengths, vec![0x4000, 0x2000, 0x1000]);
        assert_eq!(index.find_exact_bucket(0x1000)[0].id, id[1]);
        assert!(index.find_exact_bucket(0x2000).is_empty());
    }

    #[test]
    fn test_remove() {
        let id = ids(2);
        let mut index = IntervalIndex::new();
        let a = CacheKey::new(0x1000, 0x1000);
        let b = CacheKey::new(0x1000, 0x2000);
        index.insert(a, id[0]).unwrap();
        index.insert(b, id[1]).unwrap();

        assert!(index.remove(&a, id[0]));
        assert!(!index.remove(&a, id[0]));
        assert_eq!(index.len(), 1);
        assert!(index.contains(&b, id[1]));

        assert!(index.remove(&b, id[1]));
        assert!(index.is_empty());
        assert!(index.find_leftmost_overlap(&b).is_none());
    }

    #[test]
    fn test_leftmost_overlap_finds_long_entry_to_the_left() {
        let id = ids(3);
        let mut index = IntervalIndex::new();
        index.insert(CacheKey::new(0x0, 0x10000), id[0]).unwrap();
        index.insert(CacheKey::new(0x20000, 0x1000), id[1]).unwrap();
        index.insert(CacheKey::new(0x30000, 0x1000), id[2]).unwrap();

        let found = index
            .find_leftmost_overlap(&CacheKey::new(0x8000, 0x100))
            .unwrap();
        assert_eq!(found.id, id[0]);

        assert!(
            index
                .find_leftmost_overlap(&CacheKey::new(0x12000, 0x100))
                .is_none()
        );
    }

    #[test]
    fn test_overlapping_in_address_order() {
        let id = ids(4);
        let mut index = IntervalIndex::new();
        index.insert(CacheKey::new(0x3000, 0x1000), id[2]).unwrap();
        index.insert(CacheKey::new(0x1000, 0x1000), id[0]).unwrap();
        index.insert(CacheKey::new(0x2000, 0x800), id[1]).unwrap();
        index.insert(CacheKey::new(0x9000, 0x1000), id[3]).unwrap();

        let found: Vec<EntryId> = index
            .overlapping(&CacheKey::new(0x1800, 0x2000))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(found, vec![id[0], id[1], id[2]]);
    }

    #[test]
    fn test_overlapping_skips_short_entries_left_of_query() {
        let id = ids(3);
        let mut index = IntervalIndex::new();
        index.insert(CacheKey::new(0x0, 0x8000), id[0]).unwrap();
        index.insert(CacheKey::new(0x1000, 0x100), id[1]).unwrap();
        index.insert(CacheKey::new(0x6000, 0x1000), id[2]).unwrap();

        let found: Vec<EntryId> = index
            .overlapping(&CacheKey::new(0x5000, 0x1000))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(found, vec![id[0], id[2]]);
    }

    #[test]
    fn test_disjoint_lookup_ignores_distant_long_entry() {
        let id = ids(4);
        let mut index = IntervalIndex::disjoint();
        index.insert(CacheKey::new(0x1000, 0x1000), id[0]).unwrap();
        index.insert(CacheKey::new(0x4000, 0x1000), id[1]).unwrap();
        index.insert(CacheKey::new(0x8000, 0x1000), id[2]).unwrap();
        index.insert(CacheKey::new(1 << 44, 1 << 40), id[3]).unwrap();

        let hit = |address, length| {
            index
                .find_leftmost_overlap(&CacheKey::new(address, length))
                .map(|c| c.id)
        };
        assert_eq!(hit(0x4800, 0x100), Some(id[1]));
        assert_eq!(hit(0x2800, 0x1000), None);
        // Touching counts as overlapping.
        assert_eq!(hit(0x3000, 0x1000), Some(id[1]));
        assert_eq!(hit(0x1800, 0x8000), Some(id[0]));
        assert_eq!(hit(0x0, 0x800), None);
        assert_eq!(hit((1 << 44) + 0x5000, 0x1000), Some(id[3]));
        assert_eq!(hit(1 << 50, 0x1000), None);
    }

    #[test]
    fn test_disjoint_lookup_matches_bounded_scan() {
        let count = 64;
        let id = ids(count + 1);
        let mut disjoint = IntervalIndex::disjoint();
        let mut general = IntervalIndex::new();
        for (i, entry) in id.iter().take(count).enumerate() {
            let i = i as u64;
            // Uneven lengths and gaps, never touching.
            let key = CacheKey::new(i * 0x10000, 0x1000 * (1 + i % 7));
            disjoint.insert(key, *entry).unwrap();
            general.insert(key, *entry).unwrap();
        }
        let huge = CacheKey::new(1 << 44, 1 << 40);
        disjoint.insert(huge, id[count]).unwrap();
        general.insert(huge, id[count]).unwrap();

        for address in (0..0x50_0000u64).step_by(0x1800) {
            for length in [0x100, 0x8000, 0x3_0000] {
                let query = CacheKey::new(address, length);
                assert_eq!(
                    disjoint.find_leftmost_overlap(&query),
                    general.find_leftmost_overlap(&query),
                    "leftmost overlap of {query}"
                );
                assert_eq!(disjoint.overlapping(&query), general.overlapping(&query));
            }
        }
    }

    #[test]
    fn test_next_in_order_walks_buckets() {
        let id = ids(3);
        let mut index = IntervalIndex::new();
        index.insert(CacheKey::new(0x1000, 0x2000), id[0]).unwrap();
        index.insert(CacheKey::new(0x1000, 0x1000), id[1]).unwrap();
        index.insert(CacheKey::new(0x5000, 0x1000), id[2]).unwrap();

        let first = Cursor {
            key: CacheKey::new(0x1000, 0x2000),
            id: id[0],
        };
        let second = index.next_in_order(&first).unwrap();
        assert_eq!(second.id, id[1]);
        let third = index.next_in_order(&second).unwrap();
        assert_eq!(third.id, id[2]);
        assert!(index.next_in_order(&third).is_none());
        assert_eq!(index.iter().count(), 3);
    }
}
