//! Generational arena for cache entries.
//!
//! Entries reference each other (parent/child links, LRU membership, index
//! buckets) by [`EntryId`] instead of by pointer. Each id carries the
//! generation of the slot it was issued for; once a slot is freed its
//! generation is bumped, so a stale id can never resolve to whatever entry
//! reuses the slot later.
//!
//! ```text
//! slots: ┌──────────────┬──────────────┬──────────────┐
//!        │ gen 3: entry │ gen 1: free  │ gen 7: entry │
//!        └──────────────┴──────────────┴──────────────┘
//! free:  [1]
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Stable handle to an entry stored in an [`Arena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    /// Slot index (for diagnostics).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation (for diagnostics).
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({}v{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Slot storage with free-list reuse.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Make sure the next [`insert`](Self::insert) cannot allocate.
    pub(crate) fn reserve_one(&mut self) -> Result<()> {
        if self.free.is_empty() {
            self.slots.try_reserve(1)?;
        }
        Ok(())
    }

    /// Store a value and return its id.
    ///
    /// Fails only if growing the slot table fails; the arena is unchanged
    /// in that case.
    pub(crate) fn insert(&mut self, value: T) -> Result<EntryId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => {
                    return Err(Error::Inconsistent(format!(
                        "arena free list points at occupied slot {index}"
                    )));
                }
            };
            *slot = Slot::Occupied { generation, value };
            self.len += 1;
            return Ok(EntryId { index, generation });
        }

        let index = u32::try_from(self.slots.len())
            .map_err(|_| Error::OutOfMemory("entry arena is full".into()))?;
        self.slots.try_reserve(1)?;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(EntryId {
            index,
            generation: 0,
        })
    }

    pub(crate) fn get(&self, id: EntryId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: EntryId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a value, invalidating `id` and every copy of it.
    pub(crate) fn remove(&mut self, id: EntryId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let next = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, next) else {
            return None;
        };
        // Pushing can only fail to grow if the free list is at capacity;
        // losing the slot for reuse is harmless.
        if self.free.try_reserve(1).is_ok() {
            self.free.push(id.index);
        }
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of all live values, in slot order.
    pub(crate) fn ids(&self) -> Vec<EntryId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(EntryId {
                    index: index as u32,
                    generation: *generation,
                }),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_id_does_not_alias_reused_slot() {
        let mut arena = Arena::new();
        let old = arena.insert(1u32).unwrap();
        arena.remove(old);

        let new = arena.insert(2u32).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_ids_lists_live_entries() {
        let mut arena = Arena::new();
        let a = arena.insert('a').unwrap();
        let b = arena.insert('b').unwrap();
        let c = arena.insert('c').unwrap();
        arena.remove(b);

        assert_eq!(arena.ids(), vec![a, c]);
        assert!(arena.contains(c));
        assert!(!arena.contains(b));
    }
}
