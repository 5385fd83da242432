//! Cache entries.

use super::access::HwAccess;
use super::arena::EntryId;
use super::backend::{Interface, RegistrationBackend};
use super::key::CacheKey;
use std::sync::Arc;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Referenced by at least one caller and reachable from the in-use index.
    InUse,
    /// Unreferenced, parked in the stale index for reuse.
    Stale,
    /// Superseded by a merged registration but still referenced.
    Retired,
}

/// One live hardware registration plus its bookkeeping.
pub(crate) struct CacheEntry<B: RegistrationBackend> {
    pub(crate) key: CacheKey,
    pub(crate) access: HwAccess,
    pub(crate) handle: B::Handle,
    /// Owner reference: the interface the registration lives on.
    pub(crate) interface: Arc<Interface<B>>,
    pub(crate) ref_count: u32,
    pub(crate) state: EntryState,
    pub(crate) parent: Option<EntryId>,
    /// Retired entries merged into this one. While non-empty the entry holds
    /// one extra reference on their behalf.
    pub(crate) children: Vec<EntryId>,
    /// LRU token, set only while stale.
    pub(crate) lru_seq: Option<u64>,
}

impl<B: RegistrationBackend> CacheEntry<B> {
    pub(crate) fn new(
        key: CacheKey,
        access: HwAccess,
        handle: B::Handle,
        interface: Arc<Interface<B>>,
    ) -> Self {
        Self {
            key,
            access,
            handle,
            interface,
            ref_count: 1,
            state: EntryState::InUse,
            parent: None,
            children: Vec::new(),
            lru_seq: None,
        }
    }

    /// Does this entry satisfy a request for `key` at `access`?
    #[inline]
    pub(crate) fn satisfies(&self, key: &CacheKey, access: HwAccess) -> bool {
        self.key.subsumes(key) && self.access.covers(access)
    }
}

/// Read-only view of an entry, for inspection and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Arena id.
    pub id: EntryId,
    /// Registered range.
    pub key: CacheKey,
    /// Registered access level.
    pub access: HwAccess,
    /// Outstanding references (including the hold for retired children).
    pub ref_count: u32,
    /// Lifecycle state.
    pub state: EntryState,
    /// Merged entry this one was retired into.
    pub parent: Option<EntryId>,
    /// Retired entries merged into this one.
    pub children: Vec<EntryId>,
    /// Interface the registration lives on.
    pub interface_id: u64,
}

impl EntrySnapshot {
    pub(crate) fn of<B: RegistrationBackend>(id: EntryId, entry: &CacheEntry<B>) -> Self {
        Self {
            id,
            key: entry.key,
            access: entry.access,
            ref_count: entry.ref_count,
            state: entry.state,
            parent: entry.parent,
            children: entry.children.clone(),
            interface_id: entry.interface.id(),
        }
    }
}
