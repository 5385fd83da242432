//! The memory-registration cache.
//!
//! Registering memory with a NIC is slow, so the cache keeps hardware
//! registrations alive and hands the same registration to every caller whose
//! range it covers.
//!
//! # Structure
//!
//! ```text
//!             ┌──────────────── Arena<CacheEntry> ────────────────┐
//!             │  ids are stable; parent/child links are ids too    │
//!             └────────────────────────────────────────────────────┘
//!                 ▲                      ▲                    ▲
//!   in-use index ─┘        stale index ──┘        LRU list ───┘
//!   (ref_count > 0)        (ref_count == 0)       (stale, oldest first)
//! ```
//!
//! Retired entries are in neither index: they were merged into a larger
//! registration but still have users. The merged entry holds one extra
//! reference for as long as it has retired children.
//!
//! # Locking
//!
//! Every operation runs under the cache's mutex, including the hardware
//! call, so index updates are atomic with respect to the backend outcome.
//! Each interface has its own lock around its backend.

use super::access::{AccessFlags, HwAccess};
use super::arena::{Arena, EntryId};
use super::backend::{Interface, RegistrationBackend};
use super::config::CacheConfig;
use super::entry::{CacheEntry, EntrySnapshot, EntryState};
use super::index::{Cursor, IntervalIndex};
use super::key::CacheKey;
use super::lru::LruList;
use crate::error::{Error, Result};
use crate::observability::{
    CacheMetrics, LookupResult, trace_deregister_failure, trace_lookup, trace_transition,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Global counter for generating unique cache IDs.
static CACHE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_cache_id() -> u64 {
    CACHE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Accepting operations.
    Ready,
    /// `destroy` succeeded; every operation fails.
    Destroyed,
}

/// Running counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served by an in-use entry.
    pub inuse_hits: u64,
    /// Requests served by reviving a stale entry.
    pub stale_hits: u64,
    /// Requests that needed a new hardware registration.
    pub misses: u64,
    /// Successful hardware registrations.
    pub hw_registrations: u64,
    /// Hardware deregistrations attempted.
    pub hw_deregistrations: u64,
    /// In-use entries retired into merged registrations.
    pub retired: u64,
    /// Stale entries flushed (explicitly or by a limit).
    pub evictions: u64,
    /// Entries destroyed because a larger stale entry covered them, or
    /// replaced because they were covered by a newly stale entry.
    pub stale_replacements: u64,
}

/// A reference to a cached registration, returned by
/// [`RegistrationCache::register`].
///
/// Hand it back to [`RegistrationCache::deregister`] to drop the reference.
/// It is not `Clone`: each value stands for exactly one
/// reference.
#[derive(Debug)]
pub struct Registration<H> {
    cache_id: u64,
    entry: EntryId,
    key: CacheKey,
    handle: H,
    interface_id: u64,
}

impl<H> Registration<H> {
    /// The registered range. Always covers the requested range.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Hardware handle for the registered range.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Interface the registration lives on.
    pub fn interface_id(&self) -> u64 {
        self.interface_id
    }

    /// Cache entry backing this registration.
    pub fn entry_id(&self) -> EntryId {
        self.entry
    }
}

/// Interval cache of hardware memory registrations.
///
/// # Example
///
/// ```rust
/// use mrcache::memory::{AccessFlags, CacheConfig, Interface, RegistrationCache, SoftwareBackend};
///
/// let nic = Interface::new("nic0", SoftwareBackend::new());
/// let cache = RegistrationCache::new("domain0", CacheConfig::default()).unwrap();
/// let interfaces = [nic.clone()];
///
/// let first = cache.register(&interfaces, 0x1000, 0x2000, AccessFlags::SEND).unwrap();
/// let second = cache.register(&interfaces, 0x1000, 0x1000, AccessFlags::SEND).unwrap();
/// assert_eq!(first.handle(), second.handle());
///
/// cache.deregister(first).unwrap();
/// cache.deregister(second).unwrap();
/// assert_eq!(cache.stale_count(), 1);
/// assert_eq!(nic.lock_backend().unwrap().register_count(), 1);
/// ```
pub struct RegistrationCache<B: RegistrationBackend> {
    id: u64,
    name: String,
    config: CacheConfig,
    inner: Mutex<CacheInner<B>>,
}

struct CacheInner<B: RegistrationBackend> {
    name: String,
    config: CacheConfig,
    metrics: CacheMetrics,
    state: CacheState,
    entries: Arena<CacheEntry<B>>,
    inuse: IntervalIndex,
    /// Absent when lazy deregistration is off.
    stale: Option<IntervalIndex>,
    lru: LruList,
    stats: CacheStats,
}

impl<B: RegistrationBackend> RegistrationCache<B> {
    /// Create an empty cache.
    ///
    /// Fails with `InvalidArgument` if the configuration is incoherent.
    pub fn new(name: &str, config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let inner = CacheInner {
            name: name.to_string(),
            config,
            metrics: CacheMetrics::new(name),
            state: CacheState::Ready,
            entries: Arena::new(),
            inuse: IntervalIndex::disjoint(),
            stale: config.lazy_deregistration.then(IntervalIndex::new),
            lru: LruList::new(),
            stats: CacheStats::default(),
        };

        tracing::debug!(cache = %name, ?config, "created registration cache");

        Ok(Self {
            id: next_cache_id(),
            name: name.to_string(),
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheInner<B>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Inconsistent(format!("cache {} lock poisoned", self.name)))
    }

    /// Lock for inspection only; a poisoned state is still readable.
    fn lock_for_read(&self) -> MutexGuard<'_, CacheInner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain a registration covering `[address, address + length)`.
    ///
    /// Tries, in order: an in-use entry at `address`, a stale entry at
    /// `address`, any in-use entry covering the range, any stale entry
    /// covering the range, and finally a new hardware registration on the
    /// first interface that accepts it. The new registration is widened to
    /// absorb every in-use entry it overlaps.
    pub fn register(
        &self,
        interfaces: &[Arc<Interface<B>>],
        address: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<Registration<B::Handle>> {
        let key = CacheKey::checked(address, length)?;
        if access.is_empty() {
            return Err(Error::InvalidArgument("access flags must not be empty".into()));
        }
        if interfaces.is_empty() {
            return Err(Error::InvalidArgument("no interfaces to register with".into()));
        }

        let mut inner = self.lock()?;
        inner.ensure_ready()?;

        // A failed registration may still have evicted a stale entry.
        let result = inner
            .register(interfaces, key, access.hw_access())
            .and_then(|id| inner.registration(self.id, id));
        inner.publish_sizes();
        result
    }

    /// Drop the reference held by `registration`.
    ///
    /// When the last reference goes, the registration is parked for reuse
    /// (lazy deregistration) or released to the hardware right away.
    pub fn deregister(&self, registration: Registration<B::Handle>) -> Result<()> {
        let not_found = Error::NotFound {
            address: registration.key.address,
            length: registration.key.length,
        };
        if registration.cache_id != self.id {
            return Err(not_found);
        }

        let mut inner = self.lock()?;
        inner.ensure_ready()?;

        let valid = inner.entries.get(registration.entry).is_some_and(|entry| {
            entry.key == registration.key
                && entry.state != EntryState::Stale
                && users(entry) > 0
        });
        if !valid {
            tracing::warn!(
                cache = %self.name,
                key = %registration.key,
                "deregistration of unknown registration"
            );
            return Err(not_found);
        }

        let result = inner.put(registration.entry);
        inner.enforce_stale_limit();
        inner.publish_sizes();
        result
    }

    /// Drop one reference on the registration whose key is exactly `key`.
    ///
    /// This is the lookup a close path without a [`Registration`] in hand
    /// would use: the key may belong to an in-use entry or to a retired entry
    /// that was merged into one.
    pub fn release_key(&self, key: CacheKey) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_ready()?;

        let id = inner.find_by_key(&key).ok_or(Error::NotFound {
            address: key.address,
            length: key.length,
        })?;

        let result = inner.put(id);
        inner.enforce_stale_limit();
        inner.publish_sizes();
        result
    }

    /// Deregister up to `max_count` stale entries, oldest first.
    ///
    /// A negative count flushes everything. Returns how many entries were
    /// flushed; always zero when lazy deregistration is off.
    pub fn flush(&self, max_count: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        inner.ensure_ready()?;
        let flushed = inner.flush(max_count);
        inner.publish_sizes();
        Ok(flushed)
    }

    /// Deregister every stale entry.
    pub fn flush_all(&self) -> Result<usize> {
        self.flush(-1)
    }

    /// Flush all stale entries and retire the cache.
    ///
    /// Fails with `Busy`, touching nothing, while any registration is still
    /// in use.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_ready()?;

        // Retired entries always hang off an in-use parent.
        if !inner.inuse.is_empty() {
            tracing::warn!(
                cache = %self.name,
                in_use = inner.inuse.len(),
                "refusing to destroy cache with registrations in use"
            );
            return Err(Error::Busy {
                in_use: inner.inuse.len(),
            });
        }

        inner.flush(-1);
        if !inner.entries.is_empty() {
            return Err(Error::Inconsistent(format!(
                "{} entries left after flushing stale registrations",
                inner.entries.len()
            )));
        }

        inner.inuse.clear();
        if let Some(stale) = inner.stale.as_mut() {
            stale.clear();
        }
        inner.lru.clear();
        inner.state = CacheState::Destroyed;
        inner.publish_sizes();

        tracing::debug!(cache = %self.name, "destroyed registration cache");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CacheState {
        self.lock_for_read().state
    }

    /// Entries in the in-use index.
    pub fn in_use_count(&self) -> usize {
        self.lock_for_read().inuse.len()
    }

    /// Entries in the stale index.
    pub fn stale_count(&self) -> usize {
        self.lock_for_read().stale_len()
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> CacheStats {
        self.lock_for_read().stats
    }

    /// Is there an in-use entry registered for exactly `key`?
    pub fn contains_in_use(&self, key: CacheKey) -> bool {
        self.lock_for_read()
            .inuse
            .find_exact_bucket(key.address)
            .iter()
            .any(|e| e.length == key.length)
    }

    /// Is there a stale entry registered for exactly `key`?
    pub fn contains_stale(&self, key: CacheKey) -> bool {
        self.lock_for_read().stale.as_ref().is_some_and(|stale| {
            stale
                .find_exact_bucket(key.address)
                .iter()
                .any(|e| e.length == key.length)
        })
    }

    /// State of the entry behind `registration`.
    pub fn entry(&self, registration: &Registration<B::Handle>) -> Option<EntrySnapshot> {
        if registration.cache_id != self.id {
            return None;
        }
        let inner = self.lock_for_read();
        inner
            .entries
            .get(registration.entry)
            .map(|entry| EntrySnapshot::of(registration.entry, entry))
    }

    /// State of every live entry.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let inner = self.lock_for_read();
        inner
            .entries
            .ids()
            .into_iter()
            .filter_map(|id| inner.entries.get(id).map(|e| EntrySnapshot::of(id, e)))
            .collect()
    }

    /// Stale entries from oldest to newest.
    pub fn lru_keys(&self) -> Vec<CacheKey> {
        let inner = self.lock_for_read();
        inner
            .lru
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| e.key))
            .collect()
    }

    /// Verify the structural invariants of the cache.
    pub fn check_invariants(&self) -> Result<()> {
        self.lock_for_read().check_invariants()
    }
}

impl<B: RegistrationBackend> Drop for RegistrationCache<B> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state != CacheState::Ready {
            return;
        }
        inner.flush(-1);
        if !inner.entries.is_empty() {
            tracing::warn!(
                cache = %inner.name,
                leaked = inner.entries.len(),
                "registration cache dropped with registrations still in use"
            );
        }
    }
}

/// References held by callers, excluding the hold for retired children.
fn users<B: RegistrationBackend>(entry: &CacheEntry<B>) -> u32 {
    entry
        .ref_count
        .saturating_sub(u32::from(!entry.children.is_empty()))
}

fn state_name(state: EntryState) -> &'static str {
    match state {
        EntryState::InUse => "InUse",
        EntryState::Stale => "Stale",
        EntryState::Retired => "Retired",
    }
}

impl<B: RegistrationBackend> CacheInner<B> {
    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            CacheState::Ready => Ok(()),
            state => Err(Error::InvalidState(state)),
        }
    }

    fn stale_len(&self) -> usize {
        self.stale.as_ref().map_or(0, IntervalIndex::len)
    }

    fn publish_sizes(&self) {
        self.metrics
            .record_entries(self.inuse.len(), self.stale_len());
    }

    fn entry(&self, id: EntryId) -> Result<&CacheEntry<B>> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::Inconsistent(format!("dangling entry id {id:?}")))
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut CacheEntry<B>> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| Error::Inconsistent(format!("dangling entry id {id:?}")))
    }

    fn hit(&mut self, key: &CacheKey, result: LookupResult) {
        match result {
            LookupResult::InUseHit => self.stats.inuse_hits += 1,
            LookupResult::StaleHit => self.stats.stale_hits += 1,
            LookupResult::Miss => self.stats.misses += 1,
        }
        self.metrics.record_lookup(result);
        trace_lookup(&self.name, key, result);
    }

    fn registration(&self, cache_id: u64, id: EntryId) -> Result<Registration<B::Handle>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::Inconsistent(format!("registered entry {id:?} vanished")))?;
        Ok(Registration {
            cache_id,
            entry: id,
            key: entry.key,
            handle: entry.handle.clone(),
            interface_id: entry.interface.id(),
        })
    }

    fn acquire(&mut self, id: EntryId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.ref_count = entry
            .ref_count
            .checked_add(1)
            .ok_or_else(|| Error::Inconsistent(format!("reference count overflow on {id:?}")))?;
        Ok(())
    }

    fn register(
        &mut self,
        interfaces: &[Arc<Interface<B>>],
        key: CacheKey,
        access: HwAccess,
    ) -> Result<EntryId> {
        if let Some(id) = self.inuse_fast_path(&key, access) {
            self.acquire(id)?;
            self.hit(&key, LookupResult::InUseHit);
            return Ok(id);
        }

        if let Some(id) = self.stale_fast_path(&key, access)? {
            self.hit(&key, LookupResult::StaleHit);
            return Ok(id);
        }

        if let Some(id) = self.inuse_slow_path(&key, access) {
            self.acquire(id)?;
            self.hit(&key, LookupResult::InUseHit);
            return Ok(id);
        }

        if let Some(id) = self.stale_slow_path(&key, access)? {
            self.hit(&key, LookupResult::StaleHit);
            return Ok(id);
        }

        let limit = self.config.hard_reg_limit;
        if self.config.has_hard_limit() {
            if self.inuse.len() as i64 >= limit {
                tracing::debug!(cache = %self.name, limit, "hard registration limit reached");
                return Err(Error::ResourceExhausted { limit });
            }
            if (self.inuse.len() + self.stale_len()) as i64 >= limit {
                self.flush(1);
            }
        }

        self.create_registration(interfaces, key, access)
    }

    fn inuse_fast_path(&self, key: &CacheKey, access: HwAccess) -> Option<EntryId> {
        let head = self.inuse.find_exact_bucket(key.address).first()?;
        if head.length < key.length {
            return None;
        }
        let entry = self.entries.get(head.id)?;
        entry.access.covers(access).then_some(head.id)
    }

    fn stale_fast_path(&mut self, key: &CacheKey, access: HwAccess) -> Result<Option<EntryId>> {
        let Some(stale) = self.stale.as_ref() else {
            return Ok(None);
        };
        let Some(head) = stale.find_exact_bucket(key.address).first().copied() else {
            return Ok(None);
        };
        if head.length < key.length || !self.entry(head.id)?.access.covers(access) {
            return Ok(None);
        }
        self.revive(head.id, key, access)
    }

    fn inuse_slow_path(&self, key: &CacheKey, access: HwAccess) -> Option<EntryId> {
        self.inuse
            .overlapping(key)
            .into_iter()
            .find(|c| {
                self.entries
                    .get(c.id)
                    .is_some_and(|entry| entry.satisfies(key, access))
            })
            .map(|c| c.id)
    }

    fn stale_slow_path(&mut self, key: &CacheKey, access: HwAccess) -> Result<Option<EntryId>> {
        let Some(stale) = self.stale.as_ref() else {
            return Ok(None);
        };
        let candidates: Vec<EntryId> = stale
            .overlapping(key)
            .into_iter()
            .filter(|c| {
                self.entries
                    .get(c.id)
                    .is_some_and(|entry| entry.satisfies(key, access))
            })
            .map(|c| c.id)
            .collect();

        for id in candidates {
            if let Some(id) = self.revive(id, key, access)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Move a stale entry back into the in-use index with one reference.
    ///
    /// Refuses (returns `None`) if the entry would overlap an in-use entry.
    /// Smaller stale siblings at the same address that could also have
    /// served the request are destroyed.
    fn revive(
        &mut self,
        id: EntryId,
        request: &CacheKey,
        access: HwAccess,
    ) -> Result<Option<EntryId>> {
        let (key, seq) = {
            let entry = self.entry(id)?;
            (entry.key, entry.lru_seq)
        };

        if let Some(blocker) = self.inuse.find_leftmost_overlap(&key) {
            tracing::debug!(
                cache = %self.name,
                stale = %key,
                inuse = %blocker.key,
                "stale entry overlaps an in-use entry, not reviving"
            );
            return Ok(None);
        }

        let siblings: Vec<EntryId> = match self.stale.as_ref() {
            Some(stale) => stale
                .find_exact_bucket(key.address)
                .iter()
                .filter(|e| e.id != id)
                .filter(|e| {
                    self.entries
                        .get(e.id)
                        .is_some_and(|sibling| sibling.satisfies(request, access))
                })
                .map(|e| e.id)
                .collect(),
            None => Vec::new(),
        };

        self.inuse.insert(key, id)?;
        if let Some(stale) = self.stale.as_mut() {
            stale.remove(&key, id);
        }
        if let Some(seq) = seq {
            self.lru.remove(seq);
        }

        let entry = self.entry_mut(id)?;
        entry.state = EntryState::InUse;
        entry.ref_count = 1;
        entry.lru_seq = None;
        trace_transition(&self.name, &key, "Stale", "InUse");

        for sibling in siblings {
            self.stats.stale_replacements += 1;
            // Failures are logged by destroy_entry.
            let _ = self.evict_stale(sibling);
        }

        Ok(Some(id))
    }

    fn register_on_interfaces(
        &mut self,
        interfaces: &[Arc<Interface<B>>],
        key: CacheKey,
        access: HwAccess,
    ) -> Result<(B::Handle, Arc<Interface<B>>)> {
        let mut last_error = None;
        for interface in interfaces {
            match interface.register(key, access) {
                Ok(handle) => {
                    self.stats.hw_registrations += 1;
                    self.metrics.record_hw_registration();
                    return Ok((handle, Arc::clone(interface)));
                }
                Err(err) => {
                    tracing::debug!(
                        cache = %self.name,
                        interface = %interface.name(),
                        key = %key,
                        error = %err,
                        "hardware registration failed"
                    );
                    if err.is_fatal() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::InvalidArgument("no interfaces to register with".into())))
    }

    /// Register a new entry covering `key` and every in-use entry it
    /// overlaps, then retire those entries as its children.
    fn create_registration(
        &mut self,
        interfaces: &[Arc<Interface<B>>],
        key: CacheKey,
        access: HwAccess,
    ) -> Result<EntryId> {
        let overlaps = self.inuse.overlapping(&key);
        let mut merged_key = key;
        let mut merged_access = access;
        let mut child_count = 0;
        for cursor in &overlaps {
            let entry = self.entry(cursor.id)?;
            merged_key = merged_key.union(&entry.key);
            merged_access = merged_access.max(entry.access);
            child_count += 1 + entry.children.len();
        }

        if let Some(cursor) = overlaps.iter().find(|c| {
            self.entries
                .get(c.id)
                .is_some_and(|entry| entry.satisfies(&merged_key, merged_access))
        }) {
            tracing::debug!(
                cache = %self.name,
                key = %key,
                existing = %cursor.key,
                "merge target already registered"
            );
            let id = cursor.id;
            self.acquire(id)?;
            self.hit(&key, LookupResult::InUseHit);
            return Ok(id);
        }

        // Reserve everything that can fail before touching the hardware.
        let mut children: Vec<EntryId> = Vec::new();
        children.try_reserve(child_count)?;
        self.entries.reserve_one()?;

        let (handle, interface) = self.register_on_interfaces(interfaces, merged_key, merged_access)?;
        self.hit(&key, LookupResult::Miss);

        let id = match self.entries.insert(CacheEntry::new(
            merged_key,
            merged_access,
            handle.clone(),
            Arc::clone(&interface),
        )) {
            Ok(id) => id,
            Err(err) => {
                self.release_handle(&interface, &handle, &merged_key);
                return Err(err);
            }
        };

        if let Err(err) = self.inuse.insert(merged_key, id) {
            if let Some(entry) = self.entries.remove(id) {
                self.release_handle(&entry.interface, &entry.handle, &entry.key);
            }
            return Err(err);
        }

        if merged_key != key {
            tracing::debug!(
                cache = %self.name,
                requested = %key,
                merged = %merged_key,
                retired = overlaps.len(),
                "created merged registration"
            );
        }

        if !overlaps.is_empty() {
            self.retire_into(id, &overlaps, children)?;
        }

        if self.inuse.len() as i64 == self.config.soft_reg_limit {
            tracing::info!(
                cache = %self.name,
                limit = self.config.soft_reg_limit,
                "soft registration limit reached"
            );
        }

        Ok(id)
    }

    /// Hardware release for a registration that never made it into the
    /// cache.
    fn release_handle(&mut self, interface: &Interface<B>, handle: &B::Handle, key: &CacheKey) {
        self.stats.hw_deregistrations += 1;
        self.metrics.record_hw_deregistration();
        if let Err(err) = interface.deregister(handle) {
            trace_deregister_failure(&self.name, key, &err);
        }
    }

    fn retire_into(
        &mut self,
        parent: EntryId,
        overlaps: &[Cursor],
        mut children: Vec<EntryId>,
    ) -> Result<()> {
        for cursor in overlaps {
            self.inuse.remove(&cursor.key, cursor.id);

            let entry = self.entry_mut(cursor.id)?;
            entry.state = EntryState::Retired;
            let grandchildren = std::mem::take(&mut entry.children);
            if !grandchildren.is_empty() {
                // The hold for these children moves to the new parent.
                entry.ref_count -= 1;
            }
            let orphaned = entry.ref_count == 0;
            if !orphaned {
                entry.parent = Some(parent);
            }

            for grandchild in grandchildren {
                self.entry_mut(grandchild)?.parent = Some(parent);
                children.push(grandchild);
            }

            trace_transition(&self.name, &cursor.key, "InUse", "Retired");
            self.stats.retired += 1;

            if orphaned {
                // Only its children kept it alive; they now hang off the
                // new parent.
                let _ = self.destroy_entry(cursor.id);
            } else {
                children.push(cursor.id);
            }
        }
        self.metrics.record_merge(overlaps.len());

        let entry = self.entry_mut(parent)?;
        if !children.is_empty() {
            entry.children = children;
            entry.ref_count += 1;
        }
        Ok(())
    }

    fn find_by_key(&self, key: &CacheKey) -> Option<EntryId> {
        for cursor in self.inuse.overlapping(key) {
            let entry = self.entries.get(cursor.id)?;
            if entry.key == *key && users(entry) > 0 {
                return Some(cursor.id);
            }
            let child = entry.children.iter().copied().find(|child| {
                self.entries
                    .get(*child)
                    .is_some_and(|c| c.key == *key && c.ref_count > 0)
            });
            if child.is_some() {
                return child;
            }
        }
        None
    }

    /// Drop one reference on `id`.
    fn put(&mut self, id: EntryId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.ref_count == 0 {
            return Err(Error::NotFound {
                address: entry.key.address,
                length: entry.key.length,
            });
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }
        self.release_unreferenced(id)
    }

    fn release_unreferenced(&mut self, id: EntryId) -> Result<()> {
        let (key, state, parent) = {
            let entry = self.entry(id)?;
            if !entry.children.is_empty() {
                tracing::error!(
                    cache = %self.name,
                    key = %entry.key,
                    children = entry.children.len(),
                    "entry released while children remain attached"
                );
                return Err(Error::Inconsistent(format!(
                    "entry {} released with {} children attached",
                    entry.key,
                    entry.children.len()
                )));
            }
            (entry.key, entry.state, entry.parent)
        };

        if state == EntryState::InUse && !self.inuse.remove(&key, id) {
            tracing::error!(cache = %self.name, key = %key, "in-use entry missing from index");
            return Err(Error::Inconsistent(format!(
                "in-use entry {key} missing from index"
            )));
        }

        let mut release_parent = None;
        if let Some(parent_id) = parent {
            self.entry_mut(id)?.parent = None;
            let parent = self.entry_mut(parent_id)?;
            parent.children.retain(|child| *child != id);
            if parent.children.is_empty() {
                release_parent = Some(parent_id);
            }
        }

        let result = if self.config.lazy_deregistration && state == EntryState::InUse {
            self.park_stale(id)
        } else {
            trace_transition(&self.name, &key, state_name(state), "Freed");
            self.destroy_entry(id)
        };

        let parent_result = match release_parent {
            Some(parent_id) => self.put(parent_id),
            None => Ok(()),
        };

        result.and(parent_result)
    }

    /// Move an unreferenced entry into the stale index.
    ///
    /// If a stale entry already covers it, the newcomer is destroyed. Stale
    /// entries the newcomer covers are destroyed and it takes over the
    /// oldest LRU position among them.
    fn park_stale(&mut self, id: EntryId) -> Result<()> {
        let (key, access) = {
            let entry = self.entry(id)?;
            (entry.key, entry.access)
        };
        let Some(stale) = self.stale.as_ref() else {
            return self.destroy_entry(id);
        };

        let overlaps = stale.overlapping(&key);
        let covered = overlaps.iter().any(|c| {
            self.entries
                .get(c.id)
                .is_some_and(|existing| existing.satisfies(&key, access))
        });
        if covered {
            tracing::debug!(
                cache = %self.name,
                key = %key,
                "larger stale entry already present, releasing"
            );
            self.stats.stale_replacements += 1;
            return self.destroy_entry(id);
        }

        let replaced: Vec<Cursor> = overlaps
            .into_iter()
            .filter(|c| {
                self.entries
                    .get(c.id)
                    .is_some_and(|existing| key.subsumes(&existing.key) && access.covers(existing.access))
            })
            .collect();

        if let Some(stale) = self.stale.as_mut() {
            if let Err(err) = stale.insert(key, id) {
                tracing::warn!(
                    cache = %self.name,
                    key = %key,
                    error = %err,
                    "could not park entry in stale index, releasing"
                );
                return self.destroy_entry(id);
            }
        }

        let mut seq: Option<u64> = None;
        for cursor in &replaced {
            if let Some(stale) = self.stale.as_mut() {
                stale.remove(&cursor.key, cursor.id);
            }
            let old_seq = self.entry_mut(cursor.id)?.lru_seq.take();
            if let Some(old_seq) = old_seq {
                self.lru.remove(old_seq);
                seq = Some(seq.map_or(old_seq, |s| s.min(old_seq)));
            }
        }

        let token = match seq {
            Some(seq) => self.lru.insert_at(seq, id),
            None => self.lru.push_back(id),
        };
        let entry = self.entry_mut(id)?;
        entry.state = EntryState::Stale;
        entry.lru_seq = Some(token);
        trace_transition(&self.name, &key, "InUse", "Stale");

        for cursor in replaced {
            tracing::debug!(
                cache = %self.name,
                key = %key,
                replaced = %cursor.key,
                "stale entry replaced by larger one"
            );
            self.stats.stale_replacements += 1;
            // The caller's entry is parked; failures are logged by destroy_entry.
            let _ = self.destroy_entry(cursor.id);
        }
        Ok(())
    }

    /// Remove a stale entry from the stale index and LRU and destroy it.
    fn evict_stale(&mut self, id: EntryId) -> Result<()> {
        let (key, seq) = {
            let entry = self.entry_mut(id)?;
            (entry.key, entry.lru_seq.take())
        };
        if let Some(stale) = self.stale.as_mut() {
            stale.remove(&key, id);
        }
        if let Some(seq) = seq {
            self.lru.remove(seq);
        }
        self.destroy_entry(id)
    }

    /// Release the hardware registration and the owner references.
    fn destroy_entry(&mut self, id: EntryId) -> Result<()> {
        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| Error::Inconsistent(format!("destroying unknown entry {id:?}")))?;

        self.stats.hw_deregistrations += 1;
        self.metrics.record_hw_deregistration();
        let result = entry.interface.deregister(&entry.handle);
        if let Err(err) = &result {
            trace_deregister_failure(&self.name, &entry.key, err);
        }
        result
    }

    fn flush(&mut self, max_count: i64) -> usize {
        if self.stale.is_none() {
            return 0;
        }

        let mut destroyed = 0usize;
        while max_count < 0 || (destroyed as i64) < max_count {
            let Some((_, id)) = self.lru.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(id) else {
                tracing::error!(cache = %self.name, ?id, "lru entry not in the cache");
                break;
            };
            entry.lru_seq = None;
            let key = entry.key;

            let present = self
                .stale
                .as_mut()
                .is_some_and(|stale| stale.remove(&key, id));
            if !present {
                tracing::error!(
                    cache = %self.name,
                    key = %key,
                    "lru entry missing from the stale index"
                );
                let _ = self.destroy_entry(id);
                break;
            }

            tracing::debug!(cache = %self.name, key = %key, "flushing stale entry");
            // Failures are logged by destroy_entry; the entry is gone either way.
            let _ = self.destroy_entry(id);
            destroyed += 1;
        }

        if destroyed > 0 {
            self.stats.evictions += destroyed as u64;
            self.metrics.record_evictions(destroyed);
            tracing::debug!(
                cache = %self.name,
                flushed = destroyed,
                remaining = self.stale_len(),
                "flushed stale entries"
            );
        }
        destroyed
    }

    fn enforce_stale_limit(&mut self) {
        if self.stale_len() as i64 > self.config.hard_stale_limit {
            self.flush(1);
        }
    }

    fn check_invariants(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(Error::Inconsistent(msg)) };

        let mut previous: Option<CacheKey> = None;
        for cursor in self.inuse.iter() {
            let entry = self.entry(cursor.id)?;
            if entry.state != EntryState::InUse || entry.ref_count == 0 || entry.key != cursor.key {
                return fail(format!("bad in-use entry {}", cursor.key));
            }
            if let Some(prev) = previous {
                if prev.overlaps(&cursor.key) {
                    return fail(format!("in-use entries {prev} and {} overlap", cursor.key));
                }
            }
            previous = Some(cursor.key);
        }

        if let Some(stale) = self.stale.as_ref() {
            if stale.len() != self.lru.len() {
                return fail(format!(
                    "stale index has {} entries but lru has {}",
                    stale.len(),
                    self.lru.len()
                ));
            }
            for cursor in stale.iter() {
                let entry = self.entry(cursor.id)?;
                if entry.state != EntryState::Stale || entry.ref_count != 0 {
                    return fail(format!("bad stale entry {}", cursor.key));
                }
                if entry.lru_seq.is_none() || !entry.children.is_empty() {
                    return fail(format!("stale entry {} has bad links", cursor.key));
                }
            }
            for id in self.lru.iter() {
                let key = self.entry(id)?.key;
                if !stale.contains(&key, id) {
                    return fail(format!("lru entry {key} missing from the stale index"));
                }
            }
        } else if !self.lru.is_empty() {
            return fail("lru populated without lazy deregistration".into());
        }

        for id in self.entries.ids() {
            let entry = self.entry(id)?;
            if entry.state == EntryState::Retired {
                let Some(parent_id) = entry.parent else {
                    return fail(format!("retired entry {} has no parent", entry.key));
                };
                let parent = self.entry(parent_id)?;
                if parent.state != EntryState::InUse || !parent.children.contains(&id) {
                    return fail(format!("retired entry {} not linked to parent", entry.key));
                }
                if entry.ref_count == 0 || !entry.children.is_empty() {
                    return fail(format!("retired entry {} has bad counts", entry.key));
                }
            }
            for child in &entry.children {
                if !self.entries.contains(*child) {
                    return fail(format!("{} has a freed child", entry.key));
                }
                if self.entry(*child)?.parent != Some(id) {
                    return fail(format!("child of {} has wrong parent", entry.key));
                }
            }
            if !entry.children.is_empty() && entry.ref_count == 0 {
                return fail(format!("entry {} has children but no hold", entry.key));
            }
        }

        if self.config.has_hard_limit()
            && (self.inuse.len() + self.stale_len()) as i64 > self.config.hard_reg_limit
        {
            return fail("hard registration limit exceeded".into());
        }
        Ok(())
    }
}
