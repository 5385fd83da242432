//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const LOOKUPS: &str = "mrcache_lookups";
const HW_REGISTRATIONS: &str = "mrcache_hw_registrations";
const HW_DEREGISTRATIONS: &str = "mrcache_hw_deregistrations";
const MERGES: &str = "mrcache_merges";
const EVICTIONS: &str = "mrcache_evictions";
const INUSE_ENTRIES: &str = "mrcache_inuse_entries";
const STALE_ENTRIES: &str = "mrcache_stale_entries";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        LOOKUPS,
        Unit::Count,
        "Registration lookups, labelled by result (inuse_hit, stale_hit, miss)"
    );
    metrics::describe_counter!(
        HW_REGISTRATIONS,
        Unit::Count,
        "Successful hardware registrations"
    );
    metrics::describe_counter!(
        HW_DEREGISTRATIONS,
        Unit::Count,
        "Hardware deregistrations attempted"
    );
    metrics::describe_counter!(
        MERGES,
        Unit::Count,
        "In-use entries retired into a merged registration"
    );
    metrics::describe_counter!(
        EVICTIONS,
        Unit::Count,
        "Stale entries flushed from the cache"
    );
    metrics::describe_gauge!(INUSE_ENTRIES, Unit::Count, "Entries in the in-use index");
    metrics::describe_gauge!(STALE_ENTRIES, Unit::Count, "Entries in the stale index");
}

/// Outcome of a registration lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// Served by an in-use entry.
    InUseHit,
    /// Served by reviving a stale entry.
    StaleHit,
    /// Needed a new hardware registration.
    Miss,
}

impl LookupResult {
    fn label(self) -> &'static str {
        match self {
            LookupResult::InUseHit => "inuse_hit",
            LookupResult::StaleHit => "stale_hit",
            LookupResult::Miss => "miss",
        }
    }
}

/// Metrics handles for one cache, with the cache label pre-applied.
#[derive(Clone)]
pub struct CacheMetrics {
    cache: String,
    inuse_hits: Counter,
    stale_hits: Counter,
    misses: Counter,
    hw_registrations: Counter,
    hw_deregistrations: Counter,
    merges: Counter,
    evictions: Counter,
    inuse_entries: Gauge,
    stale_entries: Gauge,
}

impl CacheMetrics {
    /// Create the handles for the cache named `cache`.
    pub fn new(cache: &str) -> Self {
        let lookups = |result: LookupResult| {
            counter!(LOOKUPS, "cache" => cache.to_string(), "result" => result.label())
        };
        Self {
            cache: cache.to_string(),
            inuse_hits: lookups(LookupResult::InUseHit),
            stale_hits: lookups(LookupResult::StaleHit),
            misses: lookups(LookupResult::Miss),
            hw_registrations: counter!(HW_REGISTRATIONS, "cache" => cache.to_string()),
            hw_deregistrations: counter!(HW_DEREGISTRATIONS, "cache" => cache.to_string()),
            merges: counter!(MERGES, "cache" => cache.to_string()),
            evictions: counter!(EVICTIONS, "cache" => cache.to_string()),
            inuse_entries: gauge!(INUSE_ENTRIES, "cache" => cache.to_string()),
            stale_entries: gauge!(STALE_ENTRIES, "cache" => cache.to_string()),
        }
    }

    /// Record the outcome of a lookup.
    #[inline]
    pub fn record_lookup(&self, result: LookupResult) {
        match result {
            LookupResult::InUseHit => self.inuse_hits.increment(1),
            LookupResult::StaleHit => self.stale_hits.increment(1),
            LookupResult::Miss => self.misses.increment(1),
        }
    }

    /// Record a successful hardware registration.
    #[inline]
    pub fn record_hw_registration(&self) {
        self.hw_registrations.increment(1);
    }

    /// Record a hardware deregistration.
    #[inline]
    pub fn record_hw_deregistration(&self) {
        self.hw_deregistrations.increment(1);
    }

    /// Record entries retired into a merged registration.
    #[inline]
    pub fn record_merge(&self, retired: usize) {
        self.merges.increment(retired as u64);
    }

    /// Record stale entries flushed.
    #[inline]
    pub fn record_evictions(&self, count: usize) {
        self.evictions.increment(count as u64);
    }

    /// Record current index sizes.
    #[inline]
    pub fn record_entries(&self, in_use: usize, stale: usize) {
        self.inuse_entries.set(in_use as f64);
        self.stale_entries.set(stale as f64);
    }

    /// Get the cache name.
    pub fn cache(&self) -> &str {
        &self.cache
    }
}
