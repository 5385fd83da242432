//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters and gauges via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `mrcache_lookups` | Counter | Lookups by result (`inuse_hit`, `stale_hit`, `miss`) |
//! | `mrcache_hw_registrations` | Counter | Successful hardware registrations |
//! | `mrcache_hw_deregistrations` | Counter | Hardware deregistrations attempted |
//! | `mrcache_merges` | Counter | Entries retired into merged registrations |
//! | `mrcache_evictions` | Counter | Stale entries flushed |
//! | `mrcache_inuse_entries` | Gauge | In-use index size |
//! | `mrcache_stale_entries` | Gauge | Stale index size |
//!
//! Every metric carries a `cache` label with the cache name.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mrcache::observability::init_metrics;
//!
//! // Describe metrics once at startup, then install any metrics exporter.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{CacheMetrics, LookupResult, init_metrics};
pub use tracing_support::{
    instrument_cache, span_cache, trace_deregister_failure, trace_lookup, trace_transition,
};
