//! Tracing integration for structured logging and spans.

use super::LookupResult;
use crate::memory::CacheKey;
use tracing::{Level, Span, span};

/// Create a span covering one call into a registration cache.
///
/// # Example
///
/// ```rust,ignore
/// use mrcache::observability::span_cache;
///
/// let span = span_cache("domain0");
/// let _guard = span.enter();
/// // Cache operation here...
/// ```
#[inline]
pub fn span_cache(name: &str) -> Span {
    span!(Level::INFO, "mr_cache", cache = %name)
}

/// Enter a cache span and return the guard.
pub fn instrument_cache(name: &str) -> tracing::span::EnteredSpan {
    span_cache(name).entered()
}

/// Log the outcome of a registration lookup.
#[inline]
pub fn trace_lookup(cache: &str, key: &CacheKey, result: LookupResult) {
    tracing::debug!(
        cache = %cache,
        key = %key,
        result = ?result,
        "registration lookup"
    );
}

/// Log an entry moving between cache states.
#[inline]
pub fn trace_transition(cache: &str, key: &CacheKey, from: &str, to: &str) {
    tracing::debug!(
        cache = %cache,
        key = %key,
        from = %from,
        to = %to,
        "entry state changed"
    );
}

/// Log a hardware deregistration that failed while the cache was cleaning up.
#[inline]
pub fn trace_deregister_failure(cache: &str, key: &CacheKey, error: &dyn std::error::Error) {
    tracing::warn!(
        cache = %cache,
        key = %key,
        error = %error,
        "failed to deregister memory region"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let _span = span_cache("test-cache");
        let _guard = instrument_cache("test-cache");
    }

    #[test]
    fn test_trace_functions() {
        let key = CacheKey::new(0x1000, 0x1000);
        trace_lookup("test", &key, LookupResult::Miss);
        trace_transition("test", &key, "InUse", "Stale");
        let err = std::io::Error::other("device busy");
        trace_deregister_failure("test", &key, &err);
    }
}
