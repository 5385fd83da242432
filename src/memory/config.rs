//! Registration cache configuration.

use crate::error::{Error, Result};

/// Default advisory registration count.
pub const DEFAULT_SOFT_REG_LIMIT: i64 = 4096;

/// Default hard registration limit (unlimited).
pub const DEFAULT_HARD_REG_LIMIT: i64 = -1;

/// Default number of stale registrations kept for reuse.
pub const DEFAULT_HARD_STALE_LIMIT: i64 = 128;

/// Construction-time settings for a [`RegistrationCache`](super::RegistrationCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Advisory threshold; logged when crossed, never enforced.
    pub soft_reg_limit: i64,
    /// Maximum in-use plus stale registrations. `<= 0` means unlimited.
    pub hard_reg_limit: i64,
    /// Maximum stale registrations kept before the oldest is evicted.
    pub hard_stale_limit: i64,
    /// Park released registrations for reuse instead of deregistering them.
    pub lazy_deregistration: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_reg_limit: DEFAULT_SOFT_REG_LIMIT,
            hard_reg_limit: DEFAULT_HARD_REG_LIMIT,
            hard_stale_limit: DEFAULT_HARD_STALE_LIMIT,
            lazy_deregistration: true,
        }
    }
}

impl CacheConfig {
    /// Defaults with lazy deregistration turned off.
    pub fn eager() -> Self {
        Self {
            lazy_deregistration: false,
            ..Self::default()
        }
    }

    /// Defaults with no hard limits at all.
    pub fn unlimited() -> Self {
        Self {
            hard_reg_limit: -1,
            hard_stale_limit: i64::MAX,
            ..Self::default()
        }
    }

    /// Set the advisory registration count.
    pub fn with_soft_reg_limit(mut self, limit: i64) -> Self {
        self.soft_reg_limit = limit;
        self
    }

    /// Set the hard registration limit.
    pub fn with_hard_reg_limit(mut self, limit: i64) -> Self {
        self.hard_reg_limit = limit;
        self
    }

    /// Set the stale entry limit.
    pub fn with_hard_stale_limit(mut self, limit: i64) -> Self {
        self.hard_stale_limit = limit;
        self
    }

    /// Enable or disable lazy deregistration.
    pub fn with_lazy_deregistration(mut self, lazy: bool) -> Self {
        self.lazy_deregistration = lazy;
        self
    }

    /// Check that the limits are coherent.
    ///
    /// A positive hard limit must not be below the soft limit.
    pub fn validate(&self) -> Result<()> {
        if self.hard_reg_limit > 0 && self.hard_reg_limit < self.soft_reg_limit {
            return Err(Error::InvalidArgument(format!(
                "hard_reg_limit ({}) is below soft_reg_limit ({})",
                self.hard_reg_limit, self.soft_reg_limit
            )));
        }
        Ok(())
    }

    /// Whether a hard registration limit is in force.
    #[inline]
    pub fn has_hard_limit(&self) -> bool {
        self.hard_reg_limit > 0
    }
}
