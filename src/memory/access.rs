//! Access flags for memory registrations.

use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// How a registered region may be used by local and remote operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u64 {
        /// Local reads (RMA read initiator).
        const READ = 1 << 0;
        /// Local writes (RMA write initiator).
        const WRITE = 1 << 1;
        /// Receive buffer.
        const RECV = 1 << 2;
        /// Send buffer.
        const SEND = 1 << 3;
        /// Target of remote reads.
        const REMOTE_READ = 1 << 4;
        /// Target of remote writes.
        const REMOTE_WRITE = 1 << 5;
    }
}

impl AccessFlags {
    /// Parse raw bits, rejecting empty and unknown flags.
    pub fn validate(bits: u64) -> Result<Self> {
        let flags = AccessFlags::from_bits(bits).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown access flags {bits:#x}"))
        })?;
        if flags.is_empty() {
            return Err(Error::InvalidArgument("access flags must not be empty".into()));
        }
        Ok(flags)
    }

    /// Hardware access level needed to satisfy these flags.
    ///
    /// Anything that lets the network write into the buffer needs a
    /// read-write registration.
    pub fn hw_access(&self) -> HwAccess {
        if self.intersects(AccessFlags::RECV | AccessFlags::READ | AccessFlags::REMOTE_WRITE) {
            HwAccess::ReadWrite
        } else {
            HwAccess::ReadOnly
        }
    }
}

/// Access level of a hardware registration.
///
/// Ordered so that a stronger level compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwAccess {
    /// The network may only read the region.
    ReadOnly,
    /// The network may read and write the region.
    ReadWrite,
}

impl HwAccess {
    /// Can a registration with this level serve a request for `requested`?
    #[inline]
    pub fn covers(self, requested: HwAccess) -> bool {
        self >= requested
    }
}
