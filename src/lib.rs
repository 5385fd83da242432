//! # mrcache
//!
//! A memory-registration cache for RDMA-style network interfaces.
//!
//! Registering memory with a NIC pins pages and programs translation tables,
//! which is far too slow to do on every send or receive. `mrcache` keeps
//! registrations alive and hands an existing one to any request whose range
//! it covers.
//!
//! ## Features
//!
//! - **Interval matching**: a request is served by any registration that
//!   contains it, not only by an exact match
//! - **Merging**: overlapping registrations are replaced by one covering
//!   registration; the old ones live on until their users release them
//! - **Lazy deregistration**: released registrations are parked for reuse
//!   and evicted in LRU order
//! - **Pluggable hardware**: anything implementing
//!   [`RegistrationBackend`](memory::RegistrationBackend) can sit underneath
//!
//! ## Quick Start
//!
//! ```rust
//! use mrcache::prelude::*;
//!
//! let nic = Interface::new("nic0", SoftwareBackend::new());
//! let domain = Domain::new("domain0", CacheConfig::default(), vec![nic.clone()])?;
//!
//! let region = domain.register_memory(0x10000, 0x8000, AccessFlags::RECV.bits())?;
//! let inner = domain.register_memory(0x12000, 0x1000, AccessFlags::SEND.bits())?;
//! assert_eq!(region.handle(), inner.handle());
//!
//! inner.close()?;
//! region.close()?;
//! domain.close()?;
//! # Ok::<(), mrcache::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        AccessFlags, CacheConfig, CacheKey, Domain, HwAccess, Interface, MemoryRegion,
        Registration, RegistrationBackend, RegistrationCache, SoftwareBackend,
    };
}

pub use error::{BackendError, Error, Result};
