//! Memory registration for network interfaces.
//!
//! This module provides the registration cache and the pieces it is built
//! from.
//!
//! # Architecture
//!
//! - [`RegistrationCache`]: interval cache of hardware registrations
//! - [`Domain`]: owns interfaces and a lazily created cache
//! - [`MemoryRegion`]: a registration handed out by a domain
//! - [`RegistrationBackend`]: trait for the hardware (or a software stand-in)
//! - [`Interface`]: one backend instance behind its own lock
//!
//! # Entry lifecycle
//!
//! ```text
//!            register (miss)
//!                  │
//!                  ▼
//!   ┌──────────► InUse ──────── merged into a larger entry ──► Retired
//!   │              │                                            │
//!   │ revive       │ last reference dropped                     │ last reference
//!   │              ▼                                            ▼
//!   └────────── Stale ─────── flush / limit ──────────────► deregistered
//! ```
//!
//! # Example
//!
//! ```rust
//! use mrcache::memory::{AccessFlags, CacheConfig, Domain, Interface, SoftwareBackend};
//!
//! let nic = Interface::new("nic0", SoftwareBackend::new());
//! let domain = Domain::new("domain0", CacheConfig::default(), vec![nic.clone()]).unwrap();
//!
//! let region = domain.register_memory(0x4000, 0x100, AccessFlags::SEND.bits()).unwrap();
//! region.close().unwrap();
//!
//! // The registration is parked, not released.
//! assert_eq!(nic.lock_backend().unwrap().live_registrations(), 1);
//! ```

mod access;
mod arena;
mod backend;
mod cache;
mod config;
mod domain;
mod entry;
mod index;
mod key;
mod lru;
mod software;

pub use access::{AccessFlags, HwAccess};
pub use arena::EntryId;
pub use backend::{Interface, RegistrationBackend};
pub use cache::{CacheState, CacheStats, Registration, RegistrationCache};
pub use config::{
    CacheConfig, DEFAULT_HARD_REG_LIMIT, DEFAULT_HARD_STALE_LIMIT, DEFAULT_SOFT_REG_LIMIT,
};
pub use domain::{Domain, MemoryRegion};
pub use entry::{EntrySnapshot, EntryState};
pub use key::{CacheKey, page_align, page_size};
pub use software::{BackendCall, SoftwareBackend, SoftwareBackendError, SoftwareHandle};
