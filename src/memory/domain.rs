//! Domain front end: the owner of a registration cache.
//!
//! A [`Domain`] holds the interfaces memory can be registered on and
//! creates its [`RegistrationCache`] on first use. Callers register memory
//! through the domain and get back a [`MemoryRegion`], which releases its
//! registration when closed or dropped.

use super::access::AccessFlags;
use super::backend::{Interface, RegistrationBackend};
use super::cache::{Registration, RegistrationCache};
use super::config::CacheConfig;
use super::key::{CacheKey, page_align, page_size};
use crate::error::{Error, Result};
use crate::observability::instrument_cache;
use std::sync::{Arc, Mutex, PoisonError};

/// Owner of a set of interfaces and their shared registration cache.
pub struct Domain<B: RegistrationBackend> {
    name: String,
    config: CacheConfig,
    page_size: u64,
    interfaces: Vec<Arc<Interface<B>>>,
    cache: Mutex<Option<Arc<RegistrationCache<B>>>>,
}

impl<B: RegistrationBackend> Domain<B> {
    /// Create a domain using the host page size.
    pub fn new(
        name: &str,
        config: CacheConfig,
        interfaces: Vec<Arc<Interface<B>>>,
    ) -> Result<Arc<Self>> {
        Self::with_page_size(name, config, interfaces, page_size())
    }

    /// Create a domain that aligns registrations to `page_size`.
    pub fn with_page_size(
        name: &str,
        config: CacheConfig,
        interfaces: Vec<Arc<Interface<B>>>,
        page_size: u64,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if interfaces.is_empty() {
            return Err(Error::InvalidArgument(
                "a domain needs at least one interface".into(),
            ));
        }
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "page size {page_size:#x} is not a power of two"
            )));
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            config,
            page_size,
            interfaces,
            cache: Mutex::new(None),
        }))
    }

    /// Domain name, also used as the cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page size registrations are aligned to.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Interfaces in the order they are tried.
    pub fn interfaces(&self) -> &[Arc<Interface<B>>] {
        &self.interfaces
    }

    /// The cache, if one has been created.
    pub fn existing_cache(&self) -> Option<Arc<RegistrationCache<B>>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The cache, creating it on first use.
    pub fn cache(&self) -> Result<Arc<RegistrationCache<B>>> {
        let mut slot = self
            .cache
            .lock()
            .map_err(|_| Error::Inconsistent(format!("domain {} lock poisoned", self.name)))?;
        if let Some(cache) = slot.as_ref() {
            return Ok(Arc::clone(cache));
        }

        let cache = Arc::new(RegistrationCache::new(&self.name, self.config)?);
        *slot = Some(Arc::clone(&cache));
        Ok(cache)
    }

    /// Register `[address, address + length)` for network access.
    ///
    /// `access` is a raw [`AccessFlags`] bit set. The range is widened to
    /// page boundaries before it reaches the cache.
    pub fn register_memory(
        self: &Arc<Self>,
        address: u64,
        length: u64,
        access: u64,
    ) -> Result<MemoryRegion<B>> {
        let flags = AccessFlags::validate(access)?;
        if length == 0 {
            return Err(Error::InvalidArgument("length must be > 0".into()));
        }
        let requested = CacheKey::checked(address, length)?;
        let aligned = page_align(address, length, self.page_size)?;

        let _span = instrument_cache(&self.name);
        let cache = self.cache()?;
        let registration = cache.register(&self.interfaces, aligned.address, aligned.length, flags)?;

        tracing::trace!(
            requested = %requested,
            registered = %registration.key(),
            "registered memory region"
        );

        Ok(MemoryRegion {
            domain: Arc::clone(self),
            cache,
            requested,
            key: registration.key(),
            handle: registration.handle().clone(),
            interface_id: registration.interface_id(),
            registration: Some(registration),
        })
    }

    /// Deregister up to `max_count` stale registrations (all if negative).
    pub fn flush(&self, max_count: i64) -> Result<usize> {
        match self.existing_cache() {
            Some(cache) => {
                let _span = instrument_cache(&self.name);
                cache.flush(max_count)
            }
            None => Ok(0),
        }
    }

    /// Destroy the cache.
    ///
    /// Fails with `Busy` while memory regions are still open. A later
    /// registration creates a fresh cache.
    pub fn close(&self) -> Result<()> {
        let mut slot = self
            .cache
            .lock()
            .map_err(|_| Error::Inconsistent(format!("domain {} lock poisoned", self.name)))?;
        let Some(cache) = slot.as_ref() else {
            return Ok(());
        };

        let _span = instrument_cache(&self.name);
        cache.destroy()?;
        *slot = None;
        Ok(())
    }
}

impl<B: RegistrationBackend> std::fmt::Debug for Domain<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("page_size", &self.page_size)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

/// A registered memory region.
///
/// Holds a reference on its domain and on one cache entry. Call
/// [`close`](Self::close) to release it and observe errors; dropping it
/// releases it too, logging a warning.
pub struct MemoryRegion<B: RegistrationBackend> {
    domain: Arc<Domain<B>>,
    cache: Arc<RegistrationCache<B>>,
    requested: CacheKey,
    key: CacheKey,
    handle: B::Handle,
    interface_id: u64,
    registration: Option<Registration<B::Handle>>,
}

impl<B: RegistrationBackend> MemoryRegion<B> {
    /// Range the caller asked for.
    pub fn requested(&self) -> CacheKey {
        self.requested
    }

    /// Range actually registered; covers the requested one.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Hardware handle.
    pub fn handle(&self) -> &B::Handle {
        &self.handle
    }

    /// Interface the registration lives on.
    pub fn interface_id(&self) -> u64 {
        self.interface_id
    }

    /// Domain the region was registered through.
    pub fn domain(&self) -> &Arc<Domain<B>> {
        &self.domain
    }

    /// Release the region.
    pub fn close(mut self) -> Result<()> {
        match self.registration.take() {
            Some(registration) => {
                let _span = instrument_cache(&self.domain.name);
                self.cache.deregister(registration)
            }
            None => Ok(()),
        }
    }
}

impl<B: RegistrationBackend> Drop for MemoryRegion<B> {
    fn drop(&mut self) {
        let Some(registration) = self.registration.take() else {
            return;
        };
        tracing::warn!(
            domain = %self.domain.name,
            key = %self.key,
            "memory region dropped without close"
        );
        if let Err(err) = self.cache.deregister(registration) {
            tracing::warn!(domain = %self.domain.name, error = %err, "failed to release memory region");
        }
    }
}

impl<B: RegistrationBackend> std::fmt::Debug for MemoryRegion<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("domain", &self.domain.name)
            .field("requested", &self.requested)
            .field("key", &self.key)
            .field("handle", &self.handle)
            .field("interface_id", &self.interface_id)
            .finish()
    }
}
