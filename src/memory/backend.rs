//! Hardware registration backends and network interfaces.

use super::access::HwAccess;
use super::key::CacheKey;
use crate::error::{BackendError, Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Global counter for generating unique interface IDs.
static INTERFACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_interface_id() -> u64 {
    INTERFACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Trait for hardware memory-registration backends.
///
/// A backend pins a virtual-address range with one network interface and
/// hands back an opaque handle the NIC can use to reach it. Both calls may
/// block for a long time.
///
/// # Contract
///
/// - `register` either returns a handle that owns a live registration of
///   exactly `key`, or an error with nothing registered.
/// - `deregister` is called at most once per handle.
pub trait RegistrationBackend: Send {
    /// Opaque registration handle.
    type Handle: Clone + fmt::Debug + Send + Sync + 'static;

    /// Register `key` with the given access level.
    fn register(
        &mut self,
        key: CacheKey,
        access: HwAccess,
    ) -> std::result::Result<Self::Handle, BackendError>;

    /// Release a registration returned by `register`.
    fn deregister(&mut self, handle: &Self::Handle) -> std::result::Result<(), BackendError>;
}

/// One network interface and the backend that registers memory with it.
///
/// The backend sits behind its own lock, separate from any cache lock, so
/// that caches on different domains can share an interface.
pub struct Interface<B> {
    id: u64,
    name: String,
    backend: Mutex<B>,
}

impl<B: RegistrationBackend> Interface<B> {
    /// Wrap a backend as a shareable interface.
    pub fn new(name: &str, backend: B) -> Arc<Self> {
        Arc::new(Self {
            id: next_interface_id(),
            name: name.to_string(),
            backend: Mutex::new(backend),
        })
    }

    /// Unique id of this interface.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the backend for direct inspection.
    pub fn lock_backend(&self) -> Result<MutexGuard<'_, B>> {
        self.backend.lock().map_err(|_| {
            Error::Inconsistent(format!("interface {} lock poisoned", self.name))
        })
    }

    pub(crate) fn register(&self, key: CacheKey, access: HwAccess) -> Result<B::Handle> {
        let mut backend = self.lock_backend()?;
        backend.register(key, access).map_err(Error::Backend)
    }

    pub(crate) fn deregister(&self, handle: &B::Handle) -> Result<()> {
        let mut backend = self.lock_backend()?;
        backend.deregister(handle).map_err(Error::Backend)
    }
}

impl<B> fmt::Debug for Interface<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SoftwareBackend;

    #[test]
    fn test_interface_ids_are_unique() {
        let a = Interface::new("nic0", SoftwareBackend::new());
        let b = Interface::new("nic1", SoftwareBackend::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "nic0");
    }

    #[test]
    fn test_interface_forwards_to_backend() {
        let nic = Interface::new("nic0", SoftwareBackend::new());
        let key = CacheKey::new(0x1000, 0x1000);

        let handle = nic.register(key, HwAccess::ReadWrite).unwrap();
        assert_eq!(nic.lock_backend().unwrap().live_registrations(), 1);

        nic.deregister(&handle).unwrap();
        assert_eq!(nic.lock_backend().unwrap().live_registrations(), 0);
    }

    #[test]
    fn test_interface_surfaces_backend_error() {
        let nic = Interface::new("nic0", SoftwareBackend::new());
        nic.lock_backend().unwrap().fail_next_registrations(1);

        let err = nic
            .register(CacheKey::new(0x1000, 0x1000), HwAccess::ReadOnly)
            .unwrap_err();
        assert!(err.is_backend());
    }
}
