//! In-process registration backend.

use super::access::HwAccess;
use super::backend::RegistrationBackend;
use super::key::CacheKey;
use crate::error::BackendError;
use std::collections::HashMap;
use thiserror::Error;

/// Handle issued by [`SoftwareBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareHandle {
    /// Sequence number of the registration.
    pub id: u64,
    /// Registered range.
    pub key: CacheKey,
    /// Registered access level.
    pub access: HwAccess,
}

/// A call observed by [`SoftwareBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    /// `register` was called (whether or not it succeeded).
    Register {
        /// Requested range.
        key: CacheKey,
        /// Requested access level.
        access: HwAccess,
    },
    /// `deregister` was called.
    Deregister {
        /// Handle being released.
        handle: SoftwareHandle,
    },
}

/// Errors produced by [`SoftwareBackend`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SoftwareBackendError {
    /// Failure requested through `fail_next_*`.
    #[error("injected {0} failure")]
    Injected(&'static str),
    /// The handle is not live (double deregistration).
    #[error("handle {0} is not registered")]
    UnknownHandle(u64),
}

/// A backend that keeps registrations in a table instead of pinning pages.
///
/// Every call is recorded so tests and benchmarks can see exactly what the
/// cache asked the hardware to do. Failures can be injected.
///
/// # Example
///
/// ```rust
/// use mrcache::memory::{CacheKey, HwAccess, RegistrationBackend, SoftwareBackend};
///
/// let mut backend = SoftwareBackend::new();
/// let handle = backend
///     .register(CacheKey::new(0x1000, 0x1000), HwAccess::ReadWrite)
///     .unwrap();
/// assert_eq!(backend.live_registrations(), 1);
/// backend.deregister(&handle).unwrap();
/// assert_eq!(backend.deregister_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    next_id: u64,
    live: HashMap<u64, SoftwareHandle>,
    calls: Vec<BackendCall>,
    fail_registrations: usize,
    fail_deregistrations: usize,
}

impl SoftwareBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` registrations fail.
    pub fn fail_next_registrations(&mut self, count: usize) {
        self.fail_registrations = count;
    }

    /// Make the next `count` deregistrations fail.
    pub fn fail_next_deregistrations(&mut self, count: usize) {
        self.fail_deregistrations = count;
    }

    /// Every call seen so far, in order.
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    /// Number of `register` calls (including failed ones).
    pub fn register_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Register { .. }))
            .count()
    }

    /// Number of `deregister` calls (including failed ones).
    pub fn deregister_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Deregister { .. }))
            .count()
    }

    /// Handles passed to `deregister`, in order.
    pub fn deregistered(&self) -> Vec<SoftwareHandle> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Deregister { handle } => Some(*handle),
                BackendCall::Register { .. } => None,
            })
            .collect()
    }

    /// Number of registrations currently live.
    pub fn live_registrations(&self) -> usize {
        self.live.len()
    }

    /// Is this handle still registered?
    pub fn is_live(&self, handle: &SoftwareHandle) -> bool {
        self.live.contains_key(&handle.id)
    }

    /// Forget the call log.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl RegistrationBackend for SoftwareBackend {
    type Handle = SoftwareHandle;

    fn register(
        &mut self,
        key: CacheKey,
        access: HwAccess,
    ) -> std::result::Result<SoftwareHandle, BackendError> {
        self.calls.push(BackendCall::Register { key, access });
        if self.fail_registrations > 0 {
            self.fail_registrations -= 1;
            return Err(Box::new(SoftwareBackendError::Injected("register")));
        }

        self.next_id += 1;
        let handle = SoftwareHandle {
            id: self.next_id,
            key,
            access,
        };
        self.live.insert(handle.id, handle);
        Ok(handle)
    }

    fn deregister(&mut self, handle: &SoftwareHandle) -> std::result::Result<(), BackendError> {
        self.calls.push(BackendCall::Deregister { handle: *handle });
        if self.fail_deregistrations > 0 {
            self.fail_deregistrations -= 1;
            return Err(Box::new(SoftwareBackendError::Injected("deregister")));
        }
        match self.live.remove(&handle.id) {
            Some(_) => Ok(()),
            None => Err(Box::new(SoftwareBackendError::UnknownHandle(handle.id))),
        }
    }
}
