//! Shared engine context.
//!
//! One VPU serves every session in the process. Sessions hold an
//! `Arc<Vpu<E>>` and take the lock for the duration of each engine call;
//! the guard releases it on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::CodecError;

/// An engine behind a mutual-exclusion lock.
#[derive(Debug)]
pub struct Vpu<E> {
    engine: Mutex<E>,
}

impl<E> Vpu<E> {
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Exclusive access to the engine until the guard is dropped.
    pub fn lock(&self) -> Result<VpuGuard<'_, E>, CodecError> {
        let guard = self.engine.lock().map_err(|_| CodecError::LockPoisoned)?;
        tracing::trace!("VPU locked");
        Ok(VpuGuard { guard })
    }

    /// Recover the engine once no session holds the context any more.
    pub fn into_inner(self) -> Result<E, CodecError> {
        self.engine.into_inner().map_err(|_| CodecError::LockPoisoned)
    }
}

/// Lock-scoped access to the engine.
pub struct VpuGuard<'a, E> {
    guard: MutexGuard<'a, E>,
}

impl<E> Deref for VpuGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.guard
    }
}

impl<E> DerefMut for VpuGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.guard
    }
}

impl<E> Drop for VpuGuard<'_, E> {
    fn drop(&mut self) {
        tracing::trace!("VPU unlocked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_guard_releases_on_error_path() {
        let vpu = Arc::new(Vpu::new(0u32));

        let attempt = || -> Result<(), CodecError> {
            let mut engine = vpu.lock()?;
            *engine += 1;
            Err(CodecError::generic("engine call failed"))
        };
        assert!(attempt().is_err());

        // The lock must be free again.
        assert_eq!(*vpu.lock().unwrap(), 1);
    }

    #[test]
    fn test_poisoned_lock() {
        let vpu = Arc::new(Vpu::new(0u32));
        let shared = Arc::clone(&vpu);
        let _ = std::thread::spawn(move || {
            let _guard = shared.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(matches!(vpu.lock(), Err(CodecError::LockPoisoned)));
    }
}
