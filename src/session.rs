//! Exclusive, scoped access to the acquisition subsystem.
//!
//! Only one producer can be loaded at a time and switching requires a full
//! reset. `SubsystemSession` owns the subsystem behind a mutex; every caller
//! that needs a producer takes a [`SessionGuard`], which activates the producer
//! on creation and, on release, closes leftover sessions, resets, and restores
//! whichever producer was active before.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{ConformanceError, Result};
use crate::traits::{AcquisitionSubsystem, ProducerRef};

/// Owner of the process-wide acquisition subsystem.
pub struct SubsystemSession {
    inner: Mutex<Box<dyn AcquisitionSubsystem>>,
}

impl SubsystemSession {
    /// Take ownership of a subsystem.
    pub fn new(subsystem: impl AcquisitionSubsystem + 'static) -> Self {
        Self::from_boxed(Box::new(subsystem))
    }

    /// Take ownership of an already boxed subsystem.
    pub fn from_boxed(subsystem: Box<dyn AcquisitionSubsystem>) -> Self {
        Self {
            inner: Mutex::new(subsystem),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn AcquisitionSubsystem>>> {
        self.inner
            .lock()
            .map_err(|_| ConformanceError::SubsystemQuery("subsystem lock poisoned".to_owned()))
    }

    /// Activate `producer` and reset the subsystem.
    ///
    /// Blocks while another guard is alive.
    pub fn acquire(&self, producer: &ProducerRef) -> Result<SessionGuard<'_>> {
        let mut inner = self.lock()?;
        let previous = inner.active_producer();

        let activated = match inner.set_active_producer(Some(producer.path())) {
            Ok(()) => inner.reset(),
            Err(err) => Err(err),
        };
        if let Err(err) = activated {
            if let Err(restore_err) = inner.set_active_producer(previous.as_deref()) {
                warn!(error = %restore_err, "failed to restore previous producer");
            }
            return Err(err);
        }
        debug!(producer = %producer, "producer activated");

        Ok(SessionGuard {
            inner,
            previous,
            producer: Some(producer.clone()),
            released: false,
        })
    }

    /// Exclusive access without switching producers.
    pub fn acquire_current(&self) -> Result<SessionGuard<'_>> {
        let inner = self.lock()?;
        let previous = inner.active_producer();
        Ok(SessionGuard {
            inner,
            previous,
            producer: None,
            released: false,
        })
    }

    /// Producer active right now, outside any guard.
    pub fn active_producer(&self) -> Result<Option<PathBuf>> {
        Ok(self.lock()?.active_producer())
    }
}

impl std::fmt::Debug for SubsystemSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemSession").finish_non_exhaustive()
    }
}

/// Scoped exclusive access to the subsystem with one producer active.
pub struct SessionGuard<'a> {
    inner: MutexGuard<'a, Box<dyn AcquisitionSubsystem>>,
    previous: Option<PathBuf>,
    producer: Option<ProducerRef>,
    released: bool,
}

impl SessionGuard<'_> {
    /// Producer this guard activated, if it switched producers.
    pub const fn producer(&self) -> Option<&ProducerRef> {
        self.producer.as_ref()
    }

    /// Release the guard, returning how many sessions were still open.
    ///
    /// Leftover sessions are closed by the reset either way; a non-zero count
    /// means the caller leaked them.
    pub fn release(mut self) -> Result<usize> {
        self.released = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<usize> {
        let leaked = self.inner.open_session_count();
        self.inner.reset()?;
        if self.producer.is_some() && self.inner.active_producer() != self.previous {
            self.inner.set_active_producer(self.previous.as_deref())?;
            self.inner.reset()?;
        }
        Ok(leaked)
    }
}

impl Deref for SessionGuard<'_> {
    type Target = dyn AcquisitionSubsystem;

    fn deref(&self) -> &Self::Target {
        &**self.inner
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.inner
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.restore() {
            Ok(0) => {}
            Ok(leaked) => warn!(leaked, "sessions left open when guard was dropped"),
            Err(err) => warn!(error = %err, "failed to reset subsystem on guard drop"),
        }
    }
}
