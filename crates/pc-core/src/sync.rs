//! # sync
//!
//! why: let a caller block until a cluster-wide parameter change has been applied
//! relations: armed by proto.rs set_param, resolved when the weight-change install comes back
//! what: ParamSync handle, SyncOutcome, SyncCallback

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::PcError;

/// How a parameter synchronisation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every member applied the change
    Synced,
    /// The waiter gave up first
    TimedOut,
    /// Superseded by a view change or a forced close
    Aborted,
}

/// Invoked once with the outcome of a synchronisation
pub type SyncCallback = Box<dyn FnOnce(SyncOutcome) + Send>;

#[derive(Default)]
struct Slot {
    pending: Option<String>,
    last: Option<SyncOutcome>,
    callback: Option<SyncCallback>,
}

/// Shared handle on the pending parameter synchronisation.
///
/// Clones refer to the same slot, so a host thread can wait in
/// [`ParamSync::sync_param`] while the event loop resolves it.
#[derive(Clone, Default)]
pub struct ParamSync {
    inner: Arc<(Mutex<Slot>, Condvar)>,
}

impl ParamSync {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a synchronisation for `key`. Fails if one is already pending.
    pub fn begin(&self, key: &str, callback: Option<SyncCallback>) -> Result<(), PcError> {
        let mut slot = self.slot();
        if slot.pending.is_some() {
            return Err(PcError::SyncPending);
        }
        debug!(key, "parameter sync armed");
        slot.pending = Some(key.to_string());
        slot.last = None;
        slot.callback = callback;
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.slot().pending.is_some()
    }

    /// Key of the pending synchronisation, if any
    pub fn pending_key(&self) -> Option<String> {
        self.slot().pending.clone()
    }

    /// Resolve as synced. Returns false when nothing was pending.
    pub fn complete(&self) -> bool {
        self.resolve(SyncOutcome::Synced)
    }

    /// Resolve as aborted. Returns false when nothing was pending.
    pub fn abort(&self) -> bool {
        self.resolve(SyncOutcome::Aborted)
    }

    fn resolve(&self, outcome: SyncOutcome) -> bool {
        let callback = {
            let mut slot = self.slot();
            let Some(key) = slot.pending.take() else {
                return false;
            };
            debug!(key = %key, ?outcome, "parameter sync resolved");
            slot.last = Some(outcome);
            slot.callback.take()
        };
        self.inner.1.notify_all();
        if let Some(callback) = callback {
            callback(outcome);
        }
        true
    }

    /// Block until the pending synchronisation resolves.
    ///
    /// With `timeout` the wait is bounded; expiry resolves the sync as
    /// [`SyncOutcome::TimedOut`]. Without a pending sync this returns the
    /// outcome of the last one, or `Synced` if there never was one.
    pub fn sync_param(&self, timeout: Option<Duration>) -> SyncOutcome {
        let (lock, condvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut slot = match timeout {
            Some(timeout) => {
                condvar
                    .wait_timeout_while(guard, timeout, |slot| slot.pending.is_some())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => condvar
                .wait_while(guard, |slot| slot.pending.is_some())
                .unwrap_or_else(PoisonError::into_inner),
        };

        if slot.pending.take().is_none() {
            return slot.last.unwrap_or(SyncOutcome::Synced);
        }

        slot.last = Some(SyncOutcome::TimedOut);
        let callback = slot.callback.take();
        drop(slot);
        condvar.notify_all();
        if let Some(callback) = callback {
            callback(SyncOutcome::TimedOut);
        }
        SyncOutcome::TimedOut
    }
}

impl fmt::Debug for ParamSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();
        f.debug_struct("ParamSync")
            .field("pending", &slot.pending)
            .field("last", &slot.last)
            .finish()
    }
}
