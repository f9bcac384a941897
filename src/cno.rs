//! Completion notification object.
//!
//! A CNO aggregates wakeups from several EVDs: an EVD with an attached and
//! enabled CNO triggers it whenever an event lands while nobody waits on the
//! EVD itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use quanta::Instant;

use crate::error::*;
use crate::type_alias::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CnoState {
    Untriggered,
    Triggered(EvdId),
    Dead,
}

struct CnoInner {
    id: CnoId,
    /// Number of EVDs attached.
    ref_count: AtomicU32,
    state: Mutex<CnoState>,
    cond: Condvar,
}

/// Snapshot of a CNO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CnoParam {
    pub id: CnoId,
    pub attached_evds: u32,
    /// EVD that triggered the CNO and has not been consumed by a wait yet.
    pub triggered_by: Option<EvdId>,
}

/// Completion notification object.
#[derive(Clone)]
pub struct Cno {
    inner: Arc<CnoInner>,
}

impl std::fmt::Debug for Cno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cno").field("id", &self.inner.id).finish()
    }
}

impl Cno {
    pub(crate) fn new(id: CnoId) -> Self {
        Self {
            inner: Arc::new(CnoInner {
                id,
                ref_count: AtomicU32::new(0),
                state: Mutex::new(CnoState::Untriggered),
                cond: Condvar::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> CnoId {
        self.inner.id
    }

    pub fn query(&self) -> CnoParam {
        let triggered_by = match *self.inner.state.lock() {
            CnoState::Triggered(evd) => Some(evd),
            _ => None,
        };
        CnoParam {
            id: self.inner.id,
            attached_evds: self.inner.ref_count.load(Ordering::Acquire),
            triggered_by,
        }
    }

    /// Record that `evd` has an event and wake a waiter. A CNO that is
    /// already triggered keeps its first trigger source.
    pub(crate) fn trigger(&self, evd: EvdId) {
        let mut state = self.inner.state.lock();
        if *state == CnoState::Untriggered {
            *state = CnoState::Triggered(evd);
            self.inner.cond.notify_one();
        }
    }

    /// Block until the CNO is triggered and return the triggering EVD. The
    /// CNO goes back to untriggered.
    pub fn wait(&self, timeout: Option<Duration>) -> DatResult<EvdId> {
        let start = Instant::now();
        let mut state = self.inner.state.lock();
        loop {
            match *state {
                CnoState::Triggered(evd) => {
                    *state = CnoState::Untriggered;
                    return Ok(evd);
                }
                CnoState::Dead => return Err(DatError::InvalidState(StateReason::CnoDead)),
                CnoState::Untriggered => {}
            }

            match timeout {
                None => self.inner.cond.wait(&mut state),
                Some(t) => {
                    let elapsed = start.elapsed();
                    if elapsed >= t {
                        return Err(DatError::Timeout);
                    }
                    self.inner.cond.wait_for(&mut state, t - elapsed);
                }
            }
        }
    }

    pub(crate) fn attach(&self) {
        self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        self.inner.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Destroy the CNO. Refused while an EVD is attached. Pending waiters
    /// return an invalid-state error.
    pub fn free(&self) -> DatResult<()> {
        if self.inner.ref_count.load(Ordering::Acquire) > 0 {
            return Err(DatError::InvalidState(StateReason::CnoInUse));
        }
        *self.inner.state.lock() = CnoState::Dead;
        self.inner.cond.notify_all();
        Ok(())
    }
}
