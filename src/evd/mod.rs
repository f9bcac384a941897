//! Event dispatcher.
//!
//! An EVD owns `qlen` event slots which live either on its free ring, on its
//! pending ring or in a producer's hands as an [`EventSlot`]. Producers take
//! a free slot, fill it and post it to the pending ring; consumers dequeue or
//! wait. EVDs that carry DTO or RMR-bind events also own a completion queue,
//! whose entries are translated into events lazily by the consumer. The
//! transport reports completion-queue notifications through
//! [`Ia::on_cq_event`](crate::Ia::on_cq_event), which wakes the waiter or
//! triggers the attached CNO.

mod dto;
mod event;
mod flags;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use quanta::Instant;

pub use self::event::*;
pub use self::flags::*;
use crate::cno::Cno;
use crate::cq::{CompletionQueue, CqWait, NotifyMode};
use crate::error::*;
use crate::ia::IaShared;
use crate::rbuf::RingBuffer;
use crate::type_alias::*;

/// Lifecycle state of an EVD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EvdState {
    /// Being created.
    Initial = 0,
    /// Usable, nobody waiting.
    Open = 1,
    /// A consumer is blocked in [`Evd::wait`].
    Waited = 2,
    /// Overflowed or freed.
    Dead = 3,
}

impl From<u8> for EvdState {
    fn from(v: u8) -> Self {
        match v {
            0 => EvdState::Initial,
            1 => EvdState::Open,
            2 => EvdState::Waited,
            _ => EvdState::Dead,
        }
    }
}

/// Whether producers must hold the EVD lock while they hold an event slot.
///
/// Decided once at creation. EVDs fed only from their own completion queue
/// are produced into by the consumer itself and need no producer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerLocking {
    Required,
    NotRequired,
}

/// Snapshot of an EVD's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvdParam {
    pub id: EvdId,
    pub qlen: usize,
    pub flags: EvdFlags,
    pub state: EvdState,
    pub pending: usize,
    pub cno: Option<CnoId>,
    pub enabled: bool,
    pub waitable: bool,
}

/// State guarded by the EVD lock.
pub(crate) struct EvdShared {
    /// Pending count a blocked waiter needs.
    threshold: usize,
    qlen: usize,
    /// A completion-queue notification arrived for the current waiter.
    cq_event: bool,
}

struct EventPools {
    free: RingBuffer<Box<Event>>,
    pending: RingBuffer<Box<Event>>,
}

pub(crate) struct EvdInner {
    id: EvdId,
    flags: EvdFlags,
    locking: ProducerLocking,
    ia: Weak<IaShared>,

    state: AtomicU8,
    shared: Mutex<EvdShared>,
    cond: parking_lot::Condvar,
    pools: RwLock<EventPools>,

    cq: Option<Arc<dyn CompletionQueue>>,
    cno: Option<Cno>,

    enabled: AtomicBool,
    waitable: AtomicBool,
    catastrophic_overflow: AtomicBool,

    /// Number of endpoints and service points using this EVD.
    ref_count: AtomicU32,
}

/// Event dispatcher.
#[derive(Clone)]
pub struct Evd {
    pub(crate) inner: Arc<EvdInner>,
}

impl std::fmt::Debug for Evd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evd")
            .field("id", &self.inner.id)
            .field("flags", &self.inner.flags)
            .field("state", &self.inner.state())
            .finish()
    }
}

/// An event taken from an EVD's free pool, to be filled and posted.
///
/// Dropping the slot without posting returns it to the free pool. If the EVD
/// requires producer locking, the slot holds the EVD lock until it is posted
/// or dropped.
pub struct EventSlot<'a> {
    evd: &'a EvdInner,
    event: Option<Box<Event>>,
    guard: Option<MutexGuard<'a, EvdShared>>,
}

impl EventSlot<'_> {
    /// Post the event to the pending queue, waking a waiter or triggering the
    /// CNO as appropriate.
    pub fn post(self) -> DatResult<()> {
        let evd = self.evd;
        evd.post_inner(self, true)
    }

    pub(crate) fn post_nosignal(self) -> DatResult<()> {
        let evd = self.evd;
        evd.post_inner(self, false)
    }
}

impl Deref for EventSlot<'_> {
    type Target = Event;

    fn deref(&self) -> &Event {
        // `event` is only taken when the slot is consumed.
        self.event.as_deref().unwrap_or(&EMPTY_EVENT)
    }
}

impl DerefMut for EventSlot<'_> {
    fn deref_mut(&mut self) -> &mut Event {
        self.event.get_or_insert_with(Box::default)
    }
}

static EMPTY_EVENT: Event = Event {
    number: EventNumber::Software,
    evd: EvdId(0),
    data: EventData::None,
};

impl Drop for EventSlot<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.evd.release_event(event);
        }
    }
}

impl EvdInner {
    #[inline]
    fn state(&self) -> EvdState {
        EvdState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: EvdState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn ia(&self) -> DatResult<Arc<IaShared>> {
        self.ia
            .upgrade()
            .ok_or(DatError::InvalidHandle(HandleKind::Ia))
    }

    fn release_event(&self, mut event: Box<Event>) {
        event.clear();
        if self.pools.read().free.add(event).is_err() {
            log::error!("rdapl: {} free pool full on release, event slot lost", self.id);
        }
    }

    pub(crate) fn get_free_event(&self) -> DatResult<EventSlot<'_>> {
        if self.state() == EvdState::Dead {
            return Err(DatError::InvalidState(StateReason::EvdDead));
        }

        let guard = match self.locking {
            ProducerLocking::Required => Some(self.shared.lock()),
            ProducerLocking::NotRequired => None,
        };
        let event = self.pools.read().free.remove();
        match event {
            Some(mut event) => {
                event.clear();
                event.evd = self.id;
                Ok(EventSlot {
                    evd: self,
                    event: Some(event),
                    guard,
                })
            }
            None => {
                drop(guard);
                self.overflow();
                Err(DatError::InsufficientResources(Resource::Event))
            }
        }
    }

    /// Mark this EVD catastrophically overflowed and report it once on the
    /// async EVD.
    fn overflow(&self) {
        if self.catastrophic_overflow.swap(true, Ordering::AcqRel) {
            return;
        }
        log::warn!("rdapl: {} overflowed, no free event slot", self.id);
        {
            let _guard = self.shared.lock();
            self.set_state(EvdState::Dead);
        }
        self.wake_waiter();

        let Some(ia) = self.ia.upgrade() else {
            return;
        };
        let Some(async_evd) = ia.async_evd() else {
            return;
        };
        if async_evd.inner.id == self.id {
            return;
        }
        let res = async_evd.inner.post_async_error(
            EventNumber::AsyncEvdOverflow,
            AsyncSource::Evd(self.id),
        );
        if let Err(e) = res {
            log::warn!("rdapl: cannot report overflow of {}: {}", self.id, e);
        }
    }

    fn post_inner(&self, mut slot: EventSlot<'_>, signal: bool) -> DatResult<()> {
        let Some(event) = slot.event.take() else {
            return Ok(());
        };
        let guard = slot.guard.take();
        drop(slot);

        let added = self.pools.read().pending.add(event);
        if let Err(full) = added {
            drop(guard);
            self.release_event(full.into_inner());
            return Err(DatError::InsufficientResources(Resource::RingBuffer));
        }

        match self.state() {
            EvdState::Open => {
                let cno = match self.enabled.load(Ordering::Acquire) {
                    true => self.cno.clone(),
                    false => None,
                };
                drop(guard);
                if let Some(cno) = cno {
                    cno.trigger(self.id);
                }
            }
            EvdState::Waited if signal => {
                let guard = guard.unwrap_or_else(|| self.shared.lock());
                let wake = self.state() == EvdState::Waited
                    && self.pools.read().pending.count() >= guard.threshold;
                drop(guard);
                if wake {
                    self.wake_waiter();
                }
            }
            _ => drop(guard),
        }
        Ok(())
    }

    /// Wake a consumer blocked in `wait`, on whichever primitive it blocks on.
    fn wake_waiter(&self) {
        match (&self.cq, &self.cno) {
            (Some(cq), None) => cq.wake(),
            _ => {
                self.cond.notify_all();
            }
        }
    }

    /// Handle a notification from the completion queue.
    ///
    /// A waiter is woken to drain the queue. Otherwise an enabled CNO is
    /// triggered and the queue re-armed for the next completion.
    pub(crate) fn cq_event(&self) {
        let mut guard = self.shared.lock();
        match self.state() {
            EvdState::Waited => {
                guard.cq_event = true;
                drop(guard);
                self.wake_waiter();
            }
            EvdState::Open => {
                let cno = match self.enabled.load(Ordering::Acquire) {
                    true => self.cno.clone(),
                    false => None,
                };
                drop(guard);
                let Some(cno) = cno else {
                    return;
                };
                if let Some(cq) = &self.cq {
                    if let Err(e) = cq.arm(NotifyMode::NextCompletion) {
                        log::warn!("rdapl: cannot re-arm CQ of {}: {}", self.id, e);
                    }
                }
                cno.trigger(self.id);
            }
            _ => log::trace!("rdapl: CQ event on {} in state {:?}", self.id, self.state()),
        }
    }

    fn post_with(&self, f: impl FnOnce(&mut Event)) -> DatResult<()> {
        let mut slot = self.get_free_event()?;
        f(&mut slot);
        slot.post()
    }

    pub(crate) fn post_async_error(
        &self,
        number: EventNumber,
        source: AsyncSource,
    ) -> DatResult<()> {
        self.post_with(|ev| {
            ev.number = number;
            ev.data = EventData::AsyncError { source };
        })
    }

    pub(crate) fn post_cr_arrival(&self, sp: SpId, conn_qual: ConnQual, cr: CrId) -> DatResult<()> {
        self.post_with(|ev| {
            ev.number = EventNumber::ConnectionRequest;
            ev.data = EventData::ConnectionRequest { sp, conn_qual, cr };
        })
    }

    pub(crate) fn post_connection(
        &self,
        number: EventNumber,
        ep: EpId,
        private_data: &[u8],
    ) -> DatResult<()> {
        self.post_with(|ev| {
            ev.number = number;
            ev.data = EventData::Connection {
                ep,
                private_data: private_data.to_vec(),
            };
        })
    }
}

impl Evd {
    pub(crate) fn create(
        ia: &Arc<IaShared>,
        id: EvdId,
        qlen: usize,
        cno: Option<&Cno>,
        flags: EvdFlags,
    ) -> DatResult<Self> {
        let config = &ia.config;
        let qlen = if qlen == 0 { config.default_evd_qlen } else { qlen };
        if qlen > config.max_evd_qlen {
            return Err(DatError::InvalidParameter(Param::QueueLength));
        }
        if flags.is_empty() {
            return Err(DatError::InvalidParameter(Param::Flags));
        }

        let locking = if !(flags - EvdFlags::DTO - EvdFlags::RMR_BIND).is_empty() || cno.is_some()
        {
            ProducerLocking::Required
        } else {
            ProducerLocking::NotRequired
        };

        let free = RingBuffer::new(qlen)?;
        let pending = RingBuffer::new(qlen)?;
        for _ in 0..qlen {
            free.add(Box::default())?;
        }

        let cq = if flags.needs_cq() {
            let cq = ia
                .transport
                .create_cq(id, qlen + config.cq_depth_slack)
                .map_err(|e| {
                    log::warn!("rdapl: cannot create CQ for {}: {}", id, e);
                    DatError::InsufficientResources(Resource::Transport)
                })?;
            Some(cq)
        } else {
            None
        };

        let inner = EvdInner {
            id,
            flags,
            locking,
            ia: Arc::downgrade(ia),
            state: AtomicU8::new(EvdState::Initial as u8),
            shared: Mutex::new(EvdShared {
                threshold: 0,
                qlen,
                cq_event: false,
            }),
            cond: parking_lot::Condvar::new(),
            pools: RwLock::new(EventPools { free, pending }),
            cq,
            cno: cno.cloned(),
            enabled: AtomicBool::new(true),
            waitable: AtomicBool::new(true),
            catastrophic_overflow: AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
        };
        if let Some(cno) = &inner.cno {
            cno.attach();
            if let Some(cq) = &inner.cq {
                if let Err(e) = cq.arm(NotifyMode::NextCompletion) {
                    log::warn!("rdapl: cannot arm CQ of {}: {}", id, e);
                }
            }
        }
        inner.set_state(EvdState::Open);

        log::debug!(
            "rdapl: created {} qlen {} flags {:?} locking {:?}",
            id,
            qlen,
            flags,
            locking
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[inline]
    pub fn id(&self) -> EvdId {
        self.inner.id
    }

    #[inline]
    pub fn flags(&self) -> EvdFlags {
        self.inner.flags
    }

    #[inline]
    pub fn state(&self) -> EvdState {
        self.inner.state()
    }

    #[inline]
    pub fn producer_locking(&self) -> ProducerLocking {
        self.inner.locking
    }

    /// The completion queue feeding this EVD, if it carries DTO events.
    pub fn cq(&self) -> Option<&Arc<dyn CompletionQueue>> {
        self.inner.cq.as_ref()
    }

    pub fn query(&self) -> EvdParam {
        let qlen = self.inner.shared.lock().qlen;
        EvdParam {
            id: self.inner.id,
            qlen,
            flags: self.inner.flags,
            state: self.inner.state(),
            pending: self.inner.pools.read().pending.count(),
            cno: self.inner.cno.as_ref().map(Cno::id),
            enabled: self.inner.enabled.load(Ordering::Acquire),
            waitable: self.inner.waitable.load(Ordering::Acquire),
        }
    }

    /// Take a free event slot to fill and post.
    ///
    /// When none is left, the EVD is marked overflowed and the overflow is
    /// reported to the async EVD.
    pub fn get_free_event(&self) -> DatResult<EventSlot<'_>> {
        self.inner.get_free_event()
    }

    /// Post a software event carrying `value`.
    pub fn post_se(&self, value: u64) -> DatResult<()> {
        self.inner.post_with(|ev| {
            ev.number = EventNumber::Software;
            ev.data = EventData::Software(value);
        })
    }

    /// Let events trigger the attached CNO.
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::Release);
    }

    /// Stop triggering the attached CNO.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Release);
    }

    /// Refuse further waits and evict the current waiter, which returns an
    /// invalid-state error.
    pub fn set_unwaitable(&self) {
        let _guard = self.inner.shared.lock();
        self.inner.waitable.store(false, Ordering::Release);
        if self.inner.state() == EvdState::Waited {
            self.inner.wake_waiter();
        }
    }

    pub fn clear_unwaitable(&self) {
        let _guard = self.inner.shared.lock();
        self.inner.waitable.store(true, Ordering::Release);
    }

    /// Take the oldest pending event, or translate one completion straight
    /// from the completion queue if none is pending.
    pub fn dequeue(&self) -> DatResult<Event> {
        let ia = self.inner.ia()?;
        let guard = self.inner.shared.lock();
        match self.inner.state() {
            EvdState::Open => {}
            EvdState::Waited => return Err(DatError::InvalidState(StateReason::EvdWaited)),
            EvdState::Dead => return Err(DatError::InvalidState(StateReason::EvdDead)),
            EvdState::Initial => return Err(DatError::InvalidState(StateReason::EvdNotOpen)),
        }

        let pending = self.inner.pools.read().pending.remove();
        if let Some(mut event) = pending {
            let out = std::mem::take(&mut *event);
            drop(guard);
            self.inner.release_event(event);
            return Ok(out);
        }

        let mut result = Err(DatError::QueueEmpty);
        let mut broken = None;
        if let Some(cq) = &self.inner.cq {
            while let Some(wc) = cq.poll_one()? {
                if let Some((mut event, ep)) = self.inner.translate_cqe(&ia, &wc) {
                    event.evd = self.inner.id;
                    result = Ok(event);
                    broken = ep;
                    break;
                }
            }
        }
        drop(guard);

        if let Some(ep) = broken {
            ep.connection_broken();
        }
        result
    }

    /// Block until at least `threshold` events are pending or `timeout`
    /// elapses, then dequeue one. Return the event and the number of events
    /// still pending.
    ///
    /// Only one thread may wait at a time. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>, threshold: usize) -> DatResult<(Event, usize)> {
        let inner = &*self.inner;
        let start = Instant::now();

        let mut guard = inner.shared.lock();
        if threshold == 0 || threshold > guard.qlen || (inner.cno.is_some() && threshold > 1) {
            return Err(DatError::InvalidParameter(Param::Threshold));
        }
        if !inner.waitable.load(Ordering::Acquire) {
            return Err(DatError::InvalidState(StateReason::EvdUnwaitable));
        }
        match inner.state() {
            EvdState::Open => {}
            EvdState::Waited => return Err(DatError::InvalidState(StateReason::EvdWaited)),
            EvdState::Dead => return Err(DatError::InvalidState(StateReason::EvdDead)),
            EvdState::Initial => return Err(DatError::InvalidState(StateReason::EvdNotOpen)),
        }
        inner.set_state(EvdState::Waited);
        guard.threshold = threshold;
        guard.cq_event = false;

        let res = self.wait_loop(&mut guard, start, timeout, threshold);

        if inner.state() == EvdState::Waited {
            inner.set_state(EvdState::Open);
        }
        guard.threshold = 0;
        res?;

        let event = inner.pools.read().pending.remove();
        let Some(mut event) = event else {
            return Err(DatError::QueueEmpty);
        };
        let out = std::mem::take(&mut *event);
        let remaining = inner.pools.read().pending.count();
        drop(guard);
        inner.release_event(event);
        Ok((out, remaining))
    }

    fn wait_loop(
        &self,
        guard: &mut MutexGuard<'_, EvdShared>,
        start: Instant,
        timeout: Option<Duration>,
        threshold: usize,
    ) -> DatResult<()> {
        let inner = &*self.inner;
        let mut notify_requested = false;
        loop {
            if inner.cq.is_some() {
                MutexGuard::unlocked(guard, || inner.copy_cq());
            }
            if inner.pools.read().pending.count() >= threshold {
                return Ok(());
            }
            if inner.state() == EvdState::Dead {
                return Err(DatError::InvalidState(StateReason::EvdDead));
            }

            if !notify_requested {
                if let Some(cq) = &inner.cq {
                    cq.arm(NotifyMode::NextCompletion)?;
                }
                notify_requested = true;
                continue;
            }

            let remaining = match timeout {
                None => None,
                Some(t) => match t.checked_sub(start.elapsed()) {
                    Some(r) if !r.is_zero() => Some(r),
                    _ => return self.timed_out(guard, threshold),
                },
            };

            match (&inner.cq, &inner.cno) {
                (Some(cq), None) => {
                    if MutexGuard::unlocked(guard, || cq.wait(remaining))? == CqWait::TimedOut {
                        return self.timed_out(guard, threshold);
                    }
                }
                _ => match remaining {
                    // Arrived while the queue was being drained unlocked.
                    _ if std::mem::take(&mut guard.cq_event) => {}
                    None => inner.cond.wait(guard),
                    Some(r) => {
                        inner.cond.wait_for(guard, r);
                    }
                },
            }
            notify_requested = false;

            if !inner.waitable.load(Ordering::Acquire) {
                return Err(DatError::InvalidState(StateReason::EvdUnwaitable));
            }
        }
    }

    /// Last look at the queue before reporting a timeout.
    fn timed_out(&self, guard: &mut MutexGuard<'_, EvdShared>, threshold: usize) -> DatResult<()> {
        let inner = &*self.inner;
        if inner.cq.is_some() {
            MutexGuard::unlocked(guard, || inner.copy_cq());
        }
        if inner.pools.read().pending.count() >= threshold {
            Ok(())
        } else {
            Err(DatError::Timeout)
        }
    }

    /// Grow the event queue to `new_qlen` events.
    ///
    /// Refused while a consumer waits, when fewer than `new_qlen` slots would
    /// not hold the events already pending, and for shrinking.
    pub fn resize(&self, new_qlen: usize) -> DatResult<()> {
        let inner = &*self.inner;
        let ia = inner.ia()?;
        if new_qlen == 0 || new_qlen > ia.config.max_evd_qlen {
            return Err(DatError::InvalidParameter(Param::QueueLength));
        }

        let mut guard = inner.shared.lock();
        match inner.state() {
            EvdState::Waited => return Err(DatError::InvalidState(StateReason::EvdWaited)),
            EvdState::Dead => return Err(DatError::InvalidState(StateReason::EvdDead)),
            _ => {}
        }

        let mut pools = inner.pools.write();
        if new_qlen < pools.pending.count() {
            return Err(DatError::InvalidState(StateReason::EvdPending));
        }
        if new_qlen <= guard.qlen {
            return Err(DatError::InvalidParameter(Param::QueueLength));
        }

        if let Some(cq) = &inner.cq {
            cq.resize(new_qlen + ia.config.cq_depth_slack).map_err(|e| {
                log::warn!("rdapl: cannot resize CQ of {}: {}", inner.id, e);
                DatError::InsufficientResources(Resource::Transport)
            })?;
        }
        if new_qlen > pools.free.capacity() {
            pools.free.resize(new_qlen)?;
        }
        if new_qlen > pools.pending.capacity() {
            pools.pending.resize(new_qlen)?;
        }
        for _ in guard.qlen..new_qlen {
            pools.free.add(Box::default())?;
        }

        log::debug!("rdapl: resized {} from {} to {}", inner.id, guard.qlen, new_qlen);
        guard.qlen = new_qlen;
        Ok(())
    }

    pub(crate) fn add_ref(&self) {
        self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_ref(&self) {
        self.inner.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.inner.ref_count.load(Ordering::Acquire)
    }

    /// Destroy the EVD. Refused while an endpoint or service point uses it or
    /// a consumer waits on it.
    pub fn free(&self) -> DatResult<()> {
        let inner = &*self.inner;
        if self.ref_count() > 0 {
            return Err(DatError::InvalidState(StateReason::EvdInUse));
        }
        {
            let _guard = inner.shared.lock();
            if inner.state() == EvdState::Waited {
                return Err(DatError::InvalidState(StateReason::EvdWaited));
            }
            inner.set_state(EvdState::Dead);
        }

        if let Some(ia) = inner.ia.upgrade() {
            if let Some(cq) = &inner.cq {
                if let Err(e) = ia.transport.destroy_cq(cq) {
                    log::warn!("rdapl: cannot destroy CQ of {}: {}", inner.id, e);
                }
            }
            ia.unregister_evd(inner.id);
        }
        if let Some(cno) = &inner.cno {
            cno.detach();
        }
        log::debug!("rdapl: freed {}", inner.id);
        Ok(())
    }

    pub(crate) fn ptr_eq(&self, other: &Evd) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
