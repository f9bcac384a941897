//! Shared receive queue.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::cookie::*;
use crate::error::*;
use crate::ia::IaShared;
use crate::transport::{RecvWr, SrqHandle};
use crate::type_alias::*;

struct SrqInner {
    id: SrqId,
    ia: Weak<IaShared>,
    handle: SrqHandle,
    cookies: CookieBuffer,
    /// Number of endpoints receiving through this SRQ.
    ep_count: AtomicU32,
    freed: AtomicBool,
}

/// Shared receive queue. Receive buffers posted here can be consumed by any
/// endpoint attached to it.
#[derive(Clone)]
pub struct Srq {
    inner: Arc<SrqInner>,
}

impl std::fmt::Debug for Srq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Srq")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle)
            .finish()
    }
}

impl Srq {
    pub(crate) fn create(ia: &Arc<IaShared>, id: SrqId, max_recv_dtos: usize) -> DatResult<Self> {
        let cookies = CookieBuffer::new(CookieOwner::Srq(id), CookieQueue::Receive, max_recv_dtos)?;
        let handle = ia.transport.create_srq(max_recv_dtos)?;
        log::debug!("rdapl: created {} with {} receive slots", id, max_recv_dtos);
        Ok(Self {
            inner: Arc::new(SrqInner {
                id,
                ia: Arc::downgrade(ia),
                handle,
                cookies,
                ep_count: AtomicU32::new(0),
                freed: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> SrqId {
        self.inner.id
    }

    #[inline]
    pub(crate) fn handle(&self) -> SrqHandle {
        self.inner.handle
    }

    #[inline]
    pub(crate) fn cookies(&self) -> &CookieBuffer {
        &self.inner.cookies
    }

    /// Number of receives posted and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.inner.cookies.pending_count()
    }

    /// Post a receive buffer.
    pub fn post_recv(&self, local: &[LmrTriplet], user_cookie: u64) -> DatResult<()> {
        let ia = self
            .inner
            .ia
            .upgrade()
            .ok_or(DatError::InvalidHandle(HandleKind::Ia))?;
        if self.inner.freed.load(Ordering::Acquire) {
            return Err(DatError::InvalidHandle(HandleKind::Srq));
        }

        let size = local.iter().map(|seg| seg.segment_length).sum();
        let cookie = self.inner.cookies.allocate(CookieKind::Dto {
            op: DtoOp::Recv,
            user_cookie,
            size,
        })?;
        let wr = RecvWr {
            wr_id: cookie.wr_id(),
            local,
        };
        if let Err(e) = ia.transport.post_srq_recv(self.inner.handle, &wr) {
            self.inner.cookies.cancel(&cookie);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn attach_ep(&self) {
        self.inner.ep_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach_ep(&self) {
        self.inner.ep_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Destroy the SRQ. Refused while an endpoint uses it.
    pub fn free(&self) -> DatResult<()> {
        if self.inner.ep_count.load(Ordering::Acquire) > 0 {
            return Err(DatError::InvalidState(StateReason::SrqInUse));
        }
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(DatError::InvalidHandle(HandleKind::Srq));
        }
        if let Some(ia) = self.inner.ia.upgrade() {
            if let Err(e) = ia.transport.destroy_srq(self.inner.handle) {
                log::warn!("rdapl: cannot destroy {}: {}", self.inner.id, e);
            }
            ia.unregister_srq(self.inner.id);
        }
        Ok(())
    }

    pub(crate) fn ptr_eq(&self, other: &Srq) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
