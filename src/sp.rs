//! Service points: public (PSP) and reserved (RSP).

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::cr::Cr;
use crate::ep::Ep;
use crate::error::*;
use crate::evd::{Evd, EvdFlags};
use crate::ia::IaShared;
use crate::type_alias::*;

/// Who provides the endpoint for connection requests on a PSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PspFlags {
    /// The consumer passes its own endpoint to accept.
    ConsumerEp,
    /// An endpoint is created with each request, in tentative state.
    ProviderEp,
}

/// Service point flavor.
#[derive(Debug, Clone)]
pub enum SpKind {
    /// Public service point; accepts any number of requests.
    Psp { flags: PspFlags },
    /// Reserved service point; accepts one request, on the bound endpoint.
    Rsp { ep: Ep },
}

/// Snapshot of a service point.
#[derive(Debug, Clone)]
pub struct SpParam {
    pub id: SpId,
    pub conn_qual: ConnQual,
    pub evd: EvdId,
    pub kind: SpKind,
    pub listening: bool,
    /// Connection requests not yet released.
    pub pending_crs: usize,
}

pub(crate) struct SpShared {
    pub listening: bool,
    pub crs: Vec<Cr>,
    /// `free` was called; the SP goes away with its last CR.
    pub freed: bool,
    released: bool,
}

pub(crate) struct SpInner {
    id: SpId,
    ia: Weak<IaShared>,
    conn_qual: ConnQual,
    evd: Evd,
    kind: SpKind,
    shared: Mutex<SpShared>,
}

/// Service point listening for connection requests.
#[derive(Clone)]
pub struct Sp {
    pub(crate) inner: Arc<SpInner>,
}

impl std::fmt::Debug for Sp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sp")
            .field("id", &self.inner.id)
            .field("conn_qual", &self.inner.conn_qual)
            .finish()
    }
}

impl Sp {
    pub(crate) fn create(
        ia: &Arc<IaShared>,
        id: SpId,
        conn_qual: ConnQual,
        evd: &Evd,
        kind: SpKind,
    ) -> DatResult<Self> {
        if !evd.flags().contains(EvdFlags::CR) {
            return Err(DatError::InvalidHandle(HandleKind::EvdCr));
        }
        if let SpKind::Rsp { ep } = &kind {
            if ep.state() != crate::ep::EpState::Unconnected {
                return Err(DatError::InvalidState(StateReason::EpState));
            }
        }

        ia.transport.listen(id, conn_qual)?;
        evd.add_ref();
        log::debug!("rdapl: {} listening on qual {} ({:?})", id, conn_qual, kind);
        Ok(Self {
            inner: Arc::new(SpInner {
                id,
                ia: Arc::downgrade(ia),
                conn_qual,
                evd: evd.clone(),
                kind,
                shared: Mutex::new(SpShared {
                    listening: true,
                    crs: Vec::new(),
                    freed: false,
                    released: false,
                }),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<SpInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SpInner> {
        Arc::downgrade(&self.inner)
    }

    #[inline]
    pub fn id(&self) -> SpId {
        self.inner.id
    }

    #[inline]
    pub fn conn_qual(&self) -> ConnQual {
        self.inner.conn_qual
    }

    #[inline]
    pub fn kind(&self) -> &SpKind {
        &self.inner.kind
    }

    #[inline]
    pub(crate) fn evd(&self) -> &Evd {
        &self.inner.evd
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, SpShared> {
        self.inner.shared.lock()
    }

    pub fn query(&self) -> SpParam {
        let shared = self.lock();
        SpParam {
            id: self.inner.id,
            conn_qual: self.inner.conn_qual,
            evd: self.inner.evd.id(),
            kind: self.inner.kind.clone(),
            listening: shared.listening,
            pending_crs: shared.crs.len(),
        }
    }

    /// Find a connection request by its connection manager handle.
    pub(crate) fn search_cr(&self, cm: CmHandle) -> Option<Cr> {
        self.lock().crs.iter().find(|cr| cr.cm() == cm).cloned()
    }

    pub(crate) fn link_cr(&self, cr: Cr) {
        self.lock().crs.push(cr);
    }

    /// Unlink a connection request. Return whether it was linked.
    pub(crate) fn remove_cr(&self, id: CrId) -> bool {
        let removed = {
            let mut shared = self.lock();
            let before = shared.crs.len();
            shared.crs.retain(|cr| cr.id() != id);
            shared.crs.len() != before
        };
        self.release_if_done();
        removed
    }

    /// Stop listening. A reserved SP stops after its first request.
    pub(crate) fn stop_listening(&self, shared: &mut SpShared) -> bool {
        std::mem::replace(&mut shared.listening, false)
    }

    /// Destroy the service point. It stops listening at once; outstanding
    /// connection requests keep it alive until they are released.
    pub fn free(&self) -> DatResult<()> {
        let ia = self
            .inner
            .ia
            .upgrade()
            .ok_or(DatError::InvalidHandle(HandleKind::Ia))?;
        let was_listening = {
            let mut shared = self.lock();
            if shared.freed {
                return Err(DatError::InvalidHandle(HandleKind::Sp));
            }
            shared.freed = true;
            self.stop_listening(&mut shared)
        };
        if was_listening || matches!(self.inner.kind, SpKind::Rsp { .. }) {
            if let Err(e) = ia.transport.stop_listen(self.inner.id, self.inner.conn_qual) {
                log::debug!("rdapl: stop_listen on {} failed: {}", self.inner.id, e);
            }
        }
        self.release_if_done();
        Ok(())
    }

    /// Release a freed SP once no connection request refers to it.
    pub(crate) fn release_if_done(&self) {
        {
            let mut shared = self.lock();
            if !shared.freed || !shared.crs.is_empty() || shared.released {
                return;
            }
            shared.released = true;
        }
        self.inner.evd.release_ref();
        if let Some(ia) = self.inner.ia.upgrade() {
            ia.unregister_sp(self.inner.id);
        }
        log::debug!("rdapl: released {}", self.inner.id);
    }
}
