//! Connection requests.
//!
//! A connection request is created when a request arrives on a listening
//! service point and lives on that SP's list until the connection it leads to
//! goes away, or until it is rejected. It refers back to its SP weakly; the SP
//! holds it strongly.

mod accept;
mod callback;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub use self::callback::*;
use crate::ep::{Ep, EpState};
use crate::error::*;
use crate::ia::IaShared;
use crate::sp::{Sp, SpInner};
use crate::transport::RejectReason;
use crate::type_alias::*;

/// Snapshot of a connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrParam {
    pub id: CrId,
    pub sp: Option<SpId>,
    pub conn_qual: ConnQual,
    /// Private data sent by the requester, truncated to the configured size.
    pub private_data: Vec<u8>,
    /// Endpoint bound to the request, if any.
    pub ep: Option<EpId>,
}

pub(crate) struct CrShared {
    ep: Option<Ep>,
    /// The request went away under an accept; it can no longer be used.
    destroyed: bool,
}

pub(crate) struct CrInner {
    id: CrId,
    ia: Weak<IaShared>,
    sp: Weak<SpInner>,
    cm: CmHandle,
    conn_qual: ConnQual,
    private_data: Vec<u8>,
    shared: Mutex<CrShared>,
}

/// Connection request.
#[derive(Clone)]
pub struct Cr {
    inner: Arc<CrInner>,
}

impl std::fmt::Debug for Cr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cr")
            .field("id", &self.inner.id)
            .field("cm", &self.inner.cm)
            .finish()
    }
}

impl Cr {
    pub(crate) fn new(
        ia: &Arc<IaShared>,
        id: CrId,
        sp: &Sp,
        cm: CmHandle,
        private_data: &[u8],
        ep: Option<Ep>,
    ) -> Self {
        let len = private_data.len().min(ia.config.max_private_data_size);
        Self {
            inner: Arc::new(CrInner {
                id,
                ia: Arc::downgrade(ia),
                sp: sp.downgrade(),
                cm,
                conn_qual: sp.conn_qual(),
                private_data: private_data[..len].to_vec(),
                shared: Mutex::new(CrShared {
                    ep,
                    destroyed: false,
                }),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> CrId {
        self.inner.id
    }

    #[inline]
    pub(crate) fn cm(&self) -> CmHandle {
        self.inner.cm
    }

    /// The requester's private data.
    pub fn private_data(&self) -> &[u8] {
        &self.inner.private_data
    }

    pub(crate) fn ep(&self) -> Option<Ep> {
        self.inner.shared.lock().ep.clone()
    }

    fn sp(&self) -> Option<Sp> {
        self.inner.sp.upgrade().map(Sp::from_inner)
    }

    fn ia(&self) -> DatResult<Arc<IaShared>> {
        self.inner
            .ia
            .upgrade()
            .ok_or(DatError::InvalidHandle(HandleKind::Ia))
    }

    pub fn query(&self) -> CrParam {
        CrParam {
            id: self.inner.id,
            sp: self.sp().map(|sp| sp.id()),
            conn_qual: self.inner.conn_qual,
            private_data: self.inner.private_data.clone(),
            ep: self.ep().map(|ep| ep.id()),
        }
    }

    /// Refuse the connection and release the request.
    pub fn reject(&self, private_data: &[u8]) -> DatResult<()> {
        let ia = self.ia()?;
        if private_data.len() > ia.config.max_private_data_size {
            return Err(DatError::InvalidParameter(Param::PrivateData));
        }
        let ep = {
            let mut shared = self.inner.shared.lock();
            if shared.destroyed {
                return Err(DatError::InvalidHandle(HandleKind::Cr));
            }
            // Once accepted, the connection is torn down through the endpoint.
            if let Some(ep) = &shared.ep {
                if !ep.state().is_passive_pending() {
                    return Err(DatError::InvalidState(StateReason::EpState));
                }
            }
            shared.destroyed = true;
            shared.ep.take()
        };

        let res = ia
            .transport
            .reject(self.inner.cm, RejectReason::Consumer, private_data);
        self.release(&ia);
        if let Some(ep) = ep {
            release_passive_ep(&ep);
        }
        log::debug!("rdapl: rejected {}", self.inner.id);
        res.map_err(DatError::from)
    }

    /// Unlink from the SP and drop from the registry.
    pub(crate) fn release(&self, ia: &IaShared) {
        if let Some(sp) = self.sp() {
            sp.remove_cr(self.inner.id);
        }
        ia.unregister_cr(self.inner.id);
    }

    pub(crate) fn mark_destroyed(&self) {
        self.inner.shared.lock().destroyed = true;
    }
}

/// Return an endpoint that was waiting on a request that is now gone: the
/// provider-created one is freed, a reserved one becomes unconnected again.
pub(crate) fn release_passive_ep(ep: &Ep) {
    let state = {
        let mut shared = ep.lock();
        let state = shared.state;
        if state == EpState::PassiveConnectionPending {
            shared.state = EpState::Unconnected;
            shared.cr = None;
            shared.cm = None;
        }
        state
    };
    if state == EpState::TentativeConnectionPending {
        if let Err(e) = ep.free() {
            log::debug!("rdapl: cannot free provider {}: {}", ep.id(), e);
        }
    }
}
