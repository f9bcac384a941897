//! Endpoint.
//!
//! An endpoint owns a queue pair, one cookie buffer per work queue and the
//! connection state machine. Data transfer operations take a cookie before
//! they are posted; the cookie comes back with the completion on the request
//! or receive EVD.

mod builder;
mod state;

use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

pub use self::builder::*;
pub use self::state::*;
use crate::cookie::*;
use crate::error::*;
use crate::evd::{Evd, EventNumber};
use crate::ia::IaShared;
use crate::pd::Pd;
use crate::srq::Srq;
use crate::transport::*;
use crate::type_alias::*;

/// Per-operation completion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CompletionFlags(u32);

impl CompletionFlags {
    pub const DEFAULT: Self = Self(0);
    /// Do not generate a completion event on success.
    pub const SUPPRESS: Self = Self(0x01);
    /// Ask the peer to generate a solicited event for the matching receive.
    pub const SOLICITED_WAIT: Self = Self(0x02);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CompletionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Endpoint attributes.
#[derive(Debug, Clone, Default)]
pub struct EpParam {
    pub pd: Option<Pd>,
    pub connect_evd: Option<Evd>,
    pub request_evd: Option<Evd>,
    pub recv_evd: Option<Evd>,
    pub srq: Option<Srq>,
    pub max_request_dtos: usize,
    pub max_recv_dtos: usize,
}

/// Endpoint state guarded by the endpoint lock.
pub(crate) struct EpShared {
    pub state: EpState,
    pub param: EpParam,
    pub qp: Option<QpHandle>,
    /// Connection manager handle of the current connection.
    pub cm: Option<CmHandle>,
    /// Connection request this endpoint was accepted on.
    pub cr: Option<CrId>,
    /// Private data received from the peer.
    pub private_data: Vec<u8>,
    pub freed: bool,
}

pub(crate) struct EpInner {
    id: EpId,
    ia: Weak<IaShared>,
    shared: Mutex<EpShared>,
    req_cookies: CookieBuffer,
    recv_cookies: CookieBuffer,
}

/// Endpoint.
#[derive(Clone)]
pub struct Ep {
    inner: Arc<EpInner>,
}

impl std::fmt::Debug for Ep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ep")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Which connection manager event happened on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    Established,
    Disconnected,
    PeerRejected,
    NonPeerRejected,
    Unreachable,
    Broken,
    TimedOut,
}

impl ConnEvent {
    pub(crate) fn event_number(self) -> EventNumber {
        match self {
            ConnEvent::Established => EventNumber::ConnectionEstablished,
            ConnEvent::Disconnected => EventNumber::ConnectionDisconnected,
            ConnEvent::PeerRejected => EventNumber::ConnectionPeerRejected,
            ConnEvent::NonPeerRejected => EventNumber::ConnectionNonPeerRejected,
            ConnEvent::Unreachable => EventNumber::ConnectionUnreachable,
            ConnEvent::Broken => EventNumber::ConnectionBroken,
            ConnEvent::TimedOut => EventNumber::ConnectionTimedOut,
        }
    }
}

impl Ep {
    pub(crate) fn create(ia: &Arc<IaShared>, id: EpId, builder: EpBuilder<'_>) -> DatResult<Self> {
        builder.check_evds()?;
        let max_request_dtos = builder
            .max_request_dtos
            .unwrap_or(ia.config.max_request_dtos);
        let max_recv_dtos = builder.max_recv_dtos.unwrap_or(ia.config.max_recv_dtos);

        let req_cookies =
            CookieBuffer::new(CookieOwner::Ep(id), CookieQueue::Request, max_request_dtos)?;
        let recv_cookies =
            CookieBuffer::new(CookieOwner::Ep(id), CookieQueue::Receive, max_recv_dtos)?;

        let param = EpParam {
            pd: builder.pd.cloned(),
            connect_evd: builder.connect_evd.cloned(),
            request_evd: builder.request_evd.cloned(),
            recv_evd: builder.recv_evd.cloned(),
            srq: builder.srq.cloned(),
            max_request_dtos,
            max_recv_dtos,
        };

        let mut shared = EpShared {
            state: EpState::Unconnected,
            param,
            qp: None,
            cm: None,
            cr: None,
            private_data: Vec::new(),
            freed: false,
        };
        if shared.param.pd.is_some() {
            shared.qp = Some(Self::create_qp(ia, id, &shared.param)?);
        }
        acquire_refs(&shared.param);

        log::debug!("rdapl: created {} qp {:?}", id, shared.qp);
        Ok(Self {
            inner: Arc::new(EpInner {
                id,
                ia: Arc::downgrade(ia),
                shared: Mutex::new(shared),
                req_cookies,
                recv_cookies,
            }),
        })
    }

    /// Endpoint created by the provider for a connection request on a PSP.
    /// It has no EVDs or PD until the consumer modifies it.
    pub(crate) fn create_tentative(ia: &Arc<IaShared>, id: EpId) -> DatResult<Self> {
        let ep = Self::create(ia, id, EpBuilder::new())?;
        ep.lock().state = EpState::TentativeConnectionPending;
        Ok(ep)
    }

    fn create_qp(ia: &IaShared, id: EpId, param: &EpParam) -> DatResult<QpHandle> {
        let init = QpInit {
            ep: id,
            send_cq: param.request_evd.as_ref().and_then(Evd::cq),
            recv_cq: param.recv_evd.as_ref().and_then(Evd::cq),
            srq: param.srq.as_ref().map(Srq::handle),
            max_send_wr: param.max_request_dtos,
            max_recv_wr: param.max_recv_dtos,
        };
        let qp = ia.transport.create_qp(init).map_err(|e| {
            log::warn!("rdapl: cannot create QP for {}: {}", id, e);
            DatError::from(e)
        })?;
        ia.map_qpn(qp.qpn, id);
        Ok(qp)
    }

    fn ia(&self) -> DatResult<Arc<IaShared>> {
        self.inner
            .ia
            .upgrade()
            .ok_or(DatError::InvalidHandle(HandleKind::Ia))
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, EpShared> {
        self.inner.shared.lock()
    }

    #[inline]
    pub fn id(&self) -> EpId {
        self.inner.id
    }

    pub fn state(&self) -> EpState {
        self.lock().state
    }

    pub fn param(&self) -> EpParam {
        self.lock().param.clone()
    }

    /// The queue pair, once the endpoint has a protection domain.
    pub fn qp(&self) -> Option<QpHandle> {
        self.lock().qp
    }

    /// Private data the peer sent with its accept or reject.
    pub fn remote_private_data(&self) -> Vec<u8> {
        self.lock().private_data.clone()
    }

    /// Connection request this endpoint was accepted on, until the
    /// connection goes away.
    pub fn cr(&self) -> Option<CrId> {
        self.lock().cr
    }

    #[inline]
    pub(crate) fn cookies(&self, queue: CookieQueue) -> &CookieBuffer {
        match queue {
            CookieQueue::Request => &self.inner.req_cookies,
            CookieQueue::Receive => &self.inner.recv_cookies,
        }
    }

    /// Number of send-queue operations posted and not yet completed.
    pub fn pending_requests(&self) -> usize {
        self.inner.req_cookies.pending_count()
    }

    /// Number of receives posted and not yet completed.
    pub fn pending_recvs(&self) -> usize {
        self.inner.recv_cookies.pending_count()
    }

    /// Change the endpoint's attributes. Only allowed before it connects.
    pub fn modify(&self, builder: EpBuilder<'_>) -> DatResult<()> {
        let ia = self.ia()?;
        builder.check_evds()?;

        let mut shared = self.lock();
        if shared.freed {
            return Err(DatError::InvalidHandle(HandleKind::Ep));
        }
        if !matches!(
            shared.state,
            EpState::Unconnected | EpState::TentativeConnectionPending
        ) {
            return Err(DatError::InvalidState(StateReason::EpState));
        }
        if builder
            .max_request_dtos
            .is_some_and(|n| n != shared.param.max_request_dtos)
            || builder
                .max_recv_dtos
                .is_some_and(|n| n != shared.param.max_recv_dtos)
        {
            return Err(DatError::InvalidParameter(Param::Endpoint));
        }

        let old = shared.param.clone();
        let mut param = old.clone();
        if let Some(pd) = builder.pd {
            param.pd = Some(pd.clone());
        }
        if let Some(evd) = builder.connect_evd {
            param.connect_evd = Some(evd.clone());
        }
        if let Some(evd) = builder.request_evd {
            param.request_evd = Some(evd.clone());
        }
        if let Some(evd) = builder.recv_evd {
            param.recv_evd = Some(evd.clone());
        }
        if let Some(srq) = builder.srq {
            param.srq = Some(srq.clone());
        }

        let queues_changed = !same_evd(&old.request_evd, &param.request_evd)
            || !same_evd(&old.recv_evd, &param.recv_evd)
            || !same_srq(&old.srq, &param.srq);
        let qp = match shared.qp {
            Some(qp) if queues_changed => {
                let new_qp = Self::create_qp(&ia, self.inner.id, &param)?;
                ia.unmap_qpn(qp.qpn);
                if let Err(e) = ia.transport.destroy_qp(qp) {
                    log::warn!("rdapl: cannot destroy QP of {}: {}", self.inner.id, e);
                }
                Some(new_qp)
            }
            Some(qp) => Some(qp),
            None if param.pd.is_some() => Some(Self::create_qp(&ia, self.inner.id, &param)?),
            None => None,
        };

        acquire_refs(&param);
        release_refs(&old);
        shared.param = param;
        shared.qp = qp;
        Ok(())
    }

    fn post_request(
        &self,
        kind: CookieKind,
        op: SendOp,
        local: &[LmrTriplet],
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let ia = self.ia()?;
        let qp = {
            let shared = self.lock();
            if shared.state != EpState::Connected {
                return Err(DatError::InvalidState(StateReason::EpState));
            }
            shared
                .qp
                .ok_or(DatError::InvalidState(StateReason::EpUnattached))?
        };

        let cookie = self.inner.req_cookies.allocate(kind)?;
        let wr = SendWr {
            wr_id: cookie.wr_id(),
            op,
            local,
            signaled: !flags.contains(CompletionFlags::SUPPRESS),
            solicited: flags.contains(CompletionFlags::SOLICITED_WAIT),
        };
        if let Err(e) = ia.transport.post_send(qp, &wr) {
            self.inner.req_cookies.cancel(&cookie);
            log::debug!("rdapl: {} post_send failed: {}", self.inner.id, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn dto(op: DtoOp, user_cookie: u64, local: &[LmrTriplet]) -> CookieKind {
        CookieKind::Dto {
            op,
            user_cookie,
            size: local.iter().map(|seg| seg.segment_length).sum(),
        }
    }

    /// Send the local segments to the peer.
    pub fn post_send(
        &self,
        local: &[LmrTriplet],
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let kind = Self::dto(DtoOp::Send, user_cookie, local);
        self.post_request(kind, SendOp::Send, local, flags)
    }

    /// Send with immediate data.
    pub fn post_send_with_imm(
        &self,
        local: &[LmrTriplet],
        imm: ImmData,
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let kind = Self::dto(DtoOp::Send, user_cookie, local);
        self.post_request(kind, SendOp::SendImm(imm), local, flags)
    }

    /// Write the local segments into the peer's memory.
    pub fn post_rdma_write(
        &self,
        local: &[LmrTriplet],
        remote: RmrTriplet,
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let kind = Self::dto(DtoOp::RdmaWrite, user_cookie, local);
        self.post_request(kind, SendOp::RdmaWrite(remote), local, flags)
    }

    /// Read the peer's memory into the local segments.
    pub fn post_rdma_read(
        &self,
        local: &[LmrTriplet],
        remote: RmrTriplet,
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let kind = Self::dto(DtoOp::RdmaRead, user_cookie, local);
        self.post_request(kind, SendOp::RdmaRead(remote), local, flags)
    }

    /// Atomic compare-and-swap on 8 bytes of remote memory. The old value
    /// lands in `local`.
    pub fn post_cmp_swap(
        &self,
        local: &LmrTriplet,
        remote: RmrTriplet,
        compare: u64,
        swap: u64,
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let local = std::slice::from_ref(local);
        let kind = Self::dto(DtoOp::Extension, user_cookie, local);
        let op = SendOp::CmpSwap {
            remote,
            compare,
            swap,
        };
        self.post_request(kind, op, local, flags)
    }

    /// Atomic fetch-and-add on 8 bytes of remote memory. The old value lands
    /// in `local`.
    pub fn post_fetch_add(
        &self,
        local: &LmrTriplet,
        remote: RmrTriplet,
        add: u64,
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let local = std::slice::from_ref(local);
        let kind = Self::dto(DtoOp::Extension, user_cookie, local);
        self.post_request(kind, SendOp::FetchAdd { remote, add }, local, flags)
    }

    /// Bind a memory window to a local region.
    pub fn post_rmr_bind(
        &self,
        rmr: RmrId,
        lmr: LmrTriplet,
        user_cookie: u64,
        flags: CompletionFlags,
    ) -> DatResult<()> {
        let kind = CookieKind::RmrBind { rmr, user_cookie };
        self.post_request(kind, SendOp::BindMw { rmr, lmr }, &[], flags)
    }

    /// Post a receive buffer. Allowed in any state once the endpoint has a
    /// queue pair, so that buffers are ready before the connection is.
    ///
    /// Receive completions are always reported, so unlike sends there are no
    /// completion flags.
    pub fn post_recv(&self, local: &[LmrTriplet], user_cookie: u64) -> DatResult<()> {
        let ia = self.ia()?;
        let qp = {
            let shared = self.lock();
            if shared.param.srq.is_some() {
                return Err(DatError::InvalidState(StateReason::EpUsesSrq));
            }
            shared
                .qp
                .ok_or(DatError::InvalidState(StateReason::EpUnattached))?
        };

        let cookie = self
            .inner
            .recv_cookies
            .allocate(Self::dto(DtoOp::Recv, user_cookie, local))?;
        let wr = RecvWr {
            wr_id: cookie.wr_id(),
            local,
        };
        if let Err(e) = ia.transport.post_recv(qp, &wr) {
            self.inner.recv_cookies.cancel(&cookie);
            log::debug!("rdapl: {} post_recv failed: {}", self.inner.id, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Start an active connection to `remote`.
    pub fn connect(
        &self,
        remote: SocketAddr,
        conn_qual: ConnQual,
        private_data: &[u8],
    ) -> DatResult<()> {
        let ia = self.ia()?;
        if private_data.len() > ia.config.max_private_data_size {
            return Err(DatError::InvalidParameter(Param::PrivateData));
        }

        let qp = {
            let mut shared = self.lock();
            if shared.state != EpState::Unconnected {
                return Err(DatError::InvalidState(StateReason::EpState));
            }
            let qp = shared
                .qp
                .ok_or(DatError::InvalidState(StateReason::EpUnattached))?;
            if shared.param.connect_evd.is_none() {
                return Err(DatError::InvalidState(StateReason::EpNotReady));
            }
            shared.state = EpState::ActiveConnectionPending;
            qp
        };

        match ia
            .transport
            .connect(self.inner.id, qp, remote, conn_qual, private_data)
        {
            Ok(cm) => {
                let mut shared = self.lock();
                if shared.cm.is_none() {
                    shared.cm = Some(cm);
                }
                log::debug!("rdapl: {} connecting to {} qual {}", self.inner.id, remote, conn_qual);
                Ok(())
            }
            Err(e) => {
                let mut shared = self.lock();
                if shared.state == EpState::ActiveConnectionPending {
                    shared.state = EpState::Unconnected;
                }
                Err(e.into())
            }
        }
    }

    /// Tear the connection down. The connect EVD receives a disconnected event
    /// once the transport reports it.
    pub fn disconnect(&self, mode: DisconnectMode) -> DatResult<()> {
        let ia = self.ia()?;
        let cm = {
            let mut shared = self.lock();
            match shared.state {
                EpState::Unconnected | EpState::Disconnected | EpState::DisconnectPending => {
                    return Ok(())
                }
                EpState::PassiveConnectionPending | EpState::TentativeConnectionPending => {
                    return Err(DatError::InvalidState(StateReason::EpState))
                }
                EpState::Connected
                | EpState::ActiveConnectionPending
                | EpState::CompletionPending => {}
            }
            shared.state = EpState::DisconnectPending;
            shared.cm
        };

        if let Some(cm) = cm {
            ia.transport.disconnect(cm, mode)?;
        }
        Ok(())
    }

    /// Bring a disconnected endpoint back to unconnected so it can connect
    /// again.
    pub fn reset(&self) -> DatResult<()> {
        let mut shared = self.lock();
        if shared.state != EpState::Disconnected {
            return Err(DatError::InvalidState(StateReason::EpState));
        }
        shared.state = EpState::Unconnected;
        shared.cm = None;
        shared.cr = None;
        shared.private_data.clear();
        Ok(())
    }

    /// Destroy the endpoint, tearing down any connection abruptly.
    pub fn free(&self) -> DatResult<()> {
        let ia = self.ia()?;
        let (state, cm, qp, param) = {
            let mut shared = self.lock();
            if shared.freed {
                return Err(DatError::InvalidHandle(HandleKind::Ep));
            }
            shared.freed = true;
            let state = shared.state;
            shared.state = EpState::Disconnected;
            (state, shared.cm.take(), shared.qp.take(), std::mem::take(&mut shared.param))
        };

        if state.is_connecting_or_connected() {
            if let Some(cm) = cm {
                if let Err(e) = ia.transport.disconnect(cm, DisconnectMode::Abrupt) {
                    log::debug!("rdapl: disconnect of freed {} failed: {}", self.inner.id, e);
                }
            }
        }
        if let Some(qp) = qp {
            ia.unmap_qpn(qp.qpn);
            if let Err(e) = ia.transport.destroy_qp(qp) {
                log::warn!("rdapl: cannot destroy QP of {}: {}", self.inner.id, e);
            }
        }
        release_refs(&param);
        ia.unregister_ep(self.inner.id);
        log::debug!("rdapl: freed {}", self.inner.id);
        Ok(())
    }

    /// A completion failed on a connected endpoint: disconnect it and report
    /// a broken connection on its connect EVD.
    pub(crate) fn connection_broken(&self) {
        let Ok(ia) = self.ia() else {
            return;
        };
        let (cm, evd) = {
            let mut shared = self.lock();
            if shared.state != EpState::Connected {
                return;
            }
            shared.state = EpState::Disconnected;
            (shared.cm, shared.param.connect_evd.clone())
        };

        if let Some(cm) = cm {
            if let Err(e) = ia.transport.disconnect(cm, DisconnectMode::Abrupt) {
                log::debug!("rdapl: abrupt disconnect of {} failed: {}", self.inner.id, e);
            }
        }
        if let Some(evd) = evd {
            if let Err(e) = evd
                .inner
                .post_connection(EventNumber::ConnectionBroken, self.inner.id, &[])
            {
                log::warn!("rdapl: cannot report broken {}: {}", self.inner.id, e);
            }
        }
    }

    /// Connection manager event on a connection this endpoint initiated.
    pub(crate) fn active_cm_event(&self, event: ConnEvent, private_data: &[u8]) {
        let Ok(ia) = self.ia() else {
            return;
        };
        let mut shared = self.lock();
        match event {
            ConnEvent::Established => {
                if shared.state != EpState::ActiveConnectionPending {
                    let cm = shared.cm;
                    drop(shared);
                    log::debug!("rdapl: stale establishment on {}", self.inner.id);
                    if let Some(cm) = cm {
                        if let Err(e) = ia.transport.disconnect(cm, DisconnectMode::Abrupt) {
                            log::debug!(
                                "rdapl: disconnect of stale {} failed: {}",
                                self.inner.id,
                                e
                            );
                        }
                    }
                    return;
                }
                shared.state = EpState::Connected;
                shared.private_data = private_data.to_vec();
            }
            ConnEvent::PeerRejected => {
                shared.state = EpState::Disconnected;
                shared.private_data = private_data.to_vec();
            }
            _ => {
                if shared.state == EpState::Disconnected && event == ConnEvent::Broken {
                    // Already reported by the completion path.
                    return;
                }
                shared.state = EpState::Disconnected;
                if let Some(qp) = shared.qp {
                    ia.transport.disconnect_clean(qp, true);
                }
            }
        }
        let evd = shared.param.connect_evd.clone();
        drop(shared);

        if let Some(evd) = evd {
            let res = evd
                .inner
                .post_connection(event.event_number(), self.inner.id, private_data);
            if let Err(e) = res {
                log::warn!("rdapl: cannot post {:?} for {}: {}", event, self.inner.id, e);
            }
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Ep) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn same_evd(a: &Option<Evd>, b: &Option<Evd>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

fn same_srq(a: &Option<Srq>, b: &Option<Srq>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

fn acquire_refs(param: &EpParam) {
    for evd in [&param.connect_evd, &param.request_evd, &param.recv_evd]
        .into_iter()
        .flatten()
    {
        evd.add_ref();
    }
    if let Some(srq) = &param.srq {
        srq.attach_ep();
    }
}

fn release_refs(param: &EpParam) {
    for evd in [&param.connect_evd, &param.request_evd, &param.recv_evd]
        .into_iter()
        .flatten()
    {
        evd.release_ref();
    }
    if let Some(srq) = &param.srq {
        srq.detach_ep();
    }
}
