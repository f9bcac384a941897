//! Interface adapter.
//!
//! The IA owns the transport, the asynchronous error EVD and the registries
//! through which completions and CM events find the objects they belong to.
//! Objects refer back to the IA weakly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::cno::Cno;
use crate::config::Config;
use crate::cr::{self, CmEventSink, Cr};
use crate::ep::{ConnEvent, Ep, EpBuilder};
use crate::error::*;
use crate::evd::{AsyncSource, EventNumber, Evd, EvdFlags};
use crate::pd::Pd;
use crate::sp::{PspFlags, Sp, SpKind};
use crate::srq::Srq;
use crate::transport::{CmContext, RejectReason, Transport};
use crate::type_alias::*;

#[derive(Default)]
struct Registry {
    evds: HashMap<EvdId, Evd>,
    eps: HashMap<EpId, Ep>,
    qpns: HashMap<Qpn, EpId>,
    sps: HashMap<SpId, Sp>,
    crs: HashMap<CrId, Cr>,
    srqs: HashMap<SrqId, Srq>,
}

pub(crate) struct IaShared {
    pub transport: Arc<dyn Transport>,
    pub config: Config,
    next_id: AtomicU32,
    async_evd: OnceLock<Evd>,
    registry: RwLock<Registry>,
}

impl IaShared {
    /// Allocate an identifier. Identifiers are unique across object kinds.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn async_evd(&self) -> Option<&Evd> {
        self.async_evd.get()
    }

    pub fn evd(&self, id: EvdId) -> Option<Evd> {
        self.registry.read().evds.get(&id).cloned()
    }

    pub fn ep(&self, id: EpId) -> Option<Ep> {
        self.registry.read().eps.get(&id).cloned()
    }

    pub fn sp(&self, id: SpId) -> Option<Sp> {
        self.registry.read().sps.get(&id).cloned()
    }

    pub fn cr(&self, id: CrId) -> Option<Cr> {
        self.registry.read().crs.get(&id).cloned()
    }

    pub fn srq(&self, id: SrqId) -> Option<Srq> {
        self.registry.read().srqs.get(&id).cloned()
    }

    /// Endpoint owning the queue pair numbered `qpn`.
    pub fn ep_by_qpn(&self, qpn: Qpn) -> Option<Ep> {
        let registry = self.registry.read();
        let id = registry.qpns.get(&qpn)?;
        registry.eps.get(id).cloned()
    }

    pub fn map_qpn(&self, qpn: Qpn, ep: EpId) {
        self.registry.write().qpns.insert(qpn, ep);
    }

    pub fn unmap_qpn(&self, qpn: Qpn) {
        self.registry.write().qpns.remove(&qpn);
    }

    pub fn register_evd(&self, evd: Evd) {
        self.registry.write().evds.insert(evd.id(), evd);
    }

    pub fn register_ep(&self, ep: Ep) {
        self.registry.write().eps.insert(ep.id(), ep);
    }

    pub fn register_sp(&self, sp: Sp) {
        self.registry.write().sps.insert(sp.id(), sp);
    }

    pub fn register_cr(&self, cr: Cr) {
        self.registry.write().crs.insert(cr.id(), cr);
    }

    pub fn register_srq(&self, srq: Srq) {
        self.registry.write().srqs.insert(srq.id(), srq);
    }

    pub fn unregister_evd(&self, id: EvdId) {
        self.registry.write().evds.remove(&id);
    }

    pub fn unregister_ep(&self, id: EpId) {
        self.registry.write().eps.remove(&id);
    }

    pub fn unregister_sp(&self, id: SpId) {
        self.registry.write().sps.remove(&id);
    }

    pub fn unregister_cr(&self, id: CrId) {
        self.registry.write().crs.remove(&id);
    }

    pub fn unregister_srq(&self, id: SrqId) {
        self.registry.write().srqs.remove(&id);
    }
}

/// Interface adapter.
pub struct Ia {
    shared: Arc<IaShared>,
    async_evd: Evd,
}

impl std::fmt::Debug for Ia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ia")
            .field("async_evd", &self.async_evd.id())
            .finish()
    }
}

impl Ia {
    /// Open an interface adapter on `transport`.
    pub fn open(transport: Arc<dyn Transport>, config: Config) -> DatResult<Self> {
        config.validate()?;
        let shared = Arc::new(IaShared {
            transport,
            config,
            next_id: AtomicU32::new(1),
            async_evd: OnceLock::new(),
            registry: RwLock::new(Registry::default()),
        });

        let id = EvdId(shared.next_id());
        let qlen = shared.config.default_evd_qlen;
        let async_evd = Evd::create(&shared, id, qlen, None, EvdFlags::ASYNC)?;
        shared.register_evd(async_evd.clone());
        if shared.async_evd.set(async_evd.clone()).is_err() {
            return Err(DatError::InvalidState(StateReason::EvdInUse));
        }

        log::info!("rdapl: opened IA, async events on {}", id);
        Ok(Self { shared, async_evd })
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<IaShared> {
        &self.shared
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The EVD receiving asynchronous errors, including EVD overflows.
    #[inline]
    pub fn async_evd(&self) -> &Evd {
        &self.async_evd
    }

    pub fn pd_create(&self) -> Pd {
        Pd::new(PdId(self.shared.next_id()))
    }

    pub fn cno_create(&self) -> Cno {
        Cno::new(CnoId(self.shared.next_id()))
    }

    /// Create an EVD with `qlen` event slots, or the configured default when
    /// `qlen` is 0.
    pub fn evd_create(&self, qlen: usize, cno: Option<&Cno>, flags: EvdFlags) -> DatResult<Evd> {
        let id = EvdId(self.shared.next_id());
        let evd = Evd::create(&self.shared, id, qlen, cno, flags)?;
        self.shared.register_evd(evd.clone());
        Ok(evd)
    }

    pub fn ep_create(&self, builder: EpBuilder<'_>) -> DatResult<Ep> {
        let id = EpId(self.shared.next_id());
        let ep = Ep::create(&self.shared, id, builder)?;
        self.shared.register_ep(ep.clone());
        Ok(ep)
    }

    /// Create a shared receive queue admitting `max_recv_dtos` outstanding
    /// receives.
    pub fn srq_create(&self, max_recv_dtos: usize) -> DatResult<Srq> {
        if max_recv_dtos > self.shared.config.max_srq_dtos {
            return Err(DatError::InvalidParameter(Param::Capacity));
        }
        let id = SrqId(self.shared.next_id());
        let srq = Srq::create(&self.shared, id, max_recv_dtos)?;
        self.shared.register_srq(srq.clone());
        Ok(srq)
    }

    /// Create a public service point on `conn_qual`; requests arrive on `evd`.
    pub fn psp_create(&self, conn_qual: ConnQual, evd: &Evd, flags: PspFlags) -> DatResult<Sp> {
        self.sp_create(conn_qual, evd, SpKind::Psp { flags })
    }

    /// Create a reserved service point that hands its one request to `ep`.
    pub fn rsp_create(&self, conn_qual: ConnQual, ep: &Ep, evd: &Evd) -> DatResult<Sp> {
        self.sp_create(conn_qual, evd, SpKind::Rsp { ep: ep.clone() })
    }

    fn sp_create(&self, conn_qual: ConnQual, evd: &Evd, kind: SpKind) -> DatResult<Sp> {
        let id = SpId(self.shared.next_id());
        let sp = Sp::create(&self.shared, id, conn_qual, evd, kind)?;
        self.shared.register_sp(sp.clone());
        Ok(sp)
    }

    pub fn evd(&self, id: EvdId) -> Option<Evd> {
        self.shared.evd(id)
    }

    pub fn ep(&self, id: EpId) -> Option<Ep> {
        self.shared.ep(id)
    }

    pub fn sp(&self, id: SpId) -> Option<Sp> {
        self.shared.sp(id)
    }

    /// Look up the connection request named by a connection request event.
    pub fn cr(&self, id: CrId) -> Option<Cr> {
        self.shared.cr(id)
    }

    pub fn srq(&self, id: SrqId) -> Option<Srq> {
        self.shared.srq(id)
    }

    /// Report that the completion queue of `evd` signalled a notification.
    ///
    /// A consumer waiting on the EVD is woken; otherwise an enabled CNO
    /// attached to it is triggered and the queue re-armed.
    pub fn on_cq_event(&self, evd: EvdId) {
        match self.shared.evd(evd) {
            Some(evd) => evd.inner.cq_event(),
            None => log::debug!("rdapl: CQ event for unknown {}", evd),
        }
    }

    /// Report an asynchronous error from the transport on the async EVD.
    pub fn on_async_error(&self, number: EventNumber, source: AsyncSource) {
        log::warn!("rdapl: async error {:?} on {:?}", number, source);
        if let Err(e) = self.async_evd.inner.post_async_error(number, source) {
            log::error!("rdapl: cannot deliver async error {:?}: {}", number, e);
        }
    }
}

impl CmEventSink for Ia {
    fn on_connection_request(&self, ctx: CmContext, cm: CmHandle, private_data: &[u8]) {
        let sp = match ctx {
            CmContext::Listener(id) => self.shared.sp(id),
            CmContext::Endpoint(_) => None,
        };
        match sp {
            Some(sp) => cr::connection_request(&self.shared, &sp, cm, private_data),
            None => {
                log::debug!("rdapl: request {:?} for {:?} has no listener", cm, ctx);
                if let Err(e) = self
                    .shared
                    .transport
                    .reject(cm, RejectReason::NotListening, &[])
                {
                    log::debug!("rdapl: reject of {:?} failed: {}", cm, e);
                }
            }
        }
    }

    fn on_established(&self, ctx: CmContext, cm: CmHandle, private_data: &[u8]) {
        cr::dispatch(&self.shared, ctx, cm, ConnEvent::Established, private_data);
    }

    fn on_disconnected(&self, ctx: CmContext, cm: CmHandle) {
        cr::dispatch(&self.shared, ctx, cm, ConnEvent::Disconnected, &[]);
    }

    fn on_rejected(&self, ctx: CmContext, cm: CmHandle, by_peer: bool, private_data: &[u8]) {
        let event = match by_peer {
            true => ConnEvent::PeerRejected,
            false => ConnEvent::NonPeerRejected,
        };
        cr::dispatch(&self.shared, ctx, cm, event, private_data);
    }

    fn on_unreachable(&self, ctx: CmContext, cm: CmHandle) {
        cr::dispatch(&self.shared, ctx, cm, ConnEvent::Unreachable, &[]);
    }

    fn on_broken(&self, ctx: CmContext, cm: CmHandle) {
        cr::dispatch(&self.shared, ctx, cm, ConnEvent::Broken, &[]);
    }

    fn on_timed_out(&self, ctx: CmContext, cm: CmHandle) {
        cr::dispatch(&self.shared, ctx, cm, ConnEvent::TimedOut, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cq::{DtoStatus, WcStatus};
    use crate::ep::{CompletionFlags, EpState};
    use crate::evd::{EventData, EvdState};
    use crate::testing::*;
    use crate::transport::DisconnectMode;

    fn cr_from_event(ia: &Ia, evd: &Evd) -> Cr {
        let ev = evd.dequeue().unwrap();
        assert_eq!(ev.number, EventNumber::ConnectionRequest);
        match ev.data {
            EventData::ConnectionRequest { cr, .. } => ia.cr(cr).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_validates_config() {
        let t = Arc::new(MockTransport::new());
        let config = Config {
            default_evd_qlen: 0,
            ..Default::default()
        };
        assert!(matches!(
            Ia::open(t, config),
            Err(DatError::InvalidParameter(Param::Config))
        ));

        let (ia, _t) = open_ia();
        assert!(ia.async_evd().flags().contains(EvdFlags::ASYNC));
        assert_eq!(ia.evd(ia.async_evd().id()).map(|e| e.id()), Some(ia.async_evd().id()));
    }

    #[test]
    fn test_passive_accept_established_disconnected() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(100, &cr_evd, PspFlags::ConsumerEp).unwrap();
        let ctx = CmContext::Listener(sp.id());
        let cm = CmHandle(7);

        ia.on_connection_request(ctx, cm, b"hi there");
        let cr = cr_from_event(&ia, &cr_evd);
        let param = cr.query();
        assert_eq!(param.sp, Some(sp.id()));
        assert_eq!(param.conn_qual, 100);
        assert_eq!(param.private_data, b"hi there");
        assert_eq!(sp.query().pending_crs, 1);

        cr.accept(Some(&fx.ep), b"ok").unwrap();
        assert_eq!(fx.ep.state(), EpState::CompletionPending);
        assert_eq!(fx.ep.cr(), Some(cr.id()));
        assert_eq!(t.accepts(), vec![(cm, b"ok".to_vec())]);

        ia.on_established(ctx, cm, &[]);
        assert_eq!(fx.ep.state(), EpState::Connected);
        assert_eq!(
            fx.conn.dequeue().unwrap().number,
            EventNumber::ConnectionEstablished
        );
        // Established keeps the request.
        assert_eq!(sp.query().pending_crs, 1);
        assert!(ia.cr(cr.id()).is_some());

        ia.on_disconnected(ctx, cm);
        assert_eq!(fx.ep.state(), EpState::Disconnected);
        assert_eq!(fx.ep.cr(), None);
        assert_eq!(
            fx.conn.dequeue().unwrap().number,
            EventNumber::ConnectionDisconnected
        );
        assert_eq!(sp.query().pending_crs, 0);
        assert!(ia.cr(cr.id()).is_none());
        assert!(matches!(fx.conn.dequeue(), Err(DatError::QueueEmpty)));
    }

    #[test]
    fn test_request_on_stopped_sp_is_rejected() {
        let (ia, t) = open_ia();
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(100, &cr_evd, PspFlags::ConsumerEp).unwrap();
        let ctx = CmContext::Listener(sp.id());

        // A freed SP with a pending request stays around but stops listening.
        ia.on_connection_request(ctx, CmHandle(1), &[]);
        let cr = cr_from_event(&ia, &cr_evd);
        sp.free().unwrap();
        assert!(ia.sp(sp.id()).is_some());

        ia.on_connection_request(ctx, CmHandle(2), &[]);
        assert!(matches!(cr_evd.dequeue(), Err(DatError::QueueEmpty)));
        assert_eq!(t.rejects(), vec![(CmHandle(2), RejectReason::NotListening)]);
        assert_eq!(sp.query().pending_crs, 1);

        // Releasing the last request takes the SP with it.
        cr.reject(&[]).unwrap();
        assert!(ia.sp(sp.id()).is_none());
        assert!(cr.reject(&[]).is_err());
        cr_evd.free().unwrap();
    }

    #[test]
    fn test_request_undeliverable_is_rejected() {
        let (ia, t) = open_ia();
        let cr_evd = ia.evd_create(1, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(100, &cr_evd, PspFlags::ConsumerEp).unwrap();
        let ctx = CmContext::Listener(sp.id());

        ia.on_connection_request(ctx, CmHandle(1), &[]);
        ia.on_connection_request(ctx, CmHandle(2), &[]);
        assert_eq!(t.rejects(), vec![(CmHandle(2), RejectReason::NoResources)]);
        assert_eq!(sp.query().pending_crs, 1);
        assert_eq!(cr_evd.state(), EvdState::Dead);

        let ev = ia.async_evd().dequeue().unwrap();
        assert_eq!(ev.number, EventNumber::AsyncEvdOverflow);
        assert_eq!(
            ev.data,
            EventData::AsyncError {
                source: AsyncSource::Evd(cr_evd.id())
            }
        );
    }

    #[test]
    fn test_private_data_truncated() {
        let (ia, _t) = open_ia_with(Config {
            max_private_data_size: 4,
            ..Default::default()
        });
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(1, &cr_evd, PspFlags::ConsumerEp).unwrap();
        ia.on_connection_request(CmContext::Listener(sp.id()), CmHandle(1), b"abcdefgh");
        let cr = cr_from_event(&ia, &cr_evd);
        assert_eq!(cr.private_data(), b"abcd");
        assert!(matches!(
            cr.accept(None, b"toolong"),
            Err(DatError::InvalidParameter(Param::PrivateData))
        ));
    }

    #[test]
    fn test_accept_validates_ep() {
        let (ia, t) = open_ia();
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(1, &cr_evd, PspFlags::ConsumerEp).unwrap();
        ia.on_connection_request(CmContext::Listener(sp.id()), CmHandle(1), &[]);
        let cr = cr_from_event(&ia, &cr_evd);

        assert!(matches!(
            cr.accept(None, &[]),
            Err(DatError::InvalidParameter(Param::Endpoint))
        ));
        let bare = ia.ep_create(EpBuilder::new()).unwrap();
        assert!(matches!(
            cr.accept(Some(&bare), &[]),
            Err(DatError::InvalidState(StateReason::EpNotReady))
        ));

        let fx = Fixture::new(&ia);
        fx.force_connected(&t);
        assert!(matches!(
            cr.accept(Some(&fx.ep), &[]),
            Err(DatError::InvalidState(StateReason::EpState))
        ));
        assert!(t.accepts().is_empty());
    }

    #[test]
    fn test_accept_peer_gone() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(1, &cr_evd, PspFlags::ConsumerEp).unwrap();
        ia.on_connection_request(CmContext::Listener(sp.id()), CmHandle(1), &[]);
        let cr = cr_from_event(&ia, &cr_evd);

        t.fail_next_accept(true);
        cr.accept(Some(&fx.ep), &[]).unwrap();
        assert_eq!(fx.ep.state(), EpState::Disconnected);
        let ev = fx.conn.dequeue().unwrap();
        assert_eq!(ev.number, EventNumber::ConnectionAcceptCompletionError);
        assert_eq!(sp.query().pending_crs, 0);
        assert!(matches!(
            cr.accept(Some(&fx.ep), &[]),
            Err(DatError::InvalidHandle(HandleKind::Cr))
        ));
    }

    #[test]
    fn test_accept_transport_error_rolls_back() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(1, &cr_evd, PspFlags::ConsumerEp).unwrap();
        ia.on_connection_request(CmContext::Listener(sp.id()), CmHandle(1), &[]);
        let cr = cr_from_event(&ia, &cr_evd);

        t.fail_next_accept(false);
        assert!(matches!(cr.accept(Some(&fx.ep), &[]), Err(DatError::Transport(_))));
        assert_eq!(fx.ep.state(), EpState::Unconnected);
        assert_eq!(fx.ep.cr(), None);
        assert_eq!(cr.query().ep, None);
        assert!(matches!(fx.conn.dequeue(), Err(DatError::QueueEmpty)));

        cr.accept(Some(&fx.ep), &[]).unwrap();
        assert_eq!(fx.ep.state(), EpState::CompletionPending);
    }

    #[test]
    fn test_provider_ep_flow() {
        let (ia, t) = open_ia();
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(5, &cr_evd, PspFlags::ProviderEp).unwrap();
        let ctx = CmContext::Listener(sp.id());
        ia.on_connection_request(ctx, CmHandle(3), &[]);
        let cr = cr_from_event(&ia, &cr_evd);

        let ep = ia.ep(cr.query().ep.unwrap()).unwrap();
        assert_eq!(ep.state(), EpState::TentativeConnectionPending);
        assert_eq!(ep.cr(), Some(cr.id()));
        // Not usable until the consumer gives it a PD and EVDs.
        assert!(cr.accept(None, &[]).is_err());

        let pd = ia.pd_create();
        let dto = ia.evd_create(8, None, EvdFlags::DTO).unwrap();
        let conn = ia.evd_create(8, None, EvdFlags::CONNECTION).unwrap();
        ep.modify(
            EpBuilder::new()
                .pd(&pd)
                .connect_evd(&conn)
                .request_evd(&dto)
                .recv_evd(&dto),
        )
        .unwrap();
        cr.accept(None, &[]).unwrap();
        assert_eq!(t.accepts().len(), 1);
        ia.on_established(ctx, CmHandle(3), &[]);
        assert_eq!(ep.state(), EpState::Connected);
        assert_eq!(
            conn.dequeue().unwrap().number,
            EventNumber::ConnectionEstablished
        );
    }

    #[test]
    fn test_provider_ep_freed_on_reject() {
        let (ia, t) = open_ia();
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(5, &cr_evd, PspFlags::ProviderEp).unwrap();
        ia.on_connection_request(CmContext::Listener(sp.id()), CmHandle(3), &[]);
        let cr = cr_from_event(&ia, &cr_evd);
        let ep_id = cr.query().ep.unwrap();

        cr.reject(b"no").unwrap();
        assert!(ia.ep(ep_id).is_none());
        assert_eq!(t.rejects(), vec![(CmHandle(3), RejectReason::Consumer)]);
        assert!(ia.cr(cr.id()).is_none());
    }

    #[test]
    fn test_rsp_single_shot() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let rsp = ia.rsp_create(9, &fx.ep, &cr_evd).unwrap();
        let ctx = CmContext::Listener(rsp.id());

        ia.on_connection_request(ctx, CmHandle(1), &[]);
        assert!(!rsp.query().listening);
        assert_eq!(fx.ep.state(), EpState::PassiveConnectionPending);
        let cr = cr_from_event(&ia, &cr_evd);

        ia.on_connection_request(ctx, CmHandle(2), &[]);
        assert_eq!(t.rejects(), vec![(CmHandle(2), RejectReason::NotListening)]);

        let other = Fixture::new(&ia);
        assert!(matches!(
            cr.accept(Some(&other.ep), &[]),
            Err(DatError::InvalidParameter(Param::Endpoint))
        ));
        cr.reject(&[]).unwrap();
        assert_eq!(fx.ep.state(), EpState::Unconnected);
    }

    #[test]
    fn test_peer_gone_before_accept_releases_cr() {
        let (ia, _t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let rsp = ia.rsp_create(9, &fx.ep, &cr_evd).unwrap();
        let ctx = CmContext::Listener(rsp.id());
        ia.on_connection_request(ctx, CmHandle(1), &[]);
        let cr = cr_from_event(&ia, &cr_evd);

        ia.on_disconnected(ctx, CmHandle(1));
        assert!(ia.cr(cr.id()).is_none());
        assert_eq!(fx.ep.state(), EpState::Unconnected);
        assert!(matches!(fx.conn.dequeue(), Err(DatError::QueueEmpty)));
    }

    #[test]
    fn test_stale_established_ignored() {
        let (ia, _t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(1, &cr_evd, PspFlags::ConsumerEp).unwrap();
        let ctx = CmContext::Listener(sp.id());
        ia.on_connection_request(ctx, CmHandle(1), &[]);
        let cr = cr_from_event(&ia, &cr_evd);

        // Nothing accepted yet.
        ia.on_established(ctx, CmHandle(1), &[]);
        assert_eq!(fx.ep.state(), EpState::Unconnected);
        cr.accept(Some(&fx.ep), &[]).unwrap();
        ia.on_established(ctx, CmHandle(1), &[]);
        ia.on_established(ctx, CmHandle(1), &[]);
        assert_eq!(
            fx.conn.dequeue().unwrap().number,
            EventNumber::ConnectionEstablished
        );
        assert!(matches!(fx.conn.dequeue(), Err(DatError::QueueEmpty)));
    }

    #[test]
    fn test_passive_disconnect_by_consumer() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        let cr_evd = ia.evd_create(4, None, EvdFlags::CR).unwrap();
        let sp = ia.psp_create(1, &cr_evd, PspFlags::ConsumerEp).unwrap();
        let ctx = CmContext::Listener(sp.id());
        ia.on_connection_request(ctx, CmHandle(4), &[]);
        cr_from_event(&ia, &cr_evd).accept(Some(&fx.ep), &[]).unwrap();
        ia.on_established(ctx, CmHandle(4), &[]);
        fx.conn.dequeue().unwrap();

        fx.ep.disconnect(DisconnectMode::Graceful).unwrap();
        assert_eq!(t.disconnects(), vec![(CmHandle(4), DisconnectMode::Graceful)]);
        ia.on_disconnected(ctx, CmHandle(4));
        assert_eq!(fx.ep.state(), EpState::Disconnected);
        assert_eq!(
            fx.conn.dequeue().unwrap().number,
            EventNumber::ConnectionDisconnected
        );
        fx.ep.reset().unwrap();
    }

    #[test]
    fn test_cqe_error_breaks_connection() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        fx.force_connected(&t);
        fx.ep
            .post_send(&[seg(16)], 1, CompletionFlags::DEFAULT)
            .unwrap();
        fx.ep
            .post_send(&[seg(16)], 2, CompletionFlags::DEFAULT)
            .unwrap();

        let qp = fx.ep.qp().unwrap();
        t.complete_next_send(qp, WcStatus::RemAccessErr);
        let ev = fx.dto.dequeue().unwrap();
        match ev.data {
            EventData::Dto {
                user_cookie,
                status,
                ..
            } => {
                assert_eq!(user_cookie, 1);
                assert_eq!(status, DtoStatus::RemoteAccess);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.ep.state(), EpState::Disconnected);
        assert_eq!(
            fx.conn.dequeue().unwrap().number,
            EventNumber::ConnectionBroken
        );
        assert_eq!(t.disconnects().len(), 1);

        // The flushed remainder reports without breaking anything further.
        t.complete_next_send(qp, WcStatus::WrFlushErr);
        match fx.dto.dequeue().unwrap().data {
            EventData::Dto { status, .. } => assert_eq!(status, DtoStatus::Flushed),
            other => panic!("unexpected {:?}", other),
        }
        ia.on_broken(CmContext::Endpoint(fx.ep.id()), t.last_cm());
        assert!(matches!(fx.conn.dequeue(), Err(DatError::QueueEmpty)));
    }

    #[test]
    fn test_wait_on_cq_sees_completion() {
        let (ia, t) = open_ia();
        let fx = Fixture::new(&ia);
        fx.force_connected(&t);
        fx.ep
            .post_send(&[seg(32)], 5, CompletionFlags::DEFAULT)
            .unwrap();

        let dto = fx.dto.clone();
        let waiter = std::thread::spawn(move || {
            dto.wait(Some(std::time::Duration::from_secs(5)), 1)
        });
        while fx.dto.state() != EvdState::Waited {
            std::thread::yield_now();
        }
        t.complete_next_send(fx.ep.qp().unwrap(), WcStatus::Success);
        let (ev, remaining) = waiter.join().unwrap().unwrap();
        assert_eq!(ev.data.user_cookie(), Some(5));
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_cq_event_wakes_waiter_with_cno() {
        let (ia, t) = open_ia();
        let cno = ia.cno_create();
        let fx = Fixture::with_cno(&ia, &cno);
        fx.force_connected(&t);
        fx.ep
            .post_send(&[seg(32)], 6, CompletionFlags::DEFAULT)
            .unwrap();

        let dto = fx.dto.clone();
        let start = quanta::Instant::now();
        let waiter = std::thread::spawn(move || {
            dto.wait(Some(std::time::Duration::from_secs(5)), 1)
        });
        while fx.dto.state() != EvdState::Waited {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        t.complete_next_send(fx.ep.qp().unwrap(), WcStatus::Success);
        ia.on_cq_event(fx.dto.id());

        let (ev, remaining) = waiter.join().unwrap().unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(ev.data.user_cookie(), Some(6));
        assert_eq!(remaining, 0);
        assert!(cno.wait(Some(std::time::Duration::ZERO)).is_err());
    }

    #[test]
    fn test_cq_event_triggers_cno_and_rearms() {
        let (ia, t) = open_ia();
        let cno = ia.cno_create();
        let fx = Fixture::with_cno(&ia, &cno);
        fx.force_connected(&t);
        assert!(t.cq_armed(fx.dto.id()));
        fx.ep
            .post_send(&[seg(32)], 7, CompletionFlags::DEFAULT)
            .unwrap();

        t.complete_next_send(fx.ep.qp().unwrap(), WcStatus::Success);
        assert!(!t.cq_armed(fx.dto.id()));
        ia.on_cq_event(fx.dto.id());

        assert_eq!(
            cno.wait(Some(std::time::Duration::ZERO)).unwrap(),
            fx.dto.id()
        );
        assert!(t.cq_armed(fx.dto.id()));
        let ev = fx.dto.dequeue().unwrap();
        assert_eq!(ev.data.user_cookie(), Some(7));
    }

    #[test]
    fn test_cq_event_on_disabled_evd_leaves_cno_alone() {
        let (ia, t) = open_ia();
        let cno = ia.cno_create();
        let fx = Fixture::with_cno(&ia, &cno);
        fx.force_connected(&t);
        fx.dto.disable();
        fx.ep
            .post_send(&[seg(32)], 8, CompletionFlags::DEFAULT)
            .unwrap();

        t.complete_next_send(fx.ep.qp().unwrap(), WcStatus::Success);
        ia.on_cq_event(fx.dto.id());
        assert!(cno.wait(Some(std::time::Duration::ZERO)).is_err());
        assert_eq!(fx.dto.dequeue().unwrap().data.user_cookie(), Some(8));

        // Unknown EVDs are ignored.
        ia.on_cq_event(EvdId(9999));
    }

    #[test]
    fn test_async_error_delivery() {
        let (ia, _t) = open_ia();
        ia.on_async_error(EventNumber::AsyncIaCatastrophic, AsyncSource::Ia);
        let ev = ia.async_evd().dequeue().unwrap();
        assert_eq!(ev.number, EventNumber::AsyncIaCatastrophic);
        assert_eq!(ev.data, EventData::AsyncError { source: AsyncSource::Ia });
    }
}
