//! Connection manager callbacks on the passive side.

use super::*;
use crate::ep::ConnEvent;
use crate::evd::EventNumber;
use crate::sp::{PspFlags, SpKind};
use crate::transport::{CmContext, DisconnectMode};

/// Receiver of connection manager events.
///
/// The transport calls these from its CM thread. Events on a connection that
/// was requested through a listening service point are addressed with
/// [`CmContext::Listener`]; events on a connection an endpoint initiated are
/// addressed with [`CmContext::Endpoint`].
pub trait CmEventSink {
    fn on_connection_request(&self, ctx: CmContext, cm: CmHandle, private_data: &[u8]);

    fn on_established(&self, ctx: CmContext, cm: CmHandle, private_data: &[u8]);

    fn on_disconnected(&self, ctx: CmContext, cm: CmHandle);

    /// The connection was refused, by the peer's consumer or by the network.
    fn on_rejected(&self, ctx: CmContext, cm: CmHandle, by_peer: bool, private_data: &[u8]);

    fn on_unreachable(&self, ctx: CmContext, cm: CmHandle);

    fn on_broken(&self, ctx: CmContext, cm: CmHandle);

    fn on_timed_out(&self, ctx: CmContext, cm: CmHandle);
}

fn reject_quietly(ia: &IaShared, cm: CmHandle, reason: RejectReason) {
    if let Err(e) = ia.transport.reject(cm, reason, &[]) {
        log::debug!("rdapl: reject of {:?} failed: {}", cm, e);
    }
}

/// A connection request arrived on `sp`.
pub(crate) fn connection_request(ia: &Arc<IaShared>, sp: &Sp, cm: CmHandle, private_data: &[u8]) {
    let listening = {
        let mut shared = sp.lock();
        match sp.kind() {
            SpKind::Rsp { .. } => sp.stop_listening(&mut shared),
            SpKind::Psp { .. } => shared.listening,
        }
    };
    if !listening {
        log::debug!("rdapl: request {:?} on {} which is not listening", cm, sp.id());
        reject_quietly(ia, cm, RejectReason::NotListening);
        return;
    }

    let ep = match sp.kind() {
        SpKind::Psp {
            flags: PspFlags::ConsumerEp,
        } => None,
        SpKind::Psp {
            flags: PspFlags::ProviderEp,
        } => match Ep::create_tentative(ia, EpId(ia.next_id())) {
            Ok(ep) => {
                ia.register_ep(ep.clone());
                Some(ep)
            }
            Err(e) => {
                log::warn!("rdapl: cannot create provider EP on {}: {}", sp.id(), e);
                reject_quietly(ia, cm, RejectReason::NoResources);
                return;
            }
        },
        SpKind::Rsp { ep } => {
            let mut shared = ep.lock();
            if shared.state != EpState::Unconnected || shared.freed {
                drop(shared);
                log::debug!("rdapl: reserved {} not available for {:?}", ep.id(), cm);
                reject_quietly(ia, cm, RejectReason::NoResources);
                return;
            }
            shared.state = EpState::PassiveConnectionPending;
            drop(shared);
            Some(ep.clone())
        }
    };

    let cr = Cr::new(ia, CrId(ia.next_id()), sp, cm, private_data, ep.clone());
    if let Some(ep) = &ep {
        let mut shared = ep.lock();
        shared.cr = Some(cr.id());
        shared.cm = Some(cm);
    }
    ia.register_cr(cr.clone());
    sp.link_cr(cr.clone());

    let res = sp
        .evd()
        .inner
        .post_cr_arrival(sp.id(), sp.conn_qual(), cr.id());
    match res {
        Ok(()) => log::debug!("rdapl: {} arrived on {}", cr.id(), sp.id()),
        Err(e) => {
            log::warn!("rdapl: cannot deliver {} on {}: {}", cr.id(), sp.id(), e);
            reject_quietly(ia, cm, RejectReason::NoResources);
            cr.mark_destroyed();
            cr.release(ia);
            if let Some(ep) = &ep {
                release_passive_ep(ep);
            }
        }
    }
}

/// A connection manager event on a connection that came in through `sp`.
///
/// Every event but establishment ends the connection request.
pub(crate) fn passive_event(
    ia: &IaShared,
    sp: &Sp,
    cm: CmHandle,
    event: ConnEvent,
    private_data: &[u8],
) {
    let Some(cr) = sp.search_cr(cm) else {
        log::debug!("rdapl: {:?} on {} for unknown {:?}", event, sp.id(), cm);
        return;
    };
    let ep = cr.ep();

    if event == ConnEvent::Established {
        let Some(ep) = ep else {
            return;
        };
        let evd = {
            let mut shared = ep.lock();
            if shared.state != EpState::CompletionPending {
                log::debug!("rdapl: {} established in {:?}, ignored", ep.id(), shared.state);
                return;
            }
            shared.state = EpState::Connected;
            shared.private_data = private_data.to_vec();
            shared.param.connect_evd.clone()
        };
        if let Some(evd) = evd {
            let res = evd.inner.post_connection(
                EventNumber::ConnectionEstablished,
                ep.id(),
                private_data,
            );
            if let Err(e) = res {
                log::warn!("rdapl: cannot report establishment of {}: {}", ep.id(), e);
                if let Err(e) = ia.transport.disconnect(cm, DisconnectMode::Abrupt) {
                    log::debug!("rdapl: disconnect of {:?} failed: {}", cm, e);
                }
            }
        }
        return;
    }

    cr.mark_destroyed();
    cr.release(ia);
    let Some(ep) = ep else {
        return;
    };

    let evd = {
        let mut shared = ep.lock();
        if shared.cr == Some(cr.id()) {
            shared.cr = None;
        }
        match shared.state {
            EpState::TentativeConnectionPending | EpState::PassiveConnectionPending => {
                drop(shared);
                release_passive_ep(&ep);
                return;
            }
            EpState::Disconnected if event == ConnEvent::Broken => return,
            _ if shared.freed => return,
            _ => {}
        }
        shared.state = EpState::Disconnected;
        if matches!(event, ConnEvent::PeerRejected | ConnEvent::NonPeerRejected) {
            shared.private_data = private_data.to_vec();
        }
        if event == ConnEvent::Disconnected {
            if let Some(qp) = shared.qp {
                ia.transport.disconnect_clean(qp, false);
            }
        }
        shared.param.connect_evd.clone()
    };

    if let Some(evd) = evd {
        let res = evd
            .inner
            .post_connection(event.event_number(), ep.id(), private_data);
        if let Err(e) = res {
            log::warn!("rdapl: cannot post {:?} for {}: {}", event, ep.id(), e);
        }
    }
}

/// Route a CM event addressed to `ctx`.
pub(crate) fn dispatch(
    ia: &Arc<IaShared>,
    ctx: CmContext,
    cm: CmHandle,
    event: ConnEvent,
    private_data: &[u8],
) {
    match ctx {
        CmContext::Endpoint(id) => match ia.ep(id) {
            Some(ep) => ep.active_cm_event(event, private_data),
            None => log::debug!("rdapl: {:?} for unknown {}", event, id),
        },
        CmContext::Listener(id) => match ia.sp(id) {
            Some(sp) => passive_event(ia, &sp, cm, event, private_data),
            None => log::debug!("rdapl: {:?} for unknown {}", event, id),
        },
    }
}
