//! Completion queue entry to event translation.

use super::*;
use crate::cookie::{CookieAddr, CookieKind, CookieOwner, DtoOp};
use crate::cq::{DtoStatus, Wc};
use crate::ep::{Ep, EpState};

impl EvdInner {
    /// Resolve the cookie of `wc`, release it and build the matching event.
    ///
    /// Also return the endpoint whose connection the completion broke, if any.
    /// Completions whose cookie cannot be found produce no event.
    pub(super) fn translate_cqe(&self, ia: &IaShared, wc: &Wc) -> Option<(Event, Option<Ep>)> {
        let addr = CookieAddr::decode(wc.wr_id);
        let (cookie, ep) = match addr.owner {
            CookieOwner::Ep(id) => {
                let Some(ep) = ia.ep(id) else {
                    log::debug!("rdapl: completion {:?} for unknown {}", wc, id);
                    return None;
                };
                let buf = ep.cookies(addr.queue);
                let cookie = buf.get(addr.index)?;
                buf.deallocate(&cookie);
                (cookie, Some(ep))
            }
            CookieOwner::Srq(id) => {
                let Some(srq) = ia.srq(id) else {
                    log::debug!("rdapl: completion {:?} for unknown {}", wc, id);
                    return None;
                };
                let buf = srq.cookies();
                let cookie = buf.get(addr.index)?;
                buf.deallocate(&cookie);
                (cookie, ia.ep_by_qpn(wc.qp_num))
            }
        };

        let status = wc.dto_status();
        let (number, data) = match cookie.kind {
            CookieKind::Dto {
                op,
                user_cookie,
                size,
            } => {
                let transferred_length = match op {
                    DtoOp::Send | DtoOp::RdmaWrite => size,
                    _ => wc.byte_len as u64,
                };
                let number = match op {
                    DtoOp::Extension => EventNumber::ExtensionCompletion,
                    _ => EventNumber::DtoCompletion,
                };
                let data = EventData::Dto {
                    ep: ep.as_ref().map(Ep::id),
                    user_cookie,
                    status,
                    transferred_length,
                    op,
                    imm: wc.imm,
                };
                (number, data)
            }
            CookieKind::RmrBind { rmr, user_cookie } => {
                let status = match status {
                    DtoStatus::Success => DtoStatus::Success,
                    _ => DtoStatus::RmrOperationFailed,
                };
                let data = EventData::Rmr {
                    rmr,
                    user_cookie,
                    status,
                };
                (EventNumber::RmrBindCompletion, data)
            }
            CookieKind::Free => {
                log::debug!("rdapl: completion {:?} hit a released cookie", wc);
                return None;
            }
        };

        let broken = match status.is_fatal() {
            true => ep.filter(|ep| ep.state() == EpState::Connected),
            false => None,
        };
        if broken.is_some() {
            log::warn!(
                "rdapl: {} completion failed with {}, connection broken",
                self.id,
                wc.status()
            );
        }

        let event = Event {
            number,
            evd: self.id,
            data,
        };
        Some((event, broken))
    }

    /// Move every available completion onto the pending ring.
    ///
    /// Must be called without the EVD lock held.
    pub(super) fn copy_cq(&self) {
        let Some(cq) = &self.cq else {
            return;
        };
        let Some(ia) = self.ia.upgrade() else {
            return;
        };

        loop {
            let wc = match cq.poll_one() {
                Ok(Some(wc)) => wc,
                Ok(None) => break,
                Err(e) => {
                    log::error!("rdapl: polling CQ of {} failed: {}", self.id, e);
                    break;
                }
            };
            log::trace!("rdapl: {} polled {:?}", self.id, wc);

            let Some((event, broken)) = self.translate_cqe(&ia, &wc) else {
                continue;
            };
            // Overflow is reported by `get_free_event` itself.
            if let Ok(mut slot) = self.get_free_event() {
                *slot = event;
                if let Err(e) = slot.post_nosignal() {
                    log::warn!("rdapl: {} dropped a completion event: {}", self.id, e);
                }
            }
            if let Some(ep) = broken {
                ep.connection_broken();
            }
        }
    }
}
