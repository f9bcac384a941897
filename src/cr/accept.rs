use super::*;
use crate::evd::{EventNumber, EvdFlags};

/// Endpoint state saved before an accept, restored if the transport fails.
struct Rollback {
    state: EpState,
    cr: Option<CrId>,
    cm: Option<CmHandle>,
}

impl Cr {
    /// Accept the connection on `ep`.
    ///
    /// `ep` may be omitted when the request already carries an endpoint: the
    /// provider-created one of a PSP, or the bound one of an RSP. Passing a
    /// different endpoint in place of a provider-created one frees the latter
    /// once the accept went through.
    ///
    /// If the requester went away in the meantime, the connect EVD receives an
    /// accept completion error event, the request is released and this still
    /// returns `Ok`.
    pub fn accept(&self, ep: Option<&Ep>, private_data: &[u8]) -> DatResult<()> {
        let ia = self.ia()?;
        if private_data.len() > ia.config.max_private_data_size {
            return Err(DatError::InvalidParameter(Param::PrivateData));
        }

        let (ep, bound) = {
            let shared = self.inner.shared.lock();
            if shared.destroyed {
                return Err(DatError::InvalidHandle(HandleKind::Cr));
            }
            match (ep, &shared.ep) {
                (Some(ep), Some(bound)) if ep.ptr_eq(bound) => (ep.clone(), Some(bound.clone())),
                (Some(ep), Some(bound)) => {
                    // A reserved SP accepts on its own endpoint only.
                    if bound.state() == EpState::PassiveConnectionPending {
                        return Err(DatError::InvalidParameter(Param::Endpoint));
                    }
                    (ep.clone(), Some(bound.clone()))
                }
                (Some(ep), None) => (ep.clone(), None),
                (None, Some(bound)) => (bound.clone(), Some(bound.clone())),
                (None, None) => return Err(DatError::InvalidParameter(Param::Endpoint)),
            }
        };
        let own = bound.as_ref().is_some_and(|b| b.ptr_eq(&ep));

        let (qp, rollback, connect_evd) = {
            let mut shared = ep.lock();
            if shared.freed {
                return Err(DatError::InvalidHandle(HandleKind::Ep));
            }
            let state_ok = match shared.state {
                EpState::Unconnected => true,
                EpState::TentativeConnectionPending | EpState::PassiveConnectionPending => own,
                _ => false,
            };
            if !state_ok {
                return Err(DatError::InvalidState(StateReason::EpState));
            }
            check_accept_param(&shared.param)?;
            let qp = shared
                .qp
                .ok_or(DatError::InvalidState(StateReason::EpUnattached))?;

            let rollback = Rollback {
                state: shared.state,
                cr: shared.cr,
                cm: shared.cm,
            };
            shared.state = EpState::CompletionPending;
            shared.cr = Some(self.inner.id);
            shared.cm = Some(self.inner.cm);
            (qp, rollback, shared.param.connect_evd.clone())
        };
        self.inner.shared.lock().ep = Some(ep.clone());

        let res = ia.transport.accept(self.inner.cm, qp, private_data);
        let replaced = bound.filter(|b| !b.ptr_eq(&ep));
        match res {
            Ok(()) => {
                if let Some(old) = replaced {
                    release_passive_ep(&old);
                }
                log::debug!("rdapl: {} accepted on {}", self.inner.id, ep.id());
                Ok(())
            }
            Err(e) if e.is_peer_gone() => {
                log::debug!("rdapl: peer of {} gone during accept", self.inner.id);
                {
                    let mut shared = ep.lock();
                    shared.state = EpState::Disconnected;
                    shared.cr = None;
                }
                self.mark_destroyed();
                self.release(&ia);
                if let Some(old) = replaced {
                    release_passive_ep(&old);
                }
                if let Some(evd) = connect_evd {
                    let res = evd.inner.post_connection(
                        EventNumber::ConnectionAcceptCompletionError,
                        ep.id(),
                        &[],
                    );
                    if let Err(e) = res {
                        log::warn!("rdapl: cannot report failed accept on {}: {}", ep.id(), e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut shared = ep.lock();
                    shared.state = rollback.state;
                    shared.cr = rollback.cr;
                    shared.cm = rollback.cm;
                }
                self.inner.shared.lock().ep = replaced.or(own.then(|| ep.clone()));
                log::debug!("rdapl: accept of {} failed: {}", self.inner.id, e);
                Err(e.into())
            }
        }
    }
}

fn check_accept_param(param: &crate::ep::EpParam) -> DatResult<()> {
    if param.pd.is_none() {
        return Err(DatError::InvalidState(StateReason::EpNotReady));
    }
    match &param.connect_evd {
        Some(evd) if evd.flags().contains(EvdFlags::CONNECTION) => {}
        Some(_) => return Err(DatError::InvalidHandle(HandleKind::EvdConnect)),
        None => return Err(DatError::InvalidState(StateReason::EpNotReady)),
    }
    if let Some(evd) = &param.request_evd {
        if !evd.flags().contains(EvdFlags::DTO) {
            return Err(DatError::InvalidHandle(HandleKind::EvdRequest));
        }
    }
    if let Some(evd) = &param.recv_evd {
        if !evd.flags().contains(EvdFlags::DTO) {
            return Err(DatError::InvalidHandle(HandleKind::EvdRecv));
        }
    }
    Ok(())
}
