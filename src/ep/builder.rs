use crate::evd::{Evd, EvdFlags};
use crate::error::*;
use crate::pd::Pd;
use crate::srq::Srq;

/// Endpoint attribute builder, used both to create and to modify an endpoint.
///
/// Unset fields are left as they are on modify, and take their defaults on
/// create.
#[derive(Clone, Default)]
pub struct EpBuilder<'a> {
    pub(super) pd: Option<&'a Pd>,
    pub(super) connect_evd: Option<&'a Evd>,
    pub(super) request_evd: Option<&'a Evd>,
    pub(super) recv_evd: Option<&'a Evd>,
    pub(super) srq: Option<&'a Srq>,
    pub(super) max_request_dtos: Option<usize>,
    pub(super) max_recv_dtos: Option<usize>,
}

impl<'a> EpBuilder<'a> {
    /// Create a new endpoint builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protection domain. An endpoint gets its queue pair once it has
    /// a protection domain.
    pub fn pd(mut self, pd: &'a Pd) -> Self {
        self.pd = Some(pd);
        self
    }

    /// Set the EVD receiving connection events.
    pub fn connect_evd(mut self, evd: &'a Evd) -> Self {
        self.connect_evd = Some(evd);
        self
    }

    /// Set the EVD receiving send-queue completions.
    pub fn request_evd(mut self, evd: &'a Evd) -> Self {
        self.request_evd = Some(evd);
        self
    }

    /// Set the EVD receiving receive-queue completions. Can be the same as
    /// the request EVD.
    pub fn recv_evd(mut self, evd: &'a Evd) -> Self {
        self.recv_evd = Some(evd);
        self
    }

    /// Receive through a shared receive queue instead of the endpoint's own.
    pub fn srq(mut self, srq: &'a Srq) -> Self {
        self.srq = Some(srq);
        self
    }

    /// Set the number of outstanding send-queue operations. Only honored at
    /// creation.
    pub fn max_request_dtos(mut self, n: usize) -> Self {
        self.max_request_dtos = Some(n);
        self
    }

    /// Set the number of outstanding receive operations. Only honored at
    /// creation.
    pub fn max_recv_dtos(mut self, n: usize) -> Self {
        self.max_recv_dtos = Some(n);
        self
    }

    /// Check that each given EVD carries the events it will receive.
    pub(super) fn check_evds(&self) -> DatResult<()> {
        if let Some(evd) = self.connect_evd {
            if !evd.flags().contains(EvdFlags::CONNECTION) {
                return Err(DatError::InvalidHandle(HandleKind::EvdConnect));
            }
        }
        if let Some(evd) = self.request_evd {
            if !evd.flags().contains(EvdFlags::DTO) {
                return Err(DatError::InvalidHandle(HandleKind::EvdRequest));
            }
        }
        if let Some(evd) = self.recv_evd {
            if !evd.flags().contains(EvdFlags::DTO) {
                return Err(DatError::InvalidHandle(HandleKind::EvdRecv));
            }
        }
        Ok(())
    }
}
