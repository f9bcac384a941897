//! Interface to the verbs transport and connection manager.
//!
//! The event core never talks to hardware directly. Everything it needs from
//! the transport goes through [`Transport`], and completions come back through
//! [`CompletionQueue`](crate::cq::CompletionQueue). Connection manager events
//! come back through [`CmEventSink`](crate::cr::CmEventSink).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::cq::CompletionQueue;
use crate::error::DatError;
use crate::type_alias::*;

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote side is gone or the connection was torn down.
    #[error("peer gone")]
    PeerGone,

    /// The remote side refused the connection.
    #[error("connection rejected")]
    Rejected,

    /// The transport is out of resources.
    #[error("transport out of resources")]
    NoResources,

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Classify a positive `errno` value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECONNREFUSED => TransportError::Rejected,
            libc::ENODEV | libc::EADDRNOTAVAIL | libc::ECONNRESET | libc::ENOTCONN => {
                TransportError::PeerGone
            }
            libc::ENOMEM | libc::ENOBUFS => TransportError::NoResources,
            x => TransportError::Io(io::Error::from_raw_os_error(x)),
        }
    }

    #[inline]
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, TransportError::PeerGone)
    }
}

impl From<io::Error> for DatError {
    fn from(e: io::Error) -> Self {
        DatError::Transport(TransportError::Io(e))
    }
}

/// Transport queue pair bound to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle {
    pub qpn: Qpn,
    /// Transport-private identifier.
    pub id: u64,
}

/// Transport shared receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrqHandle {
    pub id: u64,
}

/// Send-queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    Send,
    SendImm(ImmData),
    RdmaWrite(RmrTriplet),
    RdmaWriteImm(RmrTriplet, ImmData),
    RdmaRead(RmrTriplet),
    CmpSwap {
        remote: RmrTriplet,
        compare: u64,
        swap: u64,
    },
    FetchAdd {
        remote: RmrTriplet,
        add: u64,
    },
    BindMw {
        rmr: RmrId,
        lmr: LmrTriplet,
    },
}

/// A send-queue work request.
#[derive(Debug, Clone, Copy)]
pub struct SendWr<'a> {
    pub wr_id: WrId,
    pub op: SendOp,
    pub local: &'a [LmrTriplet],
    /// Whether the request generates a completion.
    pub signaled: bool,
    /// Whether the remote receive completion should be solicited.
    pub solicited: bool,
}

/// A receive-queue work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr<'a> {
    pub wr_id: WrId,
    pub local: &'a [LmrTriplet],
}

/// Parameters for creating a queue pair.
#[derive(Clone)]
pub struct QpInit<'a> {
    pub ep: EpId,
    pub send_cq: Option<&'a Arc<dyn CompletionQueue>>,
    pub recv_cq: Option<&'a Arc<dyn CompletionQueue>>,
    pub srq: Option<SrqHandle>,
    pub max_send_wr: usize,
    pub max_recv_wr: usize,
}

/// Reason sent with a connection reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The consumer rejected the request.
    Consumer,
    /// The provider could not deliver the request.
    NoResources,
    /// Nothing is listening.
    NotListening,
}

/// How to tear down a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Wait for outstanding operations to drain.
    Graceful,
    /// Tear down immediately; outstanding operations are flushed.
    Abrupt,
}

/// Where a CM event should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmContext {
    /// A listening service point; the event belongs to one of its CRs.
    Listener(SpId),
    /// An endpoint that initiated the connection.
    Endpoint(EpId),
}

/// Verbs transport and connection manager.
pub trait Transport: Send + Sync {
    /// Create a completion queue with at least `depth` entries for `evd`.
    ///
    /// When a notification requested through [`CompletionQueue::arm`] fires,
    /// the transport reports it with [`Ia::on_cq_event`](crate::Ia::on_cq_event)
    /// for `evd`.
    fn create_cq(&self, evd: EvdId, depth: usize) -> io::Result<Arc<dyn CompletionQueue>>;

    fn destroy_cq(&self, _cq: &Arc<dyn CompletionQueue>) -> io::Result<()> {
        Ok(())
    }

    fn create_qp(&self, init: QpInit<'_>) -> Result<QpHandle, TransportError>;

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), TransportError>;

    fn create_srq(&self, max_wr: usize) -> Result<SrqHandle, TransportError>;

    fn destroy_srq(&self, _srq: SrqHandle) -> Result<(), TransportError> {
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr<'_>) -> Result<(), TransportError>;

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr<'_>) -> Result<(), TransportError>;

    fn post_srq_recv(&self, srq: SrqHandle, wr: &RecvWr<'_>) -> Result<(), TransportError>;

    /// Start listening for connection requests on `conn_qual`. Requests are
    /// delivered with [`CmContext::Listener(sp)`](CmContext::Listener).
    fn listen(&self, sp: SpId, conn_qual: ConnQual) -> Result<(), TransportError>;

    fn stop_listen(&self, sp: SpId, conn_qual: ConnQual) -> Result<(), TransportError>;

    /// Start an active connection. Events are delivered with
    /// [`CmContext::Endpoint`].
    fn connect(
        &self,
        ep: EpId,
        qp: QpHandle,
        remote: SocketAddr,
        conn_qual: ConnQual,
        private_data: &[u8],
    ) -> Result<CmHandle, TransportError>;

    fn accept(&self, cm: CmHandle, qp: QpHandle, private_data: &[u8])
        -> Result<(), TransportError>;

    fn reject(
        &self,
        cm: CmHandle,
        reason: RejectReason,
        private_data: &[u8],
    ) -> Result<(), TransportError>;

    fn disconnect(&self, cm: CmHandle, mode: DisconnectMode) -> Result<(), TransportError>;

    /// Release connection resources after a disconnect has completed.
    fn disconnect_clean(&self, _qp: QpHandle, _active: bool) {}
}
