//! Error types returned by the event core.

use std::fmt;

use thiserror::Error;

use crate::transport::TransportError;

/// Resource whose exhaustion caused an admission-control failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// No free cookie in an endpoint or SRQ cookie buffer.
    Cookie,
    /// No free event slot in an event dispatcher.
    Event,
    /// A ring buffer is full.
    RingBuffer,
    /// Memory allocation failed.
    Memory,
    /// The transport could not provide a completion queue, queue pair or
    /// other object.
    Transport,
}

/// Why an operation was refused by a state check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReason {
    /// The EVD already has a waiter.
    EvdWaited,
    /// The EVD is not open (still initializing or freed).
    EvdNotOpen,
    /// The EVD suffered a catastrophic overflow.
    EvdDead,
    /// The EVD is still referenced by an endpoint or a service point.
    EvdInUse,
    /// The EVD was made unwaitable.
    EvdUnwaitable,
    /// The EVD holds more pending events than the requested length.
    EvdPending,
    /// The CNO is still attached to an EVD.
    CnoInUse,
    /// The CNO was freed.
    CnoDead,
    /// The endpoint state does not allow the operation.
    EpState,
    /// The endpoint is missing its PD or a suitable EVD.
    EpNotReady,
    /// The endpoint has no attached queue pair.
    EpUnattached,
    /// The endpoint receives through a shared receive queue.
    EpUsesSrq,
    /// The SRQ is still used by an endpoint.
    SrqInUse,
    /// The service point is no longer listening.
    SpNotListening,
}

/// Which argument was invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Capacity,
    QueueLength,
    Threshold,
    Flags,
    PrivateData,
    Endpoint,
    Config,
}

/// Kind of handle that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Ia,
    Evd,
    EvdConnect,
    EvdRequest,
    EvdRecv,
    EvdCr,
    Ep,
    Cr,
    Sp,
    Cno,
    Pd,
    Srq,
}

macro_rules! display_as_debug {
    ($($t:ty)*) => ($(
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    )*)
}

display_as_debug!(Resource StateReason Param HandleKind);

/// Error type of the event core.
#[derive(Debug, Error)]
pub enum DatError {
    /// Admission control rejected the request; retry later or configure a
    /// larger queue.
    #[error("insufficient resources: {0}")]
    InsufficientResources(Resource),

    /// The object is in a state incompatible with the operation. Nothing was
    /// modified.
    #[error("invalid state: {0}")]
    InvalidState(StateReason),

    /// An argument is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(Param),

    /// A handle is stale or of the wrong kind.
    #[error("invalid handle: {0}")]
    InvalidHandle(HandleKind),

    /// No event is available.
    #[error("queue empty")]
    QueueEmpty,

    /// The wait timed out before the threshold was reached.
    #[error("timeout expired")]
    Timeout,

    /// The transport failed a request.
    #[error("transport error")]
    Transport(#[from] TransportError),
}

impl DatError {
    /// Return `true` if the error is an admission-control failure.
    #[inline]
    pub fn is_insufficient_resources(&self) -> bool {
        matches!(self, DatError::InsufficientResources(_))
    }

    /// Return `true` if the error is a state check failure.
    #[inline]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, DatError::InvalidState(_))
    }
}

/// Result type of the event core.
pub type DatResult<T> = Result<T, DatError>;
