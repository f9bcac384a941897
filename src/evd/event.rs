use crate::cookie::DtoOp;
use crate::cq::DtoStatus;
use crate::type_alias::*;

/// Event number, naming what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventNumber {
    #[default]
    Software,

    DtoCompletion,
    ExtensionCompletion,
    RmrBindCompletion,

    ConnectionRequest,
    ConnectionEstablished,
    ConnectionPeerRejected,
    ConnectionNonPeerRejected,
    ConnectionAcceptCompletionError,
    ConnectionDisconnected,
    ConnectionBroken,
    ConnectionTimedOut,
    ConnectionUnreachable,

    AsyncEvdOverflow,
    AsyncIaCatastrophic,
    AsyncEpBroken,
    AsyncTimedOut,
    AsyncProviderInternal,
}

impl EventNumber {
    /// Whether this event is produced on behalf of an endpoint's connection.
    pub fn is_connection(self) -> bool {
        matches!(
            self,
            EventNumber::ConnectionEstablished
                | EventNumber::ConnectionPeerRejected
                | EventNumber::ConnectionNonPeerRejected
                | EventNumber::ConnectionAcceptCompletionError
                | EventNumber::ConnectionDisconnected
                | EventNumber::ConnectionBroken
                | EventNumber::ConnectionTimedOut
                | EventNumber::ConnectionUnreachable
        )
    }

    /// Whether this event is an asynchronous error.
    pub fn is_async(self) -> bool {
        matches!(
            self,
            EventNumber::AsyncEvdOverflow
                | EventNumber::AsyncIaCatastrophic
                | EventNumber::AsyncEpBroken
                | EventNumber::AsyncTimedOut
                | EventNumber::AsyncProviderInternal
        )
    }
}

/// Object an asynchronous error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncSource {
    Evd(EvdId),
    Ep(EpId),
    Ia,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventData {
    #[default]
    None,

    /// Completion of a data transfer operation.
    Dto {
        /// `None` for SRQ completions whose queue pair is no longer known.
        ep: Option<EpId>,
        user_cookie: u64,
        status: DtoStatus,
        transferred_length: u64,
        op: DtoOp,
        imm: Option<ImmData>,
    },

    /// Completion of a memory window bind.
    Rmr {
        rmr: RmrId,
        user_cookie: u64,
        status: DtoStatus,
    },

    /// Arrival of a connection request on a service point.
    ConnectionRequest {
        sp: SpId,
        conn_qual: ConnQual,
        cr: CrId,
    },

    /// Connection state change of an endpoint, with the peer's private data
    /// if any.
    Connection { ep: EpId, private_data: Vec<u8> },

    AsyncError { source: AsyncSource },

    /// Consumer-defined value of a software event.
    Software(u64),
}

impl EventData {
    /// User cookie of a DTO or RMR-bind completion.
    pub fn user_cookie(&self) -> Option<u64> {
        match self {
            EventData::Dto { user_cookie, .. } | EventData::Rmr { user_cookie, .. } => {
                Some(*user_cookie)
            }
            _ => None,
        }
    }
}

/// Event delivered through an EVD.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    pub number: EventNumber,
    /// EVD the event was posted to.
    pub evd: EvdId,
    pub data: EventData,
}

impl Event {
    /// Reset to an empty software event, keeping allocations.
    pub(crate) fn clear(&mut self) {
        self.number = EventNumber::Software;
        self.data = EventData::None;
    }
}
