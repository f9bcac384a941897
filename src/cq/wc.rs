use std::fmt;

use thiserror::Error;

use crate::type_alias::*;

/// Opcode of a completion queue entry, in verbs numbering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum WcOpcode {
    /// Send request.
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data.
    RecvRdmaImm = 129,
}

impl TryFrom<u32> for WcOpcode {
    type Error = u32;

    fn try_from(wc_opcode: u32) -> Result<Self, u32> {
        Ok(match wc_opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            x => return Err(x),
        })
    }
}

/// Status of a completion queue entry, in verbs numbering.
///
/// The messages follow the usual `ibv_wc_status_str` wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    #[error("success")]
    Success = 0,
    #[error("local length error")]
    LocLenErr = 1,
    #[error("local QP operation error")]
    LocQpOpErr = 2,
    #[error("local EE context operation error")]
    LocEecOpErr = 3,
    #[error("local protection error")]
    LocProtErr = 4,
    /// A work request was outstanding when the QP moved to the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,
    #[error("memory window bind error")]
    MwBindErr = 6,
    #[error("bad response error")]
    BadRespErr = 7,
    #[error("local access error")]
    LocAccessErr = 8,
    #[error("remote invalid request error")]
    RemInvReqErr = 9,
    #[error("remote access error")]
    RemAccessErr = 10,
    #[error("remote operation error")]
    RemOpErr = 11,
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,
    #[error("local RDD violation error")]
    LocRddViolErr = 14,
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,
    #[error("remote aborted error")]
    RemAbortErr = 16,
    #[error("invalid EE context number")]
    InvEecnErr = 17,
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,
    #[error("fatal error")]
    FatalErr = 19,
    #[error("response timeout error")]
    RespTimeoutErr = 20,
    #[error("general error")]
    GeneralErr = 21,
}

const WC_STATUS_TABLE: [WcStatus; 22] = [
    WcStatus::Success,
    WcStatus::LocLenErr,
    WcStatus::LocQpOpErr,
    WcStatus::LocEecOpErr,
    WcStatus::LocProtErr,
    WcStatus::WrFlushErr,
    WcStatus::MwBindErr,
    WcStatus::BadRespErr,
    WcStatus::LocAccessErr,
    WcStatus::RemInvReqErr,
    WcStatus::RemAccessErr,
    WcStatus::RemOpErr,
    WcStatus::RetryExcErr,
    WcStatus::RnrRetryExcErr,
    WcStatus::LocRddViolErr,
    WcStatus::RemInvRdReqErr,
    WcStatus::RemAbortErr,
    WcStatus::InvEecnErr,
    WcStatus::InvEecStateErr,
    WcStatus::FatalErr,
    WcStatus::RespTimeoutErr,
    WcStatus::GeneralErr,
];

impl WcStatus {
    /// Decode a raw status code. Unknown codes become [`WcStatus::GeneralErr`].
    #[inline]
    pub fn from_raw(code: u32) -> Self {
        WC_STATUS_TABLE
            .get(code as usize)
            .copied()
            .unwrap_or(WcStatus::GeneralErr)
    }
}

/// Completion status reported in DTO events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DtoStatus {
    #[default]
    Success,
    Flushed,
    LocalLength,
    LocalEp,
    LocalProtection,
    BadResponse,
    RemoteAccess,
    RemoteResponder,
    Transport,
    ReceiverNotReady,
    RmrOperationFailed,
}

/// Status code to DTO status, indexed by verbs status number.
static DTO_STATUS_MAP: [DtoStatus; 22] = [
    DtoStatus::Success,            // success
    DtoStatus::LocalLength,        // loc_len_err
    DtoStatus::LocalEp,            // loc_qp_op_err
    DtoStatus::Transport,          // loc_eec_op_err
    DtoStatus::LocalProtection,    // loc_prot_err
    DtoStatus::Flushed,            // wr_flush_err
    DtoStatus::RmrOperationFailed, // mw_bind_err
    DtoStatus::BadResponse,        // bad_resp_err
    DtoStatus::LocalProtection,    // loc_access_err
    DtoStatus::RemoteResponder,    // rem_inv_req_err
    DtoStatus::RemoteAccess,       // rem_access_err
    DtoStatus::RemoteResponder,    // rem_op_err
    DtoStatus::Transport,          // retry_exc_err
    DtoStatus::ReceiverNotReady,   // rnr_retry_exc_err
    DtoStatus::LocalProtection,    // loc_rdd_viol_err
    DtoStatus::RemoteResponder,    // rem_inv_rd_req_err
    DtoStatus::RemoteResponder,    // rem_abort_err
    DtoStatus::Transport,          // inv_eecn_err
    DtoStatus::Transport,          // inv_eec_state_err
    DtoStatus::Transport,          // fatal_err
    DtoStatus::ReceiverNotReady,   // resp_timeout_err
    DtoStatus::Transport,          // general_err
];

impl DtoStatus {
    /// Map a raw verbs status code.
    #[inline]
    pub fn from_wc_status(code: u32) -> Self {
        DTO_STATUS_MAP
            .get(code as usize)
            .copied()
            .unwrap_or(DtoStatus::Transport)
    }

    /// Whether the status indicates a broken connection, i.e. anything but
    /// success or a flush.
    #[inline]
    pub fn is_fatal(self) -> bool {
        !matches!(self, DtoStatus::Success | DtoStatus::Flushed)
    }
}

/// Work completion entry as polled from a completion queue.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Wc {
    pub wr_id: WrId,
    /// Raw verbs status code.
    pub status: u32,
    /// Raw verbs opcode.
    pub opcode: u32,
    pub byte_len: u32,
    pub imm: Option<ImmData>,
    pub qp_num: Qpn,
}

impl Wc {
    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::from_raw(self.status)
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(self.byte_len as usize),
            st => Err(st),
        }
    }

    /// Get the opcode, if it is a known one.
    #[inline]
    pub fn opcode(&self) -> Option<WcOpcode> {
        WcOpcode::try_from(self.opcode).ok()
    }

    #[inline]
    pub fn dto_status(&self) -> DtoStatus {
        DtoStatus::from_wc_status(self.status)
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &format_args!("{:#x}", self.wr_id))
            .field("status", &self.status())
            .field("byte_len", &self.byte_len)
            .field("qp_num", &self.qp_num)
            .finish()
    }
}
