//! The rdapl prelude.
//!
//! The purpose of this module is to alleviate imports of the types a DAT
//! consumer touches most.

pub use crate::cno::Cno;
pub use crate::config::Config;
pub use crate::cq::{CompletionQueue, DtoStatus, Wc, WcStatus};
pub use crate::cr::{CmEventSink, Cr};
pub use crate::ep::{CompletionFlags, Ep, EpBuilder, EpState};
pub use crate::error::{DatError, DatResult};
pub use crate::evd::{Event, EventData, EventNumber, Evd, EvdFlags};
pub use crate::ia::Ia;
pub use crate::pd::Pd;
pub use crate::sp::{PspFlags, Sp};
pub use crate::srq::Srq;
pub use crate::transport::{CmContext, DisconnectMode, Transport, TransportError};
pub use crate::type_alias::{CmHandle, LmrTriplet, RmrTriplet};
