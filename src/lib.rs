//! Event dispatch, connection request and cookie management core for
//! uDAPL-style RDMA providers.
//!
//! `rdapl` sits between a verbs transport (modelled by the [`Transport`] and
//! [`CompletionQueue`] traits) and a DAT-style consumer. Work completions are
//! matched back to the operation that produced them through per-queue
//! [`CookieBuffer`]s, translated into events and handed out by event
//! dispatchers ([`Evd`]). Connection manager callbacks drive the endpoint and
//! connection request state machines and produce connection events.
//!
//! Like the verbs resources they wrap, all handle types ([`Evd`], [`Ep`],
//! [`Cr`], [`Sp`], [`Cno`], [`Srq`]) are `Arc`-based references: `clone()`
//! them to share.
//!
//! # Example
//!
//! ```rust,ignore
//! use rdapl::prelude::*;
//!
//! let ia = Ia::open(transport, Config::default())?;
//! let pd = ia.pd_create();
//! let dto = ia.evd_create(128, None, EvdFlags::DTO)?;
//! let conn = ia.evd_create(8, None, EvdFlags::CONNECTION)?;
//! let ep = ia.ep_create(
//!     EpBuilder::new()
//!         .pd(&pd)
//!         .connect_evd(&conn)
//!         .request_evd(&dto)
//!         .recv_evd(&dto),
//! )?;
//! ep.connect(peer, 4791, b"hello")?;
//! let (event, _) = conn.wait(None, 1)?;
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

mod cno;
mod config;
mod cookie;
mod cq;
mod cr;
mod ep;
mod error;
mod evd;
mod ia;
mod pd;
mod rbuf;
mod sp;
mod srq;
mod transport;
mod type_alias;

/// Commonly used types.
pub mod prelude;

#[cfg(test)]
mod testing;

pub use cno::{Cno, CnoParam};
pub use config::Config;
pub use cookie::*;
pub use cq::*;
pub use cr::{CmEventSink, Cr, CrParam};
pub use ep::{CompletionFlags, Ep, EpBuilder, EpParam, EpState};
pub use error::*;
pub use evd::*;
pub use ia::Ia;
pub use pd::Pd;
pub use rbuf::{Relocate, RingBuffer, RingFull};
pub use sp::{PspFlags, Sp, SpKind, SpParam};
pub use srq::Srq;
pub use transport::*;
pub use type_alias::*;
