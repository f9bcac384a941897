//! Type aliases and handle identifiers.

use std::fmt;

/// [`u64`]: **Work request identifier**, encodes the cookie that owns a work request.
pub type WrId = u64;

/// [`u32`]: **Immediate data**, can be carried in send-type work requests.
pub type ImmData = u32;

/// [`u32`]: **Queue pair number**, identifies a transport queue pair.
pub type Qpn = u32;

/// [`u64`]: **Connection qualifier**, the port-like value a service point listens on.
pub type ConnQual = u64;

/// [`u32`]: **Local memory region context**, identifies a registered local buffer.
pub type LmrContext = u32;

/// [`u32`]: **Remote memory region context**, identifies a remote buffer.
pub type RmrContext = u32;

macro_rules! handle_id {
    ($($(#[$meta:meta])* $name:ident => $prefix:literal;)*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Get the raw identifier value.
            #[inline]
            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    )*};
}

handle_id! {
    /// Identifier of an event dispatcher.
    EvdId => "evd";
    /// Identifier of an endpoint.
    EpId => "ep";
    /// Identifier of a service point (PSP or RSP).
    SpId => "sp";
    /// Identifier of a connection request.
    CrId => "cr";
    /// Identifier of a completion notification object.
    CnoId => "cno";
    /// Identifier of a protection domain.
    PdId => "pd";
    /// Identifier of a shared receive queue.
    SrqId => "srq";
    /// Identifier of a remote memory region used in RMR binds.
    RmrId => "rmr";
}

/// Opaque per-connection handle issued by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CmHandle(pub u64);

/// Local buffer segment of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LmrTriplet {
    pub lmr_context: LmrContext,
    pub virtual_address: u64,
    pub segment_length: u64,
}

/// Remote buffer segment targeted by RDMA and atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RmrTriplet {
    pub rmr_context: RmrContext,
    pub target_address: u64,
    pub segment_length: u64,
}
