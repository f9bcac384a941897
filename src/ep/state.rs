/// Endpoint connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EpState {
    /// Not connected; may connect, be accepted on or be modified.
    #[default]
    Unconnected,

    /// `connect` was called, waiting for the peer.
    ActiveConnectionPending,

    /// Bound to an RSP and received a connection request.
    PassiveConnectionPending,

    /// Created by the provider for a connection request on a PSP.
    TentativeConnectionPending,

    /// Connected; data transfer allowed.
    Connected,

    /// `disconnect` was called, waiting for the transport to finish.
    DisconnectPending,

    /// Disconnected; must be reset before reuse.
    Disconnected,

    /// Accept was issued, waiting for the connection to be established.
    CompletionPending,
}

impl EpState {
    /// Whether the endpoint has or is about to have a live connection that a
    /// disconnect has to tear down.
    #[inline]
    pub fn is_connecting_or_connected(self) -> bool {
        matches!(
            self,
            EpState::Connected
                | EpState::ActiveConnectionPending
                | EpState::CompletionPending
                | EpState::DisconnectPending
        )
    }

    /// Whether the endpoint is waiting on a passive connection request.
    #[inline]
    pub fn is_passive_pending(self) -> bool {
        matches!(
            self,
            EpState::PassiveConnectionPending | EpState::TentativeConnectionPending
        )
    }
}
