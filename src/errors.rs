use thiserror::Error;

/// Failures surfaced by the session core.
///
/// Media-acquisition and chat-send failures are recovered locally and do not
/// tear down the session. Negotiation failures close the peer link but leave
/// the session in its current lifecycle state. Channel disconnection only
/// flips the connectivity flag.
#[derive(Debug, Error)]
pub enum StudioError {
    /// Camera or microphone access was refused by the platform.
    #[error("camera/microphone permission denied")]
    PermissionDenied,

    /// Screen capture is not available on this platform.
    #[error("screen capture is not supported on this platform")]
    UnsupportedPlatform,

    /// ICE or offer/answer negotiation failed.
    #[error("peer negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Missing stream key or sender identity.
    #[error("missing stream key or identity")]
    Unauthenticated,

    /// The signaling channel is not connected.
    #[error("signaling channel disconnected")]
    ChannelDisconnected,

    /// A chat message could not be sent.
    #[error("chat send failed: {0}")]
    SendFailed(String),
}

impl StudioError {
    /// Whether the session should survive this error (as opposed to the
    /// caller needing to rebuild state before retrying).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StudioError::Unauthenticated)
    }
}
