use thiserror::Error;

/// Broker failure taxonomy. Per-participant failures are reported only to the
/// initiating connection and never tear down the room.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("question not found: {0}")]
    QuestionNotFound(String),

    #[error("peer endpoint not found for {0}")]
    PeerEndpointNotFound(String),

    #[error("host media not ready, re-offer once the host is streaming")]
    MediaNotReady,

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no active session for this connection")]
    NotJoined,

    #[error("webrtc engine: {0}")]
    Engine(#[from] webrtc::Error),

    #[error("signaling: {0}")]
    Signaling(&'static str),
}
