//! Error types for the session layer

use serde::Serialize;

/// Result type alias using the session error
pub type Result<T> = std::result::Result<T, SessionError>;

/// Coarse classification surfaced to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MediaAcquisition,
    Signaling,
    DataSend,
    ScreenShare,
    Transport,
    InvalidState,
    NegotiationTimeout,
    ConnectionFailed,
    Serialization,
    Config,
    Closed,
}

/// Errors produced by the session controller and its components
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Camera, microphone or display capture denied or unavailable
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// Malformed envelope or negotiation step in the wrong state
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Data channel not open
    #[error("Data send failed: {0}")]
    DataSend(String),

    /// Screen share could not be started or stopped
    #[error("Screen share failed: {0}")]
    ScreenShare(String),

    /// Peer transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Offer/answer exchange did not complete in time
    #[error("Negotiation timed out after {0}s")]
    NegotiationTimeout(u64),

    /// Connection lost and not recovered within the grace period
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The controller task is gone
    #[error("Session controller closed")]
    Closed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::MediaAcquisition(_) => ErrorKind::MediaAcquisition,
            SessionError::Signaling(_) => ErrorKind::Signaling,
            SessionError::DataSend(_) => ErrorKind::DataSend,
            SessionError::ScreenShare(_) => ErrorKind::ScreenShare,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::InvalidState(_) => ErrorKind::InvalidState,
            SessionError::NegotiationTimeout(_) => ErrorKind::NegotiationTimeout,
            SessionError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            SessionError::Serialization(_) => ErrorKind::Serialization,
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::Closed => ErrorKind::Closed,
        }
    }

    /// Errors that end the attempt to start a session; the caller must `init` again
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::MediaAcquisition(_) | SessionError::Closed)
    }
}

/// Errors raised by a [`crate::media::MediaDevices`] backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("no {0} device available")]
    NotFound(String),

    #[error("device error: {0}")]
    Device(String),
}

/// Errors raised by a [`crate::peer::transport::PeerTransport`] backend
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    #[error("Data channel error: {0}")]
    DataChannel(String),

    #[error("Media track error: {0}")]
    Track(String),

    #[error("Transport closed")]
    Closed,

    /// webrtc-rs library error
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::DataSend("channel not open".to_string());
        assert_eq!(err.to_string(), "Data send failed: channel not open");
    }

    #[test]
    fn test_media_error_conversion() {
        let err = SessionError::from(MediaError::PermissionDenied("camera".to_string()));
        assert_eq!(err.kind(), ErrorKind::MediaAcquisition);
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Media acquisition failed: permission denied for camera"
        );
    }

    #[test]
    fn test_signaling_error_not_fatal() {
        let err = SessionError::Signaling("answer without offer".to_string());
        assert_eq!(err.kind(), ErrorKind::Signaling);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transport_error_conversion() {
        let err = SessionError::from(TransportError::Closed);
        assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
