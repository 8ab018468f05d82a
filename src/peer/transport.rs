//! Seams between the connection manager and a concrete peer transport

use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::peer::types::{IceCandidate, SenderId, SessionDescription, TransportEvent};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Sink the transport reports candidates, state changes, tracks and channel traffic into
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// One peer connection: offer/answer handshake, trickle ICE, senders, data channel
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Bind a local track to a new sender
    async fn add_track(&self, track: &MediaTrack) -> TransportResult<SenderId>;

    /// Swap the track feeding an existing sender without renegotiating
    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> TransportResult<()>;

    async fn create_offer(&self) -> TransportResult<SessionDescription>;

    async fn create_answer(&self) -> TransportResult<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()>;

    async fn has_remote_description(&self) -> bool;

    /// Fails when no remote description has been applied yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()>;

    /// Create the ordered, reliable data channel (offerer side)
    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn DataChannel>>;

    async fn close(&self) -> TransportResult<()>;
}

/// Ordered reliable message channel carried by the transport
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

impl fmt::Debug for dyn DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Builds a fresh transport per session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: EventSender) -> TransportResult<Arc<dyn PeerTransport>>;
}
