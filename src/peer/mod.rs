//! Peer connection plumbing: transport seam, negotiation, candidates and the data channel

pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod loopback;
pub mod messages;
pub mod rtc;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::ConnectionManager;
pub use data_channel::{DataMultiplexer, HandlerId, SkeletonFrame};
pub use state::{NegotiationState, SessionState};
pub use transport::{DataChannel, PeerTransport, TransportFactory};
pub use types::{IceCandidate, PeerState, RemoteTrack, Role, SessionDescription};
