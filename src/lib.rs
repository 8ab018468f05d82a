//! Real-time session layer for a two-party video consultation.
//!
//! A [`SessionController`] negotiates a peer connection between an offerer and an answerer
//! over a [`SignalingBus`], attaches camera and microphone, swaps in a screen share on demand
//! and carries typed messages (pose telemetry, chat, reactions, media state, alerts) over one
//! ordered data channel.
//!
//! ```no_run
//! use physio_link::media::synthetic::{PreviewLog, SyntheticDevices};
//! use physio_link::peer::loopback::LoopbackNetwork;
//! use physio_link::{Role, SessionConfig, SessionController, SessionDeps, SignalingBus};
//! use std::sync::Arc;
//!
//! # async fn demo() -> physio_link::Result<()> {
//! let deps = SessionDeps {
//!     devices: Arc::new(SyntheticDevices::new()),
//!     transports: Arc::new(LoopbackNetwork::new().factory()),
//!     signaling: SignalingBus::default(),
//! };
//! let session = SessionController::spawn(deps, SessionConfig::default())?;
//! session.init(Arc::new(PreviewLog::new()), Role::Offerer).await?;
//! session.start_call().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{IceServerConfig, SessionConfig};
pub use error::{ErrorKind, Result, SessionError};
pub use media::{MediaDevices, MediaState, MediaStateKind, PreviewSink};
pub use peer::messages::{DataMessage, MessageType, ReceivedMessage, SkeletonUpdate};
pub use peer::types::Role;
pub use session::{
    ErrorEvent, SessionController, SessionDeps, SessionEvent, SessionHandle, SessionSnapshot,
};
pub use signaling::{SignalingBus, SignalingEnvelope};
