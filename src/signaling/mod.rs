//! Local publish/subscribe medium for connection-establishment envelopes.
//!
//! The bus is best effort: no persistence, no replay for late subscribers. Every subscription
//! is bound to a role and silently skips envelopes that role published itself, so a
//! participant never reacts to its own offer or candidates.

pub mod token;

use crate::peer::types::{IceCandidate, Role, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

pub use token::TokenError;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// JSON envelope exchanged over signaling
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Value,
    #[serde(rename = "originRole")]
    pub origin_role: Role,
}

/// Decoded envelope payload
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalingEnvelope {
    pub fn offer(origin: Role, desc: &SessionDescription) -> serde_json::Result<Self> {
        Ok(Self::build(SignalKind::Offer, origin, serde_json::to_value(desc)?))
    }

    pub fn answer(origin: Role, desc: &SessionDescription) -> serde_json::Result<Self> {
        Ok(Self::build(SignalKind::Answer, origin, serde_json::to_value(desc)?))
    }

    pub fn candidate(origin: Role, candidate: &IceCandidate) -> serde_json::Result<Self> {
        Ok(Self::build(
            SignalKind::Candidate,
            origin,
            serde_json::to_value(candidate)?,
        ))
    }

    fn build(kind: SignalKind, origin_role: Role, payload: Value) -> Self {
        Self {
            kind,
            payload,
            origin_role,
        }
    }

    pub fn decode(&self) -> serde_json::Result<Signal> {
        let payload = self.payload.clone();
        Ok(match self.kind {
            SignalKind::Offer => Signal::Offer(serde_json::from_value(payload)?),
            SignalKind::Answer => Signal::Answer(serde_json::from_value(payload)?),
            SignalKind::Candidate => Signal::Candidate(serde_json::from_value(payload)?),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Broadcast bus shared by the two participants of one session
#[derive(Clone)]
pub struct SignalingBus {
    tx: broadcast::Sender<SignalingEnvelope>,
}

impl Default for SignalingBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SignalingBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Returns how many received it; envelopes published
    /// with nobody listening are lost.
    pub fn publish(&self, envelope: SignalingEnvelope) -> usize {
        let kind = envelope.kind;
        let origin = envelope.origin_role;
        match self.tx.send(envelope) {
            Ok(n) => {
                debug!(?kind, %origin, receivers = n, "signaling envelope published");
                n
            }
            Err(_) => {
                warn!(?kind, %origin, "no signaling subscribers, envelope lost");
                0
            }
        }
    }

    /// Decode an out-of-band token and publish every envelope it carries, in order
    pub fn publish_token(&self, token: &str) -> Result<usize, TokenError> {
        let envelopes = token::decode(token)?;
        let count = envelopes.len();
        for envelope in envelopes {
            self.publish(envelope);
        }
        Ok(count)
    }

    pub fn subscribe(&self, role: Role) -> SignalingSubscription {
        trace!(%role, "signaling subscription opened");
        SignalingSubscription {
            role,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end bound to one role; ends when dropped
pub struct SignalingSubscription {
    role: Role,
    rx: broadcast::Receiver<SignalingEnvelope>,
}

impl SignalingSubscription {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Next envelope from the other side. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SignalingEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(env) if env.origin_role == self.role => {
                    trace!(kind = ?env.kind, "skipping self-originated envelope");
                }
                Ok(env) => return Some(env),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(role = %self.role, skipped = n, "signaling subscriber lagged, envelopes lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<SignalingEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(env) if env.origin_role == self.role => continue,
                Ok(env) => return Some(env),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(role = %self.role, skipped = n, "signaling subscriber lagged, envelopes lost");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        trace!(role = %self.role, "signaling subscription closed");
    }
}
