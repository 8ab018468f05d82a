//! Per-role offer/answer negotiation over a [`PeerTransport`]

use crate::error::{Result, SessionError};
use crate::logger::{dump_candidate, CandidateStats};
use crate::peer::ice::CandidateQueue;
use crate::peer::state::NegotiationState;
use crate::peer::transport::{DataChannel, PeerTransport};
use crate::peer::types::{IceCandidate, PeerState, Role};
use crate::signaling::{Signal, SignalingEnvelope};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns the transport for one session and drives the negotiation state machine.
///
/// The manager never publishes anything itself: every step returns the envelope the caller
/// should put on the signaling bus.
pub struct ConnectionManager {
    role: Role,
    transport: Arc<dyn PeerTransport>,
    state: NegotiationState,
    candidates: CandidateQueue,
    stats: CandidateStats,
    connected: bool,
    ever_connected: bool,
}

impl ConnectionManager {
    pub fn new(role: Role, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            role,
            transport,
            state: NegotiationState::New,
            candidates: CandidateQueue::new(),
            stats: CandidateStats::default(),
            connected: false,
            ever_connected: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Offer sent and answer not yet applied
    pub fn is_negotiating(&self) -> bool {
        self.state.is_negotiating()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidate_stats(&self) -> CandidateStats {
        self.stats
    }

    fn advance(&mut self, next: NegotiationState) -> Result<()> {
        if !self.state.can_advance(self.role, next) {
            return Err(SessionError::InvalidState(format!(
                "{} cannot move from {} to {}",
                self.role, self.state, next
            )));
        }
        debug!(role = %self.role, from = %self.state, to = %next, "negotiation state");
        self.state = next;
        Ok(())
    }

    /// Local tracks are attached; the answerer now waits for an offer
    pub fn media_ready(&mut self) -> Result<()> {
        self.advance(NegotiationState::HaveLocalMedia)?;
        if self.role == Role::Answerer {
            self.advance(NegotiationState::AwaitingOffer)?;
        }
        Ok(())
    }

    /// Create the session data channel. Only the offerer does this; the answerer receives it.
    pub async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        if self.role != Role::Offerer {
            return Err(SessionError::InvalidState(
                "only the offerer creates the data channel".into(),
            ));
        }
        Ok(self.transport.create_data_channel(label).await?)
    }

    /// Create and apply the offer. Returns the envelope to publish.
    pub async fn start(&mut self) -> Result<SignalingEnvelope> {
        if self.role != Role::Offerer {
            return Err(SessionError::InvalidState(
                "only the offerer starts the call".into(),
            ));
        }
        if self.state != NegotiationState::HaveLocalMedia {
            return Err(SessionError::InvalidState(format!(
                "cannot start negotiation in state {}",
                self.state
            )));
        }
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.advance(NegotiationState::OfferCreated)?;
        let envelope = SignalingEnvelope::offer(self.role, &offer)?;
        self.advance(NegotiationState::AwaitingAnswer)?;
        info!(role = %self.role, "offer created");
        Ok(envelope)
    }

    /// Consume one inbound envelope. Returns an envelope to publish in reply, if any.
    ///
    /// A step that does not fit the current state fails with `Signaling` and changes nothing.
    pub async fn handle_signal(
        &mut self,
        envelope: &SignalingEnvelope,
    ) -> Result<Option<SignalingEnvelope>> {
        let signal = envelope
            .decode()
            .map_err(|e| SessionError::Signaling(format!("malformed {:?} envelope: {e}", envelope.kind)))?;

        match signal {
            Signal::Offer(offer) => {
                if self.role != Role::Answerer || self.state != NegotiationState::AwaitingOffer {
                    return Err(SessionError::Signaling(format!(
                        "unexpected offer for {} in state {}",
                        self.role, self.state
                    )));
                }
                self.transport.set_remote_description(offer).await?;
                self.candidates.flush(self.transport.as_ref()).await;
                let answer = self.transport.create_answer().await?;
                self.transport.set_local_description(answer.clone()).await?;
                self.advance(NegotiationState::AnswerCreated)?;
                info!(role = %self.role, "answer created");
                Ok(Some(SignalingEnvelope::answer(self.role, &answer)?))
            }
            Signal::Answer(answer) => {
                if self.role != Role::Offerer || self.state != NegotiationState::AwaitingAnswer {
                    return Err(SessionError::Signaling(format!(
                        "unexpected answer for {} in state {}",
                        self.role, self.state
                    )));
                }
                self.transport.set_remote_description(answer).await?;
                let flushed = self.candidates.flush(self.transport.as_ref()).await;
                info!(role = %self.role, flushed, "answer applied");
                Ok(None)
            }
            Signal::Candidate(candidate) => {
                if self.state == NegotiationState::Ended {
                    return Err(SessionError::Signaling("candidate after session end".into()));
                }
                self.candidates
                    .accept(self.transport.as_ref(), candidate)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Wrap a locally gathered candidate for publication
    pub fn local_candidate(&mut self, candidate: &IceCandidate) -> Result<SignalingEnvelope> {
        dump_candidate("LOCAL", candidate);
        self.stats.record(candidate);
        Ok(SignalingEnvelope::candidate(self.role, candidate)?)
    }

    /// Fold a transport state change into the connected flag.
    ///
    /// Returns `Some(connected)` exactly when the flag flips.
    pub fn on_peer_state(&mut self, state: PeerState) -> Option<bool> {
        match state {
            PeerState::Connected if !self.connected => {
                if self.state == NegotiationState::Ended {
                    return None;
                }
                self.connected = true;
                self.state = NegotiationState::Connected;
                if !self.ever_connected {
                    self.ever_connected = true;
                    self.stats.report();
                }
                info!(role = %self.role, "peer connected");
                Some(true)
            }
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed if self.connected => {
                self.connected = false;
                warn!(role = %self.role, ?state, "peer connection lost");
                Some(false)
            }
            _ => None,
        }
    }

    /// Close the transport and end the state machine. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Ended {
            return;
        }
        self.candidates.clear();
        self.connected = false;
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "transport close failed");
        }
        self.state = NegotiationState::Ended;
        info!(role = %self.role, "connection closed");
    }
}
