//! Negotiation and session lifecycle states

use crate::peer::types::Role;
use serde::Serialize;
use std::fmt;

/// Per-role offer/answer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    New,
    HaveLocalMedia,
    /// Offerer: local offer created and set
    OfferCreated,
    /// Offerer: offer published, waiting for the answer
    AwaitingAnswer,
    /// Answerer: media ready, waiting for an offer
    AwaitingOffer,
    /// Answerer: answer created and set
    AnswerCreated,
    Connected,
    Ended,
}

impl NegotiationState {
    /// Whether `self -> next` is a legal step for `role`.
    ///
    /// `Ended` is reachable from anywhere. `Connected` may be re-entered after a transport
    /// interruption, and the connection may also complete before the final local step is
    /// recorded.
    pub fn can_advance(self, role: Role, next: NegotiationState) -> bool {
        use NegotiationState::*;
        if next == Ended {
            return self != Ended;
        }
        match (role, self, next) {
            (_, New, HaveLocalMedia) => true,
            (Role::Offerer, HaveLocalMedia, OfferCreated) => true,
            (Role::Offerer, OfferCreated, AwaitingAnswer) => true,
            (Role::Offerer, AwaitingAnswer, Connected) => true,
            (Role::Answerer, HaveLocalMedia, AwaitingOffer) => true,
            (Role::Answerer, AwaitingOffer, AnswerCreated) => true,
            (Role::Answerer, AnswerCreated, Connected) => true,
            (_, Connected, Connected) => true,
            _ => false,
        }
    }

    /// Offer sent and answer not yet applied
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferCreated | NegotiationState::AwaitingAnswer
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse session lifecycle reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    AwaitingMedia,
    Negotiating,
    Connected,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::AwaitingMedia => "awaiting_media",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Ended => "ended",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationState::*;
    use super::*;

    #[test]
    fn test_offerer_path() {
        let path = [New, HaveLocalMedia, OfferCreated, AwaitingAnswer, Connected, Ended];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance(Role::Offerer, pair[1]), "{pair:?}");
        }
        assert!(!HaveLocalMedia.can_advance(Role::Offerer, AwaitingOffer));
    }

    #[test]
    fn test_answerer_path() {
        let path = [New, HaveLocalMedia, AwaitingOffer, AnswerCreated, Connected, Ended];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance(Role::Answerer, pair[1]), "{pair:?}");
        }
        assert!(!HaveLocalMedia.can_advance(Role::Answerer, OfferCreated));
        assert!(!AwaitingOffer.can_advance(Role::Answerer, AwaitingAnswer));
    }

    #[test]
    fn test_ended_is_terminal() {
        assert!(New.can_advance(Role::Offerer, Ended));
        assert!(!Ended.can_advance(Role::Offerer, Ended));
        assert!(!Ended.can_advance(Role::Answerer, HaveLocalMedia));
    }

    #[test]
    fn test_negotiating_window() {
        assert!(OfferCreated.is_negotiating());
        assert!(AwaitingAnswer.is_negotiating());
        assert!(!Connected.is_negotiating());
        assert!(!AnswerCreated.is_negotiating());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::AwaitingMedia.to_string(), "awaiting_media");
    }
}
