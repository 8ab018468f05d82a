//! Remote candidate buffering.
//!
//! Candidates can arrive through signaling before the description they belong to. They are
//! held here and applied in arrival order as soon as the remote description is set.

use crate::error::TransportError;
use crate::logger::dump_candidate;
use crate::peer::transport::PeerTransport;
use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    applied: usize,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Candidates handed to the transport so far
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Apply `candidate` now if the transport has a remote description, otherwise queue it.
    ///
    /// Returns `true` when applied immediately.
    pub async fn accept(
        &mut self,
        transport: &dyn PeerTransport,
        candidate: IceCandidate,
    ) -> Result<bool, TransportError> {
        if !transport.has_remote_description().await {
            dump_candidate("QUEUED", &candidate);
            self.pending.push_back(candidate);
            debug!(pending = self.pending.len(), "remote description not set, candidate queued");
            return Ok(false);
        }
        transport.add_ice_candidate(candidate).await?;
        self.applied += 1;
        Ok(true)
    }

    /// Apply every queued candidate in arrival order. A candidate the transport rejects is
    /// logged and skipped. Returns how many were applied.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        debug!(pending = self.pending.len(), "flushing queued candidates");
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(error = %e, "failed to apply queued candidate"),
            }
        }
        self.applied += applied;
        applied
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::LoopbackNetwork;
    use crate::peer::types::TransportEvent;
    use tokio::sync::mpsc;

    fn local_candidate(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> IceCandidate {
        while let Ok(ev) = rx.try_recv() {
            if let TransportEvent::LocalCandidate(c) = ev {
                return c;
            }
        }
        panic!("no local candidate emitted");
    }

    #[tokio::test]
    async fn test_early_candidate_applied_after_remote_description() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let a = network.transport(a_tx);
        let b = network.transport(b_tx);

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        let cand = local_candidate(&mut a_rx);

        let mut queue = CandidateQueue::new();
        assert!(!queue.accept(&b, cand).await.unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.applied(), 0);

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(queue.flush(&b).await, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.applied(), 1);
    }

    #[tokio::test]
    async fn test_rejected_candidates_are_skipped() {
        let network = LoopbackNetwork::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let a = network.transport(a_tx);
        let b = network.transport(b_tx);

        let mut queue = CandidateQueue::new();
        let bogus = IceCandidate {
            candidate: "candidate:9 1 udp 1 10.0.0.1 9 typ host ufrag nobody".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        queue.accept(&b, bogus).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        assert_eq!(queue.flush(&b).await, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_empty_queue() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = network.transport(tx);
        let mut queue = CandidateQueue::new();
        assert_eq!(queue.flush(&a).await, 0);
    }
}
