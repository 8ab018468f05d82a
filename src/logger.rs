//! Tracing setup and candidate diagnostics

use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "physio_link=info";

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Calling this more than once is harmless; later calls leave the first subscriber in place.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Trickle-ICE trace for a discovered or received candidate
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

/// Tally of gathered local candidates by type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateStats {
    pub fn record(&mut self, cand: &IceCandidate) {
        let c = &cand.candidate;
        if c.contains("typ host") {
            self.host += 1;
        } else if c.contains("typ srflx") {
            self.srflx += 1;
        } else if c.contains("typ relay") {
            self.relay += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay
    }

    pub fn report(&self) {
        info!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate analysis"
        );
        if self.relay == 0 {
            warn!("no TURN relay candidates gathered; connections through symmetric NAT may fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_candidate_stats() {
        let mut stats = CandidateStats::default();
        stats.record(&cand("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host"));
        stats.record(&cand("candidate:2 1 udp 1694498815 1.2.3.4 6000 typ srflx raddr 10.0.0.2 rport 5000"));
        stats.record(&cand("candidate:3 1 udp 16777215 5.6.7.8 7000 typ relay raddr 1.2.3.4 rport 6000"));
        stats.record(&cand("candidate:4 1 udp 2130706431 10.0.0.3 5001 typ host"));
        assert_eq!(
            stats,
            CandidateStats {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
    }
}
