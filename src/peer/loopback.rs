//! In-process transport: two endpoints on a shared [`LoopbackNetwork`] complete a real
//! offer/answer/candidate handshake and then exchange tracks and channel messages directly.
//!
//! Descriptions and candidates carry the endpoint id, so the handshake has to travel through
//! signaling just like it would between two machines. A remote candidate is rejected until a
//! remote description is set, which matches how browser and webrtc-rs peers behave.

use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::peer::transport::{
    DataChannel, EventSender, PeerTransport, TransportFactory, TransportResult,
};
use crate::peer::types::{
    IceCandidate, PeerState, RemoteTrack, SdpKind, SenderId, SessionDescription, TransportEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

struct Endpoint {
    events: EventSender,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<String>,
    senders: Vec<MediaTrack>,
    channel_label: Option<String>,
    channel_open: bool,
    candidate_seen: bool,
    state: PeerState,
    offers_created: usize,
    answers_created: usize,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        trace!(?event, "loopback event");
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: PeerState) {
        if self.state != state {
            self.state = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn ready(&self) -> bool {
        self.local.is_some()
            && self.remote.is_some()
            && self.candidate_seen
            && self.peer.is_some()
            && self.state != PeerState::Closed
    }

    fn sdp(&self, id: &str) -> String {
        let mut sdp = format!("v=0\r\no=loopback {id}\r\n");
        for track in &self.senders {
            let kind = match track.kind() {
                crate::media::TrackKind::Audio => "audio",
                crate::media::TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={kind} {}\r\n", track.id()));
        }
        if let Some(label) = &self.channel_label {
            sdp.push_str(&format!("m=application {label}\r\n"));
        }
        sdp
    }
}

fn origin_of(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|l| l.strip_prefix("o=loopback "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn candidate_owner(candidate: &str) -> Option<&str> {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "ufrag" {
            return parts.next();
        }
    }
    None
}

struct Network {
    endpoints: HashMap<String, Endpoint>,
    link_up: bool,
}

/// Shared medium that loopback transports connect through
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Network {
                endpoints: HashMap::new(),
                link_up: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Network> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Factory that keeps every transport it creates for later inspection
    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn transport(&self, events: EventSender) -> LoopbackTransport {
        let id = crate::utils::random_id();
        self.lock().endpoints.insert(
            id.clone(),
            Endpoint {
                events,
                local: None,
                remote: None,
                peer: None,
                senders: Vec::new(),
                channel_label: None,
                channel_open: false,
                candidate_seen: false,
                state: PeerState::New,
                offers_created: 0,
                answers_created: 0,
            },
        );
        LoopbackTransport {
            network: self.clone(),
            id,
        }
    }

    /// Endpoints still known to the network
    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Drop connectivity for every connected endpoint
    pub fn interrupt(&self) {
        let mut net = self.lock();
        net.link_up = false;
        for ep in net.endpoints.values_mut() {
            if ep.state == PeerState::Connected {
                ep.set_state(PeerState::Disconnected);
            }
        }
        debug!("loopback link interrupted");
    }

    /// Bring the link back; endpoints that lost connectivity reconnect
    pub fn restore(&self) {
        let mut net = self.lock();
        net.link_up = true;
        for ep in net.endpoints.values_mut() {
            if ep.state == PeerState::Disconnected {
                ep.set_state(PeerState::Connected);
            }
        }
        debug!("loopback link restored");
    }

    fn try_connect(&self, net: &mut Network, id: &str) {
        if !net.link_up {
            return;
        }
        let Some(peer_id) = net.endpoints.get(id).and_then(|e| e.peer.clone()) else {
            return;
        };
        let pair = [id.to_string(), peer_id];
        let both_ready = pair.iter().all(|k| {
            net.endpoints
                .get(k)
                .map(|e| e.ready() && e.state != PeerState::Connected)
                .unwrap_or(false)
        });
        if !both_ready {
            return;
        }

        let announced: Vec<Vec<RemoteTrack>> = pair
            .iter()
            .map(|k| {
                net.endpoints
                    .get(k)
                    .map(|e| {
                        e.senders
                            .iter()
                            .map(|t| RemoteTrack {
                                id: t.id().to_string(),
                                stream_id: k.clone(),
                                kind: t.kind(),
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        for (i, this) in pair.iter().enumerate() {
            let Some(ep) = net.endpoints.get_mut(this) else {
                continue;
            };
            ep.set_state(PeerState::Connecting);
            ep.set_state(PeerState::Connected);
            for track in &announced[1 - i] {
                ep.emit(TransportEvent::Track(track.clone()));
            }
        }
        debug!(a = %pair[0], b = %pair[1], "loopback endpoints connected");

        let creator = pair.iter().enumerate().find_map(|(i, k)| {
            net.endpoints
                .get(k)
                .and_then(|e| e.channel_label.clone())
                .map(|label| (i, label))
        });
        if let Some((i, label)) = creator {
            let receiver = &pair[1 - i];
            for k in &pair {
                if let Some(ep) = net.endpoints.get_mut(k) {
                    ep.channel_open = true;
                }
            }
            if let Some(ep) = net.endpoints.get(receiver) {
                ep.emit(TransportEvent::ChannelOffered(Arc::new(LoopbackChannel {
                    network: self.clone(),
                    owner: receiver.clone(),
                    label,
                })));
            }
            for k in &pair {
                if let Some(ep) = net.endpoints.get(k) {
                    ep.emit(TransportEvent::ChannelOpen);
                }
            }
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    id: String,
}

impl LoopbackTransport {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut Endpoint) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut net = self.network.lock();
        let ep = net
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        if ep.state == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        f(ep)
    }

    /// Track currently feeding `sender`
    pub fn bound_track(&self, sender: SenderId) -> Option<MediaTrack> {
        let net = self.network.lock();
        net.endpoints
            .get(&self.id)
            .and_then(|e| e.senders.get(sender.0).cloned())
    }

    pub fn senders(&self) -> Vec<MediaTrack> {
        let net = self.network.lock();
        net.endpoints
            .get(&self.id)
            .map(|e| e.senders.clone())
            .unwrap_or_default()
    }

    pub fn offers_created(&self) -> usize {
        let net = self.network.lock();
        net.endpoints.get(&self.id).map_or(0, |e| e.offers_created)
    }

    pub fn answers_created(&self) -> usize {
        let net = self.network.lock();
        net.endpoints.get(&self.id).map_or(0, |e| e.answers_created)
    }

    pub fn state(&self) -> PeerState {
        let net = self.network.lock();
        net.endpoints
            .get(&self.id)
            .map_or(PeerState::Closed, |e| e.state)
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &MediaTrack) -> TransportResult<SenderId> {
        self.with_endpoint(|ep| {
            ep.senders.push(track.clone());
            Ok(SenderId(ep.senders.len() - 1))
        })
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> TransportResult<()> {
        self.with_endpoint(|ep| {
            let slot = ep
                .senders
                .get_mut(sender.0)
                .ok_or_else(|| TransportError::Track(format!("unknown sender {}", sender.0)))?;
            if slot.kind() != track.kind() {
                return Err(TransportError::Track(format!(
                    "cannot bind {:?} track to {:?} sender",
                    track.kind(),
                    slot.kind()
                )));
            }
            *slot = track.clone();
            Ok(())
        })
    }

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        let id = self.id.clone();
        self.with_endpoint(|ep| {
            ep.offers_created += 1;
            Ok(SessionDescription::offer(ep.sdp(&id)))
        })
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        let id = self.id.clone();
        self.with_endpoint(|ep| match &ep.remote {
            Some(remote) if remote.kind == SdpKind::Offer => {
                ep.answers_created += 1;
                Ok(SessionDescription::answer(ep.sdp(&id)))
            }
            _ => Err(TransportError::Sdp(
                "cannot create answer without a remote offer".into(),
            )),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()> {
        let mut net = self.network.lock();
        let ep = net
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        if origin_of(&desc.sdp).as_deref() != Some(self.id.as_str()) {
            return Err(TransportError::Sdp("description was not created here".into()));
        }
        let first = ep.local.is_none();
        ep.local = Some(desc);
        if first {
            ep.set_state(PeerState::Connecting);
            let port = 40000 + (rand::random::<u16>() % 20000);
            ep.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host ufrag {}",
                    self.id
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: Some(self.id.clone()),
            }));
            ep.emit(TransportEvent::GatheringComplete);
        }
        self.network.try_connect(&mut net, &self.id);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()> {
        let mut net = self.network.lock();
        let peer = origin_of(&desc.sdp)
            .ok_or_else(|| TransportError::Sdp("missing origin line".into()))?;
        let ep = net
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        match (&ep.local, desc.kind) {
            (Some(local), SdpKind::Answer) if local.kind == SdpKind::Offer => {}
            (None, SdpKind::Offer) => {}
            (_, kind) => {
                return Err(TransportError::Sdp(format!(
                    "unexpected remote {kind:?} in current signaling state"
                )))
            }
        }
        ep.peer = Some(peer);
        ep.remote = Some(desc);
        self.network.try_connect(&mut net, &self.id);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        let net = self.network.lock();
        net.endpoints
            .get(&self.id)
            .is_some_and(|e| e.remote.is_some())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        let mut net = self.network.lock();
        let ep = net
            .endpoints
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;
        if ep.remote.is_none() {
            return Err(TransportError::IceCandidate(
                "remote description not set".into(),
            ));
        }
        let owner = candidate_owner(&candidate.candidate)
            .ok_or_else(|| TransportError::IceCandidate("unparseable candidate".into()))?;
        if ep.peer.as_deref() != Some(owner) {
            return Err(TransportError::IceCandidate(format!(
                "candidate from unknown endpoint {owner}"
            )));
        }
        ep.candidate_seen = true;
        self.network.try_connect(&mut net, &self.id);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn DataChannel>> {
        self.with_endpoint(|ep| {
            if ep.channel_label.is_some() {
                return Err(TransportError::DataChannel(
                    "data channel already created".into(),
                ));
            }
            ep.channel_label = Some(label.to_string());
            Ok(())
        })?;
        Ok(Arc::new(LoopbackChannel {
            network: self.network.clone(),
            owner: self.id.clone(),
            label: label.to_string(),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        let mut net = self.network.lock();
        let peer = match net.endpoints.get_mut(&self.id) {
            Some(ep) if ep.state != PeerState::Closed => {
                let was_open = ep.channel_open;
                ep.channel_open = false;
                if was_open {
                    ep.emit(TransportEvent::ChannelClosed);
                }
                ep.set_state(PeerState::Closed);
                ep.peer.clone()
            }
            _ => return Ok(()),
        };
        let mut peer_closed = true;
        if let Some(peer) = peer.as_ref().and_then(|p| net.endpoints.get_mut(p)) {
            if peer.channel_open {
                peer.channel_open = false;
                peer.emit(TransportEvent::ChannelClosed);
            }
            if peer.state == PeerState::Connected {
                peer.set_state(PeerState::Disconnected);
            }
            peer_closed = peer.state == PeerState::Closed;
        }
        // the pair is forgotten once neither side can use it
        if peer_closed {
            net.endpoints.remove(&self.id);
            if let Some(peer_id) = &peer {
                net.endpoints.remove(peer_id);
            }
        }
        debug!(endpoint = %self.id, forgotten = peer_closed, "loopback transport closed");
        Ok(())
    }
}

/// Data channel end owned by one loopback endpoint
pub struct LoopbackChannel {
    network: LoopbackNetwork,
    owner: String,
    label: String,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        let net = self.network.lock();
        net.link_up
            && net
                .endpoints
                .get(&self.owner)
                .is_some_and(|e| e.channel_open)
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        let net = self.network.lock();
        let owner = net
            .endpoints
            .get(&self.owner)
            .ok_or(TransportError::Closed)?;
        if !net.link_up || !owner.channel_open {
            return Err(TransportError::DataChannel("channel not open".into()));
        }
        let peer = owner
            .peer
            .as_ref()
            .and_then(|p| net.endpoints.get(p))
            .ok_or_else(|| TransportError::DataChannel("no remote endpoint".into()))?;
        peer.emit(TransportEvent::ChannelMessage(text));
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let mut net = self.network.lock();
        if let Some(ep) = net.endpoints.get_mut(&self.owner) {
            if ep.channel_open {
                ep.channel_open = false;
                ep.emit(TransportEvent::ChannelClosed);
            }
        }
        Ok(())
    }
}

/// [`TransportFactory`] handing out endpoints on one network
#[derive(Clone)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    created: Arc<Mutex<Vec<Arc<LoopbackTransport>>>>,
}

impl LoopbackFactory {
    /// The most recently created transport
    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(&self, events: EventSender) -> TransportResult<Arc<dyn PeerTransport>> {
        let transport = Arc::new(self.network.transport(events));
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use tokio::sync::mpsc;

    fn endpoint(
        network: &LoopbackNetwork,
    ) -> (
        LoopbackTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (network.transport(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn candidate(events: &[TransportEvent]) -> IceCandidate {
        events
            .iter()
            .find_map(|e| match e {
                TransportEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .expect("local candidate")
    }

    #[tokio::test]
    async fn test_handshake_connects_both_ends() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx) = endpoint(&network);
        let (b, mut b_rx) = endpoint(&network);
        a.add_track(&MediaTrack::new(TrackSource::Camera, "cam"))
            .await
            .unwrap();
        let dc = a.create_data_channel("data").await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_cand = candidate(&drain(&mut a_rx));
        let b_cand = candidate(&drain(&mut b_rx));
        a.add_ice_candidate(b_cand).await.unwrap();
        b.add_ice_candidate(a_cand).await.unwrap();

        assert_eq!(a.state(), PeerState::Connected);
        assert_eq!(b.state(), PeerState::Connected);
        assert!(dc.is_open());

        let b_events = drain(&mut b_rx);
        assert!(b_events
            .iter()
            .any(|e| matches!(e, TransportEvent::Track(t) if t.kind == crate::media::TrackKind::Video)));
        let offered = b_events
            .iter()
            .find_map(|e| match e {
                TransportEvent::ChannelOffered(dc) => Some(Arc::clone(dc)),
                _ => None,
            })
            .expect("channel offered");
        assert_eq!(offered.label(), "data");

        dc.send_text("hello".into()).await.unwrap();
        let got = drain(&mut b_rx);
        assert!(matches!(&got[..], [TransportEvent::ChannelMessage(m)] if m == "hello"));
    }

    #[tokio::test]
    async fn test_closed_pair_is_forgotten() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = endpoint(&network);
        let (b, _b_rx) = endpoint(&network);
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        assert_eq!(network.endpoint_count(), 2);

        // `a` never learned its peer, so it goes right away
        a.close().await.unwrap();
        assert_eq!(network.endpoint_count(), 1);
        assert_eq!(a.state(), PeerState::Closed);

        b.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(network.endpoint_count(), 0);
        assert!(matches!(
            b.add_track(&MediaTrack::new(TrackSource::Camera, "cam")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_candidate_rejected_without_remote_description() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = endpoint(&network);
        let err = a
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 1 127.0.0.1 1 typ host ufrag x".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::IceCandidate(_)));
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = endpoint(&network);
        assert!(matches!(
            a.create_answer().await,
            Err(TransportError::Sdp(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_track_keeps_kind() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = endpoint(&network);
        let audio = a
            .add_track(&MediaTrack::new(TrackSource::Microphone, "mic"))
            .await
            .unwrap();
        let video = a
            .add_track(&MediaTrack::new(TrackSource::Camera, "cam"))
            .await
            .unwrap();
        let screen = MediaTrack::new(TrackSource::Screen, "screen");

        assert!(a.replace_track(audio, &screen).await.is_err());
        a.replace_track(video, &screen).await.unwrap();
        assert!(a.bound_track(video).unwrap().same_track(&screen));
        assert_eq!(a.offers_created(), 0);
    }

    #[test]
    fn test_candidate_owner() {
        assert_eq!(
            candidate_owner("candidate:1 1 udp 1 127.0.0.1 5 typ host ufrag abc"),
            Some("abc")
        );
        assert_eq!(candidate_owner("candidate:1 1 udp"), None);
    }
}
