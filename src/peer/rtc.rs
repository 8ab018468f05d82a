//! webrtc-rs backed transport

use crate::config::IceServerConfig;
use crate::error::TransportError;
use crate::logger::dump_candidate;
use crate::media::{MediaTrack, TrackKind};
use crate::peer::transport::{
    DataChannel, EventSender, PeerTransport, TransportFactory, TransportResult,
};
use crate::peer::types::{
    IceCandidate, PeerState, RemoteTrack, SdpKind, SenderId, SessionDescription, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "local";

/// Build ICE servers from user configuration
pub fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![config.url_with_scheme()],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

fn to_rtc(desc: SessionDescription) -> TransportResult<RTCSessionDescription> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_rtc(desc: RTCSessionDescription) -> TransportResult<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Sdp(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Snapshot of the nominated candidate pair, logged when the connection degrades
async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

struct RtcSender {
    sender: Arc<RTCRtpSender>,
    local: Arc<TrackLocalStaticSample>,
    track: MediaTrack,
}

/// Peer connection built on webrtc-rs
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: EventSender,
    senders: Mutex<Vec<RtcSender>>,
}

impl RtcTransport {
    pub async fn new(servers: &[IceServerConfig], events: EventSender) -> TransportResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);
        Self::install_handlers(&pc, &events);
        info!(ice_servers = servers.len(), "peer connection created");

        Ok(Self {
            pc,
            events,
            senders: Mutex::new(Vec::new()),
        })
    }

    fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &EventSender) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match cand.map(|c| c.to_json()) {
                    Some(Ok(init)) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        dump_candidate("LOCAL", &candidate);
                        let _ = tx.send(TransportEvent::LocalCandidate(candidate));
                    }
                    Some(Err(e)) => warn!(error = %e, "failed to serialize local candidate"),
                    None => {
                        debug!("ICE candidate gathering completed");
                        let _ = tx.send(TransportEvent::GatheringComplete);
                    }
                }
            })
        }));

        let tx = events.clone();
        let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!(state = ?st, "peer connection state changed");
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            if let Some(state) = peer_state(st) {
                let _ = tx.send(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = tx.send(TransportEvent::Track(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                }
                Box::pin(async {})
            },
        ));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            info!(label = dc.label(), "remote data channel offered");
            attach_dc(&dc, &tx);
            let _ = tx.send(TransportEvent::ChannelOffered(Arc::new(RtcChannel { dc })));
            Box::pin(async {})
        }));
    }

    /// Push one encoded frame of `duration` for `track`
    pub async fn write_frame(
        &self,
        track: &MediaTrack,
        data: Bytes,
        duration: Duration,
    ) -> TransportResult<()> {
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.write_sample(track, sample).await
    }

    /// Push one encoded media sample for `track`; dropped while the track is disabled
    pub async fn write_sample(&self, track: &MediaTrack, sample: Sample) -> TransportResult<()> {
        if !track.is_enabled() || track.is_ended() {
            return Ok(());
        }
        let local = {
            let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
            senders
                .iter()
                .find(|s| s.track.same_track(track))
                .map(|s| Arc::clone(&s.local))
        };
        match local {
            Some(local) => Ok(local.write_sample(&sample).await?),
            None => Err(TransportError::Track(format!(
                "track {} is not bound to a sender",
                track.id()
            ))),
        }
    }
}

/// Forward channel lifecycle and messages into the transport event stream
fn attach_dc(dc: &Arc<RTCDataChannel>, events: &EventSender) {
    let tx = events.clone();
    let label = dc.label().to_owned();
    dc.on_open(Box::new(move || {
        info!(label = %label, "data channel opened");
        let _ = tx.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                let _ = tx.send(TransportEvent::ChannelMessage(text));
            }
            Err(_) => warn!(len = msg.data.len(), "dropping non UTF-8 data channel frame"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        info!("data channel closed");
        let _ = tx.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> TransportResult<SenderId> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so interceptors keep running
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.push(RtcSender {
            sender,
            local,
            track: track.clone(),
        });
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(&self, id: SenderId, track: &MediaTrack) -> TransportResult<()> {
        let sender = {
            let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
            let slot = senders
                .get(id.0)
                .ok_or_else(|| TransportError::Track(format!("unknown sender {}", id.0)))?;
            if slot.track.kind() != track.kind() {
                return Err(TransportError::Track(format!(
                    "cannot bind {:?} track to {:?} sender",
                    track.kind(),
                    slot.track.kind()
                )));
            }
            Arc::clone(&slot.sender)
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        sender
            .replace_track(Some(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;

        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = senders.get_mut(id.0) {
            slot.local = local;
            slot.track = track.clone();
        }
        Ok(())
    }

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()> {
        Ok(self.pc.set_local_description(to_rtc(desc)?).await?)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()> {
        Ok(self.pc.set_remote_description(to_rtc(desc)?).await?)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        dump_candidate("REMOTE", &candidate);
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        Ok(self.pc.add_ice_candidate(init).await?)
    }

    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        attach_dc(&dc, &self.events);
        Ok(Arc::new(RtcChannel { dc }))
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(self.pc.close().await?)
    }
}

/// [`DataChannel`] over an `RTCDataChannel`
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_owned()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(self.dc.close().await?)
    }
}

/// Creates one [`RtcTransport`] per session using the configured ICE servers
#[derive(Clone, Default)]
pub struct RtcFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn create(&self, events: EventSender) -> TransportResult<Arc<dyn PeerTransport>> {
        Ok(Arc::new(RtcTransport::new(&self.ice_servers, events).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use tokio::sync::mpsc;

    #[test]
    fn test_ice_servers_from_config() {
        let servers = ice_servers(&[
            IceServerConfig::stun("stun.example.org:3478"),
            IceServerConfig::turn("turn.example.org:3478", "user", "pass"),
        ]);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "pass");
    }

    #[tokio::test]
    async fn test_offer_carries_media_and_data_sections() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RtcTransport::new(&[], tx).await.unwrap();
        transport
            .add_track(&MediaTrack::new(TrackSource::Microphone, "mic"))
            .await
            .unwrap();
        transport
            .add_track(&MediaTrack::new(TrackSource::Camera, "cam"))
            .await
            .unwrap();
        transport.create_data_channel("session-data").await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));
        assert!(!transport.has_remote_description().await);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_track_rejects_kind_mismatch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RtcTransport::new(&[], tx).await.unwrap();
        let audio = transport
            .add_track(&MediaTrack::new(TrackSource::Microphone, "mic"))
            .await
            .unwrap();
        let err = transport
            .replace_track(audio, &MediaTrack::new(TrackSource::Screen, "screen"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Track(_)));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_follow_enabled_flag() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RtcTransport::new(&[], tx).await.unwrap();
        let mic = MediaTrack::new(TrackSource::Microphone, "mic");
        let frame = Bytes::from_static(&[0xf8, 0xff, 0xfe]);
        let ptime = Duration::from_millis(20);

        assert!(matches!(
            transport.write_frame(&mic, frame.clone(), ptime).await,
            Err(TransportError::Track(_))
        ));
        transport.add_track(&mic).await.unwrap();
        transport.write_frame(&mic, frame.clone(), ptime).await.unwrap();

        // muted tracks never reach the sender, bound or not
        let unbound = MediaTrack::new(TrackSource::Camera, "cam");
        unbound.set_enabled(false);
        transport.write_frame(&unbound, frame, ptime).await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_needs_remote_description() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RtcTransport::new(&[], tx).await.unwrap();
        let result = transport
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.168.1.2 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await;
        assert!(result.is_err());
        transport.close().await.unwrap();
    }
}
