//! Local audio/video enablement and screen-share track substitution

use super::{
    MediaConstraints, MediaDevices, MediaState, MediaStateKind, MediaStream, MediaTrack,
    PreviewSink, TrackKind,
};
use crate::error::{Result, SessionError};
use crate::peer::transport::PeerTransport;
use crate::peer::types::SenderId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A local track bound to an outgoing sender
#[derive(Debug, Clone)]
pub struct TrackBinding {
    pub sender: SenderId,
    pub track: MediaTrack,
}

/// Owns the camera/microphone stream, an optional display stream and the sender bindings.
///
/// Exactly one video track is bound at a time; switching between camera and screen replaces
/// the track on the same sender.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    preview: Option<Arc<dyn PreviewSink>>,
    camera: Option<MediaStream>,
    screen: Option<MediaStream>,
    audio: Option<TrackBinding>,
    video: Option<TrackBinding>,
    state: MediaState,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            preview: None,
            camera: None,
            screen: None,
            audio: None,
            video: None,
            state: MediaState::default(),
        }
    }

    pub fn local_state(&self) -> MediaState {
        self.state
    }

    pub fn has_media(&self) -> bool {
        self.camera.is_some()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn video_binding(&self) -> Option<&TrackBinding> {
        self.video.as_ref()
    }

    pub fn audio_binding(&self) -> Option<&TrackBinding> {
        self.audio.as_ref()
    }

    /// Capture camera and microphone and show them in the preview
    pub async fn acquire(&mut self, preview: Arc<dyn PreviewSink>) -> Result<()> {
        let stream = self
            .devices
            .get_user_media(MediaConstraints::default())
            .await?;
        info!(stream = %stream.id, tracks = stream.tracks.len(), "local media acquired");
        preview.show(&stream);
        self.preview = Some(preview);
        self.camera = Some(stream);
        self.state = MediaState::default();
        Ok(())
    }

    /// Add the captured tracks to the transport, one sender per kind
    pub async fn attach(&mut self, transport: &dyn PeerTransport) -> Result<()> {
        let stream = self
            .camera
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState("no local media to attach".into()))?;

        for track in &stream.tracks {
            let sender = transport.add_track(track).await?;
            let binding = TrackBinding {
                sender,
                track: track.clone(),
            };
            debug!(kind = ?track.kind(), sender = sender.0, "track attached");
            match track.kind() {
                TrackKind::Audio => self.audio = Some(binding),
                TrackKind::Video => self.video = Some(binding),
            }
        }
        Ok(())
    }

    pub fn set_audio(&mut self, enabled: bool) -> Result<()> {
        let track = self
            .camera
            .as_ref()
            .and_then(|s| s.audio_track())
            .ok_or_else(|| SessionError::InvalidState("no local audio track".into()))?;
        track.set_enabled(enabled);
        self.state.apply(MediaStateKind::Audio, enabled);
        Ok(())
    }

    pub fn set_video(&mut self, enabled: bool) -> Result<()> {
        let track = self
            .camera
            .as_ref()
            .and_then(|s| s.video_track())
            .ok_or_else(|| SessionError::InvalidState("no local video track".into()))?;
        track.set_enabled(enabled);
        self.state.apply(MediaStateKind::Video, enabled);
        Ok(())
    }

    /// Capture the display and bind it to the video sender.
    ///
    /// Returns the screen track so the caller can watch for its natural end, or `None` when
    /// already sharing. On failure nothing is changed.
    pub async fn start_screen_share(
        &mut self,
        transport: &dyn PeerTransport,
    ) -> Result<Option<MediaTrack>> {
        if self.screen.is_some() {
            return Ok(None);
        }
        let stream = self
            .devices
            .get_display_media()
            .await
            .map_err(|e| SessionError::ScreenShare(e.to_string()))?;
        self.share_display(transport, stream).await
    }

    /// Device access used to capture the display outside of the controller
    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        Arc::clone(&self.devices)
    }

    /// Bind an already captured display stream to the video sender.
    ///
    /// The stream is released when it cannot be used, including when a share is already
    /// running, so a capture never outlives this call unowned.
    pub async fn share_display(
        &mut self,
        transport: &dyn PeerTransport,
        stream: MediaStream,
    ) -> Result<Option<MediaTrack>> {
        if self.screen.is_some() {
            stream.stop();
            return Ok(None);
        }
        let Some(sender) = self.video.as_ref().map(|b| b.sender) else {
            stream.stop();
            return Err(SessionError::ScreenShare("no video sender to substitute".into()));
        };
        let track = match stream.video_track() {
            Some(t) => t.clone(),
            None => {
                stream.stop();
                return Err(SessionError::ScreenShare(
                    "display capture has no video track".into(),
                ));
            }
        };

        if let Err(e) = transport.replace_track(sender, &track).await {
            stream.stop();
            return Err(SessionError::ScreenShare(e.to_string()));
        }

        if let Some(preview) = &self.preview {
            preview.show(&stream);
        }
        info!(track = %track.id(), "screen share started");
        self.video = Some(TrackBinding {
            sender,
            track: track.clone(),
        });
        self.screen = Some(stream);
        self.state.apply(MediaStateKind::ScreenShare, true);
        Ok(Some(track))
    }

    /// Rebind the camera and release the display capture. Returns `false` when not sharing.
    pub async fn stop_screen_share(&mut self, transport: &dyn PeerTransport) -> Result<bool> {
        let Some(screen) = self.screen.take() else {
            return Ok(false);
        };
        let camera = self.camera.as_ref().and_then(|s| s.video_track()).cloned();
        if let (Some(binding), Some(camera)) = (self.video.as_mut(), camera) {
            if let Err(e) = transport.replace_track(binding.sender, &camera).await {
                warn!(error = %e, "failed to restore camera track");
                self.screen = Some(screen);
                return Err(SessionError::ScreenShare(e.to_string()));
            }
            binding.track = camera;
        }
        screen.stop();
        if let (Some(preview), Some(camera)) = (&self.preview, &self.camera) {
            preview.show(camera);
        }
        self.state.apply(MediaStateKind::ScreenShare, false);
        info!("screen share stopped");
        Ok(true)
    }

    /// Release every captured device and clear the preview. Returns the number released.
    pub fn release(&mut self) -> usize {
        let mut released = 0;
        if let Some(screen) = self.screen.take() {
            released += screen.stop();
        }
        if let Some(camera) = self.camera.take() {
            released += camera.stop();
        }
        if let Some(preview) = self.preview.take() {
            preview.clear();
        }
        self.audio = None;
        self.video = None;
        self.state = MediaState::default();
        if released > 0 {
            info!(released, "local media released");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::{PreviewLog, SyntheticDevices};
    use crate::media::TrackSource;
    use crate::peer::loopback::{LoopbackNetwork, LoopbackTransport};
    use tokio::sync::mpsc;

    async fn setup() -> (
        MediaController,
        SyntheticDevices,
        PreviewLog,
        LoopbackTransport,
    ) {
        let devices = SyntheticDevices::new();
        let preview = PreviewLog::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = LoopbackNetwork::new().transport(tx);
        let mut media = MediaController::new(Arc::new(devices.clone()));
        media.acquire(Arc::new(preview.clone())).await.unwrap();
        media.attach(&transport).await.unwrap();
        (media, devices, preview, transport)
    }

    #[tokio::test]
    async fn test_toggle_audio_only_touches_audio() {
        let (mut media, _devices, _preview, _transport) = setup().await;
        media.set_audio(false).unwrap();

        let audio = media.audio_binding().unwrap().track.clone();
        let video = media.video_binding().unwrap().track.clone();
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());
        assert!(!media.local_state().audio_enabled);
        assert!(media.local_state().video_enabled);
    }

    #[tokio::test]
    async fn test_screen_share_reuses_video_sender() {
        let (mut media, devices, preview, transport) = setup().await;
        let sender = media.video_binding().unwrap().sender;
        let camera = media.video_binding().unwrap().track.clone();

        let screen = media.start_screen_share(&transport).await.unwrap().unwrap();
        assert_eq!(media.video_binding().unwrap().sender, sender);
        assert!(transport.bound_track(sender).unwrap().same_track(&screen));
        assert_eq!(preview.current_source(), Some(TrackSource::Screen));
        assert!(media.local_state().screen_sharing);
        assert_eq!(transport.senders().len(), 2);

        // second start is a no-op
        assert!(media.start_screen_share(&transport).await.unwrap().is_none());

        assert!(media.stop_screen_share(&transport).await.unwrap());
        assert!(transport.bound_track(sender).unwrap().same_track(&camera));
        assert!(screen.is_ended());
        assert_eq!(preview.current_source(), Some(TrackSource::Camera));
        assert!(!media.local_state().screen_sharing);
        assert_eq!(devices.live_tracks().len(), 2);

        assert!(!media.stop_screen_share(&transport).await.unwrap());
    }

    #[tokio::test]
    async fn test_denied_display_leaves_state_untouched() {
        let (mut media, devices, preview, transport) = setup().await;
        devices.deny_display(true);
        let sender = media.video_binding().unwrap().sender;

        let err = media.start_screen_share(&transport).await.unwrap_err();
        assert!(matches!(err, SessionError::ScreenShare(_)));
        assert!(!media.is_screen_sharing());
        assert_eq!(
            transport.bound_track(sender).unwrap().source(),
            TrackSource::Camera
        );
        assert_eq!(preview.current_source(), Some(TrackSource::Camera));
    }

    #[tokio::test]
    async fn test_late_capture_released_when_already_sharing() {
        let (mut media, devices, _preview, transport) = setup().await;
        let late = media.devices().get_display_media().await.unwrap();
        media.start_screen_share(&transport).await.unwrap();

        assert!(media.share_display(&transport, late.clone()).await.unwrap().is_none());
        assert!(late.video_track().unwrap().is_ended());
        assert_eq!(devices.live_tracks().len(), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (mut media, devices, preview, transport) = setup().await;
        media.start_screen_share(&transport).await.unwrap();
        assert_eq!(media.release(), 3);
        assert_eq!(media.release(), 0);
        assert_eq!(devices.released_count(), 3);
        assert!(preview.current().is_none());
        assert!(!media.has_media());
    }

    #[tokio::test]
    async fn test_toggle_without_media_fails() {
        let devices = SyntheticDevices::new();
        let mut media = MediaController::new(Arc::new(devices));
        assert!(matches!(
            media.set_video(false),
            Err(SessionError::InvalidState(_))
        ));
    }
}
