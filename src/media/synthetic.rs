//! Generated capture devices for tests and demos

use super::{
    MediaConstraints, MediaDevices, MediaStream, MediaTrack, PreviewSink, TrackSource,
};
use crate::error::MediaError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Ledger {
    acquired: Vec<MediaTrack>,
    released: Vec<String>,
}

/// Devices that hand out fake tracks and account for every acquisition and release
#[derive(Clone, Default)]
pub struct SyntheticDevices {
    deny_user_media: Arc<AtomicBool>,
    deny_display: Arc<AtomicBool>,
    ledger: Arc<Mutex<Ledger>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse camera/microphone access until re-allowed
    pub fn deny_user_media(&self, deny: bool) {
        self.deny_user_media.store(deny, Ordering::SeqCst);
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    fn track(&self, source: TrackSource, label: &str) -> MediaTrack {
        let ledger = Arc::clone(&self.ledger);
        let track = MediaTrack::with_release_hook(source, label, move |t| {
            if let Ok(mut ledger) = ledger.lock() {
                ledger.released.push(t.id().to_string());
            }
        });
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.acquired.push(track.clone());
        }
        track
    }

    pub fn acquired_count(&self) -> usize {
        self.ledger.lock().map(|l| l.acquired.len()).unwrap_or(0)
    }

    /// Number of device releases, counting every track at most once
    pub fn released_count(&self) -> usize {
        self.ledger.lock().map(|l| l.released.len()).unwrap_or(0)
    }

    /// Tracks still holding a device
    pub fn live_tracks(&self) -> Vec<MediaTrack> {
        self.ledger
            .lock()
            .map(|l| l.acquired.iter().filter(|t| !t.is_ended()).cloned().collect())
            .unwrap_or_default()
    }

    /// Most recently captured screen track
    pub fn last_display_track(&self) -> Option<MediaTrack> {
        self.ledger.lock().ok().and_then(|l| {
            l.acquired
                .iter()
                .rev()
                .find(|t| t.source() == TrackSource::Screen)
                .cloned()
        })
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera and microphone".into()));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.track(TrackSource::Microphone, "synthetic microphone"));
        }
        if constraints.video {
            tracks.push(self.track(TrackSource::Camera, "synthetic camera"));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("display capture".into()));
        }
        Ok(MediaStream::new(vec![
            self.track(TrackSource::Screen, "synthetic screen"),
        ]))
    }
}

/// Preview sink that remembers what it was asked to show
#[derive(Clone, Default)]
pub struct PreviewLog {
    shown: Arc<Mutex<Option<MediaStream>>>,
}

impl PreviewLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<MediaStream> {
        self.shown.lock().ok().and_then(|s| s.clone())
    }

    /// Source of the video track currently previewed
    pub fn current_source(&self) -> Option<TrackSource> {
        self.current()
            .and_then(|s| s.video_track().map(|t| t.source()))
    }
}

impl PreviewSink for PreviewLog {
    fn show(&self, stream: &MediaStream) {
        if let Ok(mut shown) = self.shown.lock() {
            *shown = Some(stream.clone());
        }
    }

    fn clear(&self) {
        if let Ok(mut shown) = self.shown.lock() {
            *shown = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_media_accounting() {
        let devices = SyntheticDevices::new();
        let stream = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(stream.tracks.len(), 2);
        assert_eq!(devices.acquired_count(), 2);
        assert_eq!(devices.live_tracks().len(), 2);

        stream.stop();
        stream.stop();
        assert_eq!(devices.released_count(), 2);
        assert!(devices.live_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_denied_media() {
        let devices = SyntheticDevices::new();
        devices.deny_user_media(true);
        let err = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied(_)));
        assert_eq!(devices.acquired_count(), 0);

        devices.deny_display(true);
        assert!(devices.get_display_media().await.is_err());
    }

    #[tokio::test]
    async fn test_last_display_track() {
        let devices = SyntheticDevices::new();
        assert!(devices.last_display_track().is_none());
        let stream = devices.get_display_media().await.unwrap();
        let track = devices.last_display_track().unwrap();
        assert!(track.same_track(stream.video_track().unwrap()));
    }

    #[test]
    fn test_preview_log() {
        let preview = PreviewLog::new();
        assert!(preview.current().is_none());
        let stream = MediaStream::new(vec![MediaTrack::new(TrackSource::Camera, "cam")]);
        preview.show(&stream);
        assert_eq!(preview.current_source(), Some(TrackSource::Camera));
        preview.clear();
        assert!(preview.current().is_none());
    }
}
