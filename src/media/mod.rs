//! Local media: tracks, streams, device access and media-state flags

pub mod controller;
pub mod synthetic;

use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub use controller::{MediaController, TrackBinding};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Hardware behind a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

type ReleaseHook = Box<dyn Fn(&MediaTrack) + Send + Sync>;

struct TrackInner {
    id: String,
    label: String,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    on_release: Option<ReleaseHook>,
}

/// A local capture track. Clones share the same underlying device handle.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        Self::build(source, label.into(), None)
    }

    /// Track whose device is released through `hook`, invoked once when the track ends
    pub fn with_release_hook(
        source: TrackSource,
        label: impl Into<String>,
        hook: impl Fn(&MediaTrack) + Send + Sync + 'static,
    ) -> Self {
        Self::build(source, label.into(), Some(Box::new(hook)))
    }

    fn build(source: TrackSource, label: String, on_release: Option<ReleaseHook>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: crate::utils::random_id(),
                label,
                source,
                enabled: AtomicBool::new(true),
                ended,
                on_release,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without touching the device or the transport
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Release the device. Returns `true` only for the call that actually released it.
    pub fn stop(&self) -> bool {
        self.finish("stopped")
    }

    /// The source terminated on its own (e.g. the user ended sharing from the OS chrome)
    pub fn end(&self) -> bool {
        self.finish("ended by source")
    }

    fn finish(&self, reason: &str) -> bool {
        let released = self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        });
        if released {
            debug!(track = %self.inner.id, source = ?self.inner.source, reason, "track released");
            if let Some(hook) = &self.inner.on_release {
                hook(self);
            }
        }
        released
    }

    /// Resolves once the track has ended, whichever way
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Group of tracks captured together
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: crate::utils::random_id(),
            tracks,
        }
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track; returns how many devices were released by this call
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Access to capture hardware
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Combined microphone and camera capture
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Display capture for screen sharing
    async fn get_display_media(&self) -> Result<MediaStream, MediaError>;
}

/// Local preview element
pub trait PreviewSink: Send + Sync {
    fn show(&self, stream: &MediaStream);
    fn clear(&self);
}

/// Which flag a `MEDIA_STATE` notice refers to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaStateKind {
    Audio,
    Video,
    ScreenShare,
}

/// Audio/video/screen flags for one side of the call
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

impl MediaState {
    pub fn apply(&mut self, kind: MediaStateKind, enabled: bool) {
        match kind {
            MediaStateKind::Audio => self.audio_enabled = enabled,
            MediaStateKind::Video => self.video_enabled = enabled,
            MediaStateKind::ScreenShare => self.screen_sharing = enabled,
        }
    }
}
