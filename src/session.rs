//! Session orchestration.
//!
//! A [`SessionController`] is a single tokio task that owns all state of one call: the
//! connection manager, the media controller, the data multiplexer, the signaling subscription
//! and the timers. Commands from a [`SessionHandle`], transport events, signaling envelopes and
//! timer ticks are processed one at a time in one `select!` loop, so no session state is shared
//! or locked.
//!
//! Nothing that waits on the user runs inside the loop. The display-capture prompt is awaited
//! in its own task and its result comes back as one more loop input, and remote skeleton frames
//! bypass the loop entirely through a latest-wins slot.

use crate::config::SessionConfig;
use crate::error::{ErrorKind, MediaError, Result, SessionError};
use crate::media::{
    MediaController, MediaDevices, MediaState, MediaStateKind, MediaStream, PreviewSink,
};
use crate::peer::connection::ConnectionManager;
use crate::peer::data_channel::{
    route_frames, DataMultiplexer, HandlerId, MessageHandler, SkeletonFrame,
};
use crate::peer::messages::{
    Alert, ChatMessage, DataMessage, MediaStateNotice, MessageType, Reaction, ReceivedMessage,
    SkeletonUpdate,
};
use crate::peer::state::{NegotiationState, SessionState};
use crate::peer::transport::TransportFactory;
use crate::peer::types::{PeerState, RemoteTrack, Role, TransportEvent};
use crate::signaling::{SignalingBus, SignalingEnvelope, SignalingSubscription};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 32;
const TICK: Duration = Duration::from_secs(1);

/// Collaborators a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: SignalingBus,
}

/// Error surfaced on the event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SessionError> for ErrorEvent {
    fn from(e: &SessionError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Everything the UI can observe about a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Raised on entry to and exit from the connected state
    ConnectionChanged { connected: bool },
    RemoteTrack(RemoteTrack),
    /// Inbound data message other than skeleton updates
    Message(ReceivedMessage),
    RemoteMediaChanged(MediaState),
    DurationTick { seconds: u64 },
    Error(ErrorEvent),
    /// The call is over; the appointment can be completed
    CallEnded { duration_seconds: u64 },
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub role: Option<Role>,
    pub state: SessionState,
    pub negotiation: NegotiationState,
    pub connected: bool,
    pub channel_open: bool,
    pub local_media: MediaState,
    pub remote_media: MediaState,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Init {
        preview: Arc<dyn PreviewSink>,
        role: Role,
        reply: Reply<()>,
    },
    StartCall {
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<u64>,
    },
    SetMedia {
        kind: MediaStateKind,
        enabled: bool,
        reply: Reply<()>,
    },
    StartScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    Chat {
        text: String,
        reply: Reply<()>,
    },
    Send {
        message: DataMessage,
        reply: Reply<()>,
    },
    On {
        kind: MessageType,
        handler: MessageHandler,
        reply: Reply<HandlerId>,
    },
    Off {
        id: HandlerId,
        reply: Reply<bool>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
}

/// Cheap cloneable front end of a running [`SessionController`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    skeleton: watch::Receiver<Option<SkeletonFrame>>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Acquire camera and microphone, build the transport and join signaling as `role`
    pub async fn init(&self, preview: Arc<dyn PreviewSink>, role: Role) -> Result<()> {
        self.request(|reply| Command::Init {
            preview,
            role,
            reply,
        })
        .await
    }

    /// Send the offer. Offerer only.
    pub async fn start_call(&self) -> Result<()> {
        self.request(|reply| Command::StartCall { reply }).await
    }

    /// Tear the session down and release every device. Returns the connected duration in
    /// seconds. Calling it again is a no-op.
    pub async fn end_call(&self) -> Result<u64> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn toggle_audio(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetMedia {
            kind: MediaStateKind::Audio,
            enabled,
            reply,
        })
        .await
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetMedia {
            kind: MediaStateKind::Video,
            enabled,
            reply,
        })
        .await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::Chat { text, reply }).await
    }

    pub async fn send_reaction(&self, emoji: impl Into<String>) -> Result<()> {
        self.send(DataMessage::Reaction(Reaction {
            emoji: emoji.into(),
        }))
        .await
    }

    pub async fn send_alert(&self, message: impl Into<String>) -> Result<()> {
        self.send(DataMessage::Alert(Alert {
            message: message.into(),
        }))
        .await
    }

    /// Forward one pose-estimator snapshot to the peer
    pub async fn send_skeleton(&self, update: SkeletonUpdate) -> Result<()> {
        self.send(DataMessage::Skeleton(update)).await
    }

    async fn send(&self, message: DataMessage) -> Result<()> {
        self.request(|reply| Command::Send { message, reply }).await
    }

    /// Register a handler for inbound messages of `kind`
    pub async fn on_message(
        &self,
        kind: MessageType,
        handler: impl Fn(&ReceivedMessage) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        let handler: MessageHandler = Arc::new(handler);
        self.request(|reply| Command::On {
            kind,
            handler,
            reply,
        })
        .await
    }

    pub async fn off_message(&self, id: HandlerId) -> Result<bool> {
        self.request(|reply| Command::Off { id, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Latest remote skeleton; never backs up, only the newest frame is kept
    pub fn skeleton(&self) -> watch::Receiver<Option<SkeletonFrame>> {
        self.skeleton.clone()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

type Timer = Option<Pin<Box<Sleep>>>;
type TrackEnd = Option<Pin<Box<dyn Future<Output = ()> + Send>>>;
type Capture = std::result::Result<MediaStream, MediaError>;

/// Display capture awaiting the user's choice
struct ScreenRequest {
    capture: oneshot::Receiver<Capture>,
    reply: Reply<()>,
}

pub struct SessionController {
    config: SessionConfig,
    deps: SessionDeps,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,

    role: Option<Role>,
    state: SessionState,
    media: MediaController,
    data: DataMultiplexer,
    connection: Option<ConnectionManager>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    signaling: Option<SignalingSubscription>,
    skeleton_seen: watch::Receiver<Option<SkeletonFrame>>,
    remote_media: MediaState,

    started_at: Option<DateTime<Utc>>,
    duration_seconds: u64,
    ticker: Option<Interval>,
    grace: Timer,
    negotiation_deadline: Timer,
    screen_ended: TrackEnd,
    screen_request: Option<ScreenRequest>,
}

impl SessionController {
    /// Validate `config` and start the controller task
    pub fn spawn(deps: SessionDeps, config: SessionConfig) -> Result<SessionHandle> {
        config.validate()?;
        let (cmd_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let data = DataMultiplexer::new();
        let skeleton = data.skeleton();
        let skeleton_seen = data.skeleton();

        let controller = Self {
            media: MediaController::new(Arc::clone(&deps.devices)),
            config,
            deps,
            commands,
            events: events.clone(),
            role: None,
            state: SessionState::New,
            data,
            connection: None,
            transport_events: None,
            signaling: None,
            skeleton_seen,
            remote_media: MediaState::default(),
            started_at: None,
            duration_seconds: 0,
            ticker: None,
            grace: None,
            negotiation_deadline: None,
            screen_ended: None,
            screen_request: None,
        };
        tokio::spawn(controller.run());

        Ok(SessionHandle {
            commands: cmd_tx,
            events,
            skeleton,
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                // Drain transport and signaling before taking the next command, so a command
                // always sees every state change that was already reported.
                biased;

                Ok(()) = self.skeleton_seen.changed() => self.on_skeleton(),
                Some(event) = next_transport_event(&mut self.transport_events) => {
                    self.handle_transport(event).await;
                }
                Some(envelope) = next_envelope(&mut self.signaling) => {
                    self.handle_envelope(envelope).await;
                }
                _ = track_end(&mut self.screen_ended) => self.on_screen_ended().await,
                capture = display_captured(&mut self.screen_request) => {
                    self.on_display_captured(capture).await;
                }
                _ = expire(&mut self.grace) => self.on_grace_expired(),
                _ = expire(&mut self.negotiation_deadline) => self.on_negotiation_timeout(),
                _ = tick(&mut self.ticker) => self.on_tick(),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("all session handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "session state");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn report(&self, err: &SessionError) {
        self.emit(SessionEvent::Error(ErrorEvent::from(err)));
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Negotiating | SessionState::Connected => Ok(()),
            SessionState::Ended => Err(SessionError::InvalidState("session has ended".into())),
            _ => Err(SessionError::InvalidState("session not initialised".into())),
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Init {
                preview,
                role,
                reply,
            } => {
                let result = self.init(preview, role).await;
                let _ = reply.send(result);
            }
            Command::StartCall { reply } => {
                let result = self.start_call().await;
                if let Err(e) = &result {
                    warn!(error = %e, "start_call failed");
                }
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                let _ = reply.send(Ok(self.end_call().await));
            }
            Command::SetMedia {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_media(kind, enabled).await);
            }
            Command::StartScreenShare { reply } => self.start_screen_share(reply),
            Command::StopScreenShare { reply } => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::Chat { text, reply } => {
                let sender = self
                    .config
                    .display_name
                    .clone()
                    .or_else(|| self.role.map(|r| r.label().to_string()))
                    .unwrap_or_default();
                let message = DataMessage::Chat(ChatMessage { text, sender });
                let _ = reply.send(self.data.send(message).await.map(|_| ()));
            }
            Command::Send { message, reply } => {
                let _ = reply.send(self.data.send(message).await.map(|_| ()));
            }
            Command::On {
                kind,
                handler,
                reply,
            } => {
                let _ = reply.send(Ok(self.data.on(kind, handler)));
            }
            Command::Off { id, reply } => {
                let _ = reply.send(Ok(self.data.off(id)));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    async fn init(&mut self, preview: Arc<dyn PreviewSink>, role: Role) -> Result<()> {
        if self.state != SessionState::New {
            return Err(SessionError::InvalidState(format!(
                "init not allowed in state {}",
                self.state
            )));
        }
        info!(%role, "initialising session");
        self.set_state(SessionState::AwaitingMedia);

        if let Err(e) = self.media.acquire(preview).await {
            error!(error = %e, "local media unavailable");
            self.report(&e);
            self.set_state(SessionState::New);
            return Err(e);
        }

        if let Err(e) = self.build_connection(role).await {
            error!(error = %e, "failed to set up the connection");
            self.report(&e);
            self.data.close().await;
            self.media.release();
            self.set_state(SessionState::New);
            return Err(e);
        }

        self.signaling = Some(self.deps.signaling.subscribe(role));
        self.role = Some(role);
        self.set_state(SessionState::Negotiating);
        Ok(())
    }

    /// Create the transport and prepare it for negotiation. The transport is closed again
    /// if any step fails.
    async fn build_connection(&mut self, role: Role) -> Result<()> {
        let (tx, raw) = mpsc::unbounded_channel();
        let transport = self.deps.transports.create(tx).await?;
        let mut connection = ConnectionManager::new(role, transport);
        if let Err(e) = self.prepare(&mut connection).await {
            connection.close().await;
            return Err(e);
        }

        let (forward, rx) = mpsc::unbounded_channel();
        tokio::spawn(route_frames(raw, forward, self.data.skeleton_slot()));
        self.transport_events = Some(rx);
        self.connection = Some(connection);
        Ok(())
    }

    async fn prepare(&mut self, connection: &mut ConnectionManager) -> Result<()> {
        self.media.attach(connection.transport().as_ref()).await?;
        connection.media_ready()?;
        if connection.role() == Role::Offerer {
            let channel = connection
                .open_channel(&self.config.data_channel_label)
                .await?;
            self.data.bind(channel);
        }
        Ok(())
    }

    async fn start_call(&mut self) -> Result<()> {
        self.ensure_active()?;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("no connection".into()))?;
        let offer = connection.start().await?;
        self.deps.signaling.publish(offer);
        self.arm_negotiation_deadline();
        Ok(())
    }

    fn arm_negotiation_deadline(&mut self) {
        if let Some(timeout) = self.config.negotiation_timeout() {
            self.negotiation_deadline = Some(Box::pin(tokio::time::sleep(timeout)));
        }
    }

    async fn set_media(&mut self, kind: MediaStateKind, enabled: bool) -> Result<()> {
        self.ensure_active()?;
        match kind {
            MediaStateKind::Audio => self.media.set_audio(enabled)?,
            MediaStateKind::Video => self.media.set_video(enabled)?,
            MediaStateKind::ScreenShare => {
                return Err(SessionError::InvalidState(
                    "screen share is toggled with start/stop".into(),
                ))
            }
        }
        info!(?kind, enabled, "local media toggled");
        self.announce(kind, enabled).await;
        Ok(())
    }

    /// Tell the peer about a local media change. Not being connected is not an error for
    /// the toggle itself.
    async fn announce(&mut self, kind: MediaStateKind, enabled: bool) {
        if !self.data.is_open() {
            debug!(?kind, enabled, "data channel not open, media state not announced");
            return;
        }
        let notice = DataMessage::MediaState(MediaStateNotice { kind, enabled });
        if let Err(e) = self.data.send(notice).await {
            warn!(error = %e, "failed to announce media state");
        }
    }

    /// Screen share changes need an active session, no negotiation in flight and no other
    /// screen share change pending
    fn screen_share_guard(&self) -> Result<&ConnectionManager> {
        if self.ensure_active().is_err() {
            return Err(SessionError::ScreenShare("no active session".into()));
        }
        if self.screen_request.is_some() {
            return Err(SessionError::ScreenShare(
                "a screen share change is already in progress".into(),
            ));
        }
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| SessionError::ScreenShare("no active session".into()))?;
        if connection.is_negotiating() {
            return Err(SessionError::ScreenShare(
                "negotiation in progress, try again once connected".into(),
            ));
        }
        Ok(connection)
    }

    /// Open the display picker in its own task; `reply` is answered once the user decides
    fn start_screen_share(&mut self, reply: Reply<()>) {
        if let Err(e) = self.screen_share_guard() {
            let _ = reply.send(Err(e));
            return;
        }
        if self.media.is_screen_sharing() {
            debug!("screen share already active");
            let _ = reply.send(Ok(()));
            return;
        }
        let devices = self.media.devices();
        let (tx, capture) = oneshot::channel();
        tokio::spawn(async move {
            let result = devices.get_display_media().await;
            if let Err(Ok(stream)) = tx.send(result) {
                debug!("display captured after the request was dropped, releasing");
                stream.stop();
            }
        });
        debug!("display capture requested");
        self.screen_request = Some(ScreenRequest { capture, reply });
    }

    async fn on_display_captured(
        &mut self,
        capture: std::result::Result<Capture, oneshot::error::RecvError>,
    ) {
        let Some(request) = self.screen_request.take() else {
            return;
        };
        let result = match capture {
            Ok(Ok(stream)) => self.share_display(stream).await,
            Ok(Err(e)) => Err(SessionError::ScreenShare(e.to_string())),
            Err(_) => Err(SessionError::ScreenShare("display capture abandoned".into())),
        };
        if let Err(e) = &result {
            warn!(error = %e, "screen share not started");
        }
        let _ = request.reply.send(result);
    }

    async fn share_display(&mut self, stream: MediaStream) -> Result<()> {
        let transport = match self.screen_share_guard() {
            Ok(connection) => Arc::clone(connection.transport()),
            Err(e) => {
                stream.stop();
                return Err(e);
            }
        };
        let Some(track) = self.media.share_display(transport.as_ref(), stream).await? else {
            return Ok(());
        };
        self.screen_ended = Some(Box::pin(async move { track.ended().await }));
        self.announce(MediaStateKind::ScreenShare, true).await;
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<()> {
        let transport = Arc::clone(self.screen_share_guard()?.transport());
        if self.media.stop_screen_share(transport.as_ref()).await? {
            self.screen_ended = None;
            self.announce(MediaStateKind::ScreenShare, false).await;
        }
        Ok(())
    }

    async fn on_screen_ended(&mut self) {
        self.screen_ended = None;
        if !self.media.is_screen_sharing() {
            return;
        }
        info!("display capture ended by the source, restoring camera");
        let Some(transport) = self.connection.as_ref().map(|c| Arc::clone(c.transport())) else {
            return;
        };
        match self.media.stop_screen_share(transport.as_ref()).await {
            Ok(true) => self.announce(MediaStateKind::ScreenShare, false).await,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "automatic screen share stop failed");
                self.report(&e);
            }
        }
    }

    async fn end_call(&mut self) -> u64 {
        if self.state == SessionState::Ended {
            debug!("end_call on an ended session");
            return self.duration_seconds;
        }
        self.teardown().await;
        info!(duration_seconds = self.duration_seconds, "call ended");
        self.emit(SessionEvent::CallEnded {
            duration_seconds: self.duration_seconds,
        });
        self.duration_seconds
    }

    /// Release everything the session holds and move to `Ended`
    async fn teardown(&mut self) {
        if self.state == SessionState::Ended {
            return;
        }
        self.ticker = None;
        self.grace = None;
        self.negotiation_deadline = None;
        self.screen_ended = None;
        if let Some(request) = self.screen_request.take() {
            let _ = request
                .reply
                .send(Err(SessionError::ScreenShare("call ended".into())));
        }

        let was_connected = self.connection.as_ref().is_some_and(|c| c.is_connected());
        self.data.close().await;
        if let Some(connection) = self.connection.as_mut() {
            connection.close().await;
        }
        self.transport_events = None;
        if let Some(subscription) = self.signaling.take() {
            subscription.unsubscribe();
        }
        self.media.release();

        if was_connected {
            self.emit(SessionEvent::ConnectionChanged { connected: false });
        }
        self.set_state(SessionState::Ended);
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Some(connection) = self.connection.as_mut() else {
                    return;
                };
                match connection.local_candidate(&candidate) {
                    Ok(envelope) => {
                        self.deps.signaling.publish(envelope);
                    }
                    Err(e) => warn!(error = %e, "failed to wrap local candidate"),
                }
            }
            TransportEvent::GatheringComplete => debug!("local candidate gathering complete"),
            TransportEvent::StateChanged(state) => self.on_peer_state(state),
            TransportEvent::Track(track) => {
                info!(kind = ?track.kind, id = %track.id, "remote track");
                self.emit(SessionEvent::RemoteTrack(track));
            }
            TransportEvent::ChannelOffered(channel) => self.data.bind(channel),
            TransportEvent::ChannelOpen => self.data.mark_open(),
            TransportEvent::ChannelMessage(text) => self.on_data(&text),
            TransportEvent::ChannelClosed => self.data.mark_closed(),
        }
    }

    fn on_peer_state(&mut self, state: PeerState) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        match connection.on_peer_state(state) {
            Some(true) => {
                self.grace = None;
                self.negotiation_deadline = None;
                self.remote_media = MediaState::default();
                self.started_at.get_or_insert_with(Utc::now);
                let mut ticker = interval_at(Instant::now() + TICK, TICK);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);

                self.emit(SessionEvent::ConnectionChanged { connected: true });
                self.emit(SessionEvent::RemoteMediaChanged(self.remote_media));
                self.set_state(SessionState::Connected);
            }
            Some(false) => {
                self.ticker = None;
                self.emit(SessionEvent::ConnectionChanged { connected: false });
                self.set_state(SessionState::Negotiating);
                let grace = self.config.grace_period();
                info!(grace_secs = grace.as_secs(), "connection lost, waiting for recovery");
                self.grace = Some(Box::pin(tokio::time::sleep(grace)));
            }
            None => debug!(?state, "peer state"),
        }
    }

    fn on_skeleton(&mut self) {
        let frame = self.skeleton_seen.borrow_and_update().clone();
        if let Some(frame) = frame {
            self.data.dispatch_skeleton(&frame);
        }
    }

    fn on_data(&mut self, text: &str) {
        let Some(received) = self.data.receive(text) else {
            return;
        };
        match &received.message {
            DataMessage::Skeleton(_) => {}
            DataMessage::MediaState(notice) => {
                self.remote_media.apply(notice.kind, notice.enabled);
                info!(kind = ?notice.kind, enabled = notice.enabled, "remote media state");
                self.emit(SessionEvent::RemoteMediaChanged(self.remote_media));
                self.emit(SessionEvent::Message(received));
            }
            _ => self.emit(SessionEvent::Message(received)),
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        debug!(kind = ?envelope.kind, origin = %envelope.origin_role, "signaling envelope received");
        let was_waiting = connection.state() == NegotiationState::AwaitingOffer;
        match connection.handle_signal(&envelope).await {
            Ok(Some(reply)) => {
                self.deps.signaling.publish(reply);
                if was_waiting {
                    self.arm_negotiation_deadline();
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(kind = ?envelope.kind, error = %e, "signaling step dropped");
                self.report(&e);
            }
        }
    }

    fn on_tick(&mut self) {
        self.duration_seconds += 1;
        self.emit(SessionEvent::DurationTick {
            seconds: self.duration_seconds,
        });
    }

    fn on_grace_expired(&mut self) {
        self.grace = None;
        if self.connection.as_ref().is_some_and(|c| c.is_connected()) {
            return;
        }
        let err = SessionError::ConnectionFailed(format!(
            "not recovered within {}s",
            self.config.grace_period().as_secs()
        ));
        error!(error = %err, "connection lost");
        self.report(&err);
    }

    fn on_negotiation_timeout(&mut self) {
        self.negotiation_deadline = None;
        if self.connection.as_ref().is_some_and(|c| c.is_connected()) {
            return;
        }
        let secs = self
            .config
            .negotiation_timeout()
            .map_or(0, |d| d.as_secs());
        let err = SessionError::NegotiationTimeout(secs);
        warn!(error = %err, "negotiation did not complete");
        self.report(&err);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            role: self.role,
            state: self.state,
            negotiation: self
                .connection
                .as_ref()
                .map_or(NegotiationState::New, |c| c.state()),
            connected: self.connection.as_ref().is_some_and(|c| c.is_connected()),
            channel_open: self.data.is_open(),
            local_media: self.media.local_state(),
            remote_media: self.remote_media,
            started_at: self.started_at,
            duration_seconds: self.duration_seconds,
        }
    }
}

async fn next_transport_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn next_envelope(sub: &mut Option<SignalingSubscription>) -> Option<SignalingEnvelope> {
    match sub {
        Some(sub) => sub.recv().await,
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn expire(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn display_captured(
    request: &mut Option<ScreenRequest>,
) -> std::result::Result<Capture, oneshot::error::RecvError> {
    match request {
        Some(request) => (&mut request.capture).await,
        None => pending().await,
    }
}

async fn track_end(fut: &mut TrackEnd) {
    match fut {
        Some(fut) => fut.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::media::synthetic::{PreviewLog, SyntheticDevices};
    use crate::media::MediaTrack;
    use crate::peer::loopback::{LoopbackNetwork, LoopbackTransport};
    use crate::peer::transport::{DataChannel, EventSender, PeerTransport, TransportResult};
    use crate::peer::types::{IceCandidate, SenderId, SessionDescription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spawn(devices: &SyntheticDevices) -> SessionHandle {
        let network = LoopbackNetwork::new();
        let deps = SessionDeps {
            devices: Arc::new(devices.clone()),
            transports: Arc::new(network.factory()),
            signaling: SignalingBus::default(),
        };
        SessionController::spawn(deps, SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_commands_before_init_rejected() {
        let handle = spawn(&SyntheticDevices::new());
        assert!(matches!(
            handle.start_call().await,
            Err(SessionError::InvalidState(_))
        ));
        assert!(matches!(
            handle.toggle_audio(false).await,
            Err(SessionError::InvalidState(_))
        ));
        assert!(matches!(
            handle.start_screen_share().await,
            Err(SessionError::ScreenShare(_))
        ));
        assert!(matches!(
            handle.send_chat("hi").await,
            Err(SessionError::DataSend(_))
        ));
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::New);
        assert_eq!(snap.role, None);
    }

    #[tokio::test]
    async fn test_denied_media_returns_to_new_and_allows_retry() {
        let devices = SyntheticDevices::new();
        devices.deny_user_media(true);
        let handle = spawn(&devices);
        let mut events = handle.subscribe();

        let err = handle
            .init(Arc::new(PreviewLog::new()), Role::Offerer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MediaAcquisition);
        assert_eq!(handle.snapshot().await.unwrap().state, SessionState::New);

        let mut saw_error = false;
        while let Ok(ev) = events.try_recv() {
            if let SessionEvent::Error(e) = ev {
                assert_eq!(e.kind, ErrorKind::MediaAcquisition);
                saw_error = true;
            }
        }
        assert!(saw_error);

        devices.deny_user_media(false);
        handle
            .init(Arc::new(PreviewLog::new()), Role::Offerer)
            .await
            .unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Negotiating);
        assert_eq!(snap.negotiation, NegotiationState::HaveLocalMedia);
    }

    #[tokio::test]
    async fn test_answerer_cannot_start_call() {
        let handle = spawn(&SyntheticDevices::new());
        handle
            .init(Arc::new(PreviewLog::new()), Role::Answerer)
            .await
            .unwrap();
        assert!(matches!(
            handle.start_call().await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(
            handle.snapshot().await.unwrap().negotiation,
            NegotiationState::AwaitingOffer
        );
    }

    #[tokio::test]
    async fn test_end_call_in_new_state() {
        let devices = SyntheticDevices::new();
        let handle = spawn(&devices);
        assert_eq!(handle.end_call().await.unwrap(), 0);
        assert_eq!(handle.end_call().await.unwrap(), 0);
        assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Ended);
        assert_eq!(devices.released_count(), 0);
        assert!(handle
            .init(Arc::new(PreviewLog::new()), Role::Offerer)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_reported() {
        let handle = spawn(&SyntheticDevices::new());
        let mut events = handle.subscribe();
        handle
            .init(Arc::new(PreviewLog::new()), Role::Offerer)
            .await
            .unwrap();
        // nobody answers
        handle.start_call().await.unwrap();

        let err = loop {
            match events.recv().await.unwrap() {
                SessionEvent::Error(e) => break e,
                _ => continue,
            }
        };
        assert_eq!(err.kind, ErrorKind::NegotiationTimeout);
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.negotiation, NegotiationState::AwaitingAnswer);
        assert_eq!(snap.state, SessionState::Negotiating);
    }

    /// Loopback endpoint that cannot open a data channel
    struct NoChannelTransport {
        inner: LoopbackTransport,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerTransport for NoChannelTransport {
        async fn add_track(&self, track: &MediaTrack) -> TransportResult<SenderId> {
            self.inner.add_track(track).await
        }

        async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> TransportResult<()> {
            self.inner.replace_track(sender, track).await
        }

        async fn create_offer(&self) -> TransportResult<SessionDescription> {
            self.inner.create_offer().await
        }

        async fn create_answer(&self) -> TransportResult<SessionDescription> {
            self.inner.create_answer().await
        }

        async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()> {
            self.inner.set_local_description(desc).await
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()> {
            self.inner.set_remote_description(desc).await
        }

        async fn has_remote_description(&self) -> bool {
            self.inner.has_remote_description().await
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
            self.inner.add_ice_candidate(candidate).await
        }

        async fn create_data_channel(&self, _label: &str) -> TransportResult<Arc<dyn DataChannel>> {
            Err(TransportError::DataChannel("sctp unavailable".into()))
        }

        async fn close(&self) -> TransportResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }
    }

    struct NoChannelFactory {
        network: LoopbackNetwork,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportFactory for NoChannelFactory {
        async fn create(&self, events: EventSender) -> TransportResult<Arc<dyn PeerTransport>> {
            Ok(Arc::new(NoChannelTransport {
                inner: self.network.transport(events),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    #[tokio::test]
    async fn test_failed_setup_closes_transport() {
        let devices = SyntheticDevices::new();
        let network = LoopbackNetwork::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let deps = SessionDeps {
            devices: Arc::new(devices.clone()),
            transports: Arc::new(NoChannelFactory {
                network: network.clone(),
                closes: Arc::clone(&closes),
            }),
            signaling: SignalingBus::default(),
        };
        let handle = SessionController::spawn(deps, SessionConfig::default()).unwrap();

        let err = handle
            .init(Arc::new(PreviewLog::new()), Role::Offerer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(network.endpoint_count(), 0);
        assert_eq!(devices.released_count(), 2);
        assert!(devices.live_tracks().is_empty());
        assert_eq!(handle.snapshot().await.unwrap().state, SessionState::New);
    }

    #[test]
    fn test_error_event_from_session_error() {
        let ev = ErrorEvent::from(&SessionError::DataSend("closed".into()));
        assert_eq!(ev.kind, ErrorKind::DataSend);
        assert_eq!(ev.message, "Data send failed: closed");
    }
}
