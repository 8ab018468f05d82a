//! Typed message multiplexing over the single session data channel

use crate::error::{Result, SessionError};
use crate::peer::messages::{
    DataEnvelope, DataMessage, MessageType, ReceivedMessage, SkeletonUpdate,
};
use crate::peer::transport::DataChannel;
use crate::peer::types::TransportEvent;
use crate::utils::now_millis;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Callback invoked for every inbound message of the type it was registered for
pub type MessageHandler = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Newest pose snapshot received from the peer
#[derive(Debug, Clone, PartialEq)]
pub struct SkeletonFrame {
    pub update: SkeletonUpdate,
    pub timestamp: i64,
}

/// Single-frame store for remote skeletons. Writers replace, readers see only the newest.
#[derive(Clone)]
pub struct SkeletonSlot(Arc<watch::Sender<Option<SkeletonFrame>>>);

impl SkeletonSlot {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self(Arc::new(tx))
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SkeletonFrame>> {
        self.0.subscribe()
    }

    fn replace(&self, update: SkeletonUpdate, timestamp: i64) {
        self.0.send_replace(Some(SkeletonFrame { update, timestamp }));
    }

    /// Take `text` if it is a skeleton frame. Returns `false` for anything else, including
    /// unparseable frames, which are left for the multiplexer to report.
    pub fn capture(&self, text: &str) -> bool {
        let Ok(envelope) = DataEnvelope::from_json(text) else {
            return false;
        };
        if envelope.kind != MessageType::SkeletonUpdate {
            return false;
        }
        match envelope.decode() {
            Ok(DataMessage::Skeleton(update)) => {
                trace!(timestamp = envelope.timestamp, "skeleton frame captured");
                self.replace(update, envelope.timestamp);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "malformed skeleton frame dropped"),
        }
        true
    }
}

/// Forward transport events in order, diverting skeleton frames into `slot`.
///
/// Telemetry therefore never queues behind a busy consumer: however long `forward` is not
/// drained, at most one skeleton frame is held. Ends when either side goes away.
pub async fn route_frames(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    forward: mpsc::UnboundedSender<TransportEvent>,
    slot: SkeletonSlot,
) {
    while let Some(event) = events.recv().await {
        if let TransportEvent::ChannelMessage(text) = &event {
            if slot.capture(text) {
                continue;
            }
        }
        if forward.send(event).is_err() {
            break;
        }
    }
    debug!("transport event routing stopped");
}

pub struct DataMultiplexer {
    channel: Option<Arc<dyn DataChannel>>,
    open: bool,
    handlers: HashMap<MessageType, Vec<(HandlerId, MessageHandler)>>,
    next_handler: u64,
    skeleton: SkeletonSlot,
    sent: u64,
    received: u64,
}

impl Default for DataMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataMultiplexer {
    pub fn new() -> Self {
        Self {
            channel: None,
            open: false,
            handlers: HashMap::new(),
            next_handler: 0,
            skeleton: SkeletonSlot::new(),
            sent: 0,
            received: 0,
        }
    }

    /// Adopt the channel, created locally or offered by the peer
    pub fn bind(&mut self, channel: Arc<dyn DataChannel>) {
        debug!(label = %channel.label(), "data channel bound");
        self.open = channel.is_open();
        self.channel = Some(channel);
    }

    pub fn mark_open(&mut self) {
        if !self.open {
            info!("data channel open");
        }
        self.open = true;
    }

    pub fn mark_closed(&mut self) {
        if self.open {
            info!(sent = self.sent, received = self.received, "data channel closed");
        }
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open && self.channel.is_some()
    }

    /// Encode and send one message. Fails with `DataSend` when the channel is not open;
    /// the message is dropped, never buffered.
    pub async fn send(&mut self, message: DataMessage) -> Result<DataEnvelope> {
        let kind = message.message_type();
        let channel = match &self.channel {
            Some(channel) if self.open => Arc::clone(channel),
            _ => {
                warn!(?kind, "data channel not open, message dropped");
                return Err(SessionError::DataSend("data channel not open".into()));
            }
        };
        let envelope = message.into_envelope(now_millis())?;
        let text = envelope.to_json()?;
        if let Err(e) = channel.send_text(text).await {
            warn!(?kind, error = %e, "data channel send failed, message dropped");
            return Err(SessionError::DataSend(e.to_string()));
        }
        self.sent += 1;
        debug!(?kind, "data message sent");
        Ok(envelope)
    }

    /// Decode an inbound frame and dispatch it.
    ///
    /// Skeleton updates replace the watch slot. Every message goes to the handlers registered
    /// for its type, in registration order. Malformed frames are logged and dropped.
    pub fn receive(&mut self, text: &str) -> Option<ReceivedMessage> {
        let envelope = match DataEnvelope::from_json(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, len = text.len(), "malformed data envelope dropped");
                return None;
            }
        };
        let message = match envelope.decode() {
            Ok(m) => m,
            Err(e) => {
                warn!(kind = ?envelope.kind, error = %e, "malformed payload dropped");
                return None;
            }
        };
        self.received += 1;
        let received = ReceivedMessage {
            message,
            timestamp: envelope.timestamp,
        };

        if let DataMessage::Skeleton(update) = &received.message {
            self.skeleton.replace(update.clone(), received.timestamp);
        } else {
            debug!(kind = ?envelope.kind, "data message received");
        }
        self.dispatch(&received);
        Some(received)
    }

    /// Hand the newest captured skeleton frame to the skeleton handlers
    pub fn dispatch_skeleton(&self, frame: &SkeletonFrame) {
        self.dispatch(&ReceivedMessage {
            message: DataMessage::Skeleton(frame.update.clone()),
            timestamp: frame.timestamp,
        });
    }

    fn dispatch(&self, received: &ReceivedMessage) {
        if let Some(handlers) = self.handlers.get(&received.message_type()) {
            for (_, handler) in handlers {
                handler(received);
            }
        }
    }

    pub fn on(&mut self, kind: MessageType, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a handler; returns `false` if it was not registered
    pub fn off(&mut self, id: HandlerId) -> bool {
        for handlers in self.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(h, _)| *h == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Latest-wins view of the remote skeleton
    pub fn skeleton(&self) -> watch::Receiver<Option<SkeletonFrame>> {
        self.skeleton.subscribe()
    }

    pub fn skeleton_slot(&self) -> SkeletonSlot {
        self.skeleton.clone()
    }

    /// Close and forget the channel. Handlers stay registered.
    pub async fn close(&mut self) {
        self.open = false;
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "data channel close failed");
            }
        }
    }
}
