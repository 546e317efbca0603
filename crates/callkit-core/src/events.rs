use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use tokio::sync::broadcast;

/// Buffered events per subscriber before a slow receiver starts lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Call-lifecycle events published by the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Initialized,
    Joined(String), // channel
    Left,
    AudioStateChanged(bool),   // muted
    VideoStateChanged(bool),   // video enabled
    SpeakerStateChanged(bool), // speakerphone enabled
    CameraSwitched(bool),      // front camera
    ConnectionStateChanged(ConnectionState, ConnectionChangeReason),
    Error(String),
}

/// Remote participant events published by the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    Joined(u32),
    Left(u32),
}

/// Transport connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Why the engine changed its connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChangeReason {
    Connecting,
    JoinSuccess,
    Interrupted,
    BannedByServer,
    JoinFailed,
    LeaveChannel,
    InvalidAppId,
    InvalidChannelName,
    InvalidToken,
    TokenExpired,
    RejectedByServer,
    Other(i32),
}

/// Observer-style consumer for shells that prefer callbacks over streams.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_call_event(&self, _event: CallEvent) {}
    fn on_participant_event(&self, _event: ParticipantEvent) {}
}

/// Two independent broadcast channels: call lifecycle and participants.
///
/// Late subscribers only see events published after they subscribed.
/// Within one channel, events reach every subscriber in emission order.
/// A subscriber that falls more than the channel capacity behind loses
/// the oldest events and is told how many it missed.
#[derive(Clone)]
pub struct EventBus {
    calls: Arc<Mutex<Option<broadcast::Sender<CallEvent>>>>,
    participants: Arc<Mutex<Option<broadcast::Sender<ParticipantEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (calls, _) = broadcast::channel(capacity);
        let (participants, _) = broadcast::channel(capacity);
        Self {
            calls: Arc::new(Mutex::new(Some(calls))),
            participants: Arc::new(Mutex::new(Some(participants))),
        }
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        subscribe(&self.calls)
    }

    pub fn subscribe_participants(&self) -> broadcast::Receiver<ParticipantEvent> {
        subscribe(&self.participants)
    }

    /// Lifecycle events as a stream that ends when the bus is closed.
    pub fn call_stream(&self) -> impl Stream<Item = CallEvent> + Send + use<> {
        into_stream(self.subscribe_calls())
    }

    /// Participant events as a stream that ends when the bus is closed.
    pub fn participant_stream(&self) -> impl Stream<Item = ParticipantEvent> + Send + use<> {
        into_stream(self.subscribe_participants())
    }

    pub fn emit_call(&self, event: CallEvent) {
        emit(&self.calls, event);
    }

    pub fn emit_participant(&self, event: ParticipantEvent) {
        emit(&self.participants, event);
    }

    /// Forward lifecycle events to `listener` from a background task.
    pub fn add_call_listener(&self, listener: Arc<dyn CallEventListener>) {
        let mut rx = self.subscribe_calls();
        tokio::spawn(async move {
            while let Some(event) = recv_next(&mut rx).await {
                listener.on_call_event(event);
            }
            tracing::debug!("call listener detached");
        });
    }

    /// Forward participant events to `listener` from a background task.
    pub fn add_participant_listener(&self, listener: Arc<dyn CallEventListener>) {
        let mut rx = self.subscribe_participants();
        tokio::spawn(async move {
            while let Some(event) = recv_next(&mut rx).await {
                listener.on_participant_event(event);
            }
            tracing::debug!("participant listener detached");
        });
    }

    /// Close both channels. Current subscribers drain what is buffered and
    /// then observe the end of the stream; later emits are dropped.
    pub fn close(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn subscribe<T: Clone>(slot: &Mutex<Option<broadcast::Sender<T>>>) -> broadcast::Receiver<T> {
    match slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        Some(tx) => tx.subscribe(),
        None => {
            // Closed bus: hand out a receiver whose sender is already gone.
            let (_, rx) = broadcast::channel(1);
            rx
        }
    }
}

fn emit<T: Clone + std::fmt::Debug>(slot: &Mutex<Option<broadcast::Sender<T>>>, event: T) {
    let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(tx) => {
            if tx.send(event).is_err() {
                tracing::trace!("event emitted with no subscribers");
            }
        }
        None => tracing::debug!("event bus closed, dropping {event:?}"),
    }
}

async fn recv_next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("event subscriber lagged, {missed} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn into_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> impl Stream<Item = T> + Send + 'static {
    futures_util::stream::unfold(rx, |mut rx| async move {
        recv_next(&mut rx).await.map(|event| (event, rx))
    })
}
