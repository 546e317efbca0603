//! The RTC engine provider seam.
//!
//! Each platform supplies one [`RtcEngine`] implementation, chosen when the
//! controller is constructed. Engine callbacks are delivered as
//! [`EngineEvent`] messages over an unbounded FIFO channel, so the order in
//! which the engine reports callbacks is the order the controller handles
//! them and the order the resulting events are emitted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::credentials::Role;
use crate::errors::{EngineError, TransportError};
use crate::events::{ConnectionChangeReason, ConnectionState};

/// Sending half handed to the engine in [`RtcEngine::register_callbacks`].
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Agora-compatible engine error codes the controller classifies.
pub mod codes {
    pub const JOIN_CHANNEL_REJECTED: i32 = 17;
    pub const TOKEN_EXPIRED: i32 = 109;
    pub const INVALID_TOKEN: i32 = 110;
    pub const CONNECTION_INTERRUPTED: i32 = 111;
    pub const CONNECTION_LOST: i32 = 112;
}

/// Engine channel profile, fixed when the engine is initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelProfile {
    #[default]
    Communication,
    LiveBroadcasting,
}

/// Options passed along with a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMediaOptions {
    pub role: Role,
    pub publish_audio: bool,
    pub publish_video: bool,
    pub auto_subscribe: bool,
}

impl ChannelMediaOptions {
    pub fn for_role(role: Role) -> Self {
        let publish = role == Role::Publisher;
        Self {
            role,
            publish_audio: publish,
            publish_video: publish,
            auto_subscribe: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    Quit,
    Dropped,
    BecameAudience,
}

/// A callback reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    JoinSuccess { channel: String, uid: u32 },
    Leave,
    ParticipantJoined { uid: u32 },
    ParticipantOffline { uid: u32, reason: OfflineReason },
    Error { code: i32, message: String },
    ConnectionStateChanged { state: ConnectionState, reason: ConnectionChangeReason },
}

/// The narrow surface the controller consumes from a platform RTC engine.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    fn initialize(&self, app_id: &str, profile: ChannelProfile) -> Result<(), EngineError>;

    fn enable_video(&self) -> Result<(), EngineError>;

    /// Route all subsequent callbacks into `events`, in arrival order.
    fn register_callbacks(&self, events: EngineEventSender);

    /// Start joining. Returning `Ok` only means the request was accepted;
    /// success is reported later as [`EngineEvent::JoinSuccess`].
    async fn join_channel(
        &self,
        credential: &str,
        channel: &str,
        participant_hint: u32,
        options: &ChannelMediaOptions,
    ) -> Result<(), EngineError>;

    async fn leave_channel(&self) -> Result<(), EngineError>;

    fn mute_local_audio(&self, muted: bool) -> Result<(), EngineError>;

    fn mute_local_video(&self, muted: bool) -> Result<(), EngineError>;

    fn set_speakerphone(&self, enabled: bool) -> Result<(), EngineError>;

    fn switch_camera(&self) -> Result<(), EngineError>;

    /// Release the native engine handle. Must be safe to call repeatedly.
    async fn release(&self);
}

/// Runtime camera/microphone permission prompt, provided by the host OS shell.
#[async_trait]
pub trait MediaPermissions: Send + Sync {
    async fn request_media_permissions(&self) -> bool;
}

/// For hosts without runtime media permissions (desktop, tests).
pub struct AlwaysGranted;

#[async_trait]
impl MediaPermissions for AlwaysGranted {
    async fn request_media_permissions(&self) -> bool {
        true
    }
}

/// Map an engine error callback onto the transport error taxonomy.
pub fn classify_error(code: i32, message: &str) -> TransportError {
    match code {
        codes::INVALID_TOKEN => TransportError::InvalidCredential,
        codes::TOKEN_EXPIRED => TransportError::CredentialExpired,
        codes::JOIN_CHANNEL_REJECTED | codes::CONNECTION_INTERRUPTED | codes::CONNECTION_LOST => {
            TransportError::ConnectionFailed(message.to_string())
        }
        _ => TransportError::Unknown {
            code,
            message: message.to_string(),
        },
    }
}

/// Map a `Failed` connection state onto the transport error taxonomy.
pub fn classify_connection_failure(reason: ConnectionChangeReason) -> TransportError {
    match reason {
        ConnectionChangeReason::InvalidToken => TransportError::InvalidCredential,
        ConnectionChangeReason::TokenExpired => TransportError::CredentialExpired,
        other => TransportError::ConnectionFailed(format!("connection failed: {other:?}")),
    }
}
