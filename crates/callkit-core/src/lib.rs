//! Call session core.
//!
//! Turns a callback-driven RTC engine into a deterministic call-session
//! state machine and issues the short-lived credentials needed to join.
//! Pure Rust, no platform dependencies: native shells provide the engine.

pub mod credentials;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod participants;
pub mod session;
pub mod settings;
pub mod timer;

pub use credentials::{CredentialConfig, CredentialIssuer, CredentialPolicy, JoinCredential, Role};
pub use engine::{AlwaysGranted, EngineEvent, MediaPermissions, RtcEngine};
pub use errors::{CallError, CredentialError, EngineError, TransportError};
pub use events::{CallEvent, CallEventListener, EventBus, ParticipantEvent};
pub use session::{CallSession, CallSessionController, CallState, JoinOptions};
pub use settings::{CallSettings, SettingsStore};
