use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::credentials::{CredentialIssuer, Role};
use crate::engine::{
    ChannelMediaOptions, EngineEvent, EngineEventReceiver, MediaPermissions,
    RtcEngine, classify_connection_failure, classify_error,
};
use crate::errors::{CallError, EngineError, TransportError};
use crate::events::{CallEvent, ConnectionState, EventBus, ParticipantEvent};
use crate::participants::ParticipantRoster;
use crate::settings::CallSettings;
use crate::timer::{CallTimer, format_duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Uninitialized,
    Initializing,
    Ready,
    Joining,
    Joined,
    Leaving,
    Left,
    Error,
}

/// Read-only snapshot of the current call session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub channel: Option<String>,
    pub local_participant_id: Option<u32>,
    pub state: CallState,
    pub muted: bool,
    pub video_enabled: bool,
    pub speaker_enabled: bool,
    pub front_camera: bool,
    pub remote_participants: HashSet<u32>,
    pub duration_secs: u64,
}

impl CallSession {
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_secs)
    }
}

/// Parameters of a single join.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Use this credential instead of asking the issuer.
    pub credential: Option<String>,
    pub role: Role,
    /// Credential lifetime; the configured default when `None`.
    pub ttl: Option<Duration>,
    /// Requested participant id; 0 lets the engine assign one.
    pub participant_hint: u32,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            credential: None,
            role: Role::Publisher,
            ttl: None,
            participant_hint: 0,
        }
    }
}

impl JoinOptions {
    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self {
            credential: Some(credential.into()),
            ..Default::default()
        }
    }
}

struct SessionInner {
    state: CallState,
    channel: Option<String>,
    roster: ParticipantRoster,
    muted: bool,
    video_enabled: bool,
    speaker_enabled: bool,
    front_camera: bool,
    timer: CallTimer,
    engine_ready: bool,
    disposed: bool,
    pending_join: Option<oneshot::Sender<Result<(), TransportError>>>,
    event_loop: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn new(settings: &CallSettings) -> Self {
        Self {
            state: CallState::Uninitialized,
            channel: None,
            roster: ParticipantRoster::new(),
            muted: !settings.mic_enabled_on_join,
            video_enabled: settings.camera_enabled_on_join,
            speaker_enabled: settings.speaker_enabled_on_join,
            front_camera: true,
            timer: CallTimer::new(),
            engine_ready: false,
            disposed: false,
            pending_join: None,
            event_loop: None,
        }
    }

    fn in_call(&self) -> bool {
        matches!(self.state, CallState::Joining | CallState::Joined)
    }

    /// Drop all per-call state: timer, participants, channel.
    fn end_call(&mut self) {
        self.timer.stop();
        self.roster.clear();
        self.channel = None;
    }

    fn snapshot(&self) -> CallSession {
        CallSession {
            channel: self.channel.clone(),
            local_participant_id: self.roster.local_id(),
            state: self.state,
            muted: self.muted,
            video_enabled: self.video_enabled,
            speaker_enabled: self.speaker_enabled,
            front_camera: self.front_camera,
            remote_participants: self.roster.remote_ids().clone(),
            duration_secs: self.timer.elapsed_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MediaToggle {
    Mute,
    Video,
    Speaker,
    Camera,
}

impl MediaToggle {
    fn name(self) -> &'static str {
        match self {
            Self::Mute => "toggle_mute",
            Self::Video => "toggle_video",
            Self::Speaker => "toggle_speaker",
            Self::Camera => "switch_camera",
        }
    }

    fn flag(self, s: &mut SessionInner) -> &mut bool {
        match self {
            Self::Mute => &mut s.muted,
            Self::Video => &mut s.video_enabled,
            Self::Speaker => &mut s.speaker_enabled,
            Self::Camera => &mut s.front_camera,
        }
    }

    fn apply(self, engine: &dyn RtcEngine, target: bool) -> Result<(), EngineError> {
        match self {
            Self::Mute => engine.mute_local_audio(target),
            Self::Video => engine.mute_local_video(!target),
            Self::Speaker => engine.set_speakerphone(target),
            Self::Camera => engine.switch_camera(),
        }
    }

    fn event(self, value: bool) -> CallEvent {
        match self {
            Self::Mute => CallEvent::AudioStateChanged(value),
            Self::Video => CallEvent::VideoStateChanged(value),
            Self::Speaker => CallEvent::SpeakerStateChanged(value),
            Self::Camera => CallEvent::CameraSwitched(value),
        }
    }
}

/// Marks a join as in flight for as long as it is held.
struct JoinSlot<'a>(&'a AtomicBool);

impl<'a> JoinSlot<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for JoinSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    engine: Arc<dyn RtcEngine>,
    permissions: Arc<dyn MediaPermissions>,
    issuer: CredentialIssuer,
    settings: CallSettings,
    bus: EventBus,
    session: Mutex<SessionInner>,
    join_in_flight: AtomicBool,
}

/// Drives one call session on top of an [`RtcEngine`].
///
/// Public commands and engine callbacks both mutate the session under a
/// single lock, so mutations are never interleaved. Engine callbacks are
/// handled by a background event loop in the order the engine reported them.
#[derive(Clone)]
pub struct CallSessionController {
    shared: Arc<Shared>,
}

impl CallSessionController {
    pub fn new(
        engine: Arc<dyn RtcEngine>,
        permissions: Arc<dyn MediaPermissions>,
        settings: CallSettings,
    ) -> Self {
        let issuer = CredentialIssuer::new(settings.credential_config());
        Self::with_issuer(engine, permissions, settings, issuer)
    }

    pub fn with_issuer(
        engine: Arc<dyn RtcEngine>,
        permissions: Arc<dyn MediaPermissions>,
        settings: CallSettings,
        issuer: CredentialIssuer,
    ) -> Self {
        let session = SessionInner::new(&settings);
        Self {
            shared: Arc::new(Shared {
                engine,
                permissions,
                issuer,
                settings,
                bus: EventBus::new(),
                session: Mutex::new(session),
                join_in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// The two event streams published by this controller.
    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.bus.subscribe_calls()
    }

    pub fn subscribe_participants(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.shared.bus.subscribe_participants()
    }

    pub async fn session(&self) -> CallSession {
        self.shared.session.lock().await.snapshot()
    }

    pub async fn state(&self) -> CallState {
        self.shared.session.lock().await.state
    }

    pub async fn remote_participants(&self) -> HashSet<u32> {
        self.shared.session.lock().await.roster.remote_ids().clone()
    }

    pub async fn duration_secs(&self) -> u64 {
        self.shared.session.lock().await.timer.elapsed_secs()
    }

    /// Call duration as `mm:ss`.
    pub async fn formatted_duration(&self) -> String {
        format_duration(self.duration_secs().await)
    }

    /// Prepare the engine. Calling again after success is a no-op.
    pub async fn initialize(&self) -> Result<(), CallError> {
        let shared = &self.shared;
        let mut s = shared.session.lock().await;
        if s.disposed {
            return Err(CallError::Disposed);
        }
        if s.engine_ready {
            tracing::debug!("initialize: engine already initialized");
            return Ok(());
        }

        let Some(app_id) = shared.settings.app_id.clone().filter(|id| !id.is_empty()) else {
            let err = CallError::Configuration("app id is not configured".into());
            shared.report(&err);
            return Err(err);
        };

        s.state = CallState::Initializing;

        if !shared.permissions.request_media_permissions().await {
            s.state = CallState::Uninitialized;
            let err = CallError::PermissionDenied;
            shared.report(&err);
            return Err(err);
        }

        if let Err(e) = shared
            .engine
            .initialize(&app_id, shared.settings.channel_profile)
        {
            s.state = CallState::Error;
            let err = CallError::Engine(e);
            shared.report(&err);
            return Err(err);
        }
        if let Err(e) = shared.engine.enable_video() {
            // The native handle exists at this point and must not outlive the failure.
            shared.engine.release().await;
            s.state = CallState::Error;
            let err = CallError::Engine(e);
            shared.report(&err);
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        shared.engine.register_callbacks(tx);
        s.event_loop = Some(tokio::spawn(run_event_loop(Arc::downgrade(shared), rx)));

        log_engine_failure(shared.engine.mute_local_audio(s.muted));
        log_engine_failure(shared.engine.mute_local_video(!s.video_enabled));
        log_engine_failure(shared.engine.set_speakerphone(s.speaker_enabled));

        s.engine_ready = true;
        s.state = CallState::Ready;
        tracing::info!("engine initialized");
        shared.bus.emit_call(CallEvent::Initialized);
        Ok(())
    }

    /// Join `channel`, leaving the current channel first if already joined.
    ///
    /// Resolves only once the engine confirms the join, reports an error,
    /// or the join timeout elapses. A second join while one is in flight
    /// fails with [`CallError::Busy`].
    pub async fn join_channel(&self, channel: &str, options: JoinOptions) -> Result<(), CallError> {
        let shared = &self.shared;
        let Some(_slot) = JoinSlot::acquire(&shared.join_in_flight) else {
            tracing::warn!(channel, "join rejected: another join is in flight");
            return Err(CallError::Busy);
        };

        let was_joined = {
            let s = shared.session.lock().await;
            if s.disposed {
                return Err(CallError::Disposed);
            }
            if !s.engine_ready {
                let err = CallError::NotInitialized;
                shared.report(&err);
                return Err(err);
            }
            s.state == CallState::Joined
        };
        if was_joined {
            tracing::info!(channel, "already joined, leaving current channel first");
            shared.leave().await;
        }

        {
            let mut s = shared.session.lock().await;
            if s.disposed {
                return Err(CallError::Disposed);
            }
            s.state = CallState::Joining;
            s.channel = Some(channel.to_string());
        }

        let role = options.role;
        let credential = match options.credential {
            Some(value) => value,
            None => {
                let ttl = options.ttl.unwrap_or_else(|| shared.settings.credential_ttl());
                match shared
                    .issuer
                    .issue_credential(channel, options.participant_hint, role, ttl)
                    .await
                {
                    Ok(credential) => credential.value,
                    Err(e) => {
                        let err = CallError::Credential(e);
                        let mut s = shared.session.lock().await;
                        if s.state == CallState::Joining {
                            shared.abort_join(&mut s, CallState::Ready, &err);
                        }
                        return Err(err);
                    }
                }
            }
        };

        let rx = {
            let mut s = shared.session.lock().await;
            if s.disposed {
                return Err(CallError::Disposed);
            }
            if s.state != CallState::Joining {
                return Err(TransportError::ConnectionFailed("join abandoned".into()).into());
            }
            let (tx, rx) = oneshot::channel();
            s.pending_join = Some(tx);
            rx
        };

        // One deadline covers both the engine call and its confirmation. The
        // session lock is not held across either, so leave, dispose and engine
        // callbacks proceed while the engine is busy.
        let deadline = Instant::now() + shared.settings.join_timeout();
        tracing::info!(channel, ?role, "joining channel");
        let media = ChannelMediaOptions::for_role(role);
        let accepted = tokio::time::timeout_at(
            deadline,
            shared
                .engine
                .join_channel(&credential, channel, options.participant_hint, &media),
        )
        .await;

        match accepted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = CallError::Engine(e);
                let mut s = shared.session.lock().await;
                if s.disposed {
                    return Err(CallError::Disposed);
                }
                if s.state == CallState::Joining {
                    shared.abort_join(&mut s, CallState::Error, &err);
                }
                return Err(err);
            }
            Err(_) => return shared.expire_join().await,
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(transport))) => Err(transport.into()),
            Ok(Err(_)) => Err(CallError::Disposed),
            Err(_) => shared.expire_join().await,
        }
    }

    /// Leave the current channel. Safe from any state; never fails.
    pub async fn leave_channel(&self) {
        self.shared.leave().await;
    }

    /// Flip the local microphone mute. Returns the resulting muted flag.
    pub async fn toggle_mute(&self) -> bool {
        self.toggle(MediaToggle::Mute).await
    }

    /// Flip the local camera. Returns the resulting video-enabled flag.
    pub async fn toggle_video(&self) -> bool {
        self.toggle(MediaToggle::Video).await
    }

    /// Flip speakerphone output. Returns the resulting speaker flag.
    pub async fn toggle_speaker(&self) -> bool {
        self.toggle(MediaToggle::Speaker).await
    }

    /// Swap front/back camera. Returns whether the front camera is now active.
    pub async fn switch_camera(&self) -> bool {
        self.toggle(MediaToggle::Camera).await
    }

    async fn toggle(&self, toggle: MediaToggle) -> bool {
        let mut s = self.shared.session.lock().await;
        let current = *toggle.flag(&mut s);
        if !s.engine_ready || s.disposed {
            tracing::info!("{}: engine unavailable, ignoring", toggle.name());
            return current;
        }

        let target = !current;
        match toggle.apply(self.shared.engine.as_ref(), target) {
            Ok(()) => {
                *toggle.flag(&mut s) = target;
                tracing::info!("{}: {target}", toggle.name());
                self.shared.bus.emit_call(toggle.event(target));
                target
            }
            Err(e) => {
                tracing::warn!("{} failed: {e}", toggle.name());
                current
            }
        }
    }

    /// Tear everything down: timer, engine channel and handle, event streams.
    ///
    /// Runs on its own task so it completes even if the caller is cancelled.
    /// An in-flight join resolves with [`CallError::Disposed`].
    pub async fn dispose(&self) {
        let shared = self.shared.clone();
        if let Err(e) = tokio::spawn(async move { shared.teardown().await }).await {
            tracing::error!("dispose task failed: {e}");
        }
    }
}

impl Shared {
    /// Publish a command failure on the lifecycle stream.
    fn report(&self, err: &CallError) {
        tracing::warn!("{err}");
        self.bus.emit_call(CallEvent::Error(err.to_string()));
    }

    fn abort_join(&self, s: &mut SessionInner, next: CallState, err: &CallError) {
        s.pending_join = None;
        s.end_call();
        s.state = next;
        self.report(err);
    }

    /// The join deadline passed: give up on the engine join unless it was confirmed meanwhile.
    async fn expire_join(&self) -> Result<(), CallError> {
        let mut s = self.session.lock().await;
        if s.disposed {
            return Err(CallError::Disposed);
        }
        match s.state {
            CallState::Joined => return Ok(()),
            CallState::Joining if s.pending_join.is_some() => {}
            _ => return Err(CallError::JoinTimeout),
        }
        let err = CallError::JoinTimeout;
        self.abort_join(&mut s, CallState::Ready, &err);
        drop(s);

        log_engine_failure(self.engine.leave_channel().await);
        Err(err)
    }

    async fn leave(&self) {
        let mut s = self.session.lock().await;
        if s.disposed {
            return;
        }
        let previous = s.state;
        s.state = CallState::Leaving;
        s.end_call();
        if let Some(pending) = s.pending_join.take() {
            let _ = pending.send(Err(TransportError::ConnectionFailed(
                "left before the join was confirmed".into(),
            )));
        }
        if s.engine_ready {
            log_engine_failure(self.engine.leave_channel().await);
        }
        s.state = CallState::Left;
        tracing::info!(?previous, "left channel");
        self.bus.emit_call(CallEvent::Left);
    }

    /// Transport failure while joining or joined: back to `Ready`, rejoin is manual.
    async fn fail_transport(&self, s: &mut SessionInner, err: TransportError) {
        s.end_call();
        s.state = CallState::Ready;
        tracing::warn!("transport failure: {err}");
        self.bus.emit_call(CallEvent::Error(err.to_string()));
        if let Some(pending) = s.pending_join.take() {
            let _ = pending.send(Err(err));
        }
        log_engine_failure(self.engine.leave_channel().await);
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        let mut s = self.session.lock().await;
        if s.disposed {
            return;
        }
        match event {
            EngineEvent::JoinSuccess { channel, uid } => {
                if s.state != CallState::Joining {
                    tracing::debug!(%channel, uid, state = ?s.state, "ignoring late join confirmation");
                    return;
                }
                s.roster.set_local_id(uid);
                s.channel = Some(channel.clone());
                s.timer.start();
                s.state = CallState::Joined;
                tracing::info!(%channel, uid, "joined channel");
                self.bus.emit_call(CallEvent::Joined(channel));
                if let Some(pending) = s.pending_join.take() {
                    let _ = pending.send(Ok(()));
                }
            }

            EngineEvent::Leave => {
                if s.state == CallState::Joined {
                    tracing::info!("engine left the channel");
                    s.end_call();
                    s.state = CallState::Left;
                    self.bus.emit_call(CallEvent::Left);
                } else {
                    tracing::debug!(state = ?s.state, "leave confirmed");
                }
            }

            EngineEvent::ParticipantJoined { uid } => {
                if !s.in_call() {
                    tracing::debug!(uid, "participant joined outside a call, ignoring");
                    return;
                }
                if !s.roster.add_remote(uid) {
                    tracing::debug!(uid, "participant already present");
                }
                self.bus.emit_participant(ParticipantEvent::Joined(uid));
            }

            EngineEvent::ParticipantOffline { uid, reason } => {
                if !s.in_call() {
                    tracing::debug!(uid, "participant offline outside a call, ignoring");
                    return;
                }
                tracing::info!(uid, ?reason, "participant offline");
                s.roster.remove_remote(uid);
                self.bus.emit_participant(ParticipantEvent::Left(uid));
            }

            EngineEvent::Error { code, message } => {
                let err = classify_error(code, &message);
                if s.in_call() {
                    self.fail_transport(&mut s, err).await;
                } else {
                    tracing::warn!(code, "engine error outside a call: {message}");
                    self.bus.emit_call(CallEvent::Error(err.to_string()));
                }
            }

            EngineEvent::ConnectionStateChanged { state, reason } => {
                tracing::debug!(?state, ?reason, "connection state changed");
                self.bus
                    .emit_call(CallEvent::ConnectionStateChanged(state, reason));
                if state == ConnectionState::Failed && s.in_call() {
                    self.fail_transport(&mut s, classify_connection_failure(reason))
                        .await;
                }
            }
        }
    }

    async fn teardown(&self) {
        let mut s = self.session.lock().await;
        if s.disposed {
            return;
        }
        s.disposed = true;
        let was_in_call = s.in_call();
        s.end_call();
        // Dropping the sender resolves an in-flight join with `Disposed`.
        s.pending_join = None;
        if s.engine_ready {
            if was_in_call {
                log_engine_failure(self.engine.leave_channel().await);
            }
            self.engine.release().await;
            s.engine_ready = false;
        }
        if let Some(handle) = s.event_loop.take() {
            handle.abort();
        }
        s.state = CallState::Uninitialized;
        if was_in_call {
            self.bus.emit_call(CallEvent::Left);
        }
        drop(s);

        self.bus.close();
        tracing::info!("call session disposed");
    }
}

async fn run_event_loop(shared: Weak<Shared>, mut events: EngineEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_engine_event(event).await;
    }
    tracing::info!("engine event loop ended");
}

fn log_engine_failure(result: Result<(), EngineError>) {
    if let Err(e) = result {
        tracing::warn!("{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{Denied, FakeEngine};
    use crate::engine::{AlwaysGranted, ChannelProfile, OfflineReason, codes};
    use crate::errors::CredentialError;
    use crate::events::ConnectionChangeReason;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> CallSettings {
        CallSettings {
            app_id: Some("app".into()),
            ..Default::default()
        }
    }

    fn controller_with(engine: Arc<FakeEngine>, settings: CallSettings) -> CallSessionController {
        CallSessionController::new(engine, Arc::new(AlwaysGranted), settings)
    }

    async fn ready(engine: Arc<FakeEngine>) -> CallSessionController {
        let controller = controller_with(engine, settings());
        controller.initialize().await.unwrap();
        controller
    }

    async fn joined(engine: Arc<FakeEngine>, channel: &str) -> CallSessionController {
        let controller = ready(engine).await;
        controller
            .join_channel(channel, JoinOptions::default())
            .await
            .unwrap();
        controller
    }

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn wait_for_state(controller: &CallSessionController, state: CallState) {
        for _ in 0..100 {
            if controller.state().await == state {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("state never became {state:?}, is {:?}", controller.state().await);
    }

    async fn wait_for_join_call(engine: &FakeEngine) {
        for _ in 0..100 {
            if engine.count("join:") > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("engine join was never called");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(engine.clone(), settings());
        let mut calls = controller.subscribe_calls();

        controller.initialize().await.unwrap();
        controller.initialize().await.unwrap();

        assert_eq!(controller.state().await, CallState::Ready);
        assert_eq!(engine.count("initialize"), 1);
        assert_eq!(engine.count("enable_video"), 1);
        assert_eq!(next(&mut calls).await, CallEvent::Initialized);
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn initialize_applies_media_defaults() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(
            engine.clone(),
            CallSettings {
                mic_enabled_on_join: false,
                ..settings()
            },
        );
        controller.initialize().await.unwrap();

        let session = controller.session().await;
        assert!(session.muted);
        assert!(session.video_enabled);
        assert!(engine.commands().contains(&"mute_audio:true".to_string()));
        assert!(engine.commands().contains(&"mute_video:false".to_string()));
    }

    #[tokio::test]
    async fn initialize_without_app_id_is_configuration_error() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(engine.clone(), CallSettings::default());
        let mut calls = controller.subscribe_calls();

        let result = controller.initialize().await;

        assert!(matches!(result, Err(CallError::Configuration(_))));
        assert_eq!(controller.state().await, CallState::Uninitialized);
        assert!(matches!(next(&mut calls).await, CallEvent::Error(_)));
        assert_eq!(engine.count("initialize"), 0);
    }

    #[tokio::test]
    async fn permission_denied_stays_uninitialized() {
        let engine = Arc::new(FakeEngine::new());
        let controller = CallSessionController::new(engine.clone(), Arc::new(Denied), settings());
        let mut calls = controller.subscribe_calls();

        let result = controller.initialize().await;

        assert_eq!(result, Err(CallError::PermissionDenied));
        assert_eq!(controller.state().await, CallState::Uninitialized);
        assert!(matches!(next(&mut calls).await, CallEvent::Error(_)));
        assert_eq!(engine.count("initialize"), 0);
    }

    #[tokio::test]
    async fn engine_init_failure_is_recoverable_by_reinitializing() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_initialize.store(true, Ordering::SeqCst);
        let controller = controller_with(engine.clone(), settings());

        assert!(matches!(controller.initialize().await, Err(CallError::Engine(_))));
        assert_eq!(controller.state().await, CallState::Error);

        engine.fail_initialize.store(false, Ordering::SeqCst);
        controller.initialize().await.unwrap();
        assert_eq!(controller.state().await, CallState::Ready);
    }

    #[tokio::test]
    async fn video_setup_failure_releases_engine_handle() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_enable_video.store(true, Ordering::SeqCst);
        let controller = controller_with(engine.clone(), settings());

        assert!(matches!(controller.initialize().await, Err(CallError::Engine(_))));
        assert_eq!(controller.state().await, CallState::Error);
        assert_eq!(engine.count("initialize"), 1);
        assert_eq!(engine.count("release"), 1);

        controller.dispose().await;
        assert_eq!(engine.count("release"), 1);

        // a later attempt starts from a fresh handle
        let engine = Arc::new(FakeEngine::new());
        engine.fail_enable_video.store(true, Ordering::SeqCst);
        let controller = controller_with(engine.clone(), settings());
        assert!(controller.initialize().await.is_err());
        engine.fail_enable_video.store(false, Ordering::SeqCst);
        controller.initialize().await.unwrap();
        assert_eq!(engine.count("initialize"), 2);
        assert_eq!(controller.state().await, CallState::Ready);
    }

    #[tokio::test]
    async fn initialize_uses_configured_channel_profile() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(
            engine.clone(),
            CallSettings {
                channel_profile: ChannelProfile::LiveBroadcasting,
                ..settings()
            },
        );
        controller.initialize().await.unwrap();
        assert!(engine
            .commands()
            .contains(&"initialize:app:LiveBroadcasting".to_string()));
    }

    #[tokio::test]
    async fn join_before_initialize_is_rejected() {
        let controller = controller_with(Arc::new(FakeEngine::new()), settings());
        let result = controller.join_channel("room", JoinOptions::default()).await;
        assert_eq!(result, Err(CallError::NotInitialized));
    }

    #[tokio::test]
    async fn confirmed_join_resolves_session() {
        let engine = Arc::new(FakeEngine::new());
        let controller = ready(engine.clone()).await;
        let mut calls = controller.subscribe_calls();

        controller
            .join_channel("room", JoinOptions::default())
            .await
            .unwrap();

        let session = controller.session().await;
        assert_eq!(session.state, CallState::Joined);
        assert_eq!(session.channel.as_deref(), Some("room"));
        assert_eq!(session.local_participant_id, Some(1000));
        assert_eq!(session.duration_secs, 0);
        assert_eq!(next(&mut calls).await, CallEvent::Joined("room".into()));
    }

    #[tokio::test]
    async fn join_waits_for_engine_confirmation() {
        let engine = Arc::new(FakeEngine::manual());
        let controller = ready(engine.clone()).await;

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.join_channel("room", JoinOptions::default()).await })
        };
        wait_for_join_call(&engine).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // the engine accepted the join but has not confirmed it
        assert_eq!(controller.state().await, CallState::Joining);
        assert!(!pending.is_finished());

        engine.emit(EngineEvent::JoinSuccess {
            channel: "room".into(),
            uid: 55,
        });

        pending.await.unwrap().unwrap();
        let session = controller.session().await;
        assert_eq!(session.state, CallState::Joined);
        assert_eq!(session.local_participant_id, Some(55));
    }

    #[tokio::test]
    async fn concurrent_join_is_busy() {
        let engine = Arc::new(FakeEngine::manual());
        let controller = ready(engine.clone()).await;

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.join_channel("room", JoinOptions::default()).await })
        };
        wait_for_join_call(&engine).await;

        let second = controller.join_channel("other", JoinOptions::default()).await;
        assert_eq!(second, Err(CallError::Busy));
        assert_eq!(engine.count("join:"), 1);

        engine.emit(EngineEvent::JoinSuccess {
            channel: "room".into(),
            uid: 1,
        });
        first.await.unwrap().unwrap();
        assert_eq!(controller.session().await.channel.as_deref(), Some("room"));
    }

    #[tokio::test]
    async fn join_while_joined_leaves_first() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "a").await;
        let mut calls = controller.subscribe_calls();

        controller
            .join_channel("b", JoinOptions::default())
            .await
            .unwrap();

        assert_eq!(next(&mut calls).await, CallEvent::Left);
        assert_eq!(next(&mut calls).await, CallEvent::Joined("b".into()));

        let commands = engine.commands();
        let leave = commands.iter().position(|c| c == "leave").unwrap();
        let join_b = commands.iter().position(|c| c.starts_with("join:b:")).unwrap();
        assert!(leave < join_b);
        assert_eq!(controller.session().await.channel.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn token_less_join_passes_empty_credential() {
        let engine = Arc::new(FakeEngine::new());
        joined(engine.clone(), "room").await;
        assert!(engine.commands().contains(&"join:room:".to_string()));
    }

    #[tokio::test]
    async fn client_signed_join_passes_signed_credential() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(
            engine.clone(),
            CallSettings {
                signing_key: Some("key".into()),
                ..settings()
            },
        );
        controller.initialize().await.unwrap();
        controller
            .join_channel("room", JoinOptions::default())
            .await
            .unwrap();

        let join = engine
            .commands()
            .into_iter()
            .find(|c| c.starts_with("join:room:"))
            .unwrap();
        assert!(join.len() > "join:room:".len());
    }

    #[tokio::test]
    async fn supplied_credential_is_used_verbatim() {
        let engine = Arc::new(FakeEngine::new());
        let controller = ready(engine.clone()).await;
        controller
            .join_channel("room", JoinOptions::with_credential("my-token"))
            .await
            .unwrap();
        assert!(engine.commands().contains(&"join:room:my-token".to_string()));
    }

    #[tokio::test]
    async fn backend_failure_aborts_join_and_returns_to_ready() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(
            engine.clone(),
            CallSettings {
                token_server_url: Some(mock_server.uri()),
                ..settings()
            },
        );
        controller.initialize().await.unwrap();
        let mut calls = controller.subscribe_calls();

        let result = controller.join_channel("room", JoinOptions::default()).await;

        assert!(matches!(
            result,
            Err(CallError::Credential(CredentialError::ServerRejected(_)))
        ));
        assert_eq!(controller.state().await, CallState::Ready);
        assert_eq!(engine.count("join:"), 0);
        assert!(matches!(next(&mut calls).await, CallEvent::Error(_)));
    }

    #[tokio::test]
    async fn engine_rejecting_join_call_sets_error_state() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_join.store(true, Ordering::SeqCst);
        let controller = ready(engine.clone()).await;

        let result = controller.join_channel("room", JoinOptions::default()).await;
        assert!(matches!(result, Err(CallError::Engine(_))));
        assert_eq!(controller.state().await, CallState::Error);

        engine.fail_join.store(false, Ordering::SeqCst);
        controller
            .join_channel("room", JoinOptions::default())
            .await
            .unwrap();
        assert_eq!(controller.state().await, CallState::Joined);
    }

    #[tokio::test]
    async fn participant_set_tracks_joins_and_leaves() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut participants = controller.subscribe_participants();

        for uid in 1..=6 {
            engine.emit(EngineEvent::ParticipantJoined { uid });
            if uid % 3 == 0 {
                engine.emit(EngineEvent::ParticipantOffline {
                    uid: uid - 1,
                    reason: OfflineReason::Quit,
                });
            }
        }
        engine.emit(EngineEvent::ParticipantOffline {
            uid: 6,
            reason: OfflineReason::Dropped,
        });

        let mut received = Vec::new();
        for _ in 0..9 {
            received.push(next(&mut participants).await);
        }
        assert_eq!(received[0], ParticipantEvent::Joined(1));
        assert_eq!(received[3], ParticipantEvent::Left(2));
        assert_eq!(received[8], ParticipantEvent::Left(6));

        let mut ids: Vec<_> = controller.remote_participants().await.into_iter().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn duplicate_participant_joined_keeps_one_entry() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut participants = controller.subscribe_participants();

        engine.emit(EngineEvent::ParticipantJoined { uid: 7 });
        engine.emit(EngineEvent::ParticipantJoined { uid: 7 });

        assert_eq!(next(&mut participants).await, ParticipantEvent::Joined(7));
        assert_eq!(next(&mut participants).await, ParticipantEvent::Joined(7));
        assert_eq!(controller.remote_participants().await, HashSet::from([7]));
    }

    #[tokio::test]
    async fn offline_for_unknown_participant_is_harmless() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut participants = controller.subscribe_participants();

        engine.emit(EngineEvent::ParticipantOffline {
            uid: 99,
            reason: OfflineReason::Quit,
        });

        assert_eq!(next(&mut participants).await, ParticipantEvent::Left(99));
        assert!(controller.remote_participants().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_credential_while_joined_returns_to_ready() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        engine.emit(EngineEvent::ParticipantJoined { uid: 3 });
        let mut calls = controller.subscribe_calls();

        engine.emit(EngineEvent::Error {
            code: codes::INVALID_TOKEN,
            message: "invalid token".into(),
        });

        assert_eq!(
            next(&mut calls).await,
            CallEvent::Error(TransportError::InvalidCredential.to_string())
        );
        let session = controller.session().await;
        assert_eq!(session.state, CallState::Ready);
        assert!(session.remote_participants.is_empty());
        assert_eq!(engine.count("leave"), 1);

        // manual rejoin is allowed
        controller
            .join_channel("room", JoinOptions::default())
            .await
            .unwrap();
        assert_eq!(controller.state().await, CallState::Joined);
    }

    #[tokio::test]
    async fn error_while_joining_fails_the_join() {
        let engine = Arc::new(FakeEngine::manual());
        let controller = ready(engine.clone()).await;

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.join_channel("room", JoinOptions::default()).await })
        };
        wait_for_join_call(&engine).await;
        engine.emit(EngineEvent::Error {
            code: codes::TOKEN_EXPIRED,
            message: "expired".into(),
        });

        let result = pending.await.unwrap();
        assert_eq!(result, Err(CallError::Transport(TransportError::CredentialExpired)));
        assert_eq!(controller.state().await, CallState::Ready);
    }

    #[tokio::test]
    async fn unknown_error_code_keeps_raw_message() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut calls = controller.subscribe_calls();

        engine.emit(EngineEvent::Error {
            code: 4242,
            message: "weird failure".into(),
        });

        match next(&mut calls).await {
            CallEvent::Error(message) => assert!(message.contains("weird failure")),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(controller.state().await, CallState::Ready);
    }

    #[tokio::test]
    async fn failed_connection_state_is_a_transport_failure() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut calls = controller.subscribe_calls();

        engine.emit(EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Failed,
            reason: ConnectionChangeReason::TokenExpired,
        });

        assert_eq!(
            next(&mut calls).await,
            CallEvent::ConnectionStateChanged(ConnectionState::Failed, ConnectionChangeReason::TokenExpired)
        );
        assert_eq!(
            next(&mut calls).await,
            CallEvent::Error(TransportError::CredentialExpired.to_string())
        );
        assert_eq!(controller.state().await, CallState::Ready);
    }

    #[tokio::test]
    async fn engine_initiated_leave_ends_the_call() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut calls = controller.subscribe_calls();

        engine.emit(EngineEvent::Leave);

        assert_eq!(next(&mut calls).await, CallEvent::Left);
        assert_eq!(controller.state().await, CallState::Left);
    }

    #[tokio::test]
    async fn leave_without_join_is_safe() {
        let controller = controller_with(Arc::new(FakeEngine::new()), settings());
        let mut calls = controller.subscribe_calls();

        controller.leave_channel().await;

        let session = controller.session().await;
        assert_eq!(session.state, CallState::Left);
        assert!(session.remote_participants.is_empty());
        assert_eq!(next(&mut calls).await, CallEvent::Left);
    }

    #[tokio::test]
    async fn leave_during_join_fails_the_join() {
        let engine = Arc::new(FakeEngine::manual());
        let controller = ready(engine.clone()).await;

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.join_channel("room", JoinOptions::default()).await })
        };
        wait_for_join_call(&engine).await;
        controller.leave_channel().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(CallError::Transport(TransportError::ConnectionFailed(_)))
        ));
        assert_eq!(controller.state().await, CallState::Left);

        // a late confirmation must not resurrect the call
        engine.emit(EngineEvent::JoinSuccess {
            channel: "room".into(),
            uid: 1,
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.state().await, CallState::Left);
    }

    #[tokio::test]
    async fn toggles_flip_flags_and_emit() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        let mut calls = controller.subscribe_calls();

        assert!(controller.toggle_mute().await);
        assert!(!controller.toggle_video().await);
        assert!(!controller.toggle_speaker().await);
        assert!(!controller.switch_camera().await);

        assert_eq!(next(&mut calls).await, CallEvent::AudioStateChanged(true));
        assert_eq!(next(&mut calls).await, CallEvent::VideoStateChanged(false));
        assert_eq!(next(&mut calls).await, CallEvent::SpeakerStateChanged(false));
        assert_eq!(next(&mut calls).await, CallEvent::CameraSwitched(false));

        let commands = engine.commands();
        assert!(commands.contains(&"mute_audio:true".to_string()));
        assert!(commands.contains(&"mute_video:true".to_string()));
        assert!(commands.contains(&"speaker:false".to_string()));
        assert!(commands.contains(&"switch_camera".to_string()));

        let session = controller.session().await;
        assert!(session.muted);
        assert!(!session.video_enabled);
        assert!(!session.speaker_enabled);
        assert!(!session.front_camera);
    }

    #[tokio::test]
    async fn toggle_without_engine_is_a_noop() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller_with(engine.clone(), settings());
        let mut calls = controller.subscribe_calls();

        assert!(!controller.toggle_mute().await);
        assert!(controller.switch_camera().await);

        assert!(calls.try_recv().is_err());
        assert!(engine.commands().is_empty());
    }

    #[tokio::test]
    async fn failed_engine_command_keeps_flag() {
        let engine = Arc::new(FakeEngine::new());
        let controller = ready(engine.clone()).await;
        engine.fail_commands.store(true, Ordering::SeqCst);

        assert!(!controller.toggle_mute().await);
        assert!(!controller.session().await.muted);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_counts_while_joined() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;

        for _ in 0..125 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        let secs = controller.duration_secs().await;
        assert!((124..=126).contains(&secs), "duration = {secs}");
        let formatted = controller.formatted_duration().await;
        assert!(["02:04", "02:05", "02:06"].contains(&formatted.as_str()), "{formatted}");

        controller.leave_channel().await;
        let frozen = controller.duration_secs().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.duration_secs().await, frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_join_times_out() {
        let engine = Arc::new(FakeEngine::manual());
        let controller = ready(engine.clone()).await;

        let result = controller.join_channel("room", JoinOptions::default()).await;

        assert_eq!(result, Err(CallError::JoinTimeout));
        assert_eq!(controller.state().await, CallState::Ready);
        assert_eq!(engine.count("leave"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_engine_join_does_not_block_other_commands() {
        let engine = Arc::new(FakeEngine::manual());
        engine.hang_join.store(true, Ordering::SeqCst);
        let controller = ready(engine.clone()).await;

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.join_channel("room", JoinOptions::default()).await })
        };
        wait_for_join_call(&engine).await;

        assert_eq!(controller.state().await, CallState::Joining);
        controller.dispose().await;
        assert_eq!(engine.count("release"), 1);
        assert_eq!(controller.state().await, CallState::Uninitialized);

        assert_eq!(pending.await.unwrap(), Err(CallError::Disposed));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_engine_join_times_out() {
        let engine = Arc::new(FakeEngine::manual());
        engine.hang_join.store(true, Ordering::SeqCst);
        let controller = controller_with(
            engine.clone(),
            CallSettings {
                join_timeout_secs: 1,
                ..settings()
            },
        );
        controller.initialize().await.unwrap();

        let result = controller.join_channel("room", JoinOptions::default()).await;

        assert_eq!(result, Err(CallError::JoinTimeout));
        assert_eq!(controller.state().await, CallState::Ready);
        assert_eq!(engine.count("leave"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_stops_call_timer() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        let mut calls = controller.subscribe_calls();

        engine.emit(EngineEvent::Error {
            code: codes::CONNECTION_LOST,
            message: "lost".into(),
        });

        assert!(matches!(next(&mut calls).await, CallEvent::Error(_)));
        assert_eq!(controller.state().await, CallState::Ready);
        assert!(!controller.shared.session.lock().await.timer.is_running());
        let frozen = controller.duration_secs().await;
        assert!(frozen >= 2, "duration = {frozen}");

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.duration_secs().await, frozen);
    }

    #[tokio::test]
    async fn dispose_during_join_releases_everything() {
        let engine = Arc::new(FakeEngine::manual());
        let controller = ready(engine.clone()).await;
        let mut calls = controller.subscribe_calls();

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.join_channel("room", JoinOptions::default()).await })
        };
        wait_for_join_call(&engine).await;

        controller.dispose().await;

        assert_eq!(pending.await.unwrap(), Err(CallError::Disposed));
        assert_eq!(engine.count("release"), 1);
        let session = controller.session().await;
        assert_eq!(session.state, CallState::Uninitialized);
        assert!(session.remote_participants.is_empty());
        assert!(controller.events().is_closed());

        assert_eq!(next(&mut calls).await, CallEvent::Left);
        assert!(matches!(
            calls.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        assert_eq!(
            controller.join_channel("room", JoinOptions::default()).await,
            Err(CallError::Disposed)
        );
        assert_eq!(controller.initialize().await, Err(CallError::Disposed));
    }

    #[tokio::test]
    async fn dispose_while_joined_stops_timer_and_is_repeatable() {
        let engine = Arc::new(FakeEngine::new());
        let controller = joined(engine.clone(), "room").await;
        engine.emit(EngineEvent::ParticipantJoined { uid: 2 });

        controller.dispose().await;
        controller.dispose().await;

        assert_eq!(engine.count("release"), 1);
        assert!(!controller.shared.session.lock().await.timer.is_running());
        assert!(controller.remote_participants().await.is_empty());
        // commands after dispose never reach the engine
        let before = engine.commands().len();
        controller.leave_channel().await;
        assert!(!controller.toggle_mute().await);
        assert_eq!(engine.commands().len(), before);
    }
}
