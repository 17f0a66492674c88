//! Call controller that ties capture, playback and the remote session together.
//!
//! `start_call` flips the state to `Connecting` and returns. The rest of the call
//! (microphone, speaker, session connect, steady-state streaming and teardown)
//! runs on one spawned task per call. Each call has a generation number; a task
//! whose generation is no longer current cannot touch the published status, so
//! a late "open" can never revive a call that was already ended.

use crate::backend::AudioBackend;
use crate::call_log::{CallLogStore, CallOutcome, CallRecord};
use crate::capture::{
    AudioLevelSnapshot, CaptureError, CapturePipeline, ChunkSink, MicrophoneStream,
    SharedLevelMeter,
};
use crate::codec::{EncodedChunk, PLAYBACK_SAMPLE_RATE};
use crate::live::{LinkSender, RealtimeConnector, SessionSetup};
use crate::persona::{find_persona, Persona};
use crate::playback::{AudioOutput, PlaybackError, PlaybackScheduler};
use crate::session::{
    SessionAction, SessionCounters, SessionEvent, SessionManager, TeardownCause,
};
use crate::settings::BridgeSettings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the call controller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("No microphone available: {0}")]
    NoInputDevice(String),

    #[error("Microphone failed: {0}")]
    MicrophoneFailed(String),

    #[error("Audio output unavailable: {0}")]
    OutputUnavailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("A call is already active")]
    CallAlreadyActive,

    #[error("Unknown persona: {0}")]
    NoSuchPersona(String),

    #[error("No async runtime available: {0}")]
    Runtime(String),

    #[error("Failed to acquire lock: {0}")]
    Lock(String),
}

/// Call state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// No call; ready to start one
    NoCall,
    /// Devices and remote session are being set up
    Connecting,
    /// Remote session is open and the microphone is streaming
    Active,
}

impl CallPhase {
    /// Check if this state allows starting a new call
    pub fn can_start_call(&self) -> bool {
        matches!(self, CallPhase::NoCall)
    }

    /// Check if there is anything to end
    pub fn can_end_call(&self) -> bool {
        matches!(self, CallPhase::Connecting | CallPhase::Active)
    }
}

/// Connection indicator shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
}

/// Why the last call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Ended locally
    Hangup,
    /// The remote side closed an open session
    RemoteClosed,
    Failed,
}

/// Snapshot of the controller, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub phase: CallPhase,
    pub connection: ConnectionStatus,
    pub muted: bool,
    pub level: AudioLevelSnapshot,
    pub persona_id: Option<String>,
    pub call_id: Option<String>,
    pub last_error: Option<CallError>,
    pub last_end_reason: Option<EndReason>,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub playback_failures: u64,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            phase: CallPhase::NoCall,
            connection: ConnectionStatus::Idle,
            muted: false,
            level: AudioLevelSnapshot::default(),
            persona_id: None,
            call_id: None,
            last_error: None,
            last_end_reason: None,
            chunks_sent: 0,
            chunks_received: 0,
            playback_failures: 0,
        }
    }
}

struct BridgeInner {
    status: CallStatus,
    generation: u64,
    /// Cancellation token for the current call
    cancel_token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// State shared between the controller handle and the call task.
struct Shared {
    inner: Mutex<BridgeInner>,
    status_tx: watch::Sender<CallStatus>,
    muted: Arc<AtomicBool>,
    level_meter: SharedLevelMeter,
    call_log: CallLogStore,
}

/// How a call task finished
struct CallEnd {
    reason: EndReason,
    error: Option<CallError>,
    outcome: CallOutcome,
}

impl CallEnd {
    fn hangup(was_connected: bool) -> Self {
        Self {
            reason: EndReason::Hangup,
            error: None,
            outcome: if was_connected {
                CallOutcome::Completed
            } else {
                CallOutcome::Cancelled
            },
        }
    }

    fn failed(error: CallError) -> Self {
        Self {
            reason: EndReason::Failed,
            error: Some(error),
            outcome: CallOutcome::Failed,
        }
    }
}

impl Shared {
    fn publish(&self, status: &CallStatus) {
        let mut snapshot = status.clone();
        snapshot.level = self.level_meter.snapshot();
        snapshot.muted = self.muted.load(Ordering::Acquire);
        self.status_tx.send_replace(snapshot);
    }

    /// Apply `f` to the status if call `generation` is still the live call.
    fn update(&self, generation: u64, f: impl FnOnce(&mut CallStatus)) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.generation != generation || !inner.status.phase.can_end_call() {
            return false;
        }
        f(&mut inner.status);
        self.publish(&inner.status);
        true
    }

    fn set_counters(&self, generation: u64, counters: SessionCounters, playback_failures: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation != generation {
            return;
        }
        let status = &mut inner.status;
        status.chunks_sent = counters.chunks_sent;
        status.chunks_received = counters.chunks_received;
        status.playback_failures = playback_failures;
        self.publish(&inner.status);
    }

    /// Record the end of call `generation`. A call already ended by the user
    /// keeps its hangup status.
    fn finish(&self, generation: u64, end: &CallEnd) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation != generation {
            return;
        }
        inner.cancel_token = None;
        if inner.status.phase.can_end_call() {
            let status = &mut inner.status;
            status.phase = CallPhase::NoCall;
            status.connection = if end.error.is_some() {
                ConnectionStatus::Error
            } else {
                ConnectionStatus::Idle
            };
            status.last_end_reason = Some(end.reason);
            status.last_error = end.error.clone();
        }
        self.publish(&inner.status);
    }
}

/// Thread-safe handle to the call controller.
#[derive(Clone)]
pub struct CallBridge {
    shared: Arc<Shared>,
    settings: Arc<BridgeSettings>,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn RealtimeConnector>,
}

impl CallBridge {
    pub fn new(
        settings: BridgeSettings,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Self {
        let (status_tx, _status_rx) = watch::channel(CallStatus::default());
        let call_log = CallLogStore::new(settings.call_log_retention);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(BridgeInner {
                    status: CallStatus::default(),
                    generation: 0,
                    cancel_token: None,
                    task: None,
                }),
                status_tx,
                muted: Arc::new(AtomicBool::new(false)),
                level_meter: SharedLevelMeter::new(),
                call_log,
            }),
            settings: Arc::new(settings),
            backend,
            connector,
        }
    }

    pub fn personas(&self) -> &[Persona] {
        &self.settings.personas
    }

    /// Start a call with the persona `persona_id`.
    ///
    /// Returns the call id as soon as the call is `Connecting`. Device and
    /// session failures after that point are reported through the status.
    pub fn start_call(&self, persona_id: &str) -> Result<String, CallError> {
        let persona = find_persona(&self.settings.personas, persona_id)
            .cloned()
            .ok_or_else(|| CallError::NoSuchPersona(persona_id.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CallError::Runtime(e.to_string()))?;

        let mut inner = self
            .shared
            .inner
            .lock()
            .map_err(|e| CallError::Lock(e.to_string()))?;

        // State guard: at most one call at a time
        if !inner.status.phase.can_start_call() {
            return Err(CallError::CallAlreadyActive);
        }

        // A previous call may still be releasing its devices; the new task
        // waits for it before acquiring anything.
        let previous = inner.task.take().filter(|task| !task.is_finished());
        if previous.is_some() {
            log::debug!("Bridge: previous call still tearing down");
        }

        inner.generation += 1;
        let generation = inner.generation;
        let cancel_token = CancellationToken::new();
        inner.cancel_token = Some(cancel_token.clone());

        let call_id = self
            .shared
            .call_log
            .start_call(&persona.id, &self.settings.live_model);
        self.shared.muted.store(false, Ordering::Release);
        self.shared.level_meter.clear();

        inner.status = CallStatus {
            phase: CallPhase::Connecting,
            connection: ConnectionStatus::Connecting,
            persona_id: Some(persona.id.clone()),
            call_id: Some(call_id.clone()),
            ..CallStatus::default()
        };
        self.shared.publish(&inner.status);

        log::info!("Bridge: call {} started with persona '{}'", call_id, persona.id);

        let task = CallTask {
            call_id: call_id.clone(),
            generation,
            setup: SessionSetup::for_persona(&persona, &self.settings.live_model),
            frame_len: self.settings.frame_len,
            cancel_token,
            shared: self.shared.clone(),
            backend: self.backend.clone(),
            connector: self.connector.clone(),
        };
        inner.task = Some(runtime.spawn(task.run(previous)));

        Ok(call_id)
    }

    /// End the current call. Safe to call at any time, any number of times.
    ///
    /// Teardown of devices and the session finishes in the background; use
    /// [`end_call_and_wait`](Self::end_call_and_wait) to wait for it.
    pub fn end_call(&self) {
        let Ok(mut inner) = self.shared.inner.lock() else {
            return;
        };
        if !inner.status.phase.can_end_call() {
            log::debug!("Bridge: end requested but no call is active");
            return;
        }

        // Signal cancellation to the call task
        if let Some(token) = inner.cancel_token.take() {
            token.cancel();
        }

        let status = &mut inner.status;
        status.phase = CallPhase::NoCall;
        status.connection = ConnectionStatus::Idle;
        status.last_end_reason = Some(EndReason::Hangup);
        status.last_error = None;
        self.shared.publish(&inner.status);
        log::info!("Bridge: call ended locally");
    }

    /// End the current call and wait until its resources are released.
    pub async fn end_call_and_wait(&self) {
        self.end_call();
        let task = self.shared.inner.lock().ok().and_then(|mut inner| inner.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Bridge: call task ended abnormally: {}", e);
            }
        }
    }

    /// Flip the mute flag. Returns the new value.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.shared.muted.fetch_xor(true, Ordering::AcqRel);
        self.after_mute_change(muted);
        muted
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
        self.after_mute_change(muted);
    }

    fn after_mute_change(&self, muted: bool) {
        log::info!("Bridge: microphone {}", if muted { "muted" } else { "unmuted" });
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.status.muted = muted;
            self.shared.publish(&inner.status);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Current status with a fresh level reading.
    pub fn status(&self) -> CallStatus {
        let mut status = self
            .shared
            .inner
            .lock()
            .map(|inner| inner.status.clone())
            .unwrap_or_default();
        status.level = self.shared.level_meter.snapshot();
        status.muted = self.is_muted();
        status
    }

    pub fn phase(&self) -> CallPhase {
        self.shared
            .inner
            .lock()
            .map(|inner| inner.status.phase)
            .unwrap_or(CallPhase::NoCall)
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Get the most recent input level without locking the controller.
    pub fn level_snapshot(&self) -> AudioLevelSnapshot {
        self.shared.level_meter.snapshot()
    }

    pub fn call_log(&self) -> Vec<CallRecord> {
        self.shared.call_log.get_logs(None)
    }
}

/// One call, from device acquisition to teardown.
struct CallTask {
    call_id: String,
    generation: u64,
    setup: SessionSetup,
    frame_len: usize,
    cancel_token: CancellationToken,
    shared: Arc<Shared>,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn RealtimeConnector>,
}

/// Everything a call holds; released by [`CallResources::release`].
struct CallResources {
    microphone: Option<Box<dyn MicrophoneStream>>,
    capture: CapturePipeline,
    scheduler: Option<PlaybackScheduler>,
    link: Option<LinkSender>,
    session: SessionManager,
    connected: bool,
}

impl CallResources {
    /// Close the session, release the microphone and close the output. Every
    /// step runs regardless of the others.
    async fn release(mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.session.close();

        let microphone = self.microphone.take();
        let capture = self.capture;
        let scheduler = self.scheduler.take();
        let released = tokio::task::spawn_blocking(move || {
            let mut capture = capture;
            capture.stop();
            if let Some(mut mic) = microphone {
                mic.stop();
            }
            if let Some(mut scheduler) = scheduler {
                scheduler.close();
            }
        })
        .await;
        if let Err(e) = released {
            log::warn!("Bridge: device release task failed: {}", e);
        }
    }
}

impl CallTask {
    fn log_call(&self, f: impl FnOnce(&mut CallRecord)) {
        self.shared.call_log.with_call(&self.call_id, f);
    }

    async fn run(self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                log::warn!("Bridge: previous call task ended abnormally: {}", e);
            }
        }

        let mut resources = CallResources {
            microphone: None,
            capture: CapturePipeline::new(
                self.frame_len,
                self.shared.muted.clone(),
                self.shared.level_meter.clone(),
            ),
            scheduler: None,
            link: None,
            session: SessionManager::new(),
            connected: false,
        };

        let end = self.drive(&mut resources).await;

        let counters = resources.session.counters();
        let playback_failures = resources
            .scheduler
            .as_ref()
            .map(|s| s.stats().failures)
            .unwrap_or(0);
        let connected = resources.connected;
        resources.release().await;

        self.shared.set_counters(self.generation, counters, playback_failures);
        self.shared.finish(self.generation, &end);
        self.log_call(|record| {
            record.chunks_sent = counters.chunks_sent;
            record.chunks_received = counters.chunks_received;
            record.chunks_dropped = counters.chunks_dropped;
            record.playback_failures = playback_failures;
            if connected {
                record.info("Call resources released");
            }
            record.finish(end.outcome, end.error.as_ref().map(|e| e.to_string()));
        });
        self.shared.call_log.complete_call(&self.call_id);

        match &end.error {
            Some(e) => log::error!("Bridge: call {} failed: {}", self.call_id, e),
            None => log::info!("Bridge: call {} finished ({:?})", self.call_id, end.reason),
        }
    }

    /// Run the call until it ends. Resources acquired so far are left in
    /// `resources` for the caller to release.
    async fn drive(&self, resources: &mut CallResources) -> CallEnd {
        if self.cancel_token.is_cancelled() {
            return CallEnd::hangup(false);
        }

        // Microphone permission. Device opens are awaited to completion even
        // when the call is ended meanwhile, so whatever they acquire is owned
        // by `resources` and released with the call.
        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || backend.open_microphone()).await;
        match opened {
            Ok(Ok(mic)) => {
                resources.microphone = Some(mic);
                self.log_call(|r| r.info("Microphone acquired"));
            }
            Ok(Err(e)) => return self.fail(capture_error(e)),
            Err(e) => return self.fail(CallError::MicrophoneFailed(e.to_string())),
        }
        if self.cancel_token.is_cancelled() {
            return CallEnd::hangup(false);
        }

        // Audio output context
        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || backend.open_output()).await;
        let output: Box<dyn AudioOutput> = match opened {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.fail(output_error(e)),
            Err(e) => return self.fail(CallError::OutputUnavailable(e.to_string())),
        };
        let mut scheduler = PlaybackScheduler::new(output, PLAYBACK_SAMPLE_RATE);
        scheduler.reset();
        resources.scheduler = Some(scheduler);
        if self.cancel_token.is_cancelled() {
            return CallEnd::hangup(false);
        }

        // Remote session
        resources.session.begin_connect();
        let connected = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return CallEnd::hangup(false),
            link = self.connector.connect(&self.setup) => link,
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => return self.fail(CallError::ConnectionFailed(e.to_string())),
        };
        let (sender, mut events) = link.into_split();
        resources.link = Some(sender.clone());
        self.log_call(|r| r.info(format!("Session requested via {}", self.connector.name())));

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<EncodedChunk>();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    return CallEnd::hangup(resources.connected);
                }

                event = events.recv() => {
                    let event = event.unwrap_or(SessionEvent::Closed {
                        reason: Some("transport dropped".to_string()),
                    });
                    match resources.session.handle_event(event) {
                        Some(SessionAction::StartCapture) => {
                            if let Err(e) = self.start_capture(resources, chunk_tx.clone()) {
                                return self.fail(e);
                            }
                        }
                        Some(SessionAction::Schedule(chunk)) => self.schedule(resources, &chunk),
                        Some(SessionAction::Teardown(cause)) => {
                            return self.remote_teardown(cause, resources.connected);
                        }
                        None => {}
                    }
                }

                Some(chunk) = chunk_rx.recv() => {
                    if let Some(message) = resources.session.outbound(chunk) {
                        if sender.send(message).is_err() {
                            log::debug!("Bridge: transport gone, waiting for close event");
                        }
                        self.publish_counters(resources);
                    }
                }
            }
        }
    }

    fn start_capture(
        &self,
        resources: &mut CallResources,
        chunk_tx: mpsc::UnboundedSender<EncodedChunk>,
    ) -> Result<(), CallError> {
        let mic = resources
            .microphone
            .take()
            .ok_or_else(|| CallError::MicrophoneFailed("microphone was released".to_string()))?;

        let on_chunk: ChunkSink = Arc::new(move |chunk| {
            let _ = chunk_tx.send(chunk);
        });
        resources.capture.start(mic, on_chunk).map_err(capture_error)?;
        resources.connected = true;

        self.shared.update(self.generation, |status| {
            status.phase = CallPhase::Active;
            status.connection = ConnectionStatus::Connected;
        });
        self.log_call(|r| {
            r.mark_connected();
            r.info("Session open, capture started");
        });
        Ok(())
    }

    fn schedule(&self, resources: &mut CallResources, chunk: &EncodedChunk) {
        let Some(scheduler) = resources.scheduler.as_mut() else {
            return;
        };
        if let Err(e) = scheduler.schedule_chunk(chunk) {
            log::warn!("Bridge: failed to schedule playback: {}", e);
            self.log_call(|r| r.warn(format!("Playback failed: {}", e)));
        }
        self.publish_counters(resources);
    }

    fn publish_counters(&self, resources: &CallResources) {
        let failures = resources
            .scheduler
            .as_ref()
            .map(|s| s.stats().failures)
            .unwrap_or(0);
        let counters = resources.session.counters();
        self.shared.update(self.generation, |status| {
            status.chunks_sent = counters.chunks_sent;
            status.chunks_received = counters.chunks_received;
            status.playback_failures = failures;
        });
    }

    fn remote_teardown(&self, cause: TeardownCause, was_connected: bool) -> CallEnd {
        match cause {
            TeardownCause::RemoteClosed(reason) if was_connected => {
                self.log_call(|r| {
                    r.info(format!(
                        "Remote hung up ({})",
                        reason.as_deref().unwrap_or("no reason")
                    ))
                });
                CallEnd {
                    reason: EndReason::RemoteClosed,
                    error: None,
                    outcome: CallOutcome::RemoteClosed,
                }
            }
            TeardownCause::RemoteClosed(reason) => self.fail(CallError::ConnectionFailed(format!(
                "session closed before opening ({})",
                reason.as_deref().unwrap_or("no reason")
            ))),
            TeardownCause::RemoteError(message) => self.fail(CallError::ConnectionFailed(message)),
        }
    }

    fn fail(&self, error: CallError) -> CallEnd {
        self.log_call(|r| r.error(error.to_string()));
        CallEnd::failed(error)
    }
}

fn capture_error(e: CaptureError) -> CallError {
    match e {
        CaptureError::PermissionDenied(msg) => CallError::PermissionDenied(msg),
        CaptureError::NoInputDevice => {
            CallError::NoInputDevice("no input device found".to_string())
        }
        other => CallError::MicrophoneFailed(other.to_string()),
    }
}

fn output_error(e: PlaybackError) -> CallError {
    CallError::OutputUnavailable(e.to_string())
}
