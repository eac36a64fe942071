//! `SessionController`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionController::new()
//!     └─► connect()      → background thread up, stream open, receive loop spawned,
//!         │                output device acquired (or headless), state = Connected
//!         ├─► play() / stop() / set_prompts() / set_config() / reset() / reconfigure()
//!         └─► close()    → output silenced, stream torn down, thread joined,
//!                          state = Disconnected
//! ```
//!
//! ## Threading
//!
//! One dedicated OS thread per session runs a current-thread tokio runtime.
//! Every control operation is a [`worker::Command`] on an unbounded channel
//! and executes there one at a time, in submission order. `connect()` and
//! `close()` block the caller on a crossbeam reply channel with a timeout;
//! everything else is fire-and-forget.
//!
//! The output callback never touches this machinery: it only pulls from the
//! lock-free ring and reads an atomic gate.

pub mod receive;
pub(crate) mod worker;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::{
    audio::AudioOutput,
    buffering::{recording::RecordingAccumulator, ChunkWriter, RingStats},
    config::{Credentials, SessionConfig},
    error::{CadenzaError, Result},
    events::{SessionState, SessionStatusEvent},
    export,
    generation::{GenerationConfig, WeightedPrompt},
    remote::StreamConnector,
};

use self::receive::StreamDiagnostics;
use self::worker::{Command, SessionWorker};

/// Broadcast channel capacity for status events.
const BROADCAST_CAP: usize = 64;

/// Grace added to the caller-side connect wait so the worker's own timeout
/// fires first and reports the precise error.
const CONNECT_REPLY_GRACE: Duration = Duration::from_millis(500);

/// Producer half of the current session's playback ring; `None` when headless.
pub type PlaybackFeed = Arc<Mutex<Option<ChunkWriter>>>;

/// Flags and state shared by the controller, the worker and the receive loop.
#[derive(Clone)]
pub struct SessionSignals {
    pub connected: Arc<AtomicBool>,
    pub playing: Arc<AtomicBool>,
    pub state: Arc<Mutex<SessionState>>,
    pub status_tx: broadcast::Sender<SessionStatusEvent>,
    pub diagnostics: Arc<StreamDiagnostics>,
}

impl SessionSignals {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            playing: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            status_tx,
            diagnostics: Arc::new(StreamDiagnostics::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_state(&self, new_state: SessionState, detail: Option<String>) {
        *self.state.lock() = new_state;
        self.publish(new_state, detail);
    }

    /// Move from `from` to `to` only if currently in `from`.
    pub fn transition(
        &self,
        from: SessionState,
        to: SessionState,
        detail: Option<String>,
    ) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        drop(state);
        self.publish(to, detail);
        true
    }

    /// Set `to` only while a remote stream is open, so a concurrent close
    /// is never overwritten.
    pub fn update_streaming(&self, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if !state.has_stream() {
            return false;
        }
        *state = to;
        drop(state);
        self.publish(to, None);
        true
    }

    /// Soft connection loss: clear the connected flag and tell observers.
    ///
    /// Returns `false` if the connection was already considered down.
    pub fn mark_connection_lost(&self, detail: &str) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.playing.store(false, Ordering::Release);
        self.publish(self.state(), Some(format!("connection lost: {detail}")));
        true
    }

    fn publish(&self, state: SessionState, detail: Option<String>) {
        let _ = self.status_tx.send(SessionStatusEvent {
            state,
            connected: self.is_connected(),
            detail,
        });
    }
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-scoped state reachable from both the caller and the worker.
pub(crate) struct SessionShared {
    pub signals: SessionSignals,
    pub audio_enabled: AtomicBool,
    /// Output callback gate; `false` silences the device immediately.
    pub output_gate: Arc<AtomicBool>,
    pub feed: PlaybackFeed,
    pub recording: Arc<RecordingAccumulator>,
    pub prompts: Mutex<Vec<WeightedPrompt>>,
    pub generation: Mutex<Option<GenerationConfig>>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            signals: SessionSignals::new(),
            audio_enabled: AtomicBool::new(false),
            output_gate: Arc::new(AtomicBool::new(false)),
            feed: Arc::new(Mutex::new(None)),
            recording: Arc::new(RecordingAccumulator::new()),
            prompts: Mutex::new(Vec::new()),
            generation: Mutex::new(None),
        }
    }
}

/// Point-in-time session counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub messages_in: u64,
    pub chunks_in: u64,
    pub bytes_in: u64,
    pub transport_errors: u64,
    pub output_pulls: u64,
    pub underruns: u64,
    pub spilled_bytes: u64,
    pub buffered_bytes: usize,
    pub recorded_bytes: usize,
}

/// Handle to the running background context.
struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    exited: crossbeam_channel::Receiver<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// The top-level session handle.
///
/// `SessionController` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<SessionController>` to drive it from several threads.
pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn StreamConnector>,
    output: Arc<dyn AudioOutput>,
    credentials: Credentials,
    shared: Arc<SessionShared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl SessionController {
    /// Create a controller. Nothing runs until `connect()`.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn StreamConnector>,
        output: Arc<dyn AudioOutput>,
        credentials: Credentials,
    ) -> Self {
        Self {
            config,
            connector,
            output,
            credentials,
            shared: Arc::new(SessionShared::new()),
            worker: Mutex::new(None),
        }
    }

    /// Open the remote stream and start streaming.
    ///
    /// Blocks until the stream is open, the receive loop is running and the
    /// output device was tried. A missing output device is not an error; check
    /// [`audio_enabled`](Self::audio_enabled).
    ///
    /// # Errors
    /// - `CadenzaError::InvalidSessionConfig` if the PCM format is unusable.
    /// - `CadenzaError::InvalidState` unless the session is `Disconnected`.
    /// - `CadenzaError::ConnectFailed` / `CadenzaError::ConnectTimeout` when the
    ///   stream cannot be opened; the session is then `Failed` until `close()`.
    pub fn connect(&self) -> Result<()> {
        self.config.validate()?;
        let reply_rx = {
            let mut worker = self.worker.lock();
            if !self
                .shared
                .signals
                .transition(SessionState::Disconnected, SessionState::Connecting, None)
            {
                return Err(CadenzaError::InvalidState(self.state()));
            }

            if worker.is_none() {
                match self.spawn_worker() {
                    Ok(handle) => *worker = Some(handle),
                    Err(e) => {
                        self.shared
                            .signals
                            .set_state(SessionState::Failed, Some(e.to_string()));
                        return Err(e);
                    }
                }
            }

            let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
            let sent = worker
                .as_ref()
                .map(|w| w.commands.send(Command::Connect { reply: reply_tx }).is_ok())
                .unwrap_or(false);
            if !sent {
                self.shared
                    .signals
                    .set_state(SessionState::Failed, Some("background context gone".into()));
                return Err(CadenzaError::SessionClosed);
            }
            reply_rx
        };

        let wait = self.config.connect_timeout() + CONNECT_REPLY_GRACE;
        match reply_rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(?wait, "connect did not complete in time");
                self.shared.signals.transition(
                    SessionState::Connecting,
                    SessionState::Failed,
                    Some("connect timed out".into()),
                );
                Err(CadenzaError::ConnectTimeout(self.config.connect_timeout()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.shared.signals.transition(
                    SessionState::Connecting,
                    SessionState::Failed,
                    Some("background context ended during connect".into()),
                );
                Err(CadenzaError::SessionClosed)
            }
        }
    }

    /// Replace the prompt set. Forwarded to the service if connected.
    pub fn set_prompts(&self, prompts: Vec<WeightedPrompt>) -> Result<()> {
        self.submit(Command::SetPrompts(prompts))
    }

    /// Validate and apply a generation config. Forwarded if connected.
    ///
    /// # Errors
    /// `CadenzaError::InvalidConfig` before anything is submitted.
    pub fn set_config(&self, config: GenerationConfig) -> Result<()> {
        config.validate()?;
        self.submit(Command::SetConfig(config))
    }

    /// Apply `config`, let it settle, reset the remote context, then re-send
    /// the current prompts. Runs as one uninterrupted unit on the background
    /// context.
    pub fn update_config_with_reset(&self, config: GenerationConfig) -> Result<()> {
        config.validate()?;
        self.submit(Command::Reconfigure(config))
    }

    pub fn play(&self) -> Result<()> {
        self.submit(Command::Play)
    }

    pub fn stop(&self) -> Result<()> {
        self.submit(Command::Stop)
    }

    /// Drop all queued and recorded audio and reset the remote context.
    pub fn reset(&self) -> Result<()> {
        self.submit(Command::Reset)
    }

    /// Queue a 440 Hz diagnostic tone for local playback.
    pub fn play_test_tone(&self, duration: Duration) -> Result<()> {
        self.submit(Command::TestTone(duration))
    }

    /// Explicit user clear of the recording.
    pub fn clear_recording(&self) {
        if self.submit(Command::ClearRecording).is_err() {
            self.shared.recording.clear();
        }
    }

    /// Tear the session down.
    ///
    /// Silences the output first, then closes the remote stream on the
    /// background context (bounded by `close_timeout`), then stops the
    /// background context, forcing it if teardown did not finish in time.
    /// Queued operations that had not started are dropped.
    pub fn close(&self) -> Result<()> {
        let mut handle = {
            let mut worker = self.worker.lock();
            let Some(handle) = worker.take() else {
                if self.state() != SessionState::Disconnected {
                    self.shared
                        .signals
                        .set_state(SessionState::Disconnected, None);
                }
                return Ok(());
            };
            self.shared.signals.set_state(SessionState::Closing, None);
            handle
        };

        info!("closing session");
        self.shared.output_gate.store(false, Ordering::Release);
        self.shared.signals.connected.store(false, Ordering::Release);
        self.shared.signals.playing.store(false, Ordering::Release);

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if handle
            .commands
            .send(Command::Close { reply: reply_tx })
            .is_ok()
        {
            match reply_rx.recv_timeout(self.config.close_timeout()) {
                Ok(()) => info!("remote stream closed"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("remote teardown did not finish in time — forcing shutdown")
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("background context ended before acknowledging close")
                }
            }
        }

        if let Some(shutdown) = handle.shutdown.take() {
            let _ = shutdown.send(());
        }
        drop(handle.commands);

        match handle.exited.recv_timeout(self.config.worker_join_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = handle.thread.take() {
                    if thread.join().is_err() {
                        warn!("session thread panicked during shutdown");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("session thread did not exit in time — detaching");
            }
        }

        *self.shared.feed.lock() = None;
        self.shared.audio_enabled.store(false, Ordering::Release);
        self.shared
            .signals
            .set_state(SessionState::Disconnected, None);
        info!("session closed");
        Ok(())
    }

    /// Current lifecycle state (snapshot).
    pub fn state(&self) -> SessionState {
        self.shared.signals.state()
    }

    /// `false` once the transport was lost or the session closed.
    pub fn is_connected(&self) -> bool {
        self.shared.signals.is_connected()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.signals.playing.load(Ordering::Acquire)
    }

    /// Whether local playback is active (an output device was acquired).
    pub fn audio_enabled(&self) -> bool {
        self.shared.audio_enabled.load(Ordering::Acquire)
    }

    pub fn prompts(&self) -> Vec<WeightedPrompt> {
        self.shared.prompts.lock().clone()
    }

    pub fn generation_config(&self) -> Option<GenerationConfig> {
        self.shared.generation.lock().clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bytes received but not yet played.
    pub fn buffered_bytes(&self) -> usize {
        self.shared
            .feed
            .lock()
            .as_ref()
            .map(ChunkWriter::buffered_bytes)
            .unwrap_or(0)
    }

    /// Raw PCM recorded so far in this session.
    pub fn recording_bytes(&self) -> Vec<u8> {
        self.shared.recording.snapshot()
    }

    pub fn recording_duration_secs(&self) -> f64 {
        self.shared.recording.duration_secs(self.config.format)
    }

    /// The recording as a complete WAV file.
    pub fn recording_wav(&self) -> Result<Vec<u8>> {
        export::encode_wav(&self.shared.recording.snapshot(), self.config.format)
    }

    pub fn save_recording(&self, path: impl AsRef<Path>) -> Result<()> {
        export::write_wav(path, &self.shared.recording.snapshot(), self.config.format)
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.signals.status_tx.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        let diagnostics = &self.shared.signals.diagnostics;
        let (ring, buffered_bytes) = self
            .shared
            .feed
            .lock()
            .as_ref()
            .map(|w| (w.stats(), w.buffered_bytes()))
            .unwrap_or((RingStats::default(), 0));
        DiagnosticsSnapshot {
            messages_in: diagnostics.messages_in.load(Ordering::Relaxed),
            chunks_in: diagnostics.chunks_in.load(Ordering::Relaxed),
            bytes_in: diagnostics.bytes_in.load(Ordering::Relaxed),
            transport_errors: diagnostics.transport_errors.load(Ordering::Relaxed),
            output_pulls: ring.pulls,
            underruns: ring.underruns,
            spilled_bytes: ring.spilled_bytes,
            buffered_bytes,
            recorded_bytes: self.shared.recording.len(),
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn submit(&self, command: Command) -> Result<()> {
        let worker = self.worker.lock();
        let Some(handle) = worker.as_ref() else {
            return Err(CadenzaError::NotConnected);
        };
        handle
            .commands
            .send(command)
            .map_err(|_| CadenzaError::SessionClosed)
    }

    fn spawn_worker(&self) -> Result<WorkerHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (exited_tx, exited) = crossbeam_channel::bounded(1);

        let config = self.config.clone();
        let connector = Arc::clone(&self.connector);
        let output = Arc::clone(&self.output);
        let credentials = self.credentials.clone();
        let shared = Arc::clone(&self.shared);

        let thread = std::thread::Builder::new()
            .name("cadenza-session".into())
            .spawn(move || {
                // The worker holds the output stream, which must stay on this thread.
                let worker = SessionWorker::new(config, connector, output, credentials, shared);
                runtime.block_on(worker.run(command_rx, shutdown_rx));
                // Dropping the runtime cancels the receive loop if it is still alive.
                drop(runtime);
                let _ = exited_tx.send(());
            })?;

        info!("session background context started");
        Ok(WorkerHandle {
            commands,
            shutdown: Some(shutdown),
            exited,
            thread: Some(thread),
        })
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("audio_enabled", &self.audio_enabled())
            .finish_non_exhaustive()
    }
}
