//! Background session context: executes control commands one at a time.
//!
//! Owns the remote stream's sender, the receive-loop task and the output
//! stream handle. Each command runs to completion before the next is taken
//! off the queue, so a reconfigure (config, settle, reset, prompts) is never
//! interleaved with anything else.

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    audio::{tone::test_tone, AudioOutput, PlaybackHandle},
    buffering::audio_ring,
    config::{Credentials, SessionConfig},
    error::{CadenzaError, Result},
    events::SessionState,
    generation::{GenerationConfig, WeightedPrompt},
    remote::{OutboundMessage, RemoteStream, StreamConnector, StreamSender},
    session::{
        receive::{self, ReceiveContext},
        SessionShared,
    },
};

pub(crate) enum Command {
    Connect {
        reply: crossbeam_channel::Sender<Result<()>>,
    },
    SetPrompts(Vec<WeightedPrompt>),
    SetConfig(GenerationConfig),
    Play,
    Stop,
    Reset,
    Reconfigure(GenerationConfig),
    TestTone(Duration),
    ClearRecording,
    Close {
        reply: crossbeam_channel::Sender<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::SetPrompts(_) => "set_prompts",
            Command::SetConfig(_) => "set_config",
            Command::Play => "play",
            Command::Stop => "stop",
            Command::Reset => "reset",
            Command::Reconfigure(_) => "reconfigure",
            Command::TestTone(_) => "test_tone",
            Command::ClearRecording => "clear_recording",
            Command::Close { .. } => "close",
        }
    }
}

pub(crate) struct SessionWorker {
    config: SessionConfig,
    connector: Arc<dyn StreamConnector>,
    output: Arc<dyn AudioOutput>,
    credentials: Credentials,
    shared: Arc<SessionShared>,
    sender: Option<Box<dyn StreamSender>>,
    receive_task: Option<JoinHandle<()>>,
    /// `!Send`; created and dropped on this thread only.
    playback: Option<Box<dyn PlaybackHandle>>,
    closed: bool,
}

impl SessionWorker {
    pub(crate) fn new(
        config: SessionConfig,
        connector: Arc<dyn StreamConnector>,
        output: Arc<dyn AudioOutput>,
        credentials: Credentials,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            config,
            connector,
            output,
            credentials,
            shared,
            sender: None,
            receive_task: None,
            playback: None,
            closed: false,
        }
    }

    /// Process commands until the queue closes or `shutdown` fires.
    ///
    /// `shutdown` also cancels a command that is still in flight.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let command = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            let name = command.name();
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!(command = name, "shutdown interrupted an in-flight operation");
                    break;
                }
                _ = self.handle(command) => {}
            }
        }

        self.release();
        debug!("session worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        if self.closed {
            debug!(command = command.name(), "ignoring command after close");
            return;
        }
        match command {
            Command::Connect { reply } => {
                let result = self.connect().await;
                if let Err(e) = &result {
                    warn!("connect failed: {e}");
                    self.shared.signals.transition(
                        SessionState::Connecting,
                        SessionState::Failed,
                        Some(e.to_string()),
                    );
                }
                let _ = reply.send(result);
            }
            Command::SetPrompts(prompts) => self.set_prompts(prompts).await,
            Command::SetConfig(config) => self.set_config(config).await,
            Command::Play => self.set_playing(true).await,
            Command::Stop => self.set_playing(false).await,
            Command::Reset => self.reset().await,
            Command::Reconfigure(config) => self.reconfigure(config).await,
            Command::TestTone(duration) => self.queue_test_tone(duration),
            Command::ClearRecording => self.shared.recording.clear(),
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        // A new session starts from an empty slate.
        self.shared.recording.clear();
        self.shared.prompts.lock().clear();
        *self.shared.generation.lock() = None;
        self.shared.signals.diagnostics.reset();

        info!(model = self.config.model_id.as_str(), "connecting to generation service");
        let timeout = self.config.connect_timeout();
        let stream = match tokio::time::timeout(
            timeout,
            self.connector.open(&self.config.model_id, &self.credentials),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e @ CadenzaError::ConnectFailed(_))) => return Err(e),
            Ok(Err(e)) => return Err(CadenzaError::ConnectFailed(e.to_string())),
            Err(_) => return Err(CadenzaError::ConnectTimeout(timeout)),
        };
        let RemoteStream {
            mut sender,
            receiver,
        } = stream;

        let (writer, reader) = audio_ring(self.config.ring_capacity_bytes());
        self.shared.output_gate.store(true, Ordering::Release);
        match self.output.open(
            self.config.format,
            reader,
            Arc::clone(&self.shared.output_gate),
        ) {
            Ok(handle) => {
                self.playback = Some(handle);
                *self.shared.feed.lock() = Some(writer);
                self.shared.audio_enabled.store(true, Ordering::Release);
                info!("local playback enabled");
            }
            Err(e) => {
                warn!("audio output unavailable, continuing without local playback: {e}");
                self.stop_playback();
            }
        }

        let signals = &self.shared.signals;
        signals.connected.store(true, Ordering::Release);
        if !signals.transition(SessionState::Connecting, SessionState::Connected, None) {
            // close() or the caller's timeout overtook us; hand everything back.
            signals.connected.store(false, Ordering::Release);
            let state = signals.state();
            self.stop_playback();
            let _ = tokio::time::timeout(self.config.close_timeout(), sender.close()).await;
            return Err(CadenzaError::InvalidState(state));
        }

        self.sender = Some(sender);
        self.receive_task = Some(tokio::spawn(receive::run(ReceiveContext {
            receiver,
            feed: Arc::clone(&self.shared.feed),
            recording: Arc::clone(&self.shared.recording),
            signals: self.shared.signals.clone(),
            warm_up: self.config.receive_warm_up(),
            pump_interval: self.config.spill_pump_interval(),
        })));

        info!(
            audio_enabled = self.shared.audio_enabled.load(Ordering::Acquire),
            "session connected"
        );
        Ok(())
    }

    /// Send one message if the connection is up.
    ///
    /// A send failure marks the connection lost and is not reported further.
    async fn forward(&mut self, message: OutboundMessage) -> bool {
        if !self.shared.signals.is_connected() {
            debug!(?message, "not connected — keeping change local");
            return false;
        }
        let Some(sender) = self.sender.as_mut() else {
            return false;
        };
        match sender.send(message).await {
            Ok(()) => true,
            Err(e) => {
                if self.shared.signals.mark_connection_lost(&e.to_string()) {
                    warn!("send failed — connection lost: {e}");
                }
                false
            }
        }
    }

    async fn set_prompts(&mut self, prompts: Vec<WeightedPrompt>) {
        *self.shared.prompts.lock() = prompts.clone();
        info!(count = prompts.len(), "prompts updated");
        self.forward(OutboundMessage::SetPrompts(prompts)).await;
    }

    async fn set_config(&mut self, config: GenerationConfig) {
        *self.shared.generation.lock() = Some(config.clone());
        info!(?config, "generation config updated");
        self.forward(OutboundMessage::SetConfig(config)).await;
    }

    async fn set_playing(&mut self, playing: bool) {
        let message = if playing {
            OutboundMessage::Play
        } else {
            OutboundMessage::Stop
        };
        if !self.forward(message).await {
            warn!(playing, "play/stop ignored — session not connected");
            return;
        }
        self.shared.signals.playing.store(playing, Ordering::Release);
        let state = if playing {
            SessionState::Playing
        } else {
            SessionState::Stopped
        };
        self.shared.signals.update_streaming(state);
    }

    /// Clear local audio first, then reset the remote context and let it settle.
    async fn reset(&mut self) {
        if let Some(writer) = self.shared.feed.lock().as_mut() {
            writer.clear();
        }
        self.shared.recording.clear();
        info!("local audio cleared");

        if self.forward(OutboundMessage::ResetContext).await {
            tokio::time::sleep(self.config.reset_settle()).await;
            info!("remote context reset");
        }
    }

    async fn reconfigure(&mut self, config: GenerationConfig) {
        *self.shared.generation.lock() = Some(config.clone());
        if !self.forward(OutboundMessage::SetConfig(config)).await {
            return;
        }
        tokio::time::sleep(self.config.reconfigure_settle()).await;

        self.reset().await;

        let prompts = self.shared.prompts.lock().clone();
        if !prompts.is_empty() {
            self.forward(OutboundMessage::SetPrompts(prompts)).await;
        }
        info!("config updated with context reset");
    }

    fn queue_test_tone(&mut self, duration: Duration) {
        let mut feed = self.shared.feed.lock();
        let Some(writer) = feed.as_mut() else {
            warn!("test tone skipped — no local playback");
            return;
        };
        let pcm = test_tone(self.config.format, duration);
        writer.push(&pcm);
        info!(bytes = pcm.len(), "test tone queued");
    }

    async fn close(&mut self) {
        self.closed = true;
        self.stop_playback();

        if let Some(task) = self.receive_task.take() {
            task.abort();
        }

        if let Some(mut sender) = self.sender.take() {
            match tokio::time::timeout(self.config.close_timeout(), sender.close()).await {
                Ok(Ok(())) => debug!("remote stream closed cleanly"),
                Ok(Err(e)) => warn!("error closing remote stream: {e}"),
                Err(_) => warn!("remote stream close timed out"),
            }
        }
    }

    /// Silence and drop the local output path.
    fn stop_playback(&mut self) {
        self.shared.output_gate.store(false, Ordering::Release);
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        *self.shared.feed.lock() = None;
        self.shared.audio_enabled.store(false, Ordering::Release);
    }

    /// Drop whatever is left without talking to the remote side.
    fn release(&mut self) {
        self.shared.output_gate.store(false, Ordering::Release);
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        self.sender = None;
    }
}
