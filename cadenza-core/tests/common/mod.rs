#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cadenza_core::audio::{AudioOutput, PlaybackHandle};
use cadenza_core::buffering::{chunk::AudioChunk, FrameReader};
use cadenza_core::remote::{
    InboundMessage, OutboundMessage, RemoteStream, StreamConnector, StreamReceiver, StreamSender,
};
use cadenza_core::{CadenzaError, Credentials, PcmFormat, Result, SessionConfig, SessionController};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

pub const FORMAT: PcmFormat = PcmFormat::new(8_000, 1);

/// Fast timings so tests stay quick.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        format: FORMAT,
        connect_timeout_ms: 500,
        close_timeout_ms: 300,
        worker_join_timeout_ms: 1_000,
        receive_warm_up_ms: 0,
        reset_settle_ms: 10,
        reconfigure_settle_ms: 10,
        ring_capacity_secs: 1.0,
        spill_pump_interval_ms: 2,
        ..SessionConfig::default()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

/// Knobs flipped by tests to make the fake service misbehave.
#[derive(Debug, Default)]
pub struct Script {
    pub fail_open: AtomicBool,
    pub hang_open: AtomicBool,
    pub fail_sends: AtomicBool,
    pub hang_close: AtomicBool,
    pub send_delay_ms: AtomicU64,
}

/// In-memory connector: records every outbound message, lets the test inject
/// inbound ones.
#[derive(Default)]
pub struct ScriptedConnector {
    pub script: Arc<Script>,
    pub outbound: Arc<Mutex<Vec<OutboundMessage>>>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    /// Sends that arrived after the stream was closed.
    pub sends_after_close: Arc<AtomicUsize>,
    api_key: Mutex<Option<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<InboundMessage>>>>,
    reset_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_audio(&self, chunks: &[Vec<u8>]) {
        let message = InboundMessage::Audio(
            chunks.iter().cloned().map(AudioChunk::new).collect(),
        );
        self.push(Ok(message));
    }

    pub fn push(&self, item: Result<InboundMessage>) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Close the inbound side as the service would on disconnect.
    pub fn end_stream(&self) {
        self.inbound.lock().take();
    }

    /// Make the next `ResetContext` send wait until the returned sender fires.
    pub fn hold_next_reset(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.reset_gate.lock() = Some(rx);
        tx
    }

    /// Key presented on the most recent `open`.
    pub fn api_key(&self) -> Option<String> {
        self.api_key.lock().clone()
    }

    pub fn log(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&OutboundMessage) -> bool) -> usize {
        self.outbound.lock().iter().filter(|m| pred(m)).count()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn open(&self, _model_id: &str, credentials: &Credentials) -> Result<RemoteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.api_key.lock() = Some(credentials.api_key().to_string());
        if self.script.hang_open.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.script.fail_open.load(Ordering::SeqCst) {
            return Err(CadenzaError::ConnectFailed("service refused the session".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        Ok(RemoteStream {
            sender: Box::new(ScriptedSender {
                script: Arc::clone(&self.script),
                outbound: Arc::clone(&self.outbound),
                closes: Arc::clone(&self.closes),
                sends_after_close: Arc::clone(&self.sends_after_close),
                reset_gate: Arc::clone(&self.reset_gate),
                closed: false,
            }),
            receiver: Box::new(ScriptedReceiver { rx }),
        })
    }
}

struct ScriptedSender {
    script: Arc<Script>,
    outbound: Arc<Mutex<Vec<OutboundMessage>>>,
    closes: Arc<AtomicUsize>,
    sends_after_close: Arc<AtomicUsize>,
    reset_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    closed: bool,
}

#[async_trait]
impl StreamSender for ScriptedSender {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        if self.closed {
            self.sends_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(CadenzaError::Transport("stream already closed".into()));
        }
        if self.script.fail_sends.load(Ordering::SeqCst) {
            return Err(CadenzaError::Transport("socket reset by peer".into()));
        }
        let delay = self.script.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let is_reset = message == OutboundMessage::ResetContext;
        self.outbound.lock().push(message);
        if is_reset {
            let gate = self.reset_gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.script.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedReceiver {
    rx: mpsc::UnboundedReceiver<Result<InboundMessage>>,
}

#[async_trait]
impl StreamReceiver for ScriptedReceiver {
    async fn recv(&mut self) -> Option<Result<InboundMessage>> {
        self.rx.recv().await
    }
}

/// Output that hands the ring reader to the test instead of a device.
#[derive(Default)]
pub struct CapturingOutput {
    reader: Mutex<Option<FrameReader>>,
    pub opens: AtomicUsize,
    pub stopped: Arc<AtomicBool>,
    /// Blocks `open` this long, as a slow device driver would.
    pub open_delay_ms: AtomicU64,
}

impl CapturingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_reader(&self) -> Option<FrameReader> {
        self.reader.lock().take()
    }
}

impl AudioOutput for CapturingOutput {
    fn open(
        &self,
        _format: PcmFormat,
        reader: FrameReader,
        _gate: Arc<AtomicBool>,
    ) -> Result<Box<dyn PlaybackHandle>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        *self.reader.lock() = Some(reader);
        Ok(Box::new(CapturedPlayback {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

struct CapturedPlayback {
    stopped: Arc<AtomicBool>,
}

impl PlaybackHandle for CapturedPlayback {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub fn controller(
    connector: &Arc<ScriptedConnector>,
    output: Arc<dyn AudioOutput>,
) -> SessionController {
    controller_with(test_config(), connector, output)
}

pub fn controller_with(
    config: SessionConfig,
    connector: &Arc<ScriptedConnector>,
    output: Arc<dyn AudioOutput>,
) -> SessionController {
    SessionController::new(
        config,
        Arc::clone(connector) as Arc<dyn StreamConnector>,
        output,
        Credentials::new("test-key"),
    )
}
