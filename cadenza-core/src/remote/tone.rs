//! `ToneConnector`: local stand-in for the generation service.
//!
//! Streams a synthetic tone at real-time pace while "playing", so the whole
//! session core (receive loop, ring, output callback, recording, reset) can be
//! exercised without credentials or network. The tonic of the configured scale
//! picks the pitch and the bpm drives a per-beat pulse.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::audio::tone::{render_sine, ToneSpec};
use crate::buffering::chunk::AudioChunk;
use crate::config::{Credentials, PcmFormat};
use crate::error::{CadenzaError, Result};
use crate::generation::GenerationConfig;
use crate::remote::{
    InboundMessage, OutboundMessage, RemoteStream, StreamConnector, StreamReceiver, StreamSender,
};

const DEFAULT_CHUNK: Duration = Duration::from_millis(200);
const DEFAULT_HZ: f32 = 440.0;
const MIDDLE_C_HZ: f32 = 261.63;

/// Synthetic connector. Every `open` yields an independent stream.
#[derive(Debug, Clone)]
pub struct ToneConnector {
    format: PcmFormat,
    chunk_duration: Duration,
}

impl ToneConnector {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            chunk_duration: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_duration(mut self, chunk_duration: Duration) -> Self {
        self.chunk_duration = chunk_duration.max(Duration::from_millis(1));
        self
    }
}

impl Default for ToneConnector {
    fn default() -> Self {
        Self::new(PcmFormat::default())
    }
}

#[derive(Debug)]
struct ToneState {
    playing: bool,
    closed: bool,
    next_frame: u64,
    frequency: f32,
    bpm: Option<u32>,
    prompt_count: usize,
}

#[async_trait]
impl StreamConnector for ToneConnector {
    async fn open(&self, model_id: &str, _credentials: &Credentials) -> Result<RemoteStream> {
        info!(model_id, "opening synthetic tone stream");
        let state = Arc::new(Mutex::new(ToneState {
            playing: false,
            closed: false,
            next_frame: 0,
            frequency: DEFAULT_HZ,
            bpm: None,
            prompt_count: 0,
        }));
        let wake = Arc::new(Notify::new());

        Ok(RemoteStream {
            sender: Box::new(ToneSender {
                state: Arc::clone(&state),
                wake: Arc::clone(&wake),
            }),
            receiver: Box::new(ToneReceiver {
                state,
                wake,
                format: self.format,
                chunk_duration: self.chunk_duration,
                next_due: None,
            }),
        })
    }
}

struct ToneSender {
    state: Arc<Mutex<ToneState>>,
    wake: Arc<Notify>,
}

#[async_trait]
impl StreamSender for ToneSender {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CadenzaError::Transport("tone stream is closed".into()));
        }
        match message {
            OutboundMessage::Play => state.playing = true,
            OutboundMessage::Stop => state.playing = false,
            OutboundMessage::ResetContext => state.next_frame = 0,
            OutboundMessage::SetConfig(config) => {
                state.frequency = tone_frequency(&config);
                state.bpm = config.bpm;
            }
            OutboundMessage::SetPrompts(prompts) => state.prompt_count = prompts.len(),
        }
        debug!(
            playing = state.playing,
            frequency = state.frequency,
            prompts = state.prompt_count,
            "tone stream updated"
        );
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().closed = true;
        self.wake.notify_one();
        debug!("tone stream closed");
        Ok(())
    }
}

struct ToneReceiver {
    state: Arc<Mutex<ToneState>>,
    wake: Arc<Notify>,
    format: PcmFormat,
    chunk_duration: Duration,
    /// When the pending chunk is due. Survives a dropped `recv` so a cancelled
    /// poll resumes the same wait instead of starting over.
    next_due: Option<Instant>,
}

#[async_trait]
impl StreamReceiver for ToneReceiver {
    async fn recv(&mut self) -> Option<Result<InboundMessage>> {
        loop {
            {
                let state = self.state.lock();
                if state.closed {
                    return None;
                }
                if state.playing {
                    break;
                }
            }
            self.next_due = None;
            self.wake.notified().await;
        }

        let chunk_duration = self.chunk_duration;
        let due = *self
            .next_due
            .get_or_insert_with(|| Instant::now() + chunk_duration);
        tokio::time::sleep_until(due).await;
        self.next_due = None;

        let frames =
            (self.chunk_duration.as_secs_f64() * self.format.sample_rate as f64).max(1.0) as usize;
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let spec = ToneSpec {
            frequency: state.frequency,
            amplitude: 0.25,
            bpm: state.bpm,
        };
        let pcm = render_sine(self.format, spec, state.next_frame, frames);
        state.next_frame += frames as u64;
        Some(Ok(InboundMessage::Audio(vec![AudioChunk::new(pcm)])))
    }
}

/// Tonic of the configured scale around middle C, or A4 when unspecified.
fn tone_frequency(config: &GenerationConfig) -> f32 {
    config
        .scale
        .and_then(|scale| scale.tonic_semitone())
        .map(|semitone| MIDDLE_C_HZ * 2f32.powf(semitone as f32 / 12.0))
        .unwrap_or(DEFAULT_HZ)
}
