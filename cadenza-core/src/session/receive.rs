//! Receive loop: remote stream → playback ring + recording.
//!
//! ## Per message
//!
//! ```text
//! 1. Await the next inbound message (or a spill-pump tick)
//! 2. Audio batch → for each chunk, in order:
//!    a. push into the playback ring (if local playback is active)
//!    b. append a copy to the recording
//! 3. Anything else → logged and ignored
//! 4. Stream end / receive error → connection lost, loop exits for good
//! ```
//!
//! Runs as a task on the session's background runtime. A new loop instance is
//! only ever created by a new `connect()`.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    buffering::{chunk::AudioChunk, recording::RecordingAccumulator},
    remote::{InboundMessage, StreamReceiver},
    session::{PlaybackFeed, SessionSignals},
};

/// Log the buffer level every this many chunks.
const LOG_EVERY_CHUNKS: u64 = 20;

#[derive(Debug, Default)]
pub struct StreamDiagnostics {
    pub messages_in: AtomicU64,
    pub chunks_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl StreamDiagnostics {
    pub fn reset(&self) {
        self.messages_in.store(0, Ordering::Relaxed);
        self.chunks_in.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.transport_errors.store(0, Ordering::Relaxed);
    }
}

/// All context the receive loop needs, passed as one struct so the spawn stays tidy.
pub struct ReceiveContext {
    pub receiver: Box<dyn StreamReceiver>,
    pub feed: PlaybackFeed,
    pub recording: Arc<RecordingAccumulator>,
    pub signals: SessionSignals,
    /// Delay before the first receive, letting the remote finish its own setup.
    pub warm_up: Duration,
    pub pump_interval: Duration,
}

/// Run until the stream ends, errors, or the session clears its connected flag.
pub async fn run(mut ctx: ReceiveContext) {
    info!("receive loop started");
    if !ctx.warm_up.is_zero() {
        tokio::time::sleep(ctx.warm_up).await;
    }

    let mut pump = tokio::time::interval(ctx.pump_interval);
    pump.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut chunk_count = 0u64;

    let exit_reason = loop {
        if !ctx.signals.is_connected() {
            break None;
        }

        tokio::select! {
            message = ctx.receiver.recv() => match message {
                Some(Ok(InboundMessage::Audio(chunks))) => {
                    ctx.signals
                        .diagnostics
                        .messages_in
                        .fetch_add(1, Ordering::Relaxed);
                    for chunk in chunks {
                        chunk_count += 1;
                        ingest(&ctx, &chunk, chunk_count);
                    }
                }
                Some(Ok(InboundMessage::Other(kind))) => {
                    ctx.signals
                        .diagnostics
                        .messages_in
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(kind = kind.as_str(), "ignoring non-audio message");
                }
                Some(Err(e)) => {
                    ctx.signals
                        .diagnostics
                        .transport_errors
                        .fetch_add(1, Ordering::Relaxed);
                    error!("error receiving audio: {e}");
                    break Some(format!("receive failed: {e}"));
                }
                None => break Some("stream ended".to_string()),
            },
            _ = pump.tick() => pump_spill(&ctx),
        }
    };

    match exit_reason {
        Some(reason) => {
            if ctx.signals.mark_connection_lost(&reason) {
                warn!(reason = reason.as_str(), "receive loop ended — connection lost");
            }
        }
        None => debug!("receive loop observed disconnect"),
    }
    ctx.signals.playing.store(false, Ordering::Release);
    info!(chunks = chunk_count, "receive loop stopped");
}

/// Move spilled bytes into the ring as the output callback frees space.
fn pump_spill(ctx: &ReceiveContext) {
    let mut feed = ctx.feed.lock();
    if let Some(writer) = feed.as_mut() {
        writer.pump();
    }
}

fn ingest(ctx: &ReceiveContext, chunk: &AudioChunk, chunk_count: u64) {
    if chunk.is_empty() {
        return;
    }
    let bytes = chunk.as_bytes();

    let buffered = {
        let mut feed = ctx.feed.lock();
        feed.as_mut().map(|writer| {
            writer.push(bytes);
            writer.buffered_bytes()
        })
    };
    ctx.recording.append(bytes);

    let diagnostics = &ctx.signals.diagnostics;
    diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);
    diagnostics
        .bytes_in
        .fetch_add(bytes.len() as u64, Ordering::Relaxed);

    if chunk_count % LOG_EVERY_CHUNKS == 0 {
        debug!(
            chunk_bytes = bytes.len(),
            buffered_bytes = ?buffered,
            recorded_bytes = ctx.recording.len(),
            "audio received"
        );
    }
}
