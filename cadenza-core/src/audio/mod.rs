//! Audio playback via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal output callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (beyond growing its scratch buffer on the very first
//!   oversized period)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by pulling from a [`FrameReader`], whose
//! `pull_into` is wait-free, and by checking an atomic gate that `close()` flips
//! to silence output before any teardown happens.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! [`AudioOutput::open`] is therefore called on the session's background
//! thread, and the returned [`PlaybackHandle`] is dropped on that same thread.

pub mod device;
pub mod tone;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::{
    buffering::FrameReader,
    config::PcmFormat,
    error::{CadenzaError, Result},
};

/// Scratch bytes reserved up front for the callback: 8192 stereo frames.
#[cfg(feature = "audio-cpal")]
const SCRATCH_BYTES: usize = 8192 * 2 * 2;

/// Source of real-time output streams.
pub trait AudioOutput: Send + Sync + 'static {
    /// Start a stream whose callback pulls PCM from `reader`.
    ///
    /// While `gate` is `false` the callback outputs silence without pulling.
    ///
    /// # Errors
    /// Any error means "no local playback"; the session continues headless.
    fn open(
        &self,
        format: PcmFormat,
        reader: FrameReader,
        gate: Arc<AtomicBool>,
    ) -> Result<Box<dyn PlaybackHandle>>;
}

/// A running output stream. Dropping it releases the device.
pub trait PlaybackHandle {
    /// Silence and pause the stream.
    fn stop(&mut self);
}

/// Output that never has a device, for headless sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn open(
        &self,
        _format: PcmFormat,
        _reader: FrameReader,
        _gate: Arc<AtomicBool>,
    ) -> Result<Box<dyn PlaybackHandle>> {
        Err(CadenzaError::NoDefaultOutputDevice)
    }
}

/// The system output device through cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    preferred_device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(preferred_device_name: Option<String>) -> Self {
        Self {
            preferred_device_name,
        }
    }
}

#[cfg(feature = "audio-cpal")]
struct CpalPlayback {
    /// Kept alive so the stream is not dropped prematurely.
    stream: Stream,
    gate: Arc<AtomicBool>,
}

#[cfg(feature = "audio-cpal")]
impl PlaybackHandle for CpalPlayback {
    fn stop(&mut self) {
        self.gate.store(false, Ordering::Release);
        if let Err(e) = self.stream.pause() {
            warn!("failed to pause output stream: {e}");
        }
    }
}

/// Copy s16le bytes into the device's native sample type.
#[cfg(feature = "audio-cpal")]
fn fill_from_reader<T>(
    data: &mut [T],
    reader: &mut FrameReader,
    scratch: &mut Vec<u8>,
    gate: &AtomicBool,
    convert: impl Fn(i16) -> T,
) {
    if !gate.load(Ordering::Acquire) {
        for out in data.iter_mut() {
            *out = convert(0);
        }
        return;
    }
    let bytes = data.len() * 2;
    if scratch.len() < bytes {
        scratch.resize(bytes, 0);
    }
    reader.pull_into(&mut scratch[..bytes]);
    for (out, pair) in data.iter_mut().zip(scratch.chunks_exact(2)) {
        *out = convert(i16::from_le_bytes([pair[0], pair[1]]));
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioOutput for CpalOutput {
    fn open(
        &self,
        format: PcmFormat,
        mut reader: FrameReader,
        gate: Arc<AtomicBool>,
    ) -> Result<Box<dyn PlaybackHandle>> {
        let device = device::select_output_device(self.preferred_device_name.as_deref())?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| CadenzaError::AudioDevice(e.to_string()))?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            sample_format = ?supported.sample_format(),
            "output config selected"
        );

        let gate_cb = Arc::clone(&gate);
        let mut scratch = vec![0u8; SCRATCH_BYTES];

        let stream = match supported.sample_format() {
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    fill_from_reader(data, &mut reader, &mut scratch, &gate_cb, |s| s)
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),

            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    fill_from_reader(data, &mut reader, &mut scratch, &gate_cb, |s| {
                        s as f32 / 32768.0
                    })
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),

            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _info| {
                    fill_from_reader(data, &mut reader, &mut scratch, &gate_cb, |s| {
                        (s as i32 + 32768) as u16
                    })
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),

            fmt => {
                return Err(CadenzaError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| CadenzaError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CadenzaError::AudioStream(e.to_string()))?;

        Ok(Box::new(CpalPlayback { stream, gate }))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioOutput for CpalOutput {
    fn open(
        &self,
        _format: PcmFormat,
        _reader: FrameReader,
        _gate: Arc<AtomicBool>,
    ) -> Result<Box<dyn PlaybackHandle>> {
        Err(CadenzaError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
