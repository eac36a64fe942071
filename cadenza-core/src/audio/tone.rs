//! Sine tone synthesis into s16le PCM.

use std::f32::consts::TAU;
use std::time::Duration;

use crate::config::PcmFormat;

pub const TEST_TONE_HZ: f32 = 440.0;
pub const TEST_TONE_AMPLITUDE: f32 = 0.3;

/// Parameters for [`render_sine`].
#[derive(Debug, Clone, Copy)]
pub struct ToneSpec {
    pub frequency: f32,
    pub amplitude: f32,
    /// When set, the level pulses once per beat.
    pub bpm: Option<u32>,
}

/// Render `frames` frames starting at absolute frame `start_frame`, the same
/// sample on every channel.
pub fn render_sine(format: PcmFormat, spec: ToneSpec, start_frame: u64, frames: usize) -> Vec<u8> {
    let rate = format.sample_rate.max(1) as f64;
    let channels = format.channels as usize;
    let mut out = Vec::with_capacity(frames * format.bytes_per_frame());

    for i in 0..frames {
        let frame = start_frame + i as u64;
        let t = frame as f64 / rate;
        // Cycle position in f64 so long sessions keep their precision.
        let cycle = (spec.frequency as f64 * t).fract() as f32;
        let mut gain = spec.amplitude;
        if let Some(bpm) = spec.bpm {
            let beat_pos = (t * bpm as f64 / 60.0).fract() as f32;
            gain *= 0.6 + 0.4 * (1.0 - beat_pos);
        }
        let value = ((TAU * cycle).sin() * gain * i16::MAX as f32) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

/// The diagnostic tone used to check local output: 440 Hz at 0.3 full scale.
pub fn test_tone(format: PcmFormat, duration: Duration) -> Vec<u8> {
    let frames = (duration.as_secs_f64() * format.sample_rate as f64) as usize;
    render_sine(
        format,
        ToneSpec {
            frequency: TEST_TONE_HZ,
            amplitude: TEST_TONE_AMPLITUDE,
            bpm: None,
        },
        0,
        frames,
    )
}
