//! WAV export of session recordings.
//!
//! The recording is raw s16le PCM, so export is a straight hand-off to
//! `hound` with a 16-bit integer spec. Mono and stereo files get the canonical
//! 44-byte header. A trailing partial frame is dropped. RIFF sizes are 32-bit,
//! so recordings past [`MAX_WAV_DATA_BYTES`] are refused rather than written
//! with a truncated header.

use std::io::{Cursor, Seek, Write};
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::config::{PcmFormat, BYTES_PER_SAMPLE};
use crate::error::{CadenzaError, Result};

/// Header size for PCM files of up to two channels.
pub const WAV_HEADER_LEN: usize = 44;

/// Largest data chunk whose RIFF length still fits in a `u32`.
pub const MAX_WAV_DATA_BYTES: usize = u32::MAX as usize - (WAV_HEADER_LEN - 8);

fn wav_spec(format: PcmFormat) -> WavSpec {
    WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: BYTES_PER_SAMPLE * 8,
        sample_format: SampleFormat::Int,
    }
}

fn write_samples<W: Write + Seek>(
    mut writer: WavWriter<W>,
    pcm: &[u8],
    format: PcmFormat,
) -> Result<()> {
    let whole_frames = pcm.len() - pcm.len() % format.bytes_per_frame().max(1);
    for sample in pcm[..whole_frames].chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}

fn check_size(data_len: usize) -> Result<()> {
    if data_len > MAX_WAV_DATA_BYTES {
        return Err(CadenzaError::RecordingTooLarge(data_len));
    }
    Ok(())
}

/// `pcm` wrapped in a complete WAV file.
pub fn encode_wav(pcm: &[u8], format: PcmFormat) -> Result<Vec<u8>> {
    check_size(pcm.len())?;
    let mut buffer = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    {
        let writer = WavWriter::new(Cursor::new(&mut buffer), wav_spec(format))?;
        write_samples(writer, pcm, format)?;
    }
    Ok(buffer)
}

pub fn write_wav(path: impl AsRef<Path>, pcm: &[u8], format: PcmFormat) -> Result<()> {
    check_size(pcm.len())?;
    let writer = WavWriter::create(path.as_ref(), wav_spec(format))?;
    write_samples(writer, pcm, format)
}
