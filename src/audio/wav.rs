//! WAV decoding into planar PCM and encoding of synthesized speech.

use crate::audio::PcmBuffer;
use crate::error::{ModelhostError, Result};
use std::io::{Cursor, Read};
use std::path::Path;

/// Decode WAV data from any reader into a planar buffer.
///
/// Integer formats are normalized to [-1.0, 1.0]; float formats are passed through.
pub fn decode_reader<R: Read>(reader: R) -> Result<PcmBuffer> {
    let mut wav_reader =
        hound::WavReader::new(reader).map_err(|e| ModelhostError::UnsupportedFormat {
            message: format!("Failed to parse WAV data: {}", e),
        })?;

    let spec = wav_reader.spec();
    let channel_count = spec.channels as usize;
    if channel_count == 0 {
        return Err(ModelhostError::UnsupportedFormat {
            message: "WAV header declares zero channels".to_string(),
        });
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => wav_reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            wav_reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    }
    .map_err(|e| ModelhostError::UnsupportedFormat {
        message: format!("Failed to read WAV samples: {}", e),
    })?;

    let frames = interleaved.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for frame in interleaved.chunks_exact(channel_count) {
        for (channel, &sample) in channels.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }

    Ok(PcmBuffer::new(channels, spec.sample_rate))
}

/// Decode an in-memory WAV file.
pub fn decode_wav(bytes: &[u8]) -> Result<PcmBuffer> {
    decode_reader(Cursor::new(bytes))
}

/// Read and decode a WAV file from disk.
pub fn read_wav_file(path: &Path) -> Result<PcmBuffer> {
    let bytes = std::fs::read(path)?;
    decode_wav(&bytes)
}

/// Encode mono samples as a 16-bit PCM WAV file.
///
/// Samples outside [-1.0, 1.0] are clipped.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| ModelhostError::Other(format!("Failed to start WAV encoding: {}", e)))?;

    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        writer
            .write_sample(value)
            .map_err(|e| ModelhostError::Other(format!("Failed to write WAV sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| ModelhostError::Other(format!("Failed to finalize WAV data: {}", e)))?;

    Ok(cursor.into_inner())
}
