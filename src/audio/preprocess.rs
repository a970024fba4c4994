//! Conversion of arbitrary PCM input into the 16 kHz mono buffer speech models expect.
//!
//! Resampling is plain linear interpolation between the two nearest source
//! samples. It is cheap and deterministic but not band-limited: downsampling
//! can alias content above the target Nyquist frequency. Speech recognition
//! tolerates this well; do not reuse it for playback-quality conversion.

use crate::audio::PcmBuffer;
use crate::defaults::TARGET_SAMPLE_RATE;
use crate::error::{ModelhostError, Result};

/// Equal-power stereo-to-mono scale factor.
const STEREO_SCALE: f64 = std::f64::consts::SQRT_2;

/// Convert `buffer` into mono samples at the speech model rate (16 kHz).
pub fn to_model_input(buffer: &PcmBuffer) -> Result<Vec<f32>> {
    preprocess(buffer, TARGET_SAMPLE_RATE)
}

/// Mix `buffer` down to mono and resample it to `target_rate`.
///
/// Same input always yields bit-identical output.
///
/// # Errors
/// Returns `UnsupportedFormat` for more than two channels, zero channels,
/// channels of unequal length, or a zero sample rate.
pub fn preprocess(buffer: &PcmBuffer, target_rate: u32) -> Result<Vec<f32>> {
    if buffer.sample_rate == 0 || target_rate == 0 {
        return Err(ModelhostError::UnsupportedFormat {
            message: "sample rate must be positive".to_string(),
        });
    }

    let mono = mixdown(buffer)?;

    if buffer.sample_rate == target_rate {
        return Ok(mono);
    }

    Ok(resample_linear(&mono, buffer.sample_rate, target_rate))
}

/// Mix one or two channels down to a single channel.
///
/// Two channels are summed with equal power: `sqrt(2) * (l + r) / 2`.
pub fn mixdown(buffer: &PcmBuffer) -> Result<Vec<f32>> {
    match buffer.channels.as_slice() {
        [] => Err(ModelhostError::UnsupportedFormat {
            message: "audio has no channels".to_string(),
        }),
        [mono] => Ok(mono.clone()),
        [left, right] => {
            if left.len() != right.len() {
                return Err(ModelhostError::UnsupportedFormat {
                    message: format!(
                        "channel lengths differ ({} vs {})",
                        left.len(),
                        right.len()
                    ),
                });
            }
            Ok(left
                .iter()
                .zip(right)
                .map(|(&l, &r)| (STEREO_SCALE * (l as f64 + r as f64) / 2.0) as f32)
                .collect())
        }
        channels => Err(ModelhostError::UnsupportedFormat {
            message: format!("{} channels (only mono and stereo are supported)", channels.len()),
        }),
    }
}

/// Linear-interpolation resampling.
///
/// Produces `round(N * to_rate / from_rate)` samples. For output index `i`
/// the source position is `t = i * from_rate / to_rate`, interpolated between
/// `floor(t)` and `min(floor(t) + 1, N - 1)`.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }

    let last = samples.len() - 1;
    let output_len = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let step = from_rate as f64 / to_rate as f64;

    (0..output_len)
        .map(|i| {
            let position = i as f64 * step;
            let index1 = (position.floor() as usize).min(last);
            let index2 = (index1 + 1).min(last);
            let fraction = position - index1 as f64;
            ((1.0 - fraction) * samples[index1] as f64 + fraction * samples[index2] as f64) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_stereo_channels_cancel() {
        let buffer = PcmBuffer::new(vec![vec![1.0, 1.0, 1.0], vec![-1.0, -1.0, -1.0]], 16000);
        let output = to_model_input(&buffer).unwrap();
        assert_eq!(output, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn stereo_mixdown_is_equal_power() {
        let buffer = PcmBuffer::new(vec![vec![0.5], vec![0.5]], 16000);
        let output = mixdown(&buffer).unwrap();
        let expected = (std::f64::consts::SQRT_2 * 1.0 / 2.0) as f32;
        assert_eq!(output, vec![expected]);
    }

    #[test]
    fn mono_passes_through_unchanged() {
        let samples = vec![0.1, -0.2, 0.3, -0.4];
        let buffer = PcmBuffer::mono(samples.clone(), 16000);
        assert_eq!(to_model_input(&buffer).unwrap(), samples);
    }

    #[test]
    fn more_than_two_channels_is_unsupported() {
        let buffer = PcmBuffer::new(vec![vec![0.0; 4]; 6], 48000);
        let result = to_model_input(&buffer);
        assert!(matches!(
            result,
            Err(ModelhostError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn no_channels_is_unsupported() {
        let buffer = PcmBuffer::new(Vec::new(), 16000);
        assert!(matches!(
            mixdown(&buffer),
            Err(ModelhostError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn mismatched_channel_lengths_are_unsupported() {
        let buffer = PcmBuffer::new(vec![vec![0.0; 4], vec![0.0; 3]], 16000);
        assert!(mixdown(&buffer).is_err());
    }

    #[test]
    fn zero_sample_rate_is_unsupported() {
        let buffer = PcmBuffer::mono(vec![0.0; 4], 0);
        assert!(to_model_input(&buffer).is_err());
    }

    #[test]
    fn stereo_44100_resamples_to_expected_length() {
        for n in [1usize, 7, 100, 44100, 44101, 12345] {
            let buffer = PcmBuffer::new(vec![vec![0.25; n], vec![0.25; n]], 44100);
            let output = to_model_input(&buffer).unwrap();
            let expected = (n as f64 * 16000.0 / 44100.0).round() as usize;
            assert_eq!(output.len(), expected, "length mismatch for n={n}");
        }
    }

    #[test]
    fn upsample_interpolates_between_neighbours() {
        let output = resample_linear(&[0.0, 1.0, 2.0], 8000, 16000);
        assert_eq!(output.len(), 6);
        assert_eq!(output[0], 0.0);
        assert_eq!(output[1], 0.5);
        assert_eq!(output[2], 1.0);
        assert_eq!(output[3], 1.5);
        assert_eq!(output[4], 2.0);
        // Past the last sample, index2 clamps to N - 1.
        assert_eq!(output[5], 2.0);
    }

    #[test]
    fn downsample_picks_every_other_sample() {
        let samples: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let output = resample_linear(&samples, 16000, 8000);
        assert_eq!(output, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn resample_preserves_constant_signal() {
        let output = resample_linear(&vec![0.5; 441], 44100, 16000);
        assert!(output.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn resample_empty_input() {
        assert!(resample_linear(&[], 44100, 16000).is_empty());
    }

    #[test]
    fn resample_single_sample() {
        let output = resample_linear(&[0.7], 8000, 16000);
        assert_eq!(output, vec![0.7, 0.7]);
    }

    #[test]
    fn preprocessing_is_deterministic() {
        let left: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.013).sin()).collect();
        let right: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.029).cos()).collect();
        let buffer = PcmBuffer::new(vec![left, right], 44100);

        let first = to_model_input(&buffer).unwrap();
        let second = to_model_input(&buffer).unwrap();
        let first_bits: Vec<u32> = first.iter().map(|s| s.to_bits()).collect();
        let second_bits: Vec<u32> = second.iter().map(|s| s.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
    }
}
