//! Sample-rate and channel conversion between device audio and the 16 kHz
//! mono format remote collaborators expect.
//!
//! The linear path is always available; the `high-quality-audio` feature
//! swaps in a sinc resampler for whole-clip conversion.

/// Average interleaved channels down to mono.
#[must_use]
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampling. Adequate for speech-to-text payloads;
/// the sinc path below is preferred when available.
#[must_use]
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((input.len() as f64) / ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - pos.floor()) as f32;
        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Convert a whole mono clip from `from_rate` to `to_rate`.
#[must_use]
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    #[cfg(feature = "high-quality-audio")]
    {
        if let Some(out) = hq::resample_sinc(input, from_rate, to_rate) {
            return out;
        }
        // Construction failure falls through to the linear path.
    }
    resample_linear(input, from_rate, to_rate)
}

#[cfg(feature = "high-quality-audio")]
mod hq {
    use rubato::{
        InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction,
    };

    const CHUNK: usize = 1024;

    pub(super) fn resample_sinc(input: &[f32], from_rate: u32, to_rate: u32) -> Option<Vec<f32>> {
        let ratio = f64::from(to_rate) / f64::from(from_rate);
        let params = InterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: InterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK, 1).ok()?;

        let expected = ((input.len() as f64) * ratio).round() as usize;
        let mut out = Vec::with_capacity(expected + CHUNK);
        let mut chunk = vec![0.0f32; CHUNK];
        for block in input.chunks(CHUNK) {
            chunk[..block.len()].copy_from_slice(block);
            // Zero-pad the tail so the fixed-size resampler accepts it.
            chunk[block.len()..].iter_mut().for_each(|s| *s = 0.0);
            let frames = resampler.process(&[chunk.clone()], None).ok()?;
            out.extend_from_slice(&frames[0]);
        }
        out.truncate(expected);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_passthrough_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(to_mono(&samples, 1), samples);
    }

    #[test]
    fn stereo_downmix_averages_pairs() {
        let samples = vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(to_mono(&samples, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn equal_rates_are_a_copy() {
        let samples = vec![0.1, 0.2];
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn downsampling_halves_the_length() {
        let input: Vec<f32> = (0..3200).map(|i| (i as f32 / 3200.0).sin()).collect();
        let out = resample_linear(&input, 32_000, 16_000);
        let expected = input.len() / 2;
        assert!((out.len() as i64 - expected as i64).unsigned_abs() <= 2);
    }

    #[test]
    fn upsampling_preserves_a_constant_signal() {
        let input = vec![0.25f32; 160];
        let out = resample_linear(&input, 8_000, 16_000);
        assert!(out.len() >= 318);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn empty_input_stays_empty() {
        assert!(resample(&[], 48_000, 16_000).is_empty());
    }

    #[rstest::rstest]
    #[case(48_000, 16_000)]
    #[case(44_100, 16_000)]
    #[case(16_000, 24_000)]
    #[case(8_000, 16_000)]
    fn output_length_tracks_rate_ratio(#[case] from: u32, #[case] to: u32) {
        // 100 ms of input should come out as ~100 ms at the new rate.
        let input = vec![0.1f32; (from / 10) as usize];
        let out = resample_linear(&input, from, to);
        let expected = i64::from(to / 10);
        assert!((out.len() as i64 - expected).abs() <= 2);
    }
}
