//! Mel-frequency cepstral coefficients, averaged over the whole signal.
//!
//! Frames are centred and zero padded, Hann windowed and transformed with a
//! real FFT. The power spectrum goes through a Slaney-normalised triangular
//! mel filterbank, is converted to decibels (clipped 80 dB below the peak)
//! and decorrelated with an orthonormal DCT-II.

use std::f64::consts::PI;

use realfft::RealFftPlanner;
use tracing::warn;

pub const N_MFCC: usize = 13;

const N_FFT: usize = 2048;
const HOP: usize = 512;
const N_MELS: usize = 128;
const TOP_DB: f64 = 80.0;
const AMIN: f64 = 1e-10;

struct MelFilter {
    start: usize,
    weights: Vec<f64>,
}

impl MelFilter {
    fn apply(&self, power: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(&power[self.start..])
            .map(|(w, p)| w * p)
            .sum()
    }
}

/// Mean of each of the first 13 coefficients across frames. An empty
/// signal yields zeros.
pub fn mfcc_mean(samples: &[f32], sample_rate: u32) -> Vec<f64> {
    if samples.is_empty() || sample_rate == 0 {
        return vec![0.0; N_MFCC];
    }

    let filters = mel_filterbank(sample_rate);
    let mut mel_db: Vec<Vec<f64>> = power_spectrogram(samples)
        .iter()
        .map(|power| filters.iter().map(|f| power_to_db(f.apply(power))).collect())
        .collect();
    if mel_db.is_empty() {
        return vec![0.0; N_MFCC];
    }

    let peak = mel_db.iter().flatten().cloned().fold(f64::NEG_INFINITY, f64::max);
    let floor = peak - TOP_DB;
    for value in mel_db.iter_mut().flatten() {
        *value = value.max(floor);
    }

    let mut sums = vec![0.0; N_MFCC];
    for frame in &mel_db {
        for (sum, coefficient) in sums.iter_mut().zip(dct_ii(frame, N_MFCC)) {
            *sum += coefficient;
        }
    }
    let frames = mel_db.len() as f64;
    sums.into_iter().map(|sum| sum / frames).collect()
}

fn power_spectrogram(samples: &[f32]) -> Vec<Vec<f64>> {
    let pad = N_FFT / 2;
    let mut padded = vec![0.0f64; samples.len() + 2 * pad];
    for (dst, src) in padded[pad..].iter_mut().zip(samples) {
        *dst = *src as f64;
    }

    let window: Vec<f64> = (0..N_FFT)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / N_FFT as f64).cos())
        .collect();

    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(N_FFT);
    let mut input = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();

    let n_frames = 1 + (padded.len() - N_FFT) / HOP;
    let mut frames = Vec::with_capacity(n_frames);
    for i in 0..n_frames {
        let frame = &padded[i * HOP..i * HOP + N_FFT];
        for ((dst, x), w) in input.iter_mut().zip(frame).zip(&window) {
            *dst = x * w;
        }
        if let Err(err) = fft.process(&mut input, &mut spectrum) {
            warn!(error = %err, frame = i, "fft failed");
            continue;
        }
        frames.push(spectrum.iter().map(|c| c.norm_sqr()).collect());
    }
    frames
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

fn mel_filterbank(sample_rate: u32) -> Vec<MelFilter> {
    let n_bins = N_FFT / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let bin_hz: Vec<f64> = (0..n_bins).map(|k| k as f64 * sample_rate as f64 / N_FFT as f64).collect();

    let top = hz_to_mel(nyquist);
    let edges: Vec<f64> = (0..N_MELS + 2)
        .map(|i| mel_to_hz(top * i as f64 / (N_MELS + 1) as f64))
        .collect();

    edges
        .windows(3)
        .map(|edge| {
            let (lower, center, upper) = (edge[0], edge[1], edge[2]);
            let norm = 2.0 / (upper - lower);
            let weights: Vec<f64> = bin_hz
                .iter()
                .map(|f| {
                    let rising = (f - lower) / (center - lower);
                    let falling = (upper - f) / (upper - center);
                    rising.min(falling).max(0.0) * norm
                })
                .collect();
            let start = weights.iter().position(|w| *w > 0.0).unwrap_or(n_bins);
            let end = weights.iter().rposition(|w| *w > 0.0).map_or(start, |i| i + 1);
            MelFilter { start, weights: weights[start..end].to_vec() }
        })
        .collect()
}

fn power_to_db(power: f64) -> f64 {
    10.0 * power.max(AMIN).log10()
}

/// Orthonormal DCT-II, first `count` coefficients.
fn dct_ii(values: &[f64], count: usize) -> Vec<f64> {
    let n = values.len() as f64;
    (0..count)
        .map(|k| {
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            let sum: f64 = values
                .iter()
                .enumerate()
                .map(|(i, x)| x * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos())
                .sum();
            sum * scale
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, seconds: f64, sample_rate: u32) -> Vec<f32> {
        let total = (seconds * sample_rate as f64) as usize;
        (0..total)
            .map(|i| (0.5 * (2.0 * PI * freq * i as f64 / sample_rate as f64).sin()) as f32)
            .collect()
    }

    fn distance(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
    }

    #[test]
    fn test_silence() {
        let coefficients = mfcc_mean(&[0.0; 22050], 22050);
        assert_eq!(coefficients.len(), N_MFCC);
        // every band sits at the -100 dB floor, so only c0 is non-zero
        let expected_c0 = -100.0 * (N_MELS as f64).sqrt();
        assert!((coefficients[0] - expected_c0).abs() < 1e-6, "c0 {}", coefficients[0]);
        assert!(coefficients[1..].iter().all(|c| c.abs() < 1e-6), "{coefficients:?}");
    }

    #[test]
    fn test_empty_signal() {
        assert_eq!(mfcc_mean(&[], 22050), vec![0.0; N_MFCC]);
        assert_eq!(mfcc_mean(&[0.1; 10], 0), vec![0.0; N_MFCC]);
    }

    #[test]
    fn test_short_signal_is_padded() {
        let coefficients = mfcc_mean(&sine(440.0, 0.01, 22050), 22050);
        assert_eq!(coefficients.len(), N_MFCC);
        assert!(coefficients.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_timbre_separates_tones() {
        let low = mfcc_mean(&sine(220.0, 1.0, 22050), 22050);
        let low_again = mfcc_mean(&sine(220.0, 1.0, 22050), 22050);
        let high = mfcc_mean(&sine(4000.0, 1.0, 22050), 22050);
        assert_eq!(low, low_again);
        assert!(distance(&low, &high) > 10.0);
    }

    #[test]
    fn test_filterbank_covers_spectrum() {
        let filters = mel_filterbank(22050);
        assert_eq!(filters.len(), N_MELS);
        assert!(filters.iter().all(|f| !f.weights.is_empty()));
        assert!(filters.windows(2).all(|pair| pair[0].start <= pair[1].start));
    }

    #[test]
    fn test_dct_of_constant() {
        let coefficients = dct_ii(&[2.0; 8], 4);
        assert!((coefficients[0] - 2.0 * 8f64.sqrt()).abs() < 1e-9);
        assert!(coefficients[1..].iter().all(|c| c.abs() < 1e-9));
    }
}
