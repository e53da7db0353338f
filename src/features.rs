//! Acoustic features computed from a mono PCM waveform.
//!
//! The extractor is a seam: the batch runner only sees `FeatureExtractor`,
//! so a richer analysis can be plugged in without touching the pipeline.

pub mod mfcc;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AnalysisError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

pub type AudioFeatures = BTreeMap<String, FeatureValue>;

pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, samples: &[f32], sample_rate: u32) -> AudioFeatures;
}

const FRAME: usize = 1024;
const HOP: usize = 512;
const MIN_BPM: f64 = 70.0;
const MAX_BPM: f64 = 180.0;

/// Tempo, loudness, brightness and noisiness from the time domain, plus the
/// mean MFCC vector for timbre.
pub struct BasicFeatureExtractor;

impl FeatureExtractor for BasicFeatureExtractor {
    fn extract(&self, samples: &[f32], sample_rate: u32) -> AudioFeatures {
        let mut features = AudioFeatures::new();
        let zcr = zero_crossing_rate(samples);
        let duration = if sample_rate == 0 { 0.0 } else { samples.len() as f64 / sample_rate as f64 };

        features.insert(String::from("tempo"), FeatureValue::Scalar(estimate_tempo(samples, sample_rate)));
        features.insert(String::from("rms_mean"), FeatureValue::Scalar(rms_energy(samples)));
        features.insert(String::from("zcr_mean"), FeatureValue::Scalar(zcr));
        // zero crossings track the spectral centre of mass closely enough
        // for coarse brightness comparisons
        features.insert(String::from("spectral_centroid_mean"), FeatureValue::Scalar(zcr * sample_rate as f64 / 2.0));
        features.insert(String::from("duration"), FeatureValue::Scalar(duration));
        features.insert(String::from("mfcc_mean"), FeatureValue::Vector(mfcc::mfcc_mean(samples, sample_rate)));

        debug!(?features, "extracted features");
        features
    }
}

/// Reads a 16-bit (or float) WAV file as normalised mono samples.
pub fn load_waveform(path: &Path) -> Result<(Vec<f32>, u32), AnalysisError> {
    let waveform_error = |source: hound::Error| AnalysisError::Waveform { path: path.to_path_buf(), source };
    let mut reader = hound::WavReader::open(path).map_err(waveform_error)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(waveform_error)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(waveform_error)?
        },
    };

    let channels = usize::from(spec.channels.max(1));
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((samples, spec.sample_rate))
}

fn rms_energy(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

fn zero_crossing_rate(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f64 / samples.len() as f64
}

/// Onset-strength autocorrelation over the 70–180 BPM range. Returns 0 for
/// signals without any onsets.
fn estimate_tempo(samples: &[f32], sample_rate: u32) -> f64 {
    if sample_rate == 0 || samples.len() < FRAME {
        return 0.0;
    }

    let energies: Vec<f64> = (0..=(samples.len() - FRAME) / HOP)
        .map(|i| samples[i * HOP..i * HOP + FRAME].iter().map(|s| (*s as f64).powi(2)).sum::<f64>())
        .collect();
    let onsets: Vec<f64> = energies.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
    if onsets.iter().all(|o| *o == 0.0) {
        return 0.0;
    }

    let frames_per_minute = 60.0 * sample_rate as f64 / HOP as f64;
    let min_lag = (frames_per_minute / MAX_BPM).floor().max(1.0) as usize;
    let max_lag = (frames_per_minute / MIN_BPM).ceil() as usize;

    let mut best: Option<(usize, f64)> = None;
    for lag in min_lag..=max_lag.min(onsets.len().saturating_sub(1)) {
        let score: f64 = onsets.iter().zip(&onsets[lag..]).map(|(a, b)| a * b).sum::<f64>()
            / (onsets.len() - lag) as f64;
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((lag, score));
        }
    }

    match best {
        Some((lag, score)) if score > 0.0 => frames_per_minute / lag as f64,
        _ => 0.0,
    }
}
