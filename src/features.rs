//! The 30-value acoustic summary fed to the classifier.
//!
//! Layout (fixed, shared with the training pipeline):
//!
//! | index  | column                   |
//! |--------|--------------------------|
//! | 0..13  | `mfcc_mean_0..12`        |
//! | 13..26 | `mfcc_std_0..12`         |
//! | 26     | `zcr_mean`               |
//! | 27     | `zcr_std`                |
//! | 28     | `spec_cent_mean`         |
//! | 29     | `spec_cent_std`          |

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::cascade::DecodedAudio;
use crate::error::{Error, Result};
use crate::spectral::{FrameSeries, N_MFCC, SpectralAnalyzer};

pub const FEATURE_LEN: usize = 30;

const MFCC_MEAN: usize = 0;
const MFCC_STD: usize = MFCC_MEAN + N_MFCC;
const ZCR_MEAN: usize = MFCC_STD + N_MFCC;
const ZCR_STD: usize = ZCR_MEAN + 1;
const SPEC_CENT_MEAN: usize = ZCR_STD + 1;
const SPEC_CENT_STD: usize = SPEC_CENT_MEAN + 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f32; FEATURE_LEN]);

impl FeatureVector {
    pub const COLUMN_NAMES: [&'static str; FEATURE_LEN] = [
        "mfcc_mean_0",
        "mfcc_mean_1",
        "mfcc_mean_2",
        "mfcc_mean_3",
        "mfcc_mean_4",
        "mfcc_mean_5",
        "mfcc_mean_6",
        "mfcc_mean_7",
        "mfcc_mean_8",
        "mfcc_mean_9",
        "mfcc_mean_10",
        "mfcc_mean_11",
        "mfcc_mean_12",
        "mfcc_std_0",
        "mfcc_std_1",
        "mfcc_std_2",
        "mfcc_std_3",
        "mfcc_std_4",
        "mfcc_std_5",
        "mfcc_std_6",
        "mfcc_std_7",
        "mfcc_std_8",
        "mfcc_std_9",
        "mfcc_std_10",
        "mfcc_std_11",
        "mfcc_std_12",
        "zcr_mean",
        "zcr_std",
        "spec_cent_mean",
        "spec_cent_std",
    ];

    pub fn as_array(&self) -> &[f32; FEATURE_LEN] {
        &self.0
    }

    pub fn mfcc_mean(&self) -> &[f32] {
        &self.0[MFCC_MEAN..MFCC_STD]
    }

    pub fn mfcc_std(&self) -> &[f32] {
        &self.0[MFCC_STD..ZCR_MEAN]
    }

    pub fn zcr_mean(&self) -> f32 {
        self.0[ZCR_MEAN]
    }

    pub fn zcr_std(&self) -> f32 {
        self.0[ZCR_STD]
    }

    pub fn spec_cent_mean(&self) -> f32 {
        self.0[SPEC_CENT_MEAN]
    }

    pub fn spec_cent_std(&self) -> f32 {
        self.0[SPEC_CENT_STD]
    }

    /// `(column name, value)` pairs in layout order.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        Self::COLUMN_NAMES.iter().copied().zip(self.0.iter().copied())
    }
}

impl TryFrom<&[f32]> for FeatureVector {
    type Error = Error;

    fn try_from(values: &[f32]) -> Result<Self> {
        let arr: [f32; FEATURE_LEN] = values.try_into().map_err(|_| {
            Error::invalid_input(format!(
                "feature vector has {} values, expected {FEATURE_LEN}",
                values.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FEATURE_LEN))?;
        for (name, value) in self.named() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

/// Computes [`FeatureVector`]s. Cheap to share; holds only precomputed tables.
#[derive(Default)]
pub struct FeatureExtractor {
    analyzer: SpectralAnalyzer,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(&self, audio: &DecodedAudio) -> Result<FeatureVector> {
        if audio.sample_rate() != TARGET_SAMPLE_RATE {
            return Err(Error::invalid_input(format!(
                "expected {TARGET_SAMPLE_RATE} Hz audio, got {} Hz",
                audio.sample_rate()
            )));
        }

        let samples = audio.samples();
        if let Some(idx) = samples.iter().position(|s| !s.is_finite()) {
            return Err(Error::features(format!(
                "audio buffer is not finite everywhere (first bad sample at {idx})"
            )));
        }

        let series = self.analyzer.analyze(samples);
        let vector = assemble(&series)?;

        debug!(
            frames = series.zcr.len(),
            zcr_mean = vector.zcr_mean(),
            spec_cent_mean = vector.spec_cent_mean(),
            "extracted features"
        );
        Ok(vector)
    }
}

fn assemble(series: &FrameSeries) -> Result<FeatureVector> {
    if series.mfcc.is_empty() || series.zcr.is_empty() || series.centroid.is_empty() {
        return Err(Error::features("descriptor series are empty"));
    }

    let mut out = [0.0f32; FEATURE_LEN];

    for c in 0..N_MFCC {
        let (mean, std) = mean_std(series.mfcc.iter().map(|frame| frame[c]));
        out[MFCC_MEAN + c] = mean as f32;
        out[MFCC_STD + c] = std as f32;
    }

    let (zcr_mean, zcr_std) = mean_std(series.zcr.iter().copied());
    out[ZCR_MEAN] = zcr_mean as f32;
    out[ZCR_STD] = zcr_std as f32;

    let (cent_mean, cent_std) = mean_std(series.centroid.iter().copied());
    out[SPEC_CENT_MEAN] = cent_mean as f32;
    out[SPEC_CENT_STD] = cent_std as f32;

    if let Some(idx) = out.iter().position(|v| !v.is_finite()) {
        return Err(Error::features(format!(
            "non-finite value in column {}",
            FeatureVector::COLUMN_NAMES[idx]
        )));
    }

    Ok(FeatureVector(out))
}

/// Mean and population standard deviation.
fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (n, sum) = values.clone().fold((0usize, 0.0f64), |(n, s), v| (n + 1, s + v));
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = sum / n as f64;
    let var = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
    (mean, var.sqrt())
}
