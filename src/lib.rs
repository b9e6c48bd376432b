//! `tickcheck` — tell genuine watch movements from counterfeits by how they sound.
//!
//! This crate provides:
//! - A decode cascade that turns browser recordings and uploads into 16 kHz mono samples
//! - A librosa-compatible 30-value feature extractor (MFCC, zero-crossing rate, spectral centroid)
//! - A tree-ensemble classifier loaded from a JSON artifact
//!
//! Most consumers should start with [`Detector`]: build it once from [`Opts`], then call
//! [`Detector::classify`] per upload. Every call cleans up its temporary files before returning.

// High-level API (most consumers should start here).
pub mod detector;
pub mod error;
pub mod opts;

// Decoding: format allow-list, fallback cascade, and the pieces it drives.
pub mod audio_format;
pub mod audio_pipeline;
pub mod cascade;
pub mod decoder;
pub mod transcode;
pub mod wav;

mod decode;
pub mod demux;

// Feature extraction.
pub mod features;
pub mod spectral;

// Model loading and inference.
pub mod classify;
pub mod model;

// Logging configuration for binaries.
#[cfg(feature = "logging")]
pub mod logging;

pub use audio_format::AudioFormat;
pub use classify::{ClassificationResult, Label};
pub use detector::{Detector, ModelStatus, Upload};
pub use error::{AttemptFailure, Error, Result};
pub use features::FeatureVector;
pub use model::{LabelMap, ModelHandle};
pub use opts::Opts;
