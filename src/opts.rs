use std::path::PathBuf;
use std::time::Duration;

use crate::model::LabelMap;

/// File name of the serialized classifier.
pub const MODEL_FILE_NAME: &str = "tickcheck_model.json";

/// Library-level configuration for a [`crate::Detector`].
///
/// Binaries map their flags into it; services and tests build it directly.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Candidate model locations, tried in order. The first that loads wins.
    pub model_paths: Vec<PathBuf>,

    /// Parent directory for per-request scratch directories.
    ///
    /// When `None`, the OS temp directory is used.
    pub temp_root: Option<PathBuf>,

    /// External transcoder used by the subprocess decode strategy.
    pub transcoder: TranscoderOpts,

    /// Explicit class-index mapping.
    ///
    /// When `None`, the mapping comes from the model's class names, falling back to
    /// 0 → counterfeit, 1 → genuine.
    pub label_map: Option<LabelMap>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            model_paths: default_model_paths(),
            temp_root: None,
            transcoder: TranscoderOpts::default(),
            label_map: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscoderOpts {
    /// Program to run; resolved through `PATH` when not absolute.
    pub program: PathBuf,

    /// Wall-clock budget for one transcode. Expiry fails that strategy.
    pub timeout: Duration,
}

impl Default for TranscoderOpts {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Default candidate model paths, relative to the working directory.
pub fn default_model_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("model").join(MODEL_FILE_NAME),
        PathBuf::from("..").join("model").join(MODEL_FILE_NAME),
        PathBuf::from(MODEL_FILE_NAME),
    ]
}
