//! High-level API: one upload in, one verdict out.
//!
//! `Detector` owns the long-lived, read-only pieces of the pipeline:
//! - the model handle (loaded once; "unavailable" is a state, not an error)
//! - the decode cascade and its strategy table
//! - the feature extractor's precomputed tables
//!
//! Each call to [`Detector::classify`] works in its own temporary directory, which is removed
//! before the call returns, whatever the outcome.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::audio_format::AudioFormat;
use crate::cascade::{Attempt, Cascade, DecodedAudio, Strategy};
use crate::classify::{ClassificationResult, classify};
use crate::error::{Error, Result};
use crate::features::{FeatureExtractor, FeatureVector};
use crate::model::ModelHandle;
use crate::opts::Opts;

/// An uploaded file as received from the caller: original filename plus raw bytes.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, keeping only its file name.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { filename, bytes })
    }
}

/// Diagnostic view of the model slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    Loaded { source: PathBuf },
    Unavailable { reason: String },
}

pub struct Detector<A: Attempt = Strategy> {
    model: ModelHandle,
    cascade: Cascade<A>,
    extractor: FeatureExtractor,
    temp_root: PathBuf,
}

impl Detector<Strategy> {
    /// Build a detector from options.
    ///
    /// Never fails because of the model: if no candidate loads, the detector runs degraded and
    /// every [`Detector::classify`] call returns [`Error::ModelUnavailable`].
    pub fn new(opts: Opts) -> Result<Self> {
        let model = ModelHandle::load_first(&opts.model_paths, opts.label_map);
        let cascade = Cascade::new(opts.transcoder);
        Self::with_parts(model, cascade, opts.temp_root)
    }
}

impl<A: Attempt> Detector<A> {
    /// Assemble a detector from an existing model handle and cascade.
    pub fn with_parts(
        model: ModelHandle,
        cascade: Cascade<A>,
        temp_root: Option<PathBuf>,
    ) -> Result<Self> {
        let temp_root = temp_root.unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&temp_root).map_err(|e| {
            Error::internal(format!(
                "cannot create temp root {}: {e}",
                temp_root.display()
            ))
        })?;

        Ok(Self {
            model,
            cascade,
            extractor: FeatureExtractor::new(),
            temp_root,
        })
    }

    pub fn model_status(&self) -> ModelStatus {
        match &self.model {
            ModelHandle::Loaded { source, .. } => ModelStatus::Loaded {
                source: source.clone(),
            },
            ModelHandle::Unavailable { reason } => ModelStatus::Unavailable {
                reason: reason.clone(),
            },
        }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Decode, extract, and classify one upload.
    pub fn classify(&self, upload: &Upload) -> Result<ClassificationResult> {
        self.run("classify", upload, true, |features| {
            classify(&self.model, features)
        })
    }

    /// Decode and extract only; works without a model.
    pub fn extract(&self, upload: &Upload) -> Result<FeatureVector> {
        self.run("extract", upload, false, |features| Ok(*features))
    }

    fn run<T>(
        &self,
        op: &'static str,
        upload: &Upload,
        needs_model: bool,
        finish: impl FnOnce(&FeatureVector) -> Result<T>,
    ) -> Result<T> {
        let request_id = Uuid::new_v4();
        let span = info_span!("request", %request_id, op, filename = %upload.filename);
        let _guard = span.enter();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pipeline(request_id, upload, needs_model, finish)
        }))
        .unwrap_or_else(|payload| Err(Error::internal(panic_message(payload.as_ref()))));

        match &outcome {
            Ok(_) => info!("request completed"),
            Err(err) if err.is_caller_fault() => {
                warn!(kind = err.kind(), error = %err, "request rejected")
            }
            Err(err) => error!(kind = err.kind(), error = %err, "request failed"),
        }
        outcome
    }

    fn pipeline<T>(
        &self,
        request_id: Uuid,
        upload: &Upload,
        needs_model: bool,
        finish: impl FnOnce(&FeatureVector) -> Result<T>,
    ) -> Result<T> {
        let format =
            AudioFormat::from_filename(&upload.filename).ok_or_else(|| Error::UnsupportedFormat {
                filename: upload.filename.clone(),
            })?;

        if upload.bytes.is_empty() {
            return Err(Error::EmptyInput);
        }

        if needs_model {
            self.model.loaded()?;
        }

        let workdir = RequestDir::create(&self.temp_root)?;
        let result = self
            .persist(workdir.path(), request_id, format, &upload.bytes)
            .and_then(|input| self.cascade.decode(&input, format, workdir.path()))
            .and_then(|audio| self.features(&audio))
            .and_then(|features| finish(&features));
        workdir.close();
        result
    }

    fn persist(
        &self,
        dir: &Path,
        request_id: Uuid,
        format: AudioFormat,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = dir.join(format!("{request_id}.{}", format.extension()));
        fs::write(&path, bytes)
            .map_err(|e| Error::internal(format!("failed to persist upload: {e}")))?;
        Ok(path)
    }

    fn features(&self, audio: &DecodedAudio) -> Result<FeatureVector> {
        info!(
            duration_ms = audio.duration().as_millis() as u64,
            sample_rate = audio.sample_rate(),
            "decoded"
        );
        self.extractor.extract(audio)
    }
}

/// Per-request scratch directory. Removed by [`RequestDir::close`] or, on unwind, by drop.
struct RequestDir(TempDir);

impl RequestDir {
    fn create(root: &Path) -> Result<Self> {
        tempfile::Builder::new()
            .prefix("request-")
            .tempdir_in(root)
            .map(Self)
            .map_err(|e| Error::internal(format!("failed to create request directory: {e}")))
    }

    fn path(&self) -> &Path {
        self.0.path()
    }

    fn close(self) {
        let path = self.0.path().to_path_buf();
        if let Err(err) = self.0.close() {
            warn!(path = %path.display(), error = %err, "failed to remove request directory");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    format!("panic in pipeline: {detail}")
}
