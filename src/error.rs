use std::fmt;

use thiserror::Error;

/// tickcheck's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// One failed decode strategy, kept for operator diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub strategy: &'static str,
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

/// tickcheck's crate-wide error type.
///
/// `Display` carries operator-facing detail (library error text, strategy reasons) and is meant
/// for logs. Anything shown to an end user should go through [`Error::user_message`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported file format: {filename:?}")]
    UnsupportedFormat { filename: String },

    #[error("uploaded audio is empty")]
    EmptyInput,

    #[error("every decode strategy failed: [{}]", join_attempts(.attempts))]
    DecodeExhausted { attempts: Vec<AttemptFailure> },

    #[error("invalid decoded audio: {0}")]
    InvalidInput(String),

    #[error("feature computation failed: {0}")]
    FeatureComputationFailed(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("internal fault: {0}")]
    InternalFault(String),
}

impl Error {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn features(message: impl Into<String>) -> Self {
        Self::FeatureComputationFailed(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::InternalFault(message.into())
    }

    /// Stable snake_case tag for this failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::EmptyInput => "empty_input",
            Self::DecodeExhausted { .. } => "decode_exhausted",
            Self::InvalidInput(_) => "invalid_input",
            Self::FeatureComputationFailed(_) => "feature_computation_failed",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::InternalFault(_) => "internal_fault",
        }
    }

    /// Whether the failure comes from what was uploaded rather than from the pipeline.
    pub fn is_caller_fault(&self) -> bool {
        matches!(self, Self::UnsupportedFormat { .. } | Self::EmptyInput)
    }

    /// Generic message that is safe to show to whoever uploaded the file.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat { .. } => {
                "Invalid file type. Please upload WAV, MP3, M4A, FLAC, OGG, or WebM files."
            }
            Self::EmptyInput => "The uploaded file is empty. Please choose an audio file.",
            Self::DecodeExhausted { .. }
            | Self::InvalidInput(_)
            | Self::FeatureComputationFailed(_) => {
                "Error processing audio file. Please try a different file."
            }
            Self::ModelUnavailable(_) => "Model not available. Please try again later.",
            Self::InternalFault(_) => "Error processing audio file. Please try again.",
        }
    }
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::InternalFault(err.to_string())
    }
}
