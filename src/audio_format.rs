use std::fmt;

/// The upload formats the pipeline accepts.
///
/// The allow-list is closed: anything that doesn't map onto one of these variants is rejected
/// before any bytes are written or decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum AudioFormat {
    Wav,
    Mp3,
    M4a,
    Flac,
    Ogg,
    #[cfg_attr(feature = "cli", value(name = "webm"))]
    WebM,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 6] = [
        AudioFormat::Wav,
        AudioFormat::Mp3,
        AudioFormat::M4a,
        AudioFormat::Flac,
        AudioFormat::Ogg,
        AudioFormat::WebM,
    ];

    /// Parse a bare extension (`"wav"`, `".WebM"`). Case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim().trim_start_matches('.');
        Self::ALL
            .into_iter()
            .find(|f| f.extension().eq_ignore_ascii_case(ext))
    }

    /// Parse the extension after the final `.` of an uploaded filename.
    ///
    /// A filename without a `.` has no declared format and is rejected.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::WebM => "webm",
        }
    }

    /// Container hint handed to the symphonia probe.
    pub fn container_hint(self) -> &'static str {
        match self {
            Self::M4a => "mp4",
            Self::WebM => "webm",
            other => other.extension(),
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::M4a => "audio/mp4",
            Self::Flac => "audio/flac",
            Self::Ogg => "audio/ogg",
            Self::WebM => "audio/webm",
        }
    }

    /// Demuxer name passed to the external transcoder with `-f`.
    pub fn transcoder_demuxer(self) -> &'static str {
        match self {
            Self::M4a => "mp4",
            other => other.extension(),
        }
    }

    /// Uncompressed WAV is what the pipeline consumes natively.
    pub fn is_native(self) -> bool {
        matches!(self, Self::Wav)
    }

    /// Containers produced by browser recorders (MediaRecorder) that often arrive without
    /// duration, cues, or a seekable index. Generic probing is unreliable for these.
    pub fn is_fragile_container(self) -> bool {
        matches!(self, Self::WebM | Self::Ogg)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
