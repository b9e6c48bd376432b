// src/demux.rs

//! Demux helpers for Symphonia.
//!
//! This module keeps container probing and packet iteration logic isolated from the
//! decode strategies that use them.
//!
//! Responsibilities:
//! - Probe a `MediaSource` and select a reasonable default audio track
//! - Provide a `next_packet` helper that treats IO errors as end-of-stream

use anyhow::{Context, Result, anyhow};
use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, Track};
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// What we tell the probe about the input before it starts sniffing.
///
/// An empty hint means full auto-detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeHint<'a> {
    pub extension: Option<&'a str>,
    pub mime_type: Option<&'a str>,
}

impl<'a> ProbeHint<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn extension(ext: &'a str) -> Self {
        Self {
            extension: Some(ext),
            mime_type: None,
        }
    }

    fn to_symphonia(self) -> Hint {
        let mut hint = Hint::new();
        if let Some(ext) = self.extension {
            hint.with_extension(ext);
        }
        if let Some(mime) = self.mime_type {
            hint.mime_type(mime);
        }
        hint
    }
}

/// Probe the container and pick a default audio track.
///
/// Track selection policy:
/// - choose the first track that looks decodable (codec != NULL)
/// - and has a known sample rate (required for resampling decisions downstream)
pub fn probe_source_and_pick_default_track(
    source: Box<dyn MediaSource>,
    hint: ProbeHint<'_>,
) -> Result<(Box<dyn FormatReader>, Track)> {
    let mss_opts = MediaSourceStreamOptions {
        // Symphonia expects a power-of-two buffer > 32KiB for good probing behavior.
        buffer_len: 256 * 1024,
    };

    let mss = MediaSourceStream::new(source, mss_opts);

    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };
    let metadata_opts: MetadataOptions = Default::default();

    let probed = symphonia::default::get_probe()
        .format(&hint.to_symphonia(), mss, &format_opts, &metadata_opts)
        .map_err(|e| anyhow!(e))
        .context("failed to probe media stream")?;

    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| anyhow!("no audio track found"))?;

    Ok((format, track))
}

/// Read the next packet, treating IO errors as "end of stream".
///
/// Browser-recorded containers are frequently cut off mid-cluster; an unexpected EOF there is
/// the normal end of the recording, not a failure.
pub fn next_packet(format: &mut Box<dyn FormatReader>) -> Result<Option<Packet>> {
    match format.next_packet() {
        Ok(p) => Ok(Some(p)),
        Err(SymphoniaError::IoError(_)) => Ok(None),
        Err(e) => Err(anyhow!(e)).context("failed reading packet"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use symphonia::core::io::ReadOnlySource;

    #[test]
    fn probe_rejects_garbage() {
        let source = ReadOnlySource::new(Cursor::new(vec![0x42u8; 4096]));
        let err = probe_source_and_pick_default_track(Box::new(source), ProbeHint::none())
            .err()
            .expect("garbage must not probe");
        assert!(format!("{err:#}").contains("failed to probe media stream"));
    }
}
