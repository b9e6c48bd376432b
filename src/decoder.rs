// src/decoder.rs

//! Decode a whole media file into mono `f32` through Symphonia.
//!
//! This module is orchestration only:
//! - `demux` handles probing + packet iteration
//! - `decode` handles codec decoding
//! - `audio_pipeline` handles PCM normalization (downmix + optional resample)
//!
//! Two source modes are offered. Seekable mode lets the format reader consult indexes and
//! trailers. Unseekable mode reads strictly front to back, which is more forgiving of
//! recordings that were cut off before the recorder wrote its index.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use symphonia::core::io::{MediaSource, ReadOnlySource};
use tracing::debug;

use crate::audio_pipeline::{AudioPipeline, MonoPcm, RateMode};
use crate::decode::{PacketOutcome, decode_packet_and_then, make_decoder_for_track};
use crate::demux::{ProbeHint, next_packet, probe_source_and_pick_default_track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Seekable,
    Unseekable,
}

/// Decode the file at `path` and return mono samples.
///
/// In [`RateMode::Target`] the result is at the pipeline's target rate; in
/// [`RateMode::Native`] it stays at the track's own rate.
pub fn decode_file(
    path: &Path,
    hint: ProbeHint<'_>,
    source_mode: SourceMode,
    rate_mode: RateMode,
) -> Result<MonoPcm> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let source: Box<dyn MediaSource> = match source_mode {
        SourceMode::Seekable => Box::new(file),
        SourceMode::Unseekable => Box::new(ReadOnlySource::new(file)),
    };

    decode_impl(source, hint, rate_mode)
}

fn decode_impl(
    source: Box<dyn MediaSource>,
    hint: ProbeHint<'_>,
    rate_mode: RateMode,
) -> Result<MonoPcm> {
    let (mut format, track) = probe_source_and_pick_default_track(source, hint)?;

    let mut decoder = make_decoder_for_track(&track)?;
    let mut pipeline = AudioPipeline::new(rate_mode);
    let mut decoded_packets = 0usize;
    let mut skipped_packets = 0usize;

    while let Some(packet) = next_packet(&mut format)? {
        // Ignore packets from non-audio tracks.
        if packet.track_id() != track.id {
            continue;
        }

        let outcome = decode_packet_and_then(&mut decoder, &packet, |decoded| {
            pipeline
                .push_decoded(&decoded)
                .context("audio pipeline failed while processing decoded samples")
        })?;

        match outcome {
            PacketOutcome::Decoded => decoded_packets += 1,
            PacketOutcome::Skipped => skipped_packets += 1,
        }
    }

    debug!(
        track_id = track.id,
        decoded_packets, skipped_packets, "finished decoding track"
    );

    if decoded_packets == 0 {
        bail!("track contained no decodable packets ({skipped_packets} skipped)");
    }

    let pcm = pipeline.finish().context("audio pipeline failed during finalize")?;
    if pcm.samples.is_empty() {
        bail!("decoded track produced no samples");
    }
    Ok(pcm)
}
