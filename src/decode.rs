// src/decode.rs

//! Codec-level helpers built on top of Symphonia.
//!
//! This module isolates:
//! - constructing a decoder for a selected audio track
//! - decoding packets into PCM buffers
//! - mapping Symphonia's error model onto "skip this packet" vs "give up"
//!
//! The decode strategies only ever see decoded buffers or a fatal error; they never match on
//! Symphonia error variants themselves.

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{Packet, Track};
use tracing::debug;

/// Create a decoder for the given audio track.
///
/// Fails if the codec is unsupported (e.g. Opus, which Symphonia cannot decode) or the codec
/// parameters are invalid.
pub fn make_decoder_for_track(track: &Track) -> Result<Box<dyn Decoder>> {
    let decoder_opts = DecoderOptions { verify: false };

    symphonia::default::get_codecs()
        .make(&track.codec_params, &decoder_opts)
        .map_err(|e| anyhow!(e))
        .with_context(|| {
            format!(
                "failed to create decoder for audio track (codec {:?})",
                track.codec_params.codec
            )
        })
}

/// Outcome of feeding one packet to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Decoded,
    Skipped,
}

/// Decode a packet and immediately hand the decoded buffer to a callback.
///
/// Error handling policy:
/// - `DecodeError`     → skip the corrupt frame
/// - `IoError`         → skip (streams recorded in a browser often end mid-frame)
/// - `ResetRequired`   → reset the decoder and skip the packet
/// - anything else     → fatal
pub fn decode_packet_and_then(
    decoder: &mut Box<dyn Decoder>,
    packet: &Packet,
    mut on_decoded: impl FnMut(AudioBufferRef<'_>) -> Result<()>,
) -> Result<PacketOutcome> {
    let needs_reset = match decoder.decode(packet) {
        Ok(buf) => {
            on_decoded(buf)?;
            return Ok(PacketOutcome::Decoded);
        }

        Err(SymphoniaError::DecodeError(reason)) => {
            debug!(reason, "skipping undecodable packet");
            false
        }

        Err(SymphoniaError::IoError(_)) => false,

        Err(SymphoniaError::ResetRequired) => true,

        Err(e) => return Err(anyhow!(e)).context("decoder failure"),
    };

    // The decoded buffer borrows the decoder, so the reset waits until the match is done.
    if needs_reset {
        decoder.reset();
    }
    Ok(PacketOutcome::Skipped)
}
