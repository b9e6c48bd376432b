//! The decoder cascade: an ordered list of decode strategies tried until one yields audio.
//!
//! Every strategy gets its own directory inside a per-call scratch directory. Intermediate files
//! (transcoder output, exported WAVs) live there and are removed before [`Cascade::decode`]
//! returns, whichever strategy produced them and whether or not it succeeded.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio_format::AudioFormat;
use crate::audio_pipeline::{MonoPcm, RateMode, TARGET_SAMPLE_RATE, resample};
use crate::decoder::{SourceMode, decode_file};
use crate::demux::ProbeHint;
use crate::error::{AttemptFailure, Error, Result};
use crate::opts::TranscoderOpts;
use crate::transcode::{transcode_output_path, transcode_to_wav};
use crate::wav::{load_wav_at_target_rate, write_mono_f32};

/// Mono PCM produced by the cascade.
///
/// Sample count is always > 0. Channel count is always 1.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::invalid_input("decoded audio has no samples"));
        }
        if sample_rate == 0 {
            return Err(Error::invalid_input("decoded audio has a zero sample rate"));
        }
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        1
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Everything a strategy may read or write during one attempt.
pub struct AttemptInput<'a> {
    /// The persisted upload.
    pub path: &'a Path,
    pub format: AudioFormat,
    /// Directory owned by this attempt; removed when the attempt ends.
    pub scratch: &'a Path,
    pub transcoder: &'a TranscoderOpts,
}

/// One way of turning the persisted upload into mono PCM.
pub trait Attempt {
    /// Short snake_case name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Return PCM at [`TARGET_SAMPLE_RATE`] or a reason for giving up.
    fn attempt(&self, input: &AttemptInput<'_>) -> anyhow::Result<MonoPcm>;
}

/// The built-in decode strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Symphonia decode of the file with its extension as hint, resampled while decoding.
    DirectLoad,
    /// ffmpeg with an explicit demuxer into a 16 kHz WAV, then loaded.
    SubprocessTranscode,
    /// Symphonia decode with container + MIME hint read front-to-back, exported to WAV, then loaded.
    LibraryCodecHint,
    /// Symphonia decode with no hint at all, exported to WAV, then loaded.
    AutoDetect,
    /// Symphonia decode at the track's own rate, then one explicit resample.
    NativeRateThenResample,
}

impl Attempt for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::DirectLoad => "direct_load",
            Self::SubprocessTranscode => "subprocess_transcode",
            Self::LibraryCodecHint => "library_codec_hint",
            Self::AutoDetect => "auto_detect",
            Self::NativeRateThenResample => "native_rate_then_resample",
        }
    }

    fn attempt(&self, input: &AttemptInput<'_>) -> anyhow::Result<MonoPcm> {
        let format = input.format;
        match self {
            Self::DirectLoad => decode_file(
                input.path,
                ProbeHint::extension(format.container_hint()),
                SourceMode::Seekable,
                RateMode::Target,
            ),

            Self::SubprocessTranscode => {
                let out = transcode_output_path(input.scratch);
                transcode_to_wav(input.transcoder, input.path, format, &out)?;
                load_wav_at_target_rate(&out)
            }

            Self::LibraryCodecHint => {
                let hint = ProbeHint {
                    extension: Some(format.container_hint()),
                    mime_type: Some(format.mime_type()),
                };
                let pcm = decode_file(input.path, hint, SourceMode::Unseekable, RateMode::Native)?;
                export_and_reload(input.scratch, &pcm)
            }

            Self::AutoDetect => {
                let pcm = decode_file(
                    input.path,
                    ProbeHint::none(),
                    SourceMode::Seekable,
                    RateMode::Native,
                )?;
                export_and_reload(input.scratch, &pcm)
            }

            Self::NativeRateThenResample => {
                let pcm = decode_file(
                    input.path,
                    ProbeHint::extension(format.container_hint()),
                    SourceMode::Seekable,
                    RateMode::Native,
                )?;
                if pcm.sample_rate == TARGET_SAMPLE_RATE {
                    return Ok(pcm);
                }
                Ok(MonoPcm {
                    samples: resample(&pcm.samples, pcm.sample_rate, TARGET_SAMPLE_RATE)?,
                    sample_rate: TARGET_SAMPLE_RATE,
                })
            }
        }
    }
}

fn export_and_reload(scratch: &Path, pcm: &MonoPcm) -> anyhow::Result<MonoPcm> {
    let exported = scratch.join("exported.wav");
    write_mono_f32(&exported, &pcm.samples, pcm.sample_rate)?;
    load_wav_at_target_rate(&exported)
}

/// Strategy order per kind of container.
#[derive(Debug, Clone)]
pub struct StrategyTable<A = Strategy> {
    /// Browser-recorded containers (WebM, Ogg): format-specific strategies before generic ones.
    pub fragile: Vec<A>,
    /// Everything else: library strategies before spawning a process.
    pub standard: Vec<A>,
}

impl<A> StrategyTable<A> {
    pub fn for_format(&self, format: AudioFormat) -> &[A] {
        if format.is_fragile_container() {
            &self.fragile
        } else {
            &self.standard
        }
    }
}

impl Default for StrategyTable<Strategy> {
    fn default() -> Self {
        use Strategy::*;
        Self {
            fragile: vec![
                DirectLoad,
                SubprocessTranscode,
                LibraryCodecHint,
                AutoDetect,
                NativeRateThenResample,
            ],
            standard: vec![
                DirectLoad,
                LibraryCodecHint,
                AutoDetect,
                NativeRateThenResample,
                SubprocessTranscode,
            ],
        }
    }
}

/// Decodes persisted uploads into [`DecodedAudio`] at the target rate.
///
/// The strategy table and transcoder settings are fixed at construction; a `Cascade` is shared
/// read-only by every request.
#[derive(Debug, Clone)]
pub struct Cascade<A = Strategy> {
    table: StrategyTable<A>,
    transcoder: TranscoderOpts,
}

impl Cascade<Strategy> {
    pub fn new(transcoder: TranscoderOpts) -> Self {
        Self::with_table(StrategyTable::default(), transcoder)
    }
}

impl<A: Attempt> Cascade<A> {
    pub fn with_table(table: StrategyTable<A>, transcoder: TranscoderOpts) -> Self {
        Self { table, transcoder }
    }

    pub fn table(&self) -> &StrategyTable<A> {
        &self.table
    }

    /// Decode the file at `path`, declared as `format`.
    ///
    /// `scratch_parent` must be a directory the caller owns; the cascade creates (and removes) its
    /// own scratch directory inside it.
    pub fn decode(
        &self,
        path: &Path,
        format: AudioFormat,
        scratch_parent: &Path,
    ) -> Result<DecodedAudio> {
        let len = std::fs::metadata(path)
            .map_err(|e| Error::internal(format!("cannot stat {}: {e}", path.display())))?
            .len();
        if len == 0 {
            return Err(Error::EmptyInput);
        }

        let scratch = tempfile::Builder::new()
            .prefix("cascade-")
            .tempdir_in(scratch_parent)
            .map_err(|e| Error::internal(format!("failed to create scratch directory: {e}")))?;

        let result = self.run(path, format, scratch.path());

        if let Err(err) = scratch.close() {
            warn!(error = %err, "failed to remove cascade scratch directory");
        }

        result
    }

    fn run(&self, path: &Path, format: AudioFormat, scratch: &Path) -> Result<DecodedAudio> {
        let mut attempts = Vec::new();

        if format.is_native() {
            match load_wav_at_target_rate(path).and_then(into_decoded) {
                Ok(audio) => {
                    debug!(samples = audio.samples().len(), "wav fast path succeeded");
                    return Ok(audio);
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(error = %reason, "wav fast path failed; running cascade");
                    attempts.push(AttemptFailure {
                        strategy: "wav_fast_path",
                        reason,
                    });
                }
            }
        }

        for (idx, strategy) in self.table.for_format(format).iter().enumerate() {
            let name = strategy.name();
            let attempt_dir = scratch.join(format!("{idx}-{name}"));
            let started = Instant::now();

            let outcome = std::fs::create_dir(&attempt_dir)
                .map_err(anyhow::Error::from)
                .and_then(|()| {
                    let input = AttemptInput {
                        path,
                        format,
                        scratch: &attempt_dir,
                        transcoder: &self.transcoder,
                    };
                    strategy.attempt(&input)
                })
                .and_then(into_decoded);

            if attempt_dir.exists() {
                if let Err(err) = std::fs::remove_dir_all(&attempt_dir) {
                    warn!(strategy = name, error = %err, "failed to remove attempt directory");
                }
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(audio) => {
                    info!(
                        strategy = name,
                        %format,
                        elapsed_ms,
                        samples = audio.samples().len(),
                        failed_before = attempts.len(),
                        "decode strategy succeeded"
                    );
                    return Ok(audio);
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(strategy = name, %format, elapsed_ms, error = %reason, "decode strategy failed");
                    attempts.push(AttemptFailure {
                        strategy: name,
                        reason,
                    });
                }
            }
        }

        Err(Error::DecodeExhausted { attempts })
    }
}

fn into_decoded(pcm: MonoPcm) -> anyhow::Result<DecodedAudio> {
    if pcm.sample_rate != TARGET_SAMPLE_RATE {
        anyhow::bail!(
            "strategy returned {} Hz audio, expected {TARGET_SAMPLE_RATE} Hz",
            pcm.sample_rate
        );
    }
    if pcm.samples.is_empty() {
        anyhow::bail!("strategy produced an empty buffer");
    }
    DecodedAudio::new(pcm.samples, pcm.sample_rate).map_err(anyhow::Error::from)
}
