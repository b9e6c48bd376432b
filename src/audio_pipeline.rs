//! PCM normalization for decoded audio.
//!
//! Responsibilities:
//! - Convert Symphonia-decoded PCM into interleaved `f32`
//! - Downmix to mono
//! - Resample to the pipeline's target sample rate (when needed)
//! - Collect the whole clip into one buffer (clips are short; there is no streaming consumer)
//!
//! Two entry points:
//! - [`AudioPipeline`] resamples incrementally while packets are being decoded.
//! - [`resample`] converts an already-collected mono buffer in one pass.

use anyhow::{Context, Result, anyhow, bail};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};

/// Target mono sample rate (Hz). The feature schema was built at this rate.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

// How many source frames we feed rubato per `process()` call.
const RESAMPLER_CHUNK_FRAMES: usize = 2048;

/// Whether the pipeline converts to [`TARGET_SAMPLE_RATE`] or keeps the source rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    Target,
    Native,
}

/// Mono samples together with the rate they are sampled at.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoPcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A small stateful pipeline that converts decoded packets into one mono buffer.
pub struct AudioPipeline {
    mode: RateMode,

    // Scratch buffer used to copy decoded PCM into an interleaved `Vec<f32>`.
    sample_buf_f32: Option<SampleBuffer<f32>>,
    sample_buf_spec: Option<SignalSpec>,

    // Source rate of the first decoded buffer; every later buffer must match it.
    src_rate: Option<u32>,

    // Lazily initialized resampler (only needed when the source rate != target).
    resampler: Option<SincFixedIn<f32>>,

    // Mono source samples waiting for a full rubato input block.
    mono_src_acc: Vec<f32>,

    // Total mono source frames seen, used to trim resampler padding at the end.
    src_frames: usize,

    out: Vec<f32>,
}

impl AudioPipeline {
    pub fn new(mode: RateMode) -> Self {
        Self {
            mode,
            sample_buf_f32: None,
            sample_buf_spec: None,
            src_rate: None,
            resampler: None,
            mono_src_acc: Vec::new(),
            src_frames: 0,
            out: Vec::new(),
        }
    }

    /// Push one decoded Symphonia buffer through downmix (and resampling, in target mode).
    pub fn push_decoded(&mut self, decoded: &AudioBufferRef<'_>) -> Result<()> {
        let (interleaved, rate, channels) = self.decoded_to_interleaved_f32(decoded)?;

        match self.src_rate {
            None => self.src_rate = Some(rate),
            Some(seen) if seen != rate => {
                bail!("sample rate changed mid-stream ({seen} Hz -> {rate} Hz)")
            }
            Some(_) => {}
        }

        let mono_src = downmix_to_mono(&interleaved, channels);
        self.src_frames += mono_src.len();

        // Fast path: nothing to convert.
        if self.mode == RateMode::Native || rate == TARGET_SAMPLE_RATE {
            self.out.extend_from_slice(&mono_src);
            return Ok(());
        }

        if self.resampler.is_none() {
            self.resampler = Some(make_resampler(rate)?);
        }
        self.mono_src_acc.extend_from_slice(&mono_src);

        while self.mono_src_acc.len() >= RESAMPLER_CHUNK_FRAMES {
            let block: Vec<f32> = self.mono_src_acc.drain(..RESAMPLER_CHUNK_FRAMES).collect();
            self.resample_block(block)?;
        }

        Ok(())
    }

    /// Flush the resampler tail and return the collected buffer.
    pub fn finish(mut self) -> Result<MonoPcm> {
        let Some(src_rate) = self.src_rate else {
            bail!("no audio frames were decoded");
        };

        if self.resampler.is_none() {
            let sample_rate = match self.mode {
                RateMode::Native => src_rate,
                RateMode::Target => TARGET_SAMPLE_RATE,
            };
            return Ok(MonoPcm {
                samples: self.out,
                sample_rate,
            });
        }

        if !self.mono_src_acc.is_empty() {
            // rubato expects exact block sizes; pad the remainder with zeros.
            let mut block = std::mem::take(&mut self.mono_src_acc);
            block.resize(RESAMPLER_CHUNK_FRAMES, 0.0);
            self.resample_block(block)?;
        }

        self.out
            .truncate(expected_output_len(self.src_frames, src_rate, TARGET_SAMPLE_RATE));

        Ok(MonoPcm {
            samples: self.out,
            sample_rate: TARGET_SAMPLE_RATE,
        })
    }

    fn resample_block(&mut self, block: Vec<f32>) -> Result<()> {
        let rs = self
            .resampler
            .as_mut()
            .ok_or_else(|| anyhow!("resampler not initialized"))?;

        let input = vec![block];
        let out = rs
            .process(&input, None)
            .map_err(|e| anyhow!(e))
            .context("resampler process failed")?;

        let [chan] = out.as_slice() else {
            bail!("expected mono output from resampler");
        };
        self.out.extend_from_slice(chan);
        Ok(())
    }

    fn decoded_to_interleaved_f32(
        &mut self,
        decoded: &AudioBufferRef<'_>,
    ) -> Result<(Vec<f32>, u32, usize)> {
        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            bail!("decoded audio had zero channels");
        }

        // Packets can grow (variable frame sizes) or change layout; reallocate when they do.
        let needs_new = match (&self.sample_buf_f32, self.sample_buf_spec) {
            (Some(buf), Some(prev)) => {
                prev != spec || buf.capacity() < decoded.capacity() * channels
            }
            _ => true,
        };
        if needs_new {
            self.sample_buf_f32 = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            self.sample_buf_spec = Some(spec);
        }

        let buf = self
            .sample_buf_f32
            .as_mut()
            .ok_or_else(|| anyhow!("sample buffer not initialized"))?;

        buf.copy_interleaved_ref(decoded.clone());

        Ok((buf.samples().to_vec(), spec.rate, channels))
    }
}

/// Resample a complete mono buffer from `src_rate` to `dst_rate`.
///
/// Output length is `round(len * dst_rate / src_rate)`.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Result<Vec<f32>> {
    if src_rate == 0 || dst_rate == 0 {
        bail!("invalid resample rates {src_rate} Hz -> {dst_rate} Hz");
    }
    if src_rate == dst_rate {
        return Ok(samples.to_vec());
    }

    let mut rs = SincFixedIn::<f32>::new(
        dst_rate as f64 / src_rate as f64,
        2.0,
        sinc_params(),
        RESAMPLER_CHUNK_FRAMES,
        1,
    )
    .map_err(|e| anyhow!(e))
    .context("failed to init resampler")?;

    let mut output = Vec::with_capacity(expected_output_len(samples.len(), src_rate, dst_rate) + 1);
    for chunk in samples.chunks(RESAMPLER_CHUNK_FRAMES) {
        let mut block = chunk.to_vec();
        block.resize(RESAMPLER_CHUNK_FRAMES, 0.0);

        let input = vec![block];
        let out = rs
            .process(&input, None)
            .map_err(|e| anyhow!(e))
            .context("resampler process failed")?;
        if let Some(chan) = out.first() {
            output.extend_from_slice(chan);
        }
    }

    output.truncate(expected_output_len(samples.len(), src_rate, dst_rate));
    Ok(output)
}

fn make_resampler(src_rate: u32) -> Result<SincFixedIn<f32>> {
    SincFixedIn::<f32>::new(
        TARGET_SAMPLE_RATE as f64 / src_rate as f64,
        2.0,
        sinc_params(),
        RESAMPLER_CHUNK_FRAMES,
        1, // mono
    )
    .map_err(|e| anyhow!(e))
    .context("failed to init resampler")
}

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

fn expected_output_len(src_frames: usize, src_rate: u32, dst_rate: u32) -> usize {
    (src_frames as f64 * dst_rate as f64 / src_rate as f64).round() as usize
}

/// Downmix interleaved samples into mono by averaging channels.
///
/// Policy: equal-weight average across channels.
pub(crate) fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
