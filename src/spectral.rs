//! Frame-level spectral descriptors.
//!
//! The constants and conventions here mirror the ones the training set was built with
//! (librosa defaults at 16 kHz). Changing any of them invalidates every trained model.
//!
//! ```text
//! samples ─┬─ centered frames (zero pad) ─ Hann ─ FFT ─┬─ |X|²  ─ mel(128) ─ dB ─ DCT ─ 13 MFCC
//!          │                                            └─ |X|   ─ centroid
//!          └─ centered frames (edge pad) ─ sign changes ─ ZCR
//! ```

use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::audio_pipeline::TARGET_SAMPLE_RATE;

pub const N_FFT: usize = 2048;
pub const HOP_LENGTH: usize = 512;
pub const N_MELS: usize = 128;
pub const N_MFCC: usize = 13;
pub const N_BINS: usize = N_FFT / 2 + 1;

const AMIN: f64 = 1e-10;
const TOP_DB: f64 = 80.0;
const ZCR_THRESHOLD: f32 = 1e-10;

/// Number of centered frames for a buffer of `n` samples.
pub fn frame_count(n: usize) -> usize {
    1 + n / HOP_LENGTH
}

/// Per-frame descriptor series for one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSeries {
    /// `mfcc[t][c]`: coefficient `c` of frame `t`.
    pub mfcc: Vec<[f64; N_MFCC]>,
    pub zcr: Vec<f64>,
    pub centroid: Vec<f64>,
}

/// Precomputed tables (window, FFT plan, mel filterbank, DCT basis).
///
/// Building these is the expensive part, so one instance is shared by every request.
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    mel: MelFilterbank,
    dct: Vec<[f64; N_MELS]>,
    bin_freqs: Vec<f64>,
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(N_FFT);
        let sr = TARGET_SAMPLE_RATE as f64;

        Self {
            fft,
            window: periodic_hann(N_FFT),
            mel: MelFilterbank::slaney(sr, N_FFT, N_MELS),
            dct: dct_ortho_basis(N_MFCC, N_MELS),
            bin_freqs: (0..N_BINS).map(|k| k as f64 * sr / N_FFT as f64).collect(),
        }
    }

    /// Compute every descriptor series for `samples` (16 kHz mono).
    pub fn analyze(&self, samples: &[f32]) -> FrameSeries {
        let n_frames = frame_count(samples.len());

        let mut buffer = vec![Complex::new(0.0f32, 0.0); N_FFT];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];
        let mut power = vec![0.0f64; N_BINS];

        let mut mel_db = Vec::with_capacity(n_frames);
        let mut centroid = Vec::with_capacity(n_frames);

        for t in 0..n_frames {
            // Frame `t` starts at `t * hop` in the signal padded by N_FFT / 2 zeros per side.
            let start = (t * HOP_LENGTH) as isize - (N_FFT / 2) as isize;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let idx = start + i as isize;
                let s = if idx >= 0 && (idx as usize) < samples.len() {
                    samples[idx as usize]
                } else {
                    0.0
                };
                *slot = Complex::new(s * self.window[i], 0.0);
            }

            self.fft.process_with_scratch(&mut buffer, &mut scratch);

            let mut mag_sum = 0.0f64;
            let mut weighted = 0.0f64;
            for (k, c) in buffer.iter().take(N_BINS).enumerate() {
                let p = (c.re as f64) * (c.re as f64) + (c.im as f64) * (c.im as f64);
                power[k] = p;
                let mag = p.sqrt();
                mag_sum += mag;
                weighted += mag * self.bin_freqs[k];
            }

            // Frames with (numerically) no energy are left unnormalized, which yields 0.
            centroid.push(if mag_sum < f32::MIN_POSITIVE as f64 {
                weighted
            } else {
                weighted / mag_sum
            });

            let mut frame_mel = [0.0f64; N_MELS];
            self.mel.apply(&power, &mut frame_mel);
            for v in frame_mel.iter_mut() {
                *v = 10.0 * v.max(AMIN).log10();
            }
            mel_db.push(frame_mel);
        }

        // Clip the dynamic range relative to the loudest cell of the whole clip.
        let max_db = mel_db
            .iter()
            .flat_map(|f| f.iter().copied())
            .fold(f64::NEG_INFINITY, f64::max);
        let floor = max_db - TOP_DB;

        let mfcc = mel_db
            .iter()
            .map(|frame| {
                let mut coeffs = [0.0f64; N_MFCC];
                for (c, basis) in coeffs.iter_mut().zip(&self.dct) {
                    *c = basis
                        .iter()
                        .zip(frame)
                        .map(|(b, v)| b * v.max(floor))
                        .sum();
                }
                coeffs
            })
            .collect();

        FrameSeries {
            mfcc,
            zcr: zero_crossing_rate(samples),
            centroid,
        }
    }
}

/// Fraction of sign changes per centered frame (edge-padded).
///
/// Values with magnitude at or below 1e-10 count as zero, and zero counts as positive.
pub fn zero_crossing_rate(samples: &[f32]) -> Vec<f64> {
    let n_frames = frame_count(samples.len());
    if samples.is_empty() {
        return vec![0.0; n_frames];
    }

    let last = samples.len() - 1;
    let negative = |idx: isize| -> bool {
        let clamped = idx.clamp(0, last as isize) as usize;
        let s = samples[clamped];
        s.abs() > ZCR_THRESHOLD && s < 0.0
    };

    (0..n_frames)
        .map(|t| {
            let start = (t * HOP_LENGTH) as isize - (N_FFT / 2) as isize;
            let mut crossings = 0usize;
            let mut prev = negative(start);
            for i in 1..N_FFT as isize {
                let cur = negative(start + i);
                if cur != prev {
                    crossings += 1;
                }
                prev = cur;
            }
            crossings as f64 / N_FFT as f64
        })
        .collect()
}

fn periodic_hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos()) as f32)
        .collect()
}

/// Triangular mel filters on the Slaney scale with Slaney area normalization.
struct MelFilterbank {
    // (first non-zero bin, weights from that bin on)
    filters: Vec<(usize, Vec<f64>)>,
}

impl MelFilterbank {
    fn slaney(sr: f64, n_fft: usize, n_mels: usize) -> Self {
        let n_bins = n_fft / 2 + 1;
        let fft_freqs: Vec<f64> = (0..n_bins).map(|k| k as f64 * sr / n_fft as f64).collect();

        let mel_min = hz_to_mel_slaney(0.0);
        let mel_max = hz_to_mel_slaney(sr / 2.0);
        let mel_f: Vec<f64> = (0..n_mels + 2)
            .map(|i| {
                mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
            })
            .collect();

        let filters = (0..n_mels)
            .map(|m| {
                let (lo, center, hi) = (mel_f[m], mel_f[m + 1], mel_f[m + 2]);
                let enorm = 2.0 / (hi - lo);
                let weights: Vec<f64> = fft_freqs
                    .iter()
                    .map(|&f| {
                        let lower = (f - lo) / (center - lo);
                        let upper = (hi - f) / (hi - center);
                        lower.min(upper).max(0.0) * enorm
                    })
                    .collect();

                let first = weights.iter().position(|&w| w > 0.0).unwrap_or(weights.len());
                let last = weights.iter().rposition(|&w| w > 0.0).map_or(first, |i| i + 1);
                (first, weights[first..last].to_vec())
            })
            .collect();

        Self { filters }
    }

    fn apply(&self, power: &[f64], out: &mut [f64]) {
        for ((start, weights), slot) in self.filters.iter().zip(out.iter_mut()) {
            *slot = weights
                .iter()
                .zip(&power[*start..])
                .map(|(w, p)| w * p)
                .sum();
        }
    }
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Rows of the orthonormal DCT-II matrix: `n_out` coefficients over `n_in` inputs.
fn dct_ortho_basis(n_out: usize, n_in: usize) -> Vec<[f64; N_MELS]> {
    debug_assert_eq!(n_in, N_MELS);
    (0..n_out)
        .map(|k| {
            let scale = if k == 0 {
                (1.0 / n_in as f64).sqrt()
            } else {
                (2.0 / n_in as f64).sqrt()
            };
            let mut row = [0.0f64; N_MELS];
            for (n, slot) in row.iter_mut().enumerate() {
                *slot = scale * (PI * k as f64 * (2 * n + 1) as f64 / (2 * n_in) as f64).cos();
            }
            row
        })
        .collect()
}
