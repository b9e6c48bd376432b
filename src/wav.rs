use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{Context, Result, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::audio_pipeline::{MonoPcm, TARGET_SAMPLE_RATE, downmix_to_mono, resample};

/// Load WAV audio from a reader and return mono samples at the source rate.
///
/// Accepted encodings:
/// - integer PCM at 8/16/24/32 bits, normalized to `[-1.0, 1.0]`
/// - 32-bit float, passed through
///
/// Any channel count is accepted and downmixed by equal-weight average.
pub fn read_mono_from_wav_reader<R>(reader: R) -> Result<MonoPcm>
where
    R: Read + Seek,
{
    let mut reader = WavReader::new(reader).context("failed to read WAV data from reader")?;
    let spec = reader.spec();

    if spec.channels == 0 {
        bail!("WAV header declares zero channels");
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => {
            if spec.bits_per_sample != 32 {
                bail!(
                    "unsupported float WAV bit depth: {} (expected 32)",
                    spec.bits_per_sample
                );
            }
            reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .context("failed to read float WAV samples")?
        }
        SampleFormat::Int => {
            if !(1..=32).contains(&spec.bits_per_sample) {
                bail!("unsupported integer WAV bit depth: {}", spec.bits_per_sample);
            }
            // Same scaling as the training loader: divide by 2^(bits-1).
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .context("failed to read integer WAV samples")?
        }
    };

    Ok(MonoPcm {
        samples: downmix_to_mono(&interleaved, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}

/// Load a WAV file as mono samples at [`TARGET_SAMPLE_RATE`], resampling when the file's rate
/// differs.
pub fn load_wav_at_target_rate(path: &Path) -> Result<MonoPcm> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open WAV file {}", path.display()))?;
    let pcm = read_mono_from_wav_reader(std::io::BufReader::new(file))?;

    if pcm.sample_rate == TARGET_SAMPLE_RATE {
        return Ok(pcm);
    }

    let samples = resample(&pcm.samples, pcm.sample_rate, TARGET_SAMPLE_RATE)
        .with_context(|| format!("failed to resample WAV from {} Hz", pcm.sample_rate))?;
    Ok(MonoPcm {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

/// Write mono `f32` samples as a 32-bit float WAV file.
///
/// Used for the intermediate files some decode strategies export, and handy for building
/// fixtures.
pub fn write_mono_f32(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create WAV file {}", path.display()))?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize().context("failed to finalize WAV file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn int16_wav(channels: u16, sample_rate: u32, frames: &[i16]) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).expect("writer");
            for &s in frames {
                writer.write_sample(s).expect("sample");
            }
            writer.finalize().expect("finalize");
        }
        cursor.into_inner()
    }

    #[test]
    fn reads_int16_mono_normalized() -> anyhow::Result<()> {
        let bytes = int16_wav(1, 16_000, &[0, 16_384, -32_768]);
        let pcm = read_mono_from_wav_reader(Cursor::new(bytes))?;
        assert_eq!(pcm.sample_rate, 16_000);
        assert_eq!(pcm.samples, vec![0.0, 0.5, -1.0]);
        Ok(())
    }

    #[test]
    fn downmixes_stereo() -> anyhow::Result<()> {
        let bytes = int16_wav(2, 8_000, &[16_384, 0, -16_384, -16_384]);
        let pcm = read_mono_from_wav_reader(Cursor::new(bytes))?;
        assert_eq!(pcm.sample_rate, 8_000);
        assert_eq!(pcm.samples, vec![0.25, -0.5]);
        Ok(())
    }

    #[test]
    fn rejects_non_wav_bytes() {
        let err = read_mono_from_wav_reader(Cursor::new(b"OggS not a wav".to_vec())).unwrap_err();
        assert!(err.to_string().contains("failed to read WAV data"));
    }

    #[test]
    fn float_round_trip_through_file_resamples_to_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.wav");
        let samples: Vec<f32> = (0..22_050).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
        write_mono_f32(&path, &samples, 22_050)?;

        let pcm = load_wav_at_target_rate(&path)?;
        assert_eq!(pcm.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(pcm.samples.len(), 16_000);
        Ok(())
    }
}
