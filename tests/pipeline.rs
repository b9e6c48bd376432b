use std::io::Cursor;
use std::path::{Path, PathBuf};

use tickcheck::opts::TranscoderOpts;
use tickcheck::{Detector, Error, Label, LabelMap, ModelStatus, Opts, Upload};

/// One stump on `zcr_mean`: quiet or tonal clips land left (class 0), noisy ones right (class 1).
const STUMP_MODEL: &str = r#"{
    "n_features": 30,
    "classes": [0, 1],
    "class_names": ["fake", "real"],
    "trees": [
        { "nodes": [
            { "feature": 26, "threshold": 0.2, "left": 1, "right": 2, "value": [10, 10] },
            { "feature": null, "value": [9, 1] },
            { "feature": null, "value": [1, 9] }
        ] }
    ]
}"#;

fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for s in samples {
            for _ in 0..channels {
                writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn silence(secs: u32, rate: u32) -> Vec<f32> {
    vec![0.0; (secs * rate) as usize]
}

/// Deterministic full-band noise from a small LCG.
fn noise(len: usize) -> Vec<f32> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32 * 1.6 - 0.8
        })
        .collect()
}

struct Harness {
    _dir: tempfile::TempDir,
    temp_root: PathBuf,
    model_path: PathBuf,
}

impl Harness {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let temp_root = dir.path().join("scratch");
        let model_path = dir.path().join("tickcheck_model.json");
        std::fs::write(&model_path, STUMP_MODEL)?;
        Ok(Self {
            _dir: dir,
            temp_root,
            model_path,
        })
    }

    fn opts(&self, model_paths: Vec<PathBuf>) -> Opts {
        Opts {
            model_paths,
            temp_root: Some(self.temp_root.clone()),
            transcoder: TranscoderOpts {
                program: PathBuf::from("/nonexistent/tickcheck-test-ffmpeg"),
                ..TranscoderOpts::default()
            },
            label_map: None,
        }
    }

    fn detector(&self) -> anyhow::Result<Detector> {
        Ok(Detector::new(self.opts(vec![self.model_path.clone()]))?)
    }

    fn leftovers(&self) -> usize {
        count_entries(&self.temp_root)
    }
}

fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn silent_wav_matches_regression_fixture() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;

    let upload = Upload::new("silence.wav", wav_bytes(&silence(2, 16_000), 16_000, 1)?);
    let features = det.extract(&upload)?;

    let expected_c0 = -100.0 * 128f32.sqrt();
    assert!((features.mfcc_mean()[0] - expected_c0).abs() < 1e-2);
    assert!(features.mfcc_mean()[1..].iter().all(|c| c.abs() < 1e-3));
    assert_eq!(features.zcr_mean(), 0.0);
    assert_eq!(features.spec_cent_mean(), 0.0);
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn classifies_silence_as_counterfeit_and_noise_as_genuine() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;
    assert!(matches!(det.model_status(), ModelStatus::Loaded { .. }));

    let quiet = det.classify(&Upload::new(
        "quiet.wav",
        wav_bytes(&silence(1, 16_000), 16_000, 1)?,
    ))?;
    assert_eq!(quiet.label, Label::Counterfeit);
    assert!((quiet.confidence - 90.0).abs() < 1e-9);

    let loud = det.classify(&Upload::new(
        "loud.wav",
        wav_bytes(&noise(16_000), 16_000, 1)?,
    ))?;
    assert_eq!(loud.label, Label::Genuine);
    assert!((0.0..=100.0).contains(&loud.confidence));

    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn resamples_stereo_44k_wav() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;

    let upload = Upload::new("stereo.WAV", wav_bytes(&silence(1, 44_100), 44_100, 2)?);
    let features = det.extract(&upload)?;
    assert_eq!(features.zcr_mean(), 0.0);
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn rejects_disallowed_extension_before_persisting() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;

    let err = det
        .classify(&Upload::new("payload.exe", b"MZ\x90\x00".to_vec()))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat { .. }));
    assert_eq!(err.kind(), "unsupported_format");
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn rejects_zero_byte_upload() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;

    let err = det.classify(&Upload::new("clip.m4a", Vec::new())).unwrap_err();
    assert!(matches!(err, Error::EmptyInput));
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn missing_model_degrades_classify_but_not_extract() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = Detector::new(h.opts(vec![PathBuf::from("/nowhere/tickcheck_model.json")]))?;
    assert!(matches!(det.model_status(), ModelStatus::Unavailable { .. }));

    let upload = Upload::new("clip.wav", wav_bytes(&silence(1, 16_000), 16_000, 1)?);
    let err = det.classify(&upload).unwrap_err();
    assert!(matches!(err, Error::ModelUnavailable(_)));
    assert!(det.extract(&upload).is_ok());
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn contradicting_label_map_leaves_model_unavailable() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let mut opts = h.opts(vec![h.model_path.clone()]);
    opts.label_map = Some(LabelMap {
        counterfeit: 1,
        genuine: 0,
    });
    let det = Detector::new(opts)?;

    match det.model_status() {
        ModelStatus::Unavailable { reason } => assert!(reason.contains("contradicts")),
        other => panic!("expected unavailable model, got {other:?}"),
    }
    Ok(())
}

#[test]
fn undecodable_upload_exhausts_every_strategy() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;

    let junk = b"this is plainly not an audio stream ".repeat(64);
    let err = det.classify(&Upload::new("clip.mp3", junk)).unwrap_err();
    match &err {
        Error::DecodeExhausted { attempts } => {
            let names: Vec<_> = attempts.iter().map(|a| a.strategy).collect();
            assert_eq!(
                names,
                [
                    "direct_load",
                    "library_codec_hint",
                    "auto_detect",
                    "native_rate_then_resample",
                    "subprocess_transcode",
                ]
            );
        }
        other => panic!("expected decode exhaustion, got {other}"),
    }
    assert!(!err.user_message().contains("direct_load"));
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn mislabeled_webm_still_decodes_without_transcoder() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;

    // Browsers sometimes hand over a container that does not match the extension.
    let upload = Upload::new("recording.webm", wav_bytes(&noise(8_000), 16_000, 1)?);
    let result = det.classify(&upload)?;
    assert_eq!(result.label, Label::Genuine);
    assert_eq!(h.leftovers(), 0);
    Ok(())
}

#[test]
fn concurrent_requests_do_not_collide() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let det = h.detector()?;
    let quiet = wav_bytes(&silence(1, 16_000), 16_000, 1)?;
    let loud = wav_bytes(&noise(16_000), 16_000, 1)?;

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bytes = if i % 2 == 0 { quiet.clone() } else { loud.clone() };
                let det = &det;
                s.spawn(move || det.classify(&Upload::new(format!("clip-{i}.wav"), bytes)))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.join().expect("worker panicked").expect("classified");
            let expected = if i % 2 == 0 {
                Label::Counterfeit
            } else {
                Label::Genuine
            };
            assert_eq!(result.label, expected);
        }
    });

    assert_eq!(h.leftovers(), 0);
    Ok(())
}
