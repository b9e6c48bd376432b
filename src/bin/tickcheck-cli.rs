use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};

use tickcheck::logging;
use tickcheck::opts::{TranscoderOpts, default_model_paths};
use tickcheck::{AudioFormat, Detector, Error, LabelMap, Opts, Upload};

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("tickcheck-cli: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let params = Params::parse();
    let upload = Upload::from_path(&params.audio_path)
        .with_context(|| format!("failed to read {}", params.audio_path.display()))?;
    let upload = declare_format(upload, params.format);
    let detector = Detector::new(params.opts())?;

    let (doc, code) = if params.features_only {
        render(detector.extract(&upload).map(|features| json!({ "features": features })))
    } else {
        render(detector.classify(&upload).map(|result| {
            json!({ "label": result.label, "confidence": result.confidence })
        }))
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, &doc)?;
    writeln!(out)?;
    Ok(code)
}

/// Make the upload's name end in the forced format's extension, so the allow-list sees it.
fn declare_format(mut upload: Upload, format: Option<AudioFormat>) -> Upload {
    if let Some(format) = format {
        upload.filename = format!("{}.{}", upload.filename, format.extension());
    }
    upload
}

fn render(outcome: tickcheck::Result<Value>) -> (Value, ExitCode) {
    match outcome {
        Ok(mut body) => {
            if let Value::Object(map) = &mut body {
                map.insert("status".into(), json!("ok"));
            }
            (body, ExitCode::SUCCESS)
        }
        Err(err) => (error_doc(&err), ExitCode::FAILURE),
    }
}

fn error_doc(err: &Error) -> Value {
    json!({
        "status": "error",
        "reason": err.kind(),
        "message": err.user_message(),
    })
}

#[derive(Parser, Debug)]
#[command(name = "tickcheck")]
#[command(about = "Classify a watch movement recording as genuine or counterfeit")]
struct Params {
    /// Model artifact to try; repeat to give fallbacks in priority order.
    #[arg(short = 'm', long = "model")]
    pub model_paths: Vec<PathBuf>,

    #[arg(short = 'a', long = "audio")]
    pub audio_path: PathBuf,

    /// Treat the input as this format regardless of its file name.
    #[arg(short = 'f', long = "format", value_enum)]
    pub format: Option<AudioFormat>,

    #[arg(long = "ffmpeg", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    #[arg(long = "transcode-timeout-secs", default_value_t = 30)]
    pub transcode_timeout_secs: u64,

    /// Print the feature vector instead of classifying.
    #[arg(long = "features-only", default_value_t = false)]
    pub features_only: bool,

    #[arg(long = "temp-root")]
    pub temp_root: Option<PathBuf>,

    /// Class index the model uses for counterfeit recordings.
    #[arg(long = "counterfeit-class", requires = "genuine_class")]
    pub counterfeit_class: Option<usize>,

    /// Class index the model uses for genuine recordings.
    #[arg(long = "genuine-class", requires = "counterfeit_class")]
    pub genuine_class: Option<usize>,
}

impl Params {
    fn opts(&self) -> Opts {
        let model_paths = if self.model_paths.is_empty() {
            default_model_paths()
        } else {
            self.model_paths.clone()
        };

        let label_map = match (self.counterfeit_class, self.genuine_class) {
            (Some(counterfeit), Some(genuine)) => Some(LabelMap {
                counterfeit,
                genuine,
            }),
            _ => None,
        };

        Opts {
            model_paths,
            temp_root: self.temp_root.clone(),
            transcoder: TranscoderOpts {
                program: self.ffmpeg.clone(),
                timeout: Duration::from_secs(self.transcode_timeout_secs),
            },
            label_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_map_into_opts() {
        let params = Params::parse_from([
            "tickcheck",
            "-a",
            "clip.webm",
            "-m",
            "a.json",
            "-m",
            "b.json",
            "--counterfeit-class",
            "1",
            "--genuine-class",
            "0",
        ]);
        let opts = params.opts();
        assert_eq!(opts.model_paths, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
        assert_eq!(
            opts.label_map,
            Some(LabelMap {
                counterfeit: 1,
                genuine: 0
            })
        );
        assert_eq!(opts.transcoder.timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_model_flags_fall_back_to_defaults() {
        let params = Params::parse_from(["tickcheck", "-a", "clip.wav"]);
        assert_eq!(params.opts().model_paths, default_model_paths());
        assert!(params.opts().label_map.is_none());
    }

    #[test]
    fn format_flag_overrides_the_file_extension() {
        let params = Params::parse_from(["tickcheck", "-a", "recording", "--format", "webm"]);
        assert_eq!(params.format, Some(AudioFormat::WebM));

        let upload = declare_format(Upload::new("recording", vec![1]), params.format);
        assert_eq!(upload.filename, "recording.webm");
        assert_eq!(AudioFormat::from_filename(&upload.filename), Some(AudioFormat::WebM));

        let untouched = declare_format(Upload::new("clip.mp3", vec![1]), None);
        assert_eq!(untouched.filename, "clip.mp3");
    }

    #[test]
    fn error_doc_uses_generic_message() {
        let doc = error_doc(&Error::EmptyInput);
        assert_eq!(doc["status"], "error");
        assert_eq!(doc["reason"], "empty_input");
        assert!(doc["message"].as_str().is_some_and(|m| m.contains("empty")));
    }
}
