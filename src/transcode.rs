//! External transcoder (ffmpeg) invocation.
//!
//! Symphonia has no Opus decoder, so WebM/Opus recordings from browsers can only be decoded by
//! handing them to ffmpeg. The subprocess writes a 16 kHz mono WAV next to the input, and the
//! caller loads that file through the WAV fast path.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::audio_format::AudioFormat;
use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::opts::TranscoderOpts;

// How often we check whether the child has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// Tail of the transcoder's stderr kept in error messages.
const MAX_STDERR_BYTES: usize = 2048;

/// Transcode `input` into a 16 kHz mono 16-bit WAV at `output`.
///
/// The declared format is passed as an explicit demuxer (`-f`) so ffmpeg doesn't have to guess
/// from a browser recording that may lack a duration header. The child is killed once
/// `opts.timeout` elapses.
pub fn transcode_to_wav(
    opts: &TranscoderOpts,
    input: &Path,
    format: AudioFormat,
    output: &Path,
) -> Result<()> {
    let stderr_path = output.with_extension("stderr.log");
    let stderr_file = File::create(&stderr_path)
        .with_context(|| format!("failed to create {}", stderr_path.display()))?;

    let mut cmd = Command::new(&opts.program);
    cmd.arg("-nostdin")
        .arg("-hide_banner")
        .args(["-loglevel", "error"])
        .arg("-y")
        .args(["-f", format.transcoder_demuxer()])
        .arg("-i")
        .arg(input)
        .args(["-vn", "-ac", "1"])
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .args(["-acodec", "pcm_s16le", "-f", "wav"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_file));

    debug!(program = %opts.program.display(), input = %input.display(), "spawning transcoder");

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn transcoder {}", opts.program.display()))?;

    let started = Instant::now();
    let status: ExitStatus = loop {
        if let Some(status) = child.try_wait().context("failed to wait on transcoder")? {
            break status;
        }
        if started.elapsed() >= opts.timeout {
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to kill timed-out transcoder");
            }
            // Reap the child so it doesn't linger as a zombie.
            let _ = child.wait();
            bail!("transcoder timed out after {:?}", opts.timeout);
        }
        thread::sleep(POLL_INTERVAL);
    };

    debug!(?status, elapsed_ms = started.elapsed().as_millis() as u64, "transcoder exited");

    if !status.success() {
        let stderr = read_stderr_tail(&stderr_path);
        bail!("transcoder exited with {status}: {stderr}");
    }

    let produced = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
    if produced == 0 {
        bail!("transcoder reported success but wrote no output");
    }

    Ok(())
}

/// Where a transcode writes its WAV inside a scratch directory.
pub fn transcode_output_path(dir: &Path) -> PathBuf {
    dir.join("transcoded.wav")
}

fn read_stderr_tail(path: &Path) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::from("<stderr unavailable>");
    };
    let start = bytes.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_owned()
}
