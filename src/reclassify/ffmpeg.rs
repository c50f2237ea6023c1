//! Shells out to the `ffmpeg` binary on `PATH` for clip duration probing
//! and still-frame extraction. The teacher's own ingest path links
//! `ffmpeg-next` for RTSP decoding; reclassification only needs to pull a
//! handful of still frames out of an already-downloaded clip, so it
//! drives the CLI directly rather than linking libav for one-shot calls.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Probes a clip's duration in seconds by parsing ffmpeg's own stderr
/// banner (no output muxer requested, so ffmpeg exits non-zero after
/// printing format info — that's expected here).
pub async fn probe_duration_secs(clip_path: &Path) -> Result<f64> {
    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(clip_path)
        .output()
        .await
        .context("failed to spawn ffmpeg for duration probe")?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    parse_duration_line(&stderr).ok_or_else(|| anyhow::anyhow!("ffmpeg output had no Duration line"))
}

fn parse_duration_line(stderr: &str) -> Option<f64> {
    let line = stderr.lines().find(|l| l.trim_start().starts_with("Duration:"))?;
    let after = line.trim_start().strip_prefix("Duration:")?.trim();
    let hms = after.split(',').next()?.trim();
    let mut parts = hms.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extracts a single JPEG frame at `offset_secs` into the clip.
pub async fn extract_frame_jpeg(clip_path: &Path, offset_secs: f64) -> Result<Vec<u8>> {
    let output = Command::new("ffmpeg")
        .args(["-ss", &format!("{offset_secs:.3}")])
        .arg("-i")
        .arg(clip_path)
        .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "-"])
        .output()
        .await
        .context("failed to spawn ffmpeg for frame extraction")?;
    if !output.status.success() || output.stdout.is_empty() {
        bail!("ffmpeg produced no frame at offset {offset_secs:.3}s");
    }
    Ok(output.stdout)
}
