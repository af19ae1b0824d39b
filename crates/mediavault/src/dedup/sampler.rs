//! Frame sampling for perceptual hashing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::DynamicImage;
use tokio::process::Command;

use crate::error::HashError;

/// Produces a representative decoded frame for a media file.
#[async_trait]
pub trait FrameSampler: Send + Sync {
    /// Returns the frame at the midpoint of the media.
    async fn sample_midpoint(&self, path: &Path) -> Result<DynamicImage, HashError>;
}

/// Samples frames by shelling out to `ffprobe` and `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegFrameSampler {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegFrameSampler {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl FfmpegFrameSampler {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn duration_secs(&self, path: &Path) -> Result<f64, HashError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| probe_err(path, format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(probe_err(path, stderr_of(&output.stderr)));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or_else(|| probe_err(path, format!("invalid duration '{}'", raw.trim())))
    }
}

#[async_trait]
impl FrameSampler for FfmpegFrameSampler {
    async fn sample_midpoint(&self, path: &Path) -> Result<DynamicImage, HashError> {
        let midpoint = self.duration_secs(path).await? / 2.0;

        let output = Command::new(&self.ffmpeg)
            .args(["-nostdin", "-loglevel", "error", "-ss"])
            .arg(format!("{:.3}", midpoint))
            .arg("-i")
            .arg(path)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| probe_err(path, format!("failed to run ffmpeg: {}", e)))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(probe_err(path, stderr_of(&output.stderr)));
        }

        Ok(image::load_from_memory_with_format(
            &output.stdout,
            image::ImageFormat::Png,
        )?)
    }
}

fn probe_err(path: &Path, reason: String) -> HashError {
    HashError::Probe {
        path: path.to_path_buf(),
        reason,
    }
}

fn stderr_of(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr).trim().to_string();
    if text.is_empty() {
        "no frame produced".to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_probe_error() {
        let sampler = FfmpegFrameSampler::new(
            "/nonexistent/ffmpeg-mediavault",
            "/nonexistent/ffprobe-mediavault",
        );
        let err = sampler
            .sample_midpoint(Path::new("/tmp/clip.mkv"))
            .await
            .unwrap_err();
        assert!(matches!(err, HashError::Probe { .. }));
    }

    #[test]
    fn test_stderr_of_empty() {
        assert_eq!(stderr_of(b"  \n"), "no frame produced");
        assert_eq!(stderr_of(b"bad input\n"), "bad input");
    }
}
