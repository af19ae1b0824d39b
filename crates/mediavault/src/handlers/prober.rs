use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::Value;
use tokio::process::Command;

use crate::dedup::{FfmpegFrameSampler, FrameSampler};
use crate::error::HashError;
use crate::watcher::MediaKind;

/// External metadata and thumbnail source.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Technical metadata for the file, as arbitrary JSON.
    async fn metadata(&self, path: &Path, kind: MediaKind) -> Result<Value, HashError>;

    /// A representative image for the file.
    async fn thumbnail(&self, path: &Path, kind: MediaKind) -> Result<DynamicImage, HashError>;
}

/// Prober backed by `ffprobe` and the ffmpeg frame sampler.
#[derive(Debug, Clone)]
pub struct FfmpegMediaProber {
    ffprobe: PathBuf,
    sampler: FfmpegFrameSampler,
}

impl Default for FfmpegMediaProber {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl FfmpegMediaProber {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        let ffprobe = ffprobe.into();
        Self {
            sampler: FfmpegFrameSampler::new(ffmpeg, ffprobe.clone()),
            ffprobe,
        }
    }
}

#[async_trait]
impl MediaProber for FfmpegMediaProber {
    async fn metadata(&self, path: &Path, _kind: MediaKind) -> Result<Value, HashError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HashError::Probe {
                path: path.to_path_buf(),
                reason: format!("failed to run ffprobe: {}", e),
            })?;

        if !output.status.success() {
            return Err(HashError::Probe {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| HashError::Probe {
            path: path.to_path_buf(),
            reason: format!("unreadable ffprobe output: {}", e),
        })
    }

    async fn thumbnail(&self, path: &Path, kind: MediaKind) -> Result<DynamicImage, HashError> {
        match kind {
            MediaKind::Video => self.sampler.sample_midpoint(path).await,
            MediaKind::Audio | MediaKind::Ebook => Ok(placeholder_thumbnail()),
        }
    }
}

/// Neutral image used when a file has no visual frame.
pub fn placeholder_thumbnail() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 180, Rgb([32, 32, 32])))
}
