//! Handler for `process-media` jobs queued by the ingestion watcher.
//!
//! Catalogs the file, optionally moves it into its kind's library folder and
//! writes the thumbnail and metadata outputs the watcher checks for.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::prober::{placeholder_thumbnail, MediaProber};
use crate::db::video_repo::{self, NewVideo};
use crate::db::Database;
use crate::dedup::fast_hash;
use crate::error::{HandlerError, StorageError};
use crate::queue::{JobContext, JobHandler};
use crate::roots::{RootsRegistry, VideoLocation};
use crate::watcher::layout::STAGING_DIRS;
use crate::watcher::{MediaKind, OutputLayout};

const THUMBNAIL_MAX_EDGE: u32 = 320;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessMediaPayload {
    root_key: Option<String>,
    relative_path: String,
    #[serde(default)]
    auto_organize: bool,
    media_kind: Option<String>,
}

pub struct ProcessMediaHandler {
    db: Database,
    roots: Arc<RootsRegistry>,
    prober: Arc<dyn MediaProber>,
    layout: OutputLayout,
    sample_bytes: u64,
}

impl ProcessMediaHandler {
    pub fn new(
        db: Database,
        roots: Arc<RootsRegistry>,
        prober: Arc<dyn MediaProber>,
        sample_bytes: u64,
    ) -> Self {
        Self {
            db,
            roots,
            prober,
            layout: OutputLayout::default(),
            sample_bytes,
        }
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }

    fn root_dir(&self, root_key: Option<&str>) -> Option<PathBuf> {
        match root_key {
            Some(key) => self.roots.root_path(key),
            None => self.roots.fallback_root(),
        }
    }
}

#[async_trait]
impl JobHandler for ProcessMediaHandler {
    async fn handle(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError> {
        let payload: ProcessMediaPayload = serde_json::from_value(payload)?;
        let location = VideoLocation::new(payload.root_key.as_deref(), payload.relative_path.as_str());
        let root_key = location.root_key.clone();

        let root = self.root_dir(root_key.as_deref()).ok_or_else(|| {
            HandlerError::new(format!(
                "storage root '{}' is not registered",
                root_key.as_deref().unwrap_or("<fallback>")
            ))
        })?;
        let mut source = self.roots.resolve_video_path(&location).ok_or_else(|| {
            HandlerError::new(format!("cannot resolve '{}'", payload.relative_path))
        })?;
        if !source.is_file() {
            return Err(HandlerError::new(format!(
                "source file missing: {}",
                source.display()
            )));
        }

        let kind = payload
            .media_kind
            .as_deref()
            .and_then(MediaKind::parse)
            .or_else(|| MediaKind::from_path(&source))
            .ok_or_else(|| HandlerError::new(format!("unsupported media file: {}", source.display())))?;

        // The file moves only after every fallible probe step.
        let size = tokio::fs::metadata(&source).await?.len();
        let hash = fast_hash(&source, self.sample_bytes).await?;
        let probe = match self.prober.metadata(&source, kind).await {
            Ok(value) => value,
            Err(e) => {
                warn!(job_id = %ctx.job_id, error = %e, "Metadata probe failed");
                Value::Null
            }
        };
        let frame = match self.prober.thumbnail(&source, kind).await {
            Ok(frame) => frame,
            Err(e) if kind != MediaKind::Video || ctx.is_final_attempt() => {
                warn!(job_id = %ctx.job_id, error = %e, "Thumbnail failed; using placeholder");
                placeholder_thumbnail()
            }
            Err(e) => return Err(e.into()),
        };
        let thumbnail = encode_thumbnail(&frame)?;

        let mut relative = location.relative_path.clone();
        let mut organized = false;
        if payload.auto_organize {
            if let Some(moved) = organize(&root, &relative, kind).await? {
                info!(job_id = %ctx.job_id, from = %relative, to = %moved, "Organized media file");
                source = root.join(&moved);
                relative = moved;
                organized = true;
            }
        }

        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative.clone());
        let video_id = video_repo::upsert(
            &self.db,
            &NewVideo {
                filename: &filename,
                path: &relative,
                root_key: root_key.as_deref(),
                size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
                media_kind: kind.as_str(),
                fast_hash: Some(&hash),
            },
        )?;

        let metadata = json!({
            "videoId": video_id,
            "filename": filename,
            "rootKey": root_key,
            "relativePath": relative,
            "mediaKind": kind.as_str(),
            "sizeBytes": size,
            "fastHash": hash,
            "probe": probe,
            "processedAt": chrono::Utc::now().to_rfc3339(),
        });

        let out_dir = self.layout.output_dir(&root, Path::new(&relative));
        let staging = root.join(STAGING_DIRS[0]);
        let stage_prefix = ctx.job_id.clone();
        write_output(
            &staging,
            &stage_prefix,
            &out_dir.join("thumbnail.jpg"),
            &thumbnail,
        )
        .await?;
        let metadata_bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| HandlerError::new(format!("failed to encode metadata: {}", e)))?;
        write_output(
            &staging,
            &stage_prefix,
            &out_dir.join("metadata.json"),
            &metadata_bytes,
        )
        .await?;
        remove_if_empty(&staging).await;

        debug!(job_id = %ctx.job_id, video_id, out_dir = %out_dir.display(), "Outputs written");
        Ok(json!({
            "videoId": video_id,
            "relativePath": relative,
            "fastHash": hash,
            "organized": organized,
        }))
    }
}

/// Moves the file into `<library_dir>/<filename>` under the root.
///
/// Returns the new relative path, or `None` when the file is already there.
/// Name collisions get a numeric suffix.
async fn organize(root: &Path, relative: &str, kind: MediaKind) -> Result<Option<String>, StorageError> {
    let source = root.join(relative);
    let Some(file_name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(None);
    };
    let target_dir = kind.library_dir();
    if relative == format!("{}/{}", target_dir, file_name) {
        return Ok(None);
    }

    let dir = root.join(target_dir);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| StorageError::CreateDirectory {
            path: dir.clone(),
            source: e,
        })?;

    let name = free_name(&dir, &file_name).await?;
    move_file(&source, &dir.join(&name)).await?;
    Ok(Some(format!("{}/{}", target_dir, name)))
}

/// Picks `name`, then `stem_1.ext`, `stem_2.ext` and so on until one is free.
async fn free_name(dir: &Path, name: &str) -> Result<String, StorageError> {
    const MAX_COUNTER: u32 = 1000;

    if !tokio::fs::try_exists(dir.join(name)).await.unwrap_or(true) {
        return Ok(name.to_string());
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|s| s.to_str());

    for counter in 1..=MAX_COUNTER {
        let candidate = match ext {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        if !tokio::fs::try_exists(dir.join(&candidate)).await.unwrap_or(true) {
            return Ok(candidate);
        }
    }
    Err(StorageError::FileExists(dir.join(name)))
}

/// Renames, falling back to copy and delete across filesystems.
async fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }

    let move_err = |source: std::io::Error| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };
    tokio::fs::copy(src, dst).await.map_err(move_err)?;
    tokio::fs::remove_file(src).await.map_err(move_err)?;
    Ok(())
}

fn encode_thumbnail(frame: &DynamicImage) -> Result<Vec<u8>, HandlerError> {
    let thumb = frame.thumbnail(THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE);
    let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| HandlerError::new(format!("failed to encode thumbnail: {}", e)))?;
    Ok(buf.into_inner())
}

/// Writes into the staging directory, then renames into place so the
/// watcher never sees a partial artifact.
async fn write_output(
    staging: &Path,
    prefix: &str,
    dest: &Path,
    bytes: &[u8],
) -> Result<(), StorageError> {
    let create_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StorageError::CreateDirectory { path, source }
    };
    tokio::fs::create_dir_all(staging).await.map_err(create_err(staging))?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(create_err(parent))?;
    }

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = staging.join(format!("{}-{}", prefix, file_name));
    tokio::fs::write(&staged, bytes)
        .await
        .map_err(|e| StorageError::WriteFile {
            path: staged.clone(),
            source: e,
        })?;
    move_file(&staged, dest).await
}

async fn remove_if_empty(dir: &Path) {
    // Fails harmlessly when another job still has files staged.
    let _ = tokio::fs::remove_dir(dir).await;
}
