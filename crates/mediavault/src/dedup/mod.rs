//! Duplicate detection over the media catalog.
//!
//! Every record gets a fast content hash (size plus head and tail samples)
//! and a perceptual hash of its midpoint frame. Records sharing either hash
//! form duplicate groups; pairs a user confirmed as distinct are remembered
//! in the ignore list.

pub mod hash;
pub mod sampler;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::video_repo::{self, HashColumn, VideoRecord};
use crate::db::{ignore_repo, Database};
use crate::error::DedupError;
use crate::roots::{RootsRegistry, VideoLocation};

pub use hash::{fast_hash, perceptual_hash};
pub use sampler::{FfmpegFrameSampler, FrameSampler};

/// Counts from one hashing batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashBatchReport {
    /// Records whose missing hashes were all computed.
    pub processed: usize,
    /// Records whose root could not be resolved.
    pub skipped: usize,
    /// Records where reading or sampling failed.
    pub failed: usize,
    /// Records still missing a hash after the batch.
    pub remaining: u64,
}

/// Records sharing one hash value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub hash: String,
    pub videos: Vec<VideoRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReport {
    pub by_fast_hash: Vec<DuplicateGroup>,
    pub by_perceptual_hash: Vec<DuplicateGroup>,
}

impl DuplicateReport {
    pub fn is_empty(&self) -> bool {
        self.by_fast_hash.is_empty() && self.by_perceptual_hash.is_empty()
    }
}

pub struct DuplicateDetector {
    db: Database,
    roots: Arc<RootsRegistry>,
    sampler: Arc<dyn FrameSampler>,
    sample_bytes: u64,
    /// Id of the last record visited; the next batch resumes after it.
    cursor: AtomicI64,
}

impl std::fmt::Debug for DuplicateDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateDetector")
            .field("sample_bytes", &self.sample_bytes)
            .finish_non_exhaustive()
    }
}

impl DuplicateDetector {
    pub fn new(
        db: Database,
        roots: Arc<RootsRegistry>,
        sampler: Arc<dyn FrameSampler>,
        sample_bytes: u64,
    ) -> Self {
        Self {
            db,
            roots,
            sampler,
            sample_bytes,
            cursor: AtomicI64::new(0),
        }
    }

    /// Computes missing hashes for up to `batch_limit` records.
    ///
    /// Batches resume after the last record the previous batch visited and
    /// wrap around once, so records that keep failing do not starve the
    /// rest. Records on unresolvable roots are skipped without counting
    /// toward the limit. Failures are logged and the batch moves on.
    pub async fn compute_hashes(&self, batch_limit: usize) -> Result<HashBatchReport, DedupError> {
        let mut report = HashBatchReport::default();
        let start = self.cursor.load(Ordering::SeqCst);
        let mut after_id = start;
        let mut wrapped = start == 0;

        'pages: while report.processed + report.failed < batch_limit {
            let page = video_repo::list_missing_hashes(&self.db, after_id, batch_limit)?;
            if page.is_empty() {
                if wrapped {
                    break;
                }
                wrapped = true;
                after_id = 0;
                continue;
            }

            for record in page {
                if wrapped && start > 0 && record.id > start {
                    break 'pages;
                }
                after_id = record.id;
                let location = VideoLocation::new(record.root_key.as_deref(), record.path.as_str());
                let Some(path) = self.roots.resolve_video_path(&location) else {
                    debug!(video_id = record.id, root_key = ?record.root_key, "Skipping record on unresolvable root");
                    report.skipped += 1;
                    continue;
                };

                if self.hash_record(&record, &path).await? {
                    report.processed += 1;
                } else {
                    report.failed += 1;
                }

                if report.processed + report.failed >= batch_limit {
                    break 'pages;
                }
            }
        }
        self.cursor.store(after_id, Ordering::SeqCst);

        report.remaining = video_repo::count_missing_hashes(&self.db)?;
        info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            remaining = report.remaining,
            "Hash batch finished"
        );
        Ok(report)
    }

    /// Fills in whichever hashes the record lacks. Returns false on failure.
    async fn hash_record(
        &self,
        record: &VideoRecord,
        path: &std::path::Path,
    ) -> Result<bool, DedupError> {
        if record.fast_hash.is_none() {
            match fast_hash(path, self.sample_bytes).await {
                Ok(hash) => video_repo::set_fast_hash(&self.db, record.id, &hash)?,
                Err(e) => {
                    warn!(video_id = record.id, error = %e, "Fast hash failed");
                    return Ok(false);
                }
            }
        }

        if record.perceptual_hash.is_none() && !record.perceptual_failed {
            match self.sampler.sample_midpoint(path).await {
                Ok(frame) => {
                    let hash = perceptual_hash(&frame);
                    video_repo::set_perceptual_hash(&self.db, record.id, &hash)?;
                }
                Err(e) => {
                    warn!(video_id = record.id, error = %e, "Perceptual hash failed");
                    video_repo::mark_perceptual_failed(&self.db, record.id)?;
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Groups records sharing a fast or perceptual hash.
    pub fn get_duplicates(&self) -> Result<DuplicateReport, DedupError> {
        let ignored = ignore_repo::all_keys(&self.db)?;
        Ok(DuplicateReport {
            by_fast_hash: group_by_hash(
                video_repo::list_shared_hashes(&self.db, HashColumn::Fast)?,
                |v| v.fast_hash.as_deref(),
                &ignored,
            ),
            by_perceptual_hash: group_by_hash(
                video_repo::list_shared_hashes(&self.db, HashColumn::Perceptual)?,
                |v| v.perceptual_hash.as_deref(),
                &ignored,
            ),
        })
    }

    /// Marks two records as distinct. Repeating the call is a no-op.
    pub fn ignore_pair(&self, id1: i64, id2: i64) -> Result<(), DedupError> {
        if id1 == id2 {
            return Err(DedupError::InvalidPair(id1));
        }
        if ignore_repo::insert(&self.db, id1, id2)? {
            info!(pair = %ignore_repo::pair_key(id1, id2), "Ignoring duplicate pair");
        }
        Ok(())
    }
}

/// Splits records sorted by hash into groups, dropping ignored pairs.
fn group_by_hash<F>(
    records: Vec<VideoRecord>,
    key: F,
    ignored: &HashSet<String>,
) -> Vec<DuplicateGroup>
where
    F: Fn(&VideoRecord) -> Option<&str>,
{
    let mut groups: Vec<DuplicateGroup> = Vec::new();
    for record in records {
        let Some(hash) = key(&record).map(str::to_string) else {
            continue;
        };
        match groups.last_mut() {
            Some(group) if group.hash == hash => group.videos.push(record),
            _ => groups.push(DuplicateGroup {
                hash,
                videos: vec![record],
            }),
        }
    }

    groups.retain(|g| match g.videos.as_slice() {
        [_] => false,
        [a, b] => !ignored.contains(&ignore_repo::pair_key(a.id, b.id)),
        _ => true,
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::video_repo::NewVideo;
    use crate::error::HashError;
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::path::Path;

    struct FailingSampler;

    #[async_trait]
    impl FrameSampler for FailingSampler {
        async fn sample_midpoint(&self, path: &Path) -> Result<DynamicImage, HashError> {
            Err(HashError::Probe {
                path: path.to_path_buf(),
                reason: "no video stream".to_string(),
            })
        }
    }

    fn detector(db: &Database) -> DuplicateDetector {
        DuplicateDetector::new(
            db.clone(),
            Arc::new(RootsRegistry::new()),
            Arc::new(FailingSampler),
            1024,
        )
    }

    fn insert(db: &Database, path: &str, hash: &str) -> i64 {
        video_repo::upsert(
            db,
            &NewVideo {
                filename: path,
                path,
                root_key: Some("movies"),
                size_bytes: 10,
                media_kind: "video",
                fast_hash: Some(hash),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_ignore_pair_rejects_same_id() {
        let db = Database::open_in_memory().unwrap();
        let err = detector(&db).ignore_pair(4, 4).unwrap_err();
        assert!(matches!(err, DedupError::InvalidPair(4)));
    }

    #[test]
    fn test_ignored_pair_is_suppressed() {
        let db = Database::open_in_memory().unwrap();
        let a = insert(&db, "a.mkv", "h1");
        let b = insert(&db, "b.mkv", "h1");
        insert(&db, "c.mkv", "h2");

        let detector = detector(&db);
        let report = detector.get_duplicates().unwrap();
        assert_eq!(report.by_fast_hash.len(), 1);
        assert_eq!(report.by_fast_hash[0].videos.len(), 2);

        detector.ignore_pair(b, a).unwrap();
        detector.ignore_pair(a, b).unwrap();
        assert!(detector.get_duplicates().unwrap().is_empty());
    }

    #[test]
    fn test_ignored_pair_does_not_hide_larger_group() {
        let db = Database::open_in_memory().unwrap();
        let a = insert(&db, "a.mkv", "h1");
        let b = insert(&db, "b.mkv", "h1");
        insert(&db, "c.mkv", "h1");

        let detector = detector(&db);
        detector.ignore_pair(a, b).unwrap();
        let report = detector.get_duplicates().unwrap();
        assert_eq!(report.by_fast_hash[0].videos.len(), 3);
    }
}
