//! On-disk conventions for watched roots: which files are media, where their
//! generated outputs live and which directories are off limits.

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Serialize;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Directory under each root holding generated outputs.
pub const OUTPUTS_DIR: &str = ".mediavault";

/// Directories used for in-progress writes; never scanned, never removed.
pub const STAGING_DIRS: &[&str] = &[".mediavault-staging", ".tmp"];

/// Artifacts that must all exist for a file to count as processed.
pub const REQUIRED_ARTIFACTS: &[&str] = &["metadata.json", "thumbnail.jpg"];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "wmv", "webm", "mpg", "mpeg", "ts", "flv",
];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "aac", "flac", "ogg", "opus", "wav"];
const EBOOK_EXTENSIONS: &[&str] = &["epub", "pdf", "mobi", "azw3", "cbz", "cbr"];

/// Broad category of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Ebook,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Ebook => "ebook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "ebook" => Some(MediaKind::Ebook),
            _ => None,
        }
    }

    /// Detects the kind from the extension, falling back to the guessed MIME type.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            return Some(MediaKind::Video);
        }
        if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            return Some(MediaKind::Audio);
        }
        if EBOOK_EXTENSIONS.contains(&ext.as_str()) {
            return Some(MediaKind::Ebook);
        }

        let mime = mime_guess::from_path(path).first()?;
        match mime.type_().as_str() {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            _ => None,
        }
    }

    /// Folder name used when organizing files by kind.
    pub fn library_dir(&self) -> &'static str {
        match self {
            MediaKind::Video => "videos",
            MediaKind::Audio => "audiobooks",
            MediaKind::Ebook => "ebooks",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where outputs for a source file are written: `<root>/.mediavault/<rel>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    outputs_dir: String,
    required: Vec<String>,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            outputs_dir: OUTPUTS_DIR.to_string(),
            required: REQUIRED_ARTIFACTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl OutputLayout {
    pub fn new(outputs_dir: impl Into<String>, required: Vec<String>) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
            required,
        }
    }

    pub fn outputs_root(&self, root: &Path) -> PathBuf {
        root.join(&self.outputs_dir)
    }

    pub fn output_dir(&self, root: &Path, relative: &Path) -> PathBuf {
        self.outputs_root(root).join(relative)
    }

    pub fn required_artifacts(&self) -> &[String] {
        &self.required
    }

    /// True when every required artifact exists for the file.
    pub fn has_outputs(&self, root: &Path, relative: &Path) -> bool {
        let dir = self.output_dir(root, relative);
        self.required.iter().all(|name| dir.join(name).is_file())
    }

    /// True for the outputs directory and staging directories.
    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.outputs_dir || STAGING_DIRS.contains(&name)
    }
}

/// A media file found under a watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub kind: MediaKind,
}

impl Candidate {
    /// Relative path with `/` separators, as stored on jobs and records.
    pub fn relative_str(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Lists media files under `root`, skipping hidden entries, reserved
/// directories and excluded paths.
pub fn collect_candidates(root: &Path, layout: &OutputLayout, exclude: &[Pattern]) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let reserved = e.file_name().to_str().map(|n| layout.is_reserved(n)).unwrap_or(false);
            !reserved && !is_hidden(e)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if is_excluded(relative, exclude) {
            debug!("File excluded by pattern: {}", path.display());
            continue;
        }
        let Some(kind) = MediaKind::from_path(path) else {
            continue;
        };

        candidates.push(Candidate {
            path: path.to_path_buf(),
            relative: relative.to_path_buf(),
            kind,
        });
    }

    candidates
}

fn is_excluded(relative: &Path, exclude: &[Pattern]) -> bool {
    let filename = relative.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    exclude
        .iter()
        .any(|p| p.matches_path(relative) || p.matches(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_media_kind_detection() {
        assert_eq!(MediaKind::from_path(Path::new("a/Film.MKV")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("book.m4b")), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_path(Path::new("novel.epub")), Some(MediaKind::Ebook));
        assert_eq!(MediaKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_has_outputs_requires_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::default();
        let rel = Path::new("Film/film.mkv");

        assert!(!layout.has_outputs(dir.path(), rel));
        touch(&layout.output_dir(dir.path(), rel).join("metadata.json"));
        assert!(!layout.has_outputs(dir.path(), rel));
        touch(&layout.output_dir(dir.path(), rel).join("thumbnail.jpg"));
        assert!(layout.has_outputs(dir.path(), rel));
    }

    #[test]
    fn test_collect_candidates_skips_reserved_hidden_and_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("Film/film.mkv"));
        touch(&root.join("Film/sample/film-sample.mkv"));
        touch(&root.join("Film/notes.txt"));
        touch(&root.join(".hidden.mkv"));
        touch(&root.join(".tmp/partial.mkv"));
        touch(&root.join(".mediavault-staging/partial.mkv"));
        touch(&root.join(".mediavault/Film/film.mkv/thumbnail.mp4"));
        touch(&root.join("Music/track.flac"));
        touch(&root.join("Film/film.mkv.part.mkv"));

        let exclude = vec![
            Pattern::new("**/sample/*").unwrap(),
            Pattern::new("*.part.*").unwrap(),
        ];
        let mut found: Vec<String> = collect_candidates(root, &OutputLayout::default(), &exclude)
            .iter()
            .map(Candidate::relative_str)
            .collect();
        found.sort();

        assert_eq!(found, vec!["Film/film.mkv", "Music/track.flac"]);
    }
}
