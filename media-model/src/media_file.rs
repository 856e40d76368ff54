use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::ids::{LibraryId, MediaFileId};

/// Coarse classification of a scanned file, derived from its container and
/// stream layout rather than its library's kind (a music library can still
/// hold a video file, e.g. a concert recording).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MediaType {
    Audio,
    Video,
    Image,
    Unknown,
}

/// A single demuxed stream within a container, enough to drive playback
/// decisions without re-probing the file.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamInfo {
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
    pub channels: Option<u32>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

/// A file discovered by the scanner, deduplicated by content hash across
/// moves and renames within a library.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaFile {
    pub id: MediaFileId,
    pub library_id: LibraryId,
    pub path: PathBuf,
    pub size: u64,
    pub content_hash: Option<String>,
    pub media_type: MediaType,
    pub container: Option<String>,
    pub streams: Vec<StreamInfo>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl MediaFile {
    /// Construct a newly discovered file. `content_hash`, `container` and
    /// `streams` are filled in later by the enricher pool; at discovery time
    /// the walker only knows the path and size.
    pub fn discovered(library_id: LibraryId, path: PathBuf, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: MediaFileId::new(),
            library_id,
            path,
            size,
            content_hash: None,
            media_type: MediaType::Unknown,
            container: None,
            streams: Vec::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.kind == StreamKind::Video)
    }
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "flv", "wmv", "m4v", "ts"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "ogg", "opus", "wav", "aac"];

/// Extension whitelist used by the walker's filter, per library kind.
pub fn extensions_for(kind: crate::library::LibraryKind) -> &'static [&'static str] {
    use crate::library::LibraryKind::*;
    match kind {
        Music => AUDIO_EXTENSIONS,
        Movie | Episode => VIDEO_EXTENSIONS,
        Mixed => &[
            "mp4", "mkv", "avi", "mov", "webm", "flv", "wmv", "m4v", "ts", "mp3", "flac", "m4a",
            "ogg", "opus", "wav", "aac",
        ],
    }
}
