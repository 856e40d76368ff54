use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::ids::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TranscodeStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TranscodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TranscodeStatus::Completed | TranscodeStatus::Failed | TranscodeStatus::Cancelled
        )
    }
}

/// The parameters that affect a transcode's output. `content_hash` (below)
/// is a deterministic function of exactly these fields, so two requests
/// that would produce byte-identical output always coalesce onto the same
/// session regardless of which media file or client triggered them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TranscodeRequest {
    pub media_id: String,
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub quality: String,
    pub speed_preset: String,
    pub resolution: Option<(u32, u32)>,
    pub adaptive_bitrate: bool,
    pub video_bitrate_kbps: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
}

/// Computes the canonical content hash described by the directory/session
/// naming convention: SHA-256 over a canonical key built from the fields
/// that affect transcode output, hex-lowercase.
pub fn content_hash(req: &TranscodeRequest) -> String {
    let mut key = format!(
        "{}_{}_{}_{}_{}_{}",
        req.media_id, req.container, req.video_codec, req.audio_codec, req.quality, req.speed_preset
    );
    if let Some((w, h)) = req.resolution {
        key.push_str(&format!("_{w}x{h}"));
    }
    if req.adaptive_bitrate {
        key.push_str("_abr");
    }
    if let Some(vb) = req.video_bitrate_kbps {
        key.push_str(&format!("_vb{vb}"));
    }
    if let Some(ab) = req.audio_bitrate_kbps {
        key.push_str(&format!("_ab{ab}"));
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TranscodeProgress {
    pub percent: f64,
    pub segments_ready: u32,
    pub current_speed: Option<f64>,
}

impl Default for TranscodeProgress {
    fn default() -> Self {
        Self {
            percent: 0.0,
            segments_ready: 0,
            current_speed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TranscodeResult {
    pub playlist_path: PathBuf,
    pub output_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TranscodeSession {
    pub id: SessionId,
    pub provider_id: String,
    pub content_hash: String,
    pub media_id: String,
    pub request: TranscodeRequest,
    pub status: TranscodeStatus,
    pub progress: TranscodeProgress,
    pub result: Option<TranscodeResult>,
    pub directory_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_accessed: DateTime<Utc>,
}

/// Directory-name grammar for a session: `{container}_{provider_id}_{session_id}`.
/// The provider id is permitted to contain underscores, so inversion needs
/// the set of registered provider id prefixes to disambiguate.
pub fn session_directory_name(container: &str, provider_id: &str, session_id: SessionId) -> String {
    format!("{container}_{provider_id}_{session_id}")
}

/// Inverts [`session_directory_name`] given the set of known provider ids.
/// Returns `None` if the name doesn't parse against any known provider.
pub fn parse_session_directory_name(
    name: &str,
    known_provider_ids: &[&str],
) -> Option<(String, String, String)> {
    for provider_id in known_provider_ids {
        let marker = format!("_{provider_id}_");
        if let Some(idx) = name.find(&marker) {
            let container = name[..idx].to_string();
            let rest = &name[idx + marker.len()..];
            if !container.is_empty() && !rest.is_empty() {
                return Some((container, provider_id.to_string(), rest.to_string()));
            }
        }
    }
    None
}

impl TranscodeSession {
    pub fn new(provider_id: String, request: TranscodeRequest, directory_root: &std::path::Path) -> Self {
        let id = SessionId::new();
        let hash = content_hash(&request);
        let dir_name = session_directory_name(&request.container, &provider_id, id);
        let now = Utc::now();
        Self {
            id,
            media_id: request.media_id.clone(),
            directory_path: directory_root.join(dir_name),
            provider_id,
            content_hash: hash,
            request,
            status: TranscodeStatus::Queued,
            progress: TranscodeProgress::default(),
            result: None,
            start_time: now,
            end_time: None,
            last_accessed: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> TranscodeRequest {
        TranscodeRequest {
            media_id: "media-1".into(),
            container: "mp4".into(),
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            quality: "high".into(),
            speed_preset: "fast".into(),
            resolution: Some((1920, 1080)),
            adaptive_bitrate: false,
            video_bitrate_kbps: Some(5000),
            audio_bitrate_kbps: Some(128),
        }
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash(&req()), content_hash(&req()));
    }

    #[test]
    fn content_hash_is_64_hex_chars() {
        let h = content_hash(&req());
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn content_hash_changes_with_bitrate() {
        let mut other = req();
        other.video_bitrate_kbps = Some(2000);
        assert_ne!(content_hash(&req()), content_hash(&other));
    }

    #[test]
    fn directory_name_roundtrips_with_underscored_provider() {
        let id = SessionId::new();
        let name = session_directory_name("mp4", "dash_ffmpeg_software", id);
        let known = ["dash_ffmpeg_software"];
        let (container, provider, session) = parse_session_directory_name(&name, &known).unwrap();
        assert_eq!(container, "mp4");
        assert_eq!(provider, "dash_ffmpeg_software");
        assert_eq!(session, id.to_string());
    }
}
