#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceProfile {
    pub name: String,
    pub user_agent: Option<String>,
    pub supported_containers: Vec<String>,
    pub supported_video_codecs: Vec<String>,
    pub supported_audio_codecs: Vec<String>,
    pub max_resolution: Option<(u32, u32)>,
    pub max_bitrate_kbps: Option<u32>,
    pub preferred_container: Option<String>,
    pub preferred_video_codec: Option<String>,
    pub preferred_audio_codec: Option<String>,
}

impl DeviceProfile {
    pub fn supports_container(&self, container: &str) -> bool {
        self.supported_containers
            .iter()
            .any(|c| container_eq(c, container))
    }

    pub fn supports_video_codec(&self, codec: &str) -> bool {
        self.supported_video_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(codec))
    }

    pub fn supports_audio_codec(&self, codec: &str) -> bool {
        self.supported_audio_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(codec))
    }
}

/// Container names are compared through an alias table so that e.g.
/// `matroska` and `mkv` are treated as equivalent. Names outside the
/// alias table fall back to plain case-insensitive comparison, so two
/// different unrecognized containers are never mistaken for a match.
pub fn container_eq(a: &str, b: &str) -> bool {
    match (canonical_container(a), canonical_container(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

fn canonical_container(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "mkv" | "matroska" => Some("matroska"),
        "mp4" | "m4v" | "mpeg4" => Some("mp4"),
        "webm" => Some("webm"),
        "ts" | "mpegts" => Some("mpegts"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkv_and_matroska_are_equal() {
        assert!(container_eq("mkv", "matroska"));
        assert!(container_eq("MKV", "Matroska"));
    }

    #[test]
    fn mp4_and_mkv_are_not_equal() {
        assert!(!container_eq("mp4", "mkv"));
    }

    #[test]
    fn two_different_unrecognized_containers_are_not_equal() {
        assert!(!container_eq("foo", "bar"));
    }

    #[test]
    fn same_unrecognized_container_is_equal_case_insensitively() {
        assert!(container_eq("foo", "FOO"));
    }
}
