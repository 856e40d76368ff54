//! Playback Decision Engine: a pure mapping from a media descriptor and a
//! device profile to a playback method.

use media_model::{DeviceProfile, TranscodeRequest};

/// Minimal description of a media file's technical shape, as seen by the
/// decision engine. Deliberately narrower than `MediaFile` — only the
/// fields the algorithm inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate_kbps: u32,
}

impl MediaInfo {
    pub fn is_audio_only(&self) -> bool {
        self.video_codec.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMethod {
    Direct,
    Remux,
    Transcode,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Decision {
    pub method: PlaybackMethod,
    pub reason: String,
    pub transcode_request: Option<TranscodeRequest>,
}

struct Mismatch {
    container: bool,
    video_codec: bool,
    audio_codec: bool,
    resolution: bool,
    bitrate: bool,
}

impl Mismatch {
    fn any(&self) -> bool {
        self.container || self.video_codec || self.audio_codec || self.resolution || self.bitrate
    }

    fn only_container(&self) -> bool {
        self.container && !self.video_codec && !self.audio_codec && !self.resolution && !self.bitrate
    }
}

fn evaluate(media: &MediaInfo, profile: &DeviceProfile) -> Mismatch {
    let container = !profile.supports_container(&media.container);
    let video_codec = media
        .video_codec
        .as_ref()
        .map(|c| !profile.supports_video_codec(c))
        .unwrap_or(false);
    let audio_codec = !profile.supports_audio_codec(&media.audio_codec);
    let resolution = match (media.width, media.height, profile.max_resolution) {
        (Some(w), Some(h), Some((max_w, max_h))) => w > max_w || h > max_h,
        _ => false,
    };
    let bitrate = profile
        .max_bitrate_kbps
        .map(|max| media.bitrate_kbps > max)
        .unwrap_or(false);

    Mismatch {
        container,
        video_codec,
        audio_codec,
        resolution,
        bitrate,
    }
}

fn preferred_container(profile: &DeviceProfile) -> &str {
    profile.preferred_container.as_deref().unwrap_or("mp4")
}

fn mismatch_reason(mismatch: &Mismatch, media: &MediaInfo, profile: &DeviceProfile) -> String {
    let mut parts = Vec::new();
    if mismatch.container {
        parts.push(format!(
            "Container format '{}' not supported, remuxing to {}",
            media.container,
            preferred_container(profile)
        ));
    }
    if mismatch.video_codec {
        parts.push(format!(
            "Video codec '{}' not supported",
            media.video_codec.as_deref().unwrap_or("none")
        ));
    }
    if mismatch.audio_codec {
        parts.push(format!("Audio codec '{}' not supported", media.audio_codec));
    }
    if mismatch.resolution {
        parts.push("Resolution exceeds device maximum".to_string());
    }
    if mismatch.bitrate {
        parts.push("Bitrate exceeds device maximum".to_string());
    }
    if parts.is_empty() {
        "Compatible with device profile".to_string()
    } else {
        parts.join("; ")
    }
}

/// Decide how `media` should be delivered to a device described by
/// `profile`. Pure function of its inputs; the `reason` string is
/// deterministic from the mismatch set.
pub fn decide(media: &MediaInfo, profile: &DeviceProfile) -> Decision {
    let audio_only = media.is_audio_only();
    let mismatch = evaluate(media, profile);

    if !mismatch.any() {
        return Decision {
            method: PlaybackMethod::Direct,
            reason: "Compatible with device profile".to_string(),
            transcode_request: None,
        };
    }

    if mismatch.only_container() && !audio_only {
        return Decision {
            method: PlaybackMethod::Remux,
            reason: mismatch_reason(&mismatch, media, profile),
            transcode_request: None,
        };
    }

    let (video_bitrate_kbps, audio_bitrate_kbps) = match profile.max_bitrate_kbps {
        Some(max) => ((max as f64 * 0.8) as u32, (max as f64 * 0.2) as u32),
        None => (4_000, 192),
    };

    let resolution = match (media.width, media.height, profile.max_resolution) {
        (Some(w), Some(h), Some((max_w, max_h))) if w > max_w || h > max_h => {
            let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
            Some((
                (w as f64 * scale) as u32 & !1,
                (h as f64 * scale) as u32 & !1,
            ))
        }
        _ => None,
    };

    let request = TranscodeRequest {
        media_id: Default::default(),
        container: preferred_container(profile).to_string(),
        video_codec: if audio_only {
            String::new()
        } else {
            profile
                .preferred_video_codec
                .clone()
                .unwrap_or_else(|| "h264".to_string())
        },
        audio_codec: profile
            .preferred_audio_codec
            .clone()
            .unwrap_or_else(|| "aac".to_string()),
        quality: "default".to_string(),
        speed_preset: "fast".to_string(),
        resolution,
        adaptive_bitrate: true,
        video_bitrate_kbps: if audio_only { Some(0) } else { Some(video_bitrate_kbps) },
        audio_bitrate_kbps: Some(audio_bitrate_kbps),
    };

    Decision {
        method: PlaybackMethod::Transcode,
        reason: mismatch_reason(&mismatch, media, profile),
        transcode_request: Some(request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> DeviceProfile {
        DeviceProfile {
            name: "test".to_string(),
            user_agent: None,
            supported_containers: vec!["mp4".to_string()],
            supported_video_codecs: vec!["h264".to_string()],
            supported_audio_codecs: vec!["aac".to_string()],
            max_resolution: Some((1920, 1080)),
            max_bitrate_kbps: Some(10_000),
            preferred_container: Some("mp4".to_string()),
            preferred_video_codec: Some("h264".to_string()),
            preferred_audio_codec: Some("aac".to_string()),
        }
    }

    fn media() -> MediaInfo {
        MediaInfo {
            container: "mkv".to_string(),
            video_codec: Some("h264".to_string()),
            audio_codec: "aac".to_string(),
            width: Some(1920),
            height: Some(1080),
            bitrate_kbps: 5_000,
        }
    }

    #[test]
    fn fully_compatible_is_direct() {
        let mut m = media();
        m.container = "mp4".to_string();
        let decision = decide(&m, &profile());
        assert_eq!(decision.method, PlaybackMethod::Direct);
    }

    #[test]
    fn container_only_mismatch_is_remux() {
        let decision = decide(&media(), &profile());
        assert_eq!(decision.method, PlaybackMethod::Remux);
        assert_eq!(
            decision.reason,
            "Container format 'mkv' not supported, remuxing to mp4"
        );
    }

    #[test]
    fn codec_mismatch_forces_transcode() {
        let mut m = media();
        m.video_codec = Some("hevc".to_string());
        let decision = decide(&m, &profile());
        assert_eq!(decision.method, PlaybackMethod::Transcode);
        assert!(decision.transcode_request.is_some());
    }

    #[test]
    fn transcode_downscales_above_max_resolution() {
        let mut m = media();
        m.video_codec = Some("hevc".to_string());
        m.width = Some(3840);
        m.height = Some(2160);
        let decision = decide(&m, &profile());
        let req = decision.transcode_request.unwrap();
        assert_eq!(req.resolution, Some((1920, 1080)));
    }

    #[test]
    fn audio_only_skips_video_fields() {
        let mut m = media();
        m.video_codec = None;
        m.container = "flac".to_string();
        let decision = decide(&m, &profile());
        assert_eq!(decision.method, PlaybackMethod::Transcode);
        let req = decision.transcode_request.unwrap();
        assert_eq!(req.video_bitrate_kbps, Some(0));
    }
}
