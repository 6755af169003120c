use serde::Deserialize;

/// One output rendition an application asks for. The produced stream is
/// registered as `<source-name>/<profile-name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputProfile {
    /// Rendition suffix, e.g. `720p`.
    pub name: String,
    /// Bypass decode/encode entirely and republish the source packets.
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub video: Option<VideoProfile>,
    #[serde(default)]
    pub audio: Option<AudioProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    /// Keyframe interval; keep aligned with the LL-HLS segment target so
    /// segmentation stays deterministic.
    #[serde(default = "default_gop_ms")]
    pub gop_ms: u32,
    #[serde(default = "default_fps")]
    pub fps: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioProfile {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_audio_bitrate")]
    pub bitrate_kbps: u32,
}

const fn default_gop_ms() -> u32 {
    2_000
}
fn default_fps() -> f32 {
    30.0
}
const fn default_sample_rate() -> u32 {
    48_000
}
const fn default_channels() -> u8 {
    2
}
const fn default_audio_bitrate() -> u32 {
    96
}

impl OutputProfile {
    /// The rendition's stream name for a given source.
    #[must_use]
    pub fn rendition_name(&self, source_name: &str) -> String {
        format!("{source_name}/{}", self.name)
    }

    /// Renditions are recognisable by the slash their own names carry;
    /// transcoding one again would cascade forever.
    #[must_use]
    pub fn is_rendition_name(stream_name: &str) -> bool {
        stream_name.contains('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendition_naming() {
        let profile = OutputProfile {
            name: "720p".into(),
            passthrough: false,
            video: None,
            audio: None,
        };
        assert_eq!(profile.rendition_name("s1"), "s1/720p");
        assert!(OutputProfile::is_rendition_name("s1/720p"));
        assert!(!OutputProfile::is_rendition_name("s1"));
    }
}
