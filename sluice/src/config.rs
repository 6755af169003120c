use {
    serde::Deserialize,
    sluice_engine::mpegts_udp::MpegTsBinding,
    sluice_transcode::profile::OutputProfile,
    std::collections::HashMap,
    std::net::Ipv4Addr,
};

/// Top-level configuration document, loaded once at startup. Live
/// sessions keep the snapshot they started with; there is no reload.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub admin: AdminSection,
    #[serde(default)]
    pub vhosts: Vec<VHostConfig>,
    /// Edge-mode and camera pulls.
    #[serde(default)]
    pub pulls: Vec<PullConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default)]
    pub bind: BindSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            bind: BindSection::default(),
        }
    }
}

fn default_server_name() -> String {
    "sluice".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindSection {
    #[serde(default)]
    pub providers: ProvidersBind,
    #[serde(default)]
    pub publishers: PublishersBind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersBind {
    /// RTMP ingest listener; `None` disables it.
    #[serde(default = "default_rtmp")]
    pub rtmp: Option<String>,
    /// SRT ingest port (UDP).
    #[serde(default = "default_srt_ingest")]
    pub srt: Option<u16>,
    /// WebRTC signalling (WHIP) shares the publisher signalling socket.
    #[serde(default)]
    pub webrtc: Option<WebRtcBind>,
    /// Fixed MPEG-TS/UDP ports.
    #[serde(default)]
    pub mpegts: Vec<MpegTsBindConfig>,
}

impl Default for ProvidersBind {
    fn default() -> Self {
        Self {
            rtmp: default_rtmp(),
            srt: default_srt_ingest(),
            webrtc: Some(WebRtcBind::default()),
            mpegts: Vec::new(),
        }
    }
}

fn default_rtmp() -> Option<String> {
    Some("0.0.0.0:1935".to_string())
}
const fn default_srt_ingest() -> Option<u16> {
    Some(9_999)
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebRtcBind {
    #[serde(default = "default_signalling")]
    pub signalling: String,
    #[serde(default)]
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcBind {
    fn default() -> Self {
        Self {
            signalling: default_signalling(),
            ice_servers: Vec::new(),
        }
    }
}

fn default_signalling() -> String {
    "0.0.0.0:3333".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MpegTsBindConfig {
    pub port: u16,
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub multicast_group: Option<Ipv4Addr>,
}

impl MpegTsBindConfig {
    #[must_use]
    pub fn to_binding(&self) -> MpegTsBinding {
        MpegTsBinding {
            port: self.port,
            app: self.app.clone(),
            stream: self.stream.clone(),
            multicast_group: self.multicast_group,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishersBind {
    #[serde(default = "default_llhls")]
    pub llhls: Option<String>,
    #[serde(default = "default_srt_egress")]
    pub srt: Option<u16>,
    #[serde(default = "default_httpflv")]
    pub httpflv: Option<String>,
    #[serde(default = "default_thumbnail")]
    pub thumbnail: Option<String>,
    #[serde(default = "default_ovt")]
    pub ovt: Option<String>,
}

impl Default for PublishersBind {
    fn default() -> Self {
        Self {
            llhls: default_llhls(),
            srt: default_srt_egress(),
            httpflv: default_httpflv(),
            thumbnail: default_thumbnail(),
            ovt: default_ovt(),
        }
    }
}

fn default_llhls() -> Option<String> {
    Some("0.0.0.0:8088".to_string())
}
const fn default_srt_egress() -> Option<u16> {
    Some(9_998)
}
fn default_httpflv() -> Option<String> {
    Some("0.0.0.0:8090".to_string())
}
fn default_thumbnail() -> Option<String> {
    Some("0.0.0.0:8081".to_string())
}
fn default_ovt() -> Option<String> {
    Some("0.0.0.0:9000".to_string())
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSection {
    #[serde(default = "default_admin_address")]
    pub address: String,
    /// Bearer token; absent disables the admin surface.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
            token: None,
        }
    }
}

fn default_admin_address() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VHostConfig {
    pub name: String,
    #[serde(default)]
    pub host_names: Vec<String>,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    #[serde(default = "default_app_type")]
    pub kind: String,
    #[serde(default)]
    pub output_profiles: Vec<OutputProfile>,
    #[serde(default)]
    pub access_control: Option<AccessControlConfig>,
    #[serde(default)]
    pub llhls: Option<LlHlsAppConfig>,
    #[serde(default)]
    pub recording: Option<RecordingConfig>,
    /// RTMP push re-stream targets, keyed by source stream name.
    #[serde(default)]
    pub push_targets: HashMap<String, String>,
}

fn default_app_type() -> String {
    "live".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessControlConfig {
    #[serde(default)]
    pub signed_policy_secret: Option<String>,
    #[serde(default)]
    pub admission_webhook: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlHlsAppConfig {
    #[serde(default = "default_segment_ms")]
    pub segment_duration_ms: i64,
    #[serde(default = "default_part_ms")]
    pub part_duration_ms: i64,
    #[serde(default = "default_dvr_segments")]
    pub dvr_window_segments: usize,
}

const fn default_segment_ms() -> i64 {
    2_000
}
const fn default_part_ms() -> i64 {
    250
}
const fn default_dvr_segments() -> usize {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PullConfig {
    /// Edge mode: pull an upstream origin over OVT.
    Ovt {
        origin: String,
        upstream_app: String,
        upstream_stream: String,
        app: String,
        stream: String,
    },
    /// External camera or origin over RTSP.
    Rtsp {
        url: String,
        app: String,
        stream: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_rtsp_transport")]
        transport: String,
    },
}

fn default_rtsp_transport() -> String {
    "tcp".to_string()
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SLUICE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// The vhost listeners register streams under: the first configured
    /// one, or "default".
    #[must_use]
    pub fn primary_vhost(&self) -> String {
        self.vhosts
            .first()
            .map_or_else(|| "default".to_string(), |v| v.name.clone())
    }

    #[must_use]
    pub fn transcode_profiles(&self) -> HashMap<String, Vec<OutputProfile>> {
        let mut profiles = HashMap::new();
        for vhost in &self.vhosts {
            for app in &vhost.applications {
                if !app.output_profiles.is_empty() {
                    profiles.insert(app.name.clone(), app.output_profiles.clone());
                }
            }
        }
        profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config: ServerConfig = toml_from_str("");
        assert_eq!(config.server.name, "sluice");
        assert_eq!(config.server.bind.providers.rtmp.as_deref(), Some("0.0.0.0:1935"));
        assert_eq!(config.server.bind.providers.srt, Some(9_999));
        assert_eq!(config.server.bind.publishers.srt, Some(9_998));
        assert_eq!(config.primary_vhost(), "default");
    }

    #[test]
    fn test_full_document_parses() {
        let config: ServerConfig = toml_from_str(
            r#"
[server]
name = "origin-1"

[server.bind.providers]
rtmp = "0.0.0.0:1935"
srt = 9999

[[server.bind.providers.mpegts]]
port = 4000
app = "app"
stream = "cam1"

[server.bind.publishers]
llhls = "0.0.0.0:8088"
srt = 9998

[admin]
address = "0.0.0.0:8080"
token = "secret-token"

[[vhosts]]
name = "default"
host_names = ["*"]

[[vhosts.applications]]
name = "app"
kind = "live"

[vhosts.applications.access_control]
signed_policy_secret = "s3cret"

[vhosts.applications.llhls]
segment_duration_ms = 2000
part_duration_ms = 250

[[vhosts.applications.output_profiles]]
name = "720p"
[vhosts.applications.output_profiles.video]
width = 1280
height = 720
bitrate_kbps = 2000

[[pulls]]
kind = "rtsp"
url = "rtsp://cam.local/stream"
app = "app"
stream = "cam2"
"#,
        );
        assert_eq!(config.server.name, "origin-1");
        assert_eq!(config.vhosts.len(), 1);
        let app = &config.vhosts[0].applications[0];
        assert_eq!(app.name, "app");
        assert_eq!(app.output_profiles.len(), 1);
        assert_eq!(app.output_profiles[0].video.as_ref().unwrap().width, 1280);
        assert!(app.access_control.as_ref().unwrap().signed_policy_secret.is_some());
        assert_eq!(config.transcode_profiles().len(), 1);
        assert!(matches!(config.pulls[0], PullConfig::Rtsp { .. }));
        assert_eq!(config.server.bind.providers.mpegts[0].port, 4_000);
    }

    fn toml_from_str(raw: &str) -> ServerConfig {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
