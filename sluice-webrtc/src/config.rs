use serde::Deserialize;

/// WebRTC signalling and transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebRtcConfig {
    /// WHIP/WHEP signalling bind address, e.g. `0.0.0.0:3333`.
    pub signalling_address: String,
    /// STUN/TURN servers offered to peers.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Cap on concurrent peers (ingest + egress).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

const fn default_max_peers() -> usize {
    1_000
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            signalling_address: "0.0.0.0:3333".to_string(),
            ice_servers: default_ice_servers(),
            max_peers: default_max_peers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WebRtcConfig::default();
        assert_eq!(config.signalling_address, "0.0.0.0:3333");
        assert!(!config.ice_servers.is_empty());
    }
}
