use serde::Serialize;
use std::fmt;

/// Fully-qualified stream name: every stream the registry indexes lives
/// under a virtual host and an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamKey {
    pub vhost: String,
    pub app: String,
    pub name: String,
}

impl StreamKey {
    #[must_use]
    pub fn new(
        vhost: impl Into<String>,
        app: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            name: name.into(),
        }
    }

    /// `<app>/<name>` under the default vhost, the form most wire
    /// protocols carry.
    #[must_use]
    pub fn default_vhost(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new("default", app, name)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.name)
    }
}

/// A capability to operate on one incarnation of a stream. The epoch
/// increments on every stop, so a handle taken before a stop can never
/// touch a later stream that happens to reuse the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHandle {
    pub key: StreamKey,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Initialising,
    Ready,
    Publishing,
    Stopping,
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Initialising => "initialising",
            Self::Ready => "ready",
            Self::Publishing => "publishing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = StreamKey::default_vhost("live", "s1");
        assert_eq!(key.to_string(), "default/live/s1");
    }

    #[test]
    fn test_handles_differ_across_epochs() {
        let key = StreamKey::default_vhost("live", "s1");
        let h1 = StreamHandle {
            key: key.clone(),
            epoch: 1,
        };
        let h2 = StreamHandle { key, epoch: 2 };
        assert_ne!(h1, h2);
    }
}
