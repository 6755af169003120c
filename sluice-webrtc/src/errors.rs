use sluice_engine::hub::errors::HubError;

#[derive(Debug, thiserror::Error)]
pub enum WebRtcError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("no local description after gathering")]
    NoLocalDescription,
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("peer limit reached")]
    PeerLimit,
    #[error("stream has no media webrtc can carry")]
    NoUsableTracks,
}
