use crate::hub::errors::HubError;

#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed rtsp url: {0}")]
    BadUrl(String),
    #[error("rtsp status {0}: {1}")]
    Status(u16, String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("malformed sdp: {0}")]
    MalformedSdp(String),
    #[error("no supported media in sdp")]
    NoSupportedMedia,
    #[error("malformed rtp packet")]
    MalformedRtp,
    #[error("digest auth failed")]
    AuthFailed,
    #[error("upstream closed")]
    UpstreamGone,
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
}
