use tokio::sync::oneshot::error::RecvError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("a stream with this name is already publishing")]
    AlreadyPublishing,
    #[error("no such stream")]
    NoSuchStream,
    #[error("stale stream handle (epoch mismatch)")]
    StaleHandle,
    #[error("stream is stopping")]
    Stopping,
    #[error("hub event channel full or closed")]
    SendError,
    #[error("hub reply dropped: {0}")]
    RecvError(#[from] RecvError),
    #[error("subscriber channel closed")]
    SubscriberClosed,
    #[error("track set rejected: {0}")]
    InvalidTracks(String),
}
