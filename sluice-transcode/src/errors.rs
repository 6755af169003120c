use sluice_engine::hub::errors::HubError;

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("video decoder error: {0}")]
    Decoder(String),
    #[error("video encoder error: {0}")]
    Encoder(String),
    #[error("audio codec error: {0}")]
    Audio(String),
    #[error("resampler error: {0}")]
    Resampler(String),
    #[error("source track not transcodable: {0}")]
    UnsupportedSource(String),
    #[error("graph input closed")]
    InputClosed,
}
