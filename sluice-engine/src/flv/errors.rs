use crate::{bytesio::errors::{BytesReadError, BytesWriteError}, codec::errors::CodecError};

#[derive(Debug, thiserror::Error)]
pub enum FlvError {
    #[error("bytes read error: {0}")]
    BytesReadError(#[from] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] BytesWriteError),
    #[error("codec error: {0}")]
    CodecError(#[from] CodecError),
    #[error("unsupported codec id: {0}")]
    UnsupportedCodec(u8),
    #[error("unsupported sound format: {0}")]
    UnsupportedSoundFormat(u8),
    #[error("video tag before sequence header")]
    MissingSequenceHeader,
}
