use crate::bytesio::errors::{BitError, BytesReadError, BytesWriteError};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bytes read error: {0}")]
    BytesReadError(#[from] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] BytesWriteError),
    #[error("bit parse error: {0}")]
    BitError(#[from] BitError),
    #[error("malformed decoder configuration record")]
    MalformedConfigurationRecord,
    #[error("malformed adts header")]
    MalformedAdtsHeader,
    #[error("unsupported sample rate index: {0}")]
    UnsupportedSampleRateIndex(u8),
    #[error("nal unit shorter than its length prefix claims")]
    TruncatedNalUnit,
    #[error("no start code found in annex-b stream")]
    MissingStartCode,
}
