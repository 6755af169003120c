use crate::bytesio::errors::{BytesReadError, BytesWriteError};

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("bytes read error: {0}")]
    BytesReadError(#[from] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] BytesWriteError),
    #[error("format-3 chunk for unknown chunk stream {0}")]
    UnknownChunkStream(u32),
    #[error("message length {0} exceeds limit")]
    MessageTooLarge(usize),
    #[error("declared chunk size {0} is invalid")]
    InvalidChunkSize(usize),
}
