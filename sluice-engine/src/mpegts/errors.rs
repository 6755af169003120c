use crate::bytesio::errors::{BytesReadError, BytesWriteError};

#[derive(Debug, thiserror::Error)]
pub enum MpegTsError {
    #[error("bytes read error: {0}")]
    BytesReadError(#[from] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] BytesWriteError),
    #[error("lost ts sync byte")]
    LostSync,
    #[error("section crc mismatch")]
    CrcMismatch,
    #[error("unknown pid: {0}")]
    UnknownPid(u16),
    #[error("unsupported stream type: {0:#x}")]
    UnsupportedStreamType(u8),
    #[error("malformed pes header")]
    MalformedPesHeader,
    #[error("too many elementary streams")]
    TooManyStreams,
}
