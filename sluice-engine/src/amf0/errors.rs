use crate::bytesio::errors::{BytesReadError, BytesWriteError};

#[derive(Debug, thiserror::Error)]
pub enum Amf0ErrorValue {
    #[error("unknown amf0 marker: {0:#x}")]
    UnknownMarker(u8),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("bytes read error: {0}")]
    BytesReadError(#[from] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] BytesWriteError),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct Amf0Error {
    pub value: Amf0ErrorValue,
}

impl From<Amf0ErrorValue> for Amf0Error {
    fn from(value: Amf0ErrorValue) -> Self {
        Self { value }
    }
}

impl From<BytesReadError> for Amf0Error {
    fn from(error: BytesReadError) -> Self {
        Self {
            value: Amf0ErrorValue::BytesReadError(error),
        }
    }
}

impl From<BytesWriteError> for Amf0Error {
    fn from(error: BytesWriteError) -> Self {
        Self {
            value: Amf0ErrorValue::BytesWriteError(error),
        }
    }
}
