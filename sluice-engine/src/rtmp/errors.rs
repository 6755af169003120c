use crate::{
    amf0::errors::Amf0Error,
    bytesio::errors::{BytesReadError, BytesWriteError},
    codec::errors::CodecError,
    flv::errors::FlvError,
    hub::errors::HubError,
    rtmp::chunk::errors::ChunkError,
};

#[derive(Debug, thiserror::Error)]
pub enum RtmpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported rtmp version: {0}")]
    HandshakeVersion(u8),
    #[error("bad handshake length: {0}")]
    HandshakeLength(usize),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("amf0 error: {0}")]
    Amf0(#[from] Amf0Error),
    #[error("flv error: {0}")]
    Flv(#[from] FlvError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("bytes read error: {0}")]
    BytesRead(#[from] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWrite(#[from] BytesWriteError),
    #[error("malformed command message: {0}")]
    MalformedCommand(String),
    #[error("command out of order: {0}")]
    UnexpectedCommand(String),
    #[error("publish rejected: {0}")]
    PublishRejected(String),
    #[error("play rejected: {0}")]
    PlayRejected(String),
    #[error("peer closed connection")]
    PeerClosed,
}
