pub mod errors;
pub mod packetizer;
pub mod unpacketizer;

/// Chunk stream IDs this implementation allocates for its own messages.
pub mod csid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const VIDEO: u32 = 6;
    pub const DATA: u32 = 5;
}

pub const INIT_CHUNK_SIZE: usize = 128;
pub const DEFAULT_CHUNK_SIZE: usize = 4_096;
/// Upper bound a peer may negotiate; larger is a protocol violation.
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;
/// Upper bound on one assembled message.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

/*
 * 5.3.1 Chunk Format
 * +--------------+----------------+--------------------+------------+
 * | Basic Header | Message Header | Extended Timestamp | Chunk Data |
 * +--------------+----------------+--------------------+------------+
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkBasicHeader {
    pub format: u8,
    pub chunk_stream_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMessageHeader {
    /// Absolute timestamp after delta resolution.
    pub timestamp: u32,
    pub msg_length: u32,
    pub msg_type_id: u8,
    pub msg_stream_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkInfo {
    pub basic_header: ChunkBasicHeader,
    pub message_header: ChunkMessageHeader,
    pub payload: bytes::BytesMut,
}

impl ChunkInfo {
    #[must_use]
    pub fn new(
        chunk_stream_id: u32,
        msg_type_id: u8,
        timestamp: u32,
        msg_stream_id: u32,
        payload: bytes::BytesMut,
    ) -> Self {
        Self {
            basic_header: ChunkBasicHeader {
                format: 0,
                chunk_stream_id,
            },
            message_header: ChunkMessageHeader {
                timestamp,
                msg_length: payload.len() as u32,
                msg_type_id,
                msg_stream_id,
            },
            payload,
        }
    }
}
