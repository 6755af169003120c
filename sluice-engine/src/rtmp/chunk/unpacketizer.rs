use {
    super::{
        errors::ChunkError, ChunkBasicHeader, ChunkInfo, ChunkMessageHeader, EXTENDED_TIMESTAMP,
        INIT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE,
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    bytes::{BufMut, BytesMut},
    std::collections::HashMap,
};

/// Per chunk stream: the last message header (format 1-3 chunks inherit
/// fields from it) and any partially assembled message payload.
#[derive(Default)]
struct ChunkStreamState {
    header: ChunkMessageHeader,
    last_delta: u32,
    uses_extended_timestamp: bool,
    partial: BytesMut,
}

/// Assembles RTMP chunk streams back into complete messages.
///
/// Bytes go in via [`extend_data`]; complete messages come out of
/// [`read_messages`]. Parsing is transactional: a chunk is only consumed
/// from the buffer once all of its bytes are present, so partial reads
/// resume cleanly on the next network read.
pub struct ChunkUnpacketizer {
    buffer: BytesMut,
    streams: HashMap<u32, ChunkStreamState>,
    max_chunk_size: usize,
}

impl Default for ChunkUnpacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkUnpacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            streams: HashMap::new(),
            max_chunk_size: INIT_CHUNK_SIZE,
        }
    }

    pub fn extend_data(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn update_max_chunk_size(&mut self, chunk_size: usize) -> Result<(), ChunkError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ChunkError::InvalidChunkSize(chunk_size));
        }
        self.max_chunk_size = chunk_size;
        Ok(())
    }

    /// Drain every complete message currently in the buffer.
    ///
    /// Stops early after a `SetChunkSize` message so the caller can apply
    /// it before the following chunks are sliced with the old size.
    pub fn read_messages(&mut self) -> Result<Vec<ChunkInfo>, ChunkError> {
        let mut messages = Vec::new();
        while let Some(message) = self.read_message()? {
            let stop = message.message_header.msg_type_id
                == crate::rtmp::messages::msg_type_id::SET_CHUNK_SIZE;
            messages.push(message);
            if stop {
                break;
            }
        }
        Ok(messages)
    }

    fn read_message(&mut self) -> Result<Option<ChunkInfo>, ChunkError> {
        loop {
            match self.read_chunk()? {
                ReadOutcome::NeedMoreData => return Ok(None),
                ReadOutcome::MessageComplete(info) => return Ok(Some(info)),
                ReadOutcome::ChunkConsumed => {}
            }
        }
    }

    fn read_chunk(&mut self) -> Result<ReadOutcome, ChunkError> {
        let buf = &self.buffer[..];
        let Some((basic, basic_len)) = parse_basic_header(buf) else {
            return Ok(ReadOutcome::NeedMoreData);
        };

        let header_len = match basic.format {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < basic_len + header_len {
            return Ok(ReadOutcome::NeedMoreData);
        }
        let header_bytes = &buf[basic_len..basic_len + header_len];

        // Resolve the full message header against per-stream state.
        let state = self.streams.entry(basic.chunk_stream_id).or_default();
        if basic.format == 3 && state.header.msg_length == 0 && state.partial.is_empty() {
            return Err(ChunkError::UnknownChunkStream(basic.chunk_stream_id));
        }

        let mut header = state.header;
        let mut extended = false;
        let mut delta = state.last_delta;
        let starts_message = state.partial.is_empty();

        match basic.format {
            0 => {
                let ts = BigEndian::read_u24(&header_bytes[0..3]);
                header.msg_length = BigEndian::read_u24(&header_bytes[3..6]);
                header.msg_type_id = header_bytes[6];
                header.msg_stream_id = LittleEndian::read_u32(&header_bytes[7..11]);
                extended = ts == EXTENDED_TIMESTAMP;
                if !extended {
                    header.timestamp = ts;
                }
                delta = 0;
            }
            1 => {
                let d = BigEndian::read_u24(&header_bytes[0..3]);
                header.msg_length = BigEndian::read_u24(&header_bytes[3..6]);
                header.msg_type_id = header_bytes[6];
                extended = d == EXTENDED_TIMESTAMP;
                if !extended {
                    delta = d;
                }
            }
            2 => {
                let d = BigEndian::read_u24(&header_bytes[0..3]);
                extended = d == EXTENDED_TIMESTAMP;
                if !extended {
                    delta = d;
                }
            }
            _ => {
                // Format 3 inherits everything; continuation chunks of a
                // message carrying an extended timestamp repeat it.
                extended = state.uses_extended_timestamp;
            }
        }

        let mut consumed = basic_len + header_len;
        let ext_value = if extended {
            if buf.len() < consumed + 4 {
                return Ok(ReadOutcome::NeedMoreData);
            }
            let v = BigEndian::read_u32(&buf[consumed..consumed + 4]);
            consumed += 4;
            Some(v)
        } else {
            None
        };

        if let Some(v) = ext_value {
            match basic.format {
                0 => header.timestamp = v,
                1 | 2 => delta = v,
                _ => {}
            }
        }

        if header.msg_length as usize > MAX_MESSAGE_SIZE {
            return Err(ChunkError::MessageTooLarge(header.msg_length as usize));
        }

        let already = state.partial.len();
        let remaining = (header.msg_length as usize).saturating_sub(already);
        let chunk_payload_len = remaining.min(self.max_chunk_size);
        if buf.len() < consumed + chunk_payload_len {
            return Ok(ReadOutcome::NeedMoreData);
        }

        // Whole chunk available: commit.
        if starts_message && basic.format != 0 {
            header.timestamp = header.timestamp.wrapping_add(delta);
        }
        let _ = self.buffer.split_to(consumed);
        let payload = self.buffer.split_to(chunk_payload_len);

        let state = self
            .streams
            .get_mut(&basic.chunk_stream_id)
            .ok_or(ChunkError::UnknownChunkStream(basic.chunk_stream_id))?;
        state.header = header;
        state.last_delta = delta;
        state.uses_extended_timestamp = ext_value.is_some() || (basic.format == 3 && extended);
        state.partial.extend_from_slice(&payload);

        if state.partial.len() >= header.msg_length as usize {
            let payload = state.partial.split();
            return Ok(ReadOutcome::MessageComplete(ChunkInfo {
                basic_header: basic,
                message_header: header,
                payload,
            }));
        }
        Ok(ReadOutcome::ChunkConsumed)
    }
}

enum ReadOutcome {
    NeedMoreData,
    ChunkConsumed,
    MessageComplete(ChunkInfo),
}

/*
 * 5.3.1.1 Chunk Basic Header: 1-3 bytes.
 *  0 1 2 3 4 5 6 7
 * +-+-+-+-+-+-+-+-+
 * |fmt|   cs id   |   csid 2-63
 * +-+-+-+-+-+-+-+-+
 * csid == 0: next byte + 64 (range 64-319)
 * csid == 1: next two bytes LE + 64 (range 64-65599)
 */
fn parse_basic_header(buf: &[u8]) -> Option<(ChunkBasicHeader, usize)> {
    let first = *buf.first()?;
    let format = first >> 6;
    match first & 0x3F {
        0 => {
            let b = *buf.get(1)?;
            Some((
                ChunkBasicHeader {
                    format,
                    chunk_stream_id: u32::from(b) + 64,
                },
                2,
            ))
        }
        1 => {
            if buf.len() < 3 {
                return None;
            }
            let id = u32::from(buf[1]) + (u32::from(buf[2]) << 8) + 64;
            Some((
                ChunkBasicHeader {
                    format,
                    chunk_stream_id: id,
                },
                3,
            ))
        }
        id => Some((
            ChunkBasicHeader {
                format,
                chunk_stream_id: u32::from(id),
            },
            1,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::chunk::packetizer::ChunkPacketizer;
    use crate::rtmp::messages::msg_type_id;

    fn message(csid: u32, type_id: u8, timestamp: u32, len: usize, fill: u8) -> ChunkInfo {
        ChunkInfo::new(
            csid,
            type_id,
            timestamp,
            1,
            BytesMut::from(&vec![fill; len][..]),
        )
    }

    #[test]
    fn test_single_chunk_message_round_trip() {
        let mut packetizer = ChunkPacketizer::new();
        let sent = message(4, msg_type_id::AUDIO, 1_000, 100, 0xAB);
        let wire = packetizer.packetize(&sent).unwrap();

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.extend_data(&wire);
        let out = unpacketizer.read_messages().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_header.timestamp, 1_000);
        assert_eq!(out[0].message_header.msg_type_id, msg_type_id::AUDIO);
        assert_eq!(out[0].payload.as_ref(), &[0xAB; 100][..]);
    }

    #[test]
    fn test_multi_chunk_message_reassembly() {
        let mut packetizer = ChunkPacketizer::new();
        // 500 bytes at 128-byte chunks: 4 chunks.
        let sent = message(6, msg_type_id::VIDEO, 40, 500, 0xCD);
        let wire = packetizer.packetize(&sent).unwrap();

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.extend_data(&wire);
        let out = unpacketizer.read_messages().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 500);
    }

    #[test]
    fn test_partial_delivery_resumes() {
        let mut packetizer = ChunkPacketizer::new();
        let sent = message(6, msg_type_id::VIDEO, 40, 300, 0x11);
        let wire = packetizer.packetize(&sent).unwrap();

        let mut unpacketizer = ChunkUnpacketizer::new();
        let (a, b) = wire.split_at(wire.len() / 2);
        unpacketizer.extend_data(a);
        assert!(unpacketizer.read_messages().unwrap().is_empty());
        unpacketizer.extend_data(b);
        let out = unpacketizer.read_messages().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 300);
    }

    #[test]
    fn test_delta_timestamps_accumulate() {
        let mut packetizer = ChunkPacketizer::new();
        let mut unpacketizer = ChunkUnpacketizer::new();

        for (i, ts) in [0u32, 33, 66, 99].iter().enumerate() {
            let sent = message(6, msg_type_id::VIDEO, *ts, 10, i as u8);
            let wire = packetizer.packetize(&sent).unwrap();
            unpacketizer.extend_data(&wire);
        }
        let out = unpacketizer.read_messages().unwrap();
        assert_eq!(out.len(), 4);
        let timestamps: Vec<u32> = out.iter().map(|m| m.message_header.timestamp).collect();
        assert_eq!(timestamps, vec![0, 33, 66, 99]);
    }

    #[test]
    fn test_extended_timestamp_round_trip() {
        let mut packetizer = ChunkPacketizer::new();
        let ts = 0x0100_0000; // above the 24-bit field
        let sent = message(6, msg_type_id::VIDEO, ts, 32, 0x42);
        let wire = packetizer.packetize(&sent).unwrap();

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.extend_data(&wire);
        let out = unpacketizer.read_messages().unwrap();
        assert_eq!(out[0].message_header.timestamp, ts);
    }

    #[test]
    fn test_format3_without_context_rejected() {
        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.extend_data(&[0xC6, 0x00, 0x00]); // fmt3 on unknown csid 6
        assert!(unpacketizer.read_messages().is_err());
    }

    #[test]
    fn test_chunk_size_update() {
        let mut packetizer = ChunkPacketizer::new();
        packetizer.update_max_chunk_size(4_096).unwrap();
        let sent = message(6, msg_type_id::VIDEO, 0, 3_000, 0x77);
        let wire = packetizer.packetize(&sent).unwrap();

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.update_max_chunk_size(4_096).unwrap();
        unpacketizer.extend_data(&wire);
        let out = unpacketizer.read_messages().unwrap();
        assert_eq!(out[0].payload.len(), 3_000);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let mut unpacketizer = ChunkUnpacketizer::new();
        assert!(unpacketizer.update_max_chunk_size(0).is_err());
        assert!(unpacketizer.update_max_chunk_size(MAX_CHUNK_SIZE + 1).is_err());
    }
}
