use {
    super::{errors::ChunkError, ChunkInfo, EXTENDED_TIMESTAMP, INIT_CHUNK_SIZE, MAX_CHUNK_SIZE},
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::{BigEndian, LittleEndian},
    bytes::BytesMut,
};

/// Serialises messages into RTMP chunks.
///
/// Every message is written with a format-0 header followed by format-3
/// continuation chunks; receivers always understand that shape and the
/// few header bytes saved by delta compression are noise next to media
/// payloads.
pub struct ChunkPacketizer {
    writer: BytesWriter,
    max_chunk_size: usize,
}

impl Default for ChunkPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkPacketizer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: BytesWriter::new(),
            max_chunk_size: INIT_CHUNK_SIZE,
        }
    }

    pub fn update_max_chunk_size(&mut self, chunk_size: usize) -> Result<(), ChunkError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ChunkError::InvalidChunkSize(chunk_size));
        }
        self.max_chunk_size = chunk_size;
        Ok(())
    }

    pub fn packetize(&mut self, info: &ChunkInfo) -> Result<BytesMut, ChunkError> {
        let csid = info.basic_header.chunk_stream_id;
        let header = &info.message_header;
        let extended = header.timestamp >= EXTENDED_TIMESTAMP;
        let field_ts = if extended {
            EXTENDED_TIMESTAMP
        } else {
            header.timestamp
        };

        self.write_basic_header(0, csid)?;
        self.writer.write_u24::<BigEndian>(field_ts)?;
        self.writer.write_u24::<BigEndian>(header.msg_length)?;
        self.writer.write_u8(header.msg_type_id)?;
        self.writer.write_u32::<LittleEndian>(header.msg_stream_id)?;
        if extended {
            self.writer.write_u32::<BigEndian>(header.timestamp)?;
        }

        let mut offset = 0usize;
        let payload = &info.payload;
        loop {
            let chunk_len = (payload.len() - offset).min(self.max_chunk_size);
            self.writer.write(&payload[offset..offset + chunk_len])?;
            offset += chunk_len;
            if offset >= payload.len() {
                break;
            }
            self.write_basic_header(3, csid)?;
            if extended {
                self.writer.write_u32::<BigEndian>(header.timestamp)?;
            }
        }

        Ok(self.writer.extract_current_bytes())
    }

    fn write_basic_header(&mut self, format: u8, csid: u32) -> Result<(), ChunkError> {
        let fmt_bits = format << 6;
        if csid < 64 {
            self.writer.write_u8(fmt_bits | csid as u8)?;
        } else if csid < 320 {
            self.writer.write_u8(fmt_bits)?;
            self.writer.write_u8((csid - 64) as u8)?;
        } else {
            self.writer.write_u8(fmt_bits | 0x01)?;
            let reduced = csid - 64;
            self.writer.write_u8((reduced & 0xFF) as u8)?;
            self.writer.write_u8((reduced >> 8) as u8)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header_encodings() {
        let mut p = ChunkPacketizer::new();
        p.write_basic_header(0, 3).unwrap();
        p.write_basic_header(3, 70).unwrap();
        p.write_basic_header(0, 400).unwrap();
        let data = p.writer.extract_current_bytes();
        assert_eq!(data[0], 0x03);
        assert_eq!(&data[1..3], &[0xC0, 70 - 64]);
        assert_eq!(data[3], 0x01);
        let id = u32::from(data[4]) + (u32::from(data[5]) << 8) + 64;
        assert_eq!(id, 400);
    }

    #[test]
    fn test_chunk_count_for_large_payload() {
        let mut p = ChunkPacketizer::new();
        let info = ChunkInfo::new(6, 9, 0, 1, BytesMut::from(&[0u8; 300][..]));
        let wire = p.packetize(&info).unwrap();
        // fmt0 header (12) + 128 + fmt3 (1) + 128 + fmt3 (1) + 44
        assert_eq!(wire.len(), 12 + 128 + 1 + 128 + 1 + 44);
    }
}
