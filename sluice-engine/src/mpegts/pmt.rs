use {
    super::{crc32, define, errors::MpegTsError},
    crate::bytesio::{bytes_reader::BytesReader, bytes_writer::BytesWriter},
    byteorder::{BigEndian, LittleEndian},
    bytes::{Bytes, BytesMut},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    /// Raw ES-info descriptor bytes (e.g. the Opus registration descriptor).
    pub es_info: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    pub program_number: u16,
    pub pcr_pid: u16,
    pub version_number: u8,
    pub streams: Vec<PmtStream>,
}

impl Default for Pmt {
    fn default() -> Self {
        Self::new()
    }
}

impl Pmt {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            program_number: 1,
            pcr_pid: define::PID_NULL,
            version_number: 0,
            streams: Vec::new(),
        }
    }
}

pub struct PmtMuxer {
    pub bytes_writer: BytesWriter,
}

impl Default for PmtMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl PmtMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_writer: BytesWriter::new(),
        }
    }

    pub fn write(&mut self, pmt: &Pmt) -> Result<BytesMut, MpegTsError> {
        /*table id*/
        self.bytes_writer.write_u8(define::PMT_TID_PMS)?;

        let es_bytes: usize = pmt.streams.iter().map(|s| 5 + s.es_info.len()).sum();
        /*section length: 9 fixed + es loop + 4 crc*/
        let length = (9 + es_bytes + 4) as u16;
        self.bytes_writer.write_u16::<BigEndian>(0xB000 | length)?;
        self.bytes_writer
            .write_u16::<BigEndian>(pmt.program_number)?;
        self.bytes_writer
            .write_u8(0xC1 | (pmt.version_number << 1))?;
        /*section_number + last_section_number*/
        self.bytes_writer.write_u16::<BigEndian>(0x00)?;
        self.bytes_writer
            .write_u16::<BigEndian>(0xE000 | pmt.pcr_pid)?;
        /*program_info_length*/
        self.bytes_writer.write_u16::<BigEndian>(0xF000)?;

        for stream in &pmt.streams {
            self.bytes_writer.write_u8(stream.stream_type)?;
            self.bytes_writer
                .write_u16::<BigEndian>(0xE000 | stream.elementary_pid)?;
            self.bytes_writer
                .write_u16::<BigEndian>(0xF000 | stream.es_info.len() as u16)?;
            self.bytes_writer.write(&stream.es_info)?;
        }

        let crc32_value = crc32::gen_crc32(0xFFFF_FFFF, &self.bytes_writer.get_current_bytes());
        self.bytes_writer.write_u32::<LittleEndian>(crc32_value)?;

        Ok(self.bytes_writer.extract_current_bytes())
    }
}

/// Parse a PMT section (pointer field already consumed).
pub fn parse(section: &[u8]) -> Result<Pmt, MpegTsError> {
    let mut reader = BytesReader::new(BytesMut::from(section));

    let table_id = reader.read_u8()?;
    if table_id != define::PMT_TID_PMS {
        return Err(MpegTsError::LostSync);
    }
    let section_length = (reader.read_u16::<BigEndian>()? & 0x0FFF) as usize;
    let program_number = reader.read_u16::<BigEndian>()?;
    let version_number = (reader.read_u8()? >> 1) & 0x1F;
    reader.read_u16::<BigEndian>()?; // section numbers
    let pcr_pid = reader.read_u16::<BigEndian>()? & 0x1FFF;
    let program_info_length = (reader.read_u16::<BigEndian>()? & 0x0FFF) as usize;
    reader.read_bytes(program_info_length)?;

    let mut remaining = section_length
        .saturating_sub(9)
        .saturating_sub(program_info_length)
        .saturating_sub(4);
    let mut streams = Vec::new();
    while remaining >= 5 {
        let stream_type = reader.read_u8()?;
        let elementary_pid = reader.read_u16::<BigEndian>()? & 0x1FFF;
        let es_info_length = (reader.read_u16::<BigEndian>()? & 0x0FFF) as usize;
        let es_info = reader.read_bytes(es_info_length)?.freeze();
        streams.push(PmtStream {
            stream_type,
            elementary_pid,
            es_info,
        });
        remaining = remaining.saturating_sub(5 + es_info_length);
        if streams.len() > define::MAX_ELEMENTARY_STREAMS {
            return Err(MpegTsError::TooManyStreams);
        }
    }

    Ok(Pmt {
        program_number,
        pcr_pid,
        version_number,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pmt() -> Pmt {
        Pmt {
            program_number: 1,
            pcr_pid: 0x100,
            version_number: 0,
            streams: vec![
                PmtStream {
                    stream_type: define::PSI_STREAM_H265,
                    elementary_pid: 0x100,
                    es_info: Bytes::new(),
                },
                PmtStream {
                    stream_type: define::PSI_STREAM_PRIVATE_DATA,
                    elementary_pid: 0x101,
                    es_info: Bytes::from_static(&[0x05, 0x04, b'O', b'p', b'u', b's']),
                },
            ],
        }
    }

    #[test]
    fn test_pmt_mux_parse_round_trip() {
        let pmt = sample_pmt();
        let data = PmtMuxer::new().write(&pmt).unwrap();
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed, pmt);
    }

    #[test]
    fn test_rewrite_same_pids_byte_equivalent() {
        let first = PmtMuxer::new().write(&sample_pmt()).unwrap();
        let reparsed = parse(&first).unwrap();
        let second = PmtMuxer::new().write(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_opus_registration_descriptor_survives() {
        let data = PmtMuxer::new().write(&sample_pmt()).unwrap();
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.streams[1].es_info.as_ref(), b"\x05\x04Opus");
    }
}
