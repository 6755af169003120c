use {
    super::{crc32, define, errors::MpegTsError},
    crate::bytesio::{bytes_reader::BytesReader, bytes_writer::BytesWriter},
    byteorder::{BigEndian, LittleEndian},
    bytes::BytesMut,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Program association table (ISO/IEC 13818-1 §2.4.4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version_number: u8, // 5 bits
    pub programs: Vec<PatEntry>,
}

impl Default for Pat {
    fn default() -> Self {
        Self::new()
    }
}

impl Pat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transport_stream_id: 1,
            version_number: 0,
            programs: Vec::new(),
        }
    }

    /// Serialise the section. The body (everything between the length
    /// field and the CRC) is rendered first so the section length falls
    /// out of the finished body instead of field arithmetic.
    pub fn marshal(&self) -> Result<BytesMut, MpegTsError> {
        let mut body = BytesWriter::new();
        body.write_u16::<BigEndian>(self.transport_stream_id)?;
        // reserved(2)=11, version(5), current_next_indicator(1)=1
        body.write_u8(0xC0 | ((self.version_number & 0x1F) << 1) | 0x01)?;
        body.write_u16::<BigEndian>(0)?; // section_number, last_section_number
        for entry in &self.programs {
            body.write_u16::<BigEndian>(entry.program_number)?;
            // reserved(3)=111, PMT PID(13)
            body.write_u16::<BigEndian>(0xE000 | (entry.pmt_pid & 0x1FFF))?;
        }
        let body = body.extract_current_bytes();

        let mut section = BytesWriter::new();
        section.write_u8(define::PAT_TID_PAS)?;
        // section_syntax_indicator(1)=1, '0'(1), reserved(2)=11, length(12);
        // the length counts the body plus the 4 CRC bytes.
        section.write_u16::<BigEndian>(0xB000 | (body.len() as u16 + 4))?;
        section.write(&body)?;
        let crc = crc32::gen_crc32(0xFFFF_FFFF, &section.get_current_bytes());
        section.write_u32::<LittleEndian>(crc)?;
        Ok(section.extract_current_bytes())
    }

    /// Parse a section (pointer field already consumed).
    pub fn parse(section: &[u8]) -> Result<Self, MpegTsError> {
        let mut reader = BytesReader::new(BytesMut::from(section));

        let table_id = reader.read_u8()?;
        if table_id != define::PAT_TID_PAS {
            return Err(MpegTsError::LostSync);
        }
        let section_length = (reader.read_u16::<BigEndian>()? & 0x0FFF) as usize;
        let transport_stream_id = reader.read_u16::<BigEndian>()?;
        let version_number = (reader.read_u8()? >> 1) & 0x1F;
        reader.read_u16::<BigEndian>()?; // section numbers

        // 5 header bytes already consumed past the length field, 4
        // trailing CRC bytes.
        let program_bytes = section_length.saturating_sub(5 + 4);
        let mut programs = Vec::new();
        for _ in 0..program_bytes / 4 {
            let program_number = reader.read_u16::<BigEndian>()?;
            let pid = reader.read_u16::<BigEndian>()? & 0x1FFF;
            if program_number != 0 {
                programs.push(PatEntry {
                    program_number,
                    pmt_pid: pid,
                });
            }
        }

        Ok(Self {
            transport_stream_id,
            version_number,
            programs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pat_marshal_parse_round_trip() {
        let pat = Pat {
            transport_stream_id: 1,
            version_number: 0,
            programs: vec![PatEntry {
                program_number: 1,
                pmt_pid: define::PMT_PID,
            }],
        };
        let data = pat.marshal().unwrap();
        // header(3+5) + entry(4) + crc(4)
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], define::PAT_TID_PAS);
        // section_length counts everything after the length field.
        let length = u16::from_be_bytes([data[1], data[2]]) & 0x0FFF;
        assert_eq!(length as usize, data.len() - 3);
        assert_eq!(Pat::parse(&data).unwrap(), pat);
    }

    #[test]
    fn test_rewrite_same_pids_byte_equivalent() {
        let pat = Pat {
            transport_stream_id: 7,
            version_number: 3,
            programs: vec![PatEntry {
                program_number: 1,
                pmt_pid: 0x1000,
            }],
        };
        let first = pat.marshal().unwrap();
        let reparsed = Pat::parse(&first).unwrap();
        let second = reparsed.marshal().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_pat_is_just_header_and_crc() {
        let data = Pat::new().marshal().unwrap();
        assert_eq!(data.len(), 12);
    }

    #[test]
    fn test_parse_rejects_wrong_table_id() {
        assert!(
            Pat::parse(&[0x02, 0xB0, 0x0D, 0, 1, 0xC1, 0, 0, 0, 1, 0xE1, 0, 0, 0, 0, 0]).is_err()
        );
    }
}
