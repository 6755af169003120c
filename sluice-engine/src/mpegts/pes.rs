use {
    super::errors::MpegTsError,
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
};

pub mod stream_id {
    pub const VIDEO: u8 = 0xE0;
    pub const AUDIO: u8 = 0xC0;
    pub const PRIVATE_1: u8 = 0xBD;
}

/// Encode one 33-bit timestamp in the 5-byte PES form.
fn write_timestamp(writer: &mut BytesWriter, marker: u8, ts: i64) -> Result<(), MpegTsError> {
    let ts = ts & 0x1_FFFF_FFFF;
    writer.write_u8((marker << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 0x01)?;
    writer.write_u16::<BigEndian>((((ts >> 15) as u16 & 0x7FFF) << 1) | 0x01)?;
    writer.write_u16::<BigEndian>((((ts as u16) & 0x7FFF) << 1) | 0x01)?;
    Ok(())
}

fn read_timestamp(data: &[u8]) -> i64 {
    let a = i64::from(data[0] >> 1 & 0x07);
    let b = i64::from((u16::from(data[1]) << 7) | u16::from(data[2] >> 1));
    let c = i64::from((u16::from(data[3]) << 7) | u16::from(data[4] >> 1));
    (a << 30) | (b << 15) | c
}

/// Serialise a PES header. `payload_len` is the ES payload length that
/// follows; video streams may pass 0 for an unbounded PES packet.
pub fn write_pes_header(
    writer: &mut BytesWriter,
    sid: u8,
    payload_len: usize,
    pts: i64,
    dts: i64,
) -> Result<(), MpegTsError> {
    writer.write_u24::<BigEndian>(0x00_0001)?;
    writer.write_u8(sid)?;

    let has_dts = dts != pts;
    let header_data_len: usize = if has_dts { 10 } else { 5 };
    let pes_len = payload_len + 3 + header_data_len;
    let pes_len = if sid == stream_id::VIDEO || pes_len > u16::MAX as usize {
        0
    } else {
        pes_len
    };
    writer.write_u16::<BigEndian>(pes_len as u16)?;

    writer.write_u8(0x80)?; // marker bits, no scrambling
    writer.write_u8(if has_dts { 0xC0 } else { 0x80 })?;
    writer.write_u8(header_data_len as u8)?;
    write_timestamp(writer, if has_dts { 0x03 } else { 0x02 }, pts)?;
    if has_dts {
        write_timestamp(writer, 0x01, dts)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub stream_id: u8,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Offset of the ES payload within the parsed buffer.
    pub payload_offset: usize,
}

/// Parse a PES header from the start of an assembled PES packet.
pub fn parse_pes_header(data: &[u8]) -> Result<PesHeader, MpegTsError> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        return Err(MpegTsError::MalformedPesHeader);
    }
    let sid = data[3];
    let flags = data[7];
    let header_data_len = data[8] as usize;
    let payload_offset = 9 + header_data_len;
    if data.len() < payload_offset {
        return Err(MpegTsError::MalformedPesHeader);
    }

    let mut pts = None;
    let mut dts = None;
    if flags & 0x80 != 0 {
        if header_data_len < 5 {
            return Err(MpegTsError::MalformedPesHeader);
        }
        pts = Some(read_timestamp(&data[9..14]));
        if flags & 0x40 != 0 {
            if header_data_len < 10 {
                return Err(MpegTsError::MalformedPesHeader);
            }
            dts = Some(read_timestamp(&data[14..19]));
        }
    }

    Ok(PesHeader {
        stream_id: sid,
        pts,
        dts,
        payload_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pes_round_trip_pts_only() {
        let mut writer = BytesWriter::new();
        write_pes_header(&mut writer, stream_id::AUDIO, 100, 123_456, 123_456).unwrap();
        let data = writer.extract_current_bytes();
        let header = parse_pes_header(&data).unwrap();
        assert_eq!(header.stream_id, stream_id::AUDIO);
        assert_eq!(header.pts, Some(123_456));
        assert_eq!(header.dts, None);
        assert_eq!(header.payload_offset, 14);
    }

    #[test]
    fn test_pes_round_trip_pts_dts() {
        let mut writer = BytesWriter::new();
        write_pes_header(&mut writer, stream_id::VIDEO, 0, 90_090, 87_087).unwrap();
        let data = writer.extract_current_bytes();
        let header = parse_pes_header(&data).unwrap();
        assert_eq!(header.pts, Some(90_090));
        assert_eq!(header.dts, Some(87_087));
        assert_eq!(header.payload_offset, 19);
    }

    #[test]
    fn test_pes_33bit_wrap_value() {
        let ts = (1i64 << 33) - 90_000;
        let mut writer = BytesWriter::new();
        write_pes_header(&mut writer, stream_id::VIDEO, 0, ts, ts).unwrap();
        let data = writer.extract_current_bytes();
        let header = parse_pes_header(&data).unwrap();
        assert_eq!(header.pts, Some(ts));
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(parse_pes_header(&[0, 0, 2, 0xE0, 0, 0, 0x80, 0x80, 5]).is_err());
    }
}
