use {
    super::errors::CodecError,
    byteorder::LittleEndian,
    bytes::{BufMut, Bytes, BytesMut},
    byteorder::ByteOrder,
};

const MAGIC: &[u8; 8] = b"OpusHead";

/// Opus identification header (RFC 7845 §5.1), used as track extradata so
/// muxers know channel count and pre-skip without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusIdHeader {
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
}

impl OpusIdHeader {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 19 || &data[0..8] != MAGIC || data[8] != 1 {
            return Err(CodecError::MalformedConfigurationRecord);
        }
        Ok(Self {
            channels: data[9],
            pre_skip: LittleEndian::read_u16(&data[10..12]),
            input_sample_rate: LittleEndian::read_u32(&data[12..16]),
        })
    }

    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(19);
        out.put_slice(MAGIC);
        out.put_u8(1); // version
        out.put_u8(self.channels);
        out.put_u16_le(self.pre_skip);
        out.put_u32_le(self.input_sample_rate);
        out.put_u16_le(0); // output gain
        out.put_u8(0); // channel mapping family
        out.freeze()
    }
}

/// Opus always runs at a 48 kHz RTP clock regardless of input rate.
pub const RTP_CLOCK_RATE: u32 = 48_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_header_round_trip() {
        let header = OpusIdHeader {
            channels: 2,
            pre_skip: 312,
            input_sample_rate: 48_000,
        };
        let bytes = header.marshal();
        assert_eq!(bytes.len(), 19);
        let parsed = OpusIdHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_rejects_wrong_magic() {
        assert!(OpusIdHeader::parse(b"OpusTags\x01\x02\x00\x00\x00\x00\x00\x00\x00\x00\x00").is_err());
    }
}
