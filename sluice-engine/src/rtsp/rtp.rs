use {super::errors::RtspError, bytes::Bytes};

/// One parsed RTP packet (RFC 3550 §5.1). Header extensions and padding
/// are honoured; CSRC lists are skipped.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(data: &[u8]) -> Result<Self, RtspError> {
        if data.len() < 12 {
            return Err(RtspError::MalformedRtp);
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(RtspError::MalformedRtp);
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = 12 + csrc_count * 4;
        if extension {
            if data.len() < offset + 4 {
                return Err(RtspError::MalformedRtp);
            }
            let ext_words =
                u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
        }
        if data.len() < offset {
            return Err(RtspError::MalformedRtp);
        }
        let mut end = data.len();
        if padding {
            let pad = *data.last().ok_or(RtspError::MalformedRtp)? as usize;
            if pad == 0 || offset + pad > end {
                return Err(RtspError::MalformedRtp);
            }
            end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_packet() -> Vec<u8> {
        let mut data = vec![
            0x80, 0xE0, 0x00, 0x2A, // v2, marker, pt 96, seq 42
            0x00, 0x01, 0x5F, 0x90, // timestamp 90000
            0xDE, 0xAD, 0xBE, 0xEF, // ssrc
        ];
        data.extend_from_slice(&[0x01, 0x02, 0x03]);
        data
    }

    #[test]
    fn test_parse_basic() {
        let packet = RtpPacket::parse(&basic_packet()).unwrap();
        assert!(packet.marker);
        assert_eq!(packet.payload_type, 96);
        assert_eq!(packet.sequence, 42);
        assert_eq!(packet.timestamp, 90_000);
        assert_eq!(packet.ssrc, 0xDEAD_BEEF);
        assert_eq!(packet.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_parse_with_extension() {
        let mut data = basic_packet();
        data[0] |= 0x10; // extension bit
        // splice a 1-word extension between header and payload
        let ext = [0xBE, 0xDE, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD];
        data.splice(12..12, ext.iter().copied());
        let packet = RtpPacket::parse(&data).unwrap();
        assert_eq!(packet.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_parse_with_padding() {
        let mut data = basic_packet();
        data[0] |= 0x20;
        data.extend_from_slice(&[0x00, 0x02]); // 2 padding bytes, last = count
        let packet = RtpPacket::parse(&data).unwrap();
        assert_eq!(packet.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut data = basic_packet();
        data[0] = 0x40;
        assert!(RtpPacket::parse(&data).is_err());
    }

    #[test]
    fn test_rejects_truncated() {
        assert!(RtpPacket::parse(&[0x80, 0x60]).is_err());
    }
}
