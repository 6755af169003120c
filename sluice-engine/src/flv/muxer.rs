use {
    super::errors::FlvError,
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
    bytes::BytesMut,
};

pub const HEADER_LENGTH: u32 = 11;

/// Serialises FLV headers and tags for HTTP-FLV delivery.
#[derive(Default)]
pub struct FlvMuxer {
    pub writer: BytesWriter,
}

impl FlvMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: BytesWriter::new(),
        }
    }

    pub fn write_flv_header(&mut self, has_audio: bool, has_video: bool) -> Result<(), FlvError> {
        self.writer.write(b"FLV")?;
        self.writer.write_u8(0x01)?;
        let flags = (u8::from(has_audio) << 2) | u8::from(has_video);
        self.writer.write_u8(flags)?;
        self.writer.write_u32::<BigEndian>(9)?;
        Ok(())
    }

    pub fn write_flv_tag_header(
        &mut self,
        tag_type: u8,
        data_size: u32,
        timestamp: u32,
    ) -> Result<(), FlvError> {
        self.writer.write_u8(tag_type)?;
        self.writer.write_u24::<BigEndian>(data_size)?;
        self.writer.write_u24::<BigEndian>(timestamp & 0xFF_FFFF)?;
        self.writer.write_u8((timestamp >> 24) as u8)?;
        self.writer.write_u24::<BigEndian>(0)?; // stream id
        Ok(())
    }

    pub fn write_flv_tag_body(&mut self, body: BytesMut) -> Result<(), FlvError> {
        self.writer.write(&body[..])?;
        Ok(())
    }

    pub fn write_previous_tag_size(&mut self, size: u32) -> Result<(), FlvError> {
        self.writer.write_u32::<BigEndian>(size)?;
        Ok(())
    }

    pub fn extract_current_bytes(&mut self) -> BytesMut {
        self.writer.extract_current_bytes()
    }
}

/// FLV tag-data builders shared by RTMP egress paths (play sessions,
/// push relays) and HTTP-FLV.
pub mod tag_body {
    use super::super::{aac_packet_type, avc_packet_type};
    use bytes::{BufMut, BytesMut};

    #[must_use]
    pub fn avc_sequence_header(extradata: &[u8]) -> BytesMut {
        let mut tag = BytesMut::with_capacity(extradata.len() + 5);
        tag.put_slice(&[0x17, avc_packet_type::AVC_SEQHDR, 0x00, 0x00, 0x00]);
        tag.put_slice(extradata);
        tag
    }

    #[must_use]
    pub fn aac_sequence_header(config: &[u8]) -> BytesMut {
        let mut tag = BytesMut::with_capacity(config.len() + 2);
        tag.put_slice(&[0xAF, aac_packet_type::AAC_SEQHDR]);
        tag.put_slice(config);
        tag
    }

    #[must_use]
    pub fn avc_nalu(keyframe: bool, composition_time: u32, avcc: &[u8]) -> BytesMut {
        let mut tag = BytesMut::with_capacity(avcc.len() + 5);
        tag.put_u8(if keyframe { 0x17 } else { 0x27 });
        tag.put_u8(avc_packet_type::AVC_NALU);
        tag.put_slice(&composition_time.to_be_bytes()[1..4]);
        tag.put_slice(avcc);
        tag
    }

    #[must_use]
    pub fn aac_raw(frame: &[u8]) -> BytesMut {
        let mut tag = BytesMut::with_capacity(frame.len() + 2);
        tag.put_slice(&[0xAF, aac_packet_type::AAC_RAW]);
        tag.put_slice(frame);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flv_header_flags() {
        let mut muxer = FlvMuxer::new();
        muxer.write_flv_header(true, true).unwrap();
        let data = muxer.extract_current_bytes();
        assert_eq!(&data[0..3], b"FLV");
        assert_eq!(data[4], 0x05);
        assert_eq!(data.len(), 9);
    }

    #[test]
    fn test_tag_header_extended_timestamp() {
        let mut muxer = FlvMuxer::new();
        muxer
            .write_flv_tag_header(super::super::tag_type::VIDEO, 5, 0x1234_5678)
            .unwrap();
        let data = muxer.extract_current_bytes();
        assert_eq!(data[0], 9);
        // lower 24 bits then the extension byte
        assert_eq!(&data[4..7], &[0x34, 0x56, 0x78]);
        assert_eq!(data[7], 0x12);
    }
}
