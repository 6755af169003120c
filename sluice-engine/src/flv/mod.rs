pub mod demuxer;
pub mod errors;
pub mod muxer;

pub mod tag_type {
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const SCRIPT_DATA: u8 = 18;
}

pub mod frame_type {
    pub const KEY_FRAME: u8 = 1;
    pub const INTER_FRAME: u8 = 2;
}

pub mod avc_packet_type {
    pub const AVC_SEQHDR: u8 = 0;
    pub const AVC_NALU: u8 = 1;
    pub const AVC_EOS: u8 = 2;
}

pub mod aac_packet_type {
    pub const AAC_SEQHDR: u8 = 0;
    pub const AAC_RAW: u8 = 1;
}

pub mod sound_format {
    pub const AAC: u8 = 10;
}

pub mod codec_id {
    pub const H264: u8 = 7;
    pub const H265: u8 = 12;
}

use crate::bytesio::bytes_reader::BytesReader;
use errors::FlvError;

/*
 ** FLV tag layout **
 +----------------------------------------------------------------------------------+
 | Tag Type(1) | Data Size(3) | Timestamp(3) | Timestamp Ext(1) | Stream ID(3) | Data |
 +----------------------------------------------------------------------------------+

 **** Video tag data ****
 +-------------------------------------------------+
 | FrameType(4 bits) | CodecID(4 bits) | Video Data|
 +-------------------------------------------------+
 When CodecID == 7 (AVC):
 | AVCPacketType(1) | CompositionTime(3, signed) | AVCC payload |

 **** Audio tag data ****
 +----------------------------------------------------------------------------+
 | SoundFormat(4 bits) | SoundRate(2) | SoundSize(1) | SoundType(1) | Payload |
 +----------------------------------------------------------------------------+
 When SoundFormat == 10 (AAC):
 | AACPacketType(1) | raw AAC frame or AudioSpecificConfig |
*/

#[derive(Debug, Clone, Copy)]
pub struct VideoTagHeader {
    pub frame_type: u8,
    pub codec_id: u8,
    pub avc_packet_type: u8,
    pub composition_time: i32,
}

impl VideoTagHeader {
    pub fn unmarshal(reader: &mut BytesReader) -> Result<Self, FlvError> {
        let byte = reader.read_u8()?;
        let frame_type = byte >> 4;
        let codec_id = byte & 0x0F;
        let mut avc_packet_type = 0;
        let mut composition_time = 0i32;
        if codec_id == codec_id::H264 || codec_id == codec_id::H265 {
            avc_packet_type = reader.read_u8()?;
            let raw = reader.read_u24::<byteorder::BigEndian>()?;
            // 24-bit signed
            composition_time = if raw & 0x80_0000 != 0 {
                (raw | 0xFF00_0000) as i32
            } else {
                raw as i32
            };
        }
        Ok(Self {
            frame_type,
            codec_id,
            avc_packet_type,
            composition_time,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioTagHeader {
    pub sound_format: u8,
    pub sound_rate: u8,
    pub sound_size: u8,
    pub sound_type: u8,
    pub aac_packet_type: u8,
}

impl AudioTagHeader {
    pub fn unmarshal(reader: &mut BytesReader) -> Result<Self, FlvError> {
        let byte = reader.read_u8()?;
        let sound_format = byte >> 4;
        let mut aac_packet_type = 0;
        if sound_format == sound_format::AAC {
            aac_packet_type = reader.read_u8()?;
        }
        Ok(Self {
            sound_format,
            sound_rate: (byte >> 2) & 0x03,
            sound_size: (byte >> 1) & 0x01,
            sound_type: byte & 0x01,
            aac_packet_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_video_tag_header_keyframe_avc() {
        // frame_type=1 codec=7, AVC NALU, cts=0x000102
        let data = BytesMut::from(&[0x17, 0x01, 0x00, 0x01, 0x02][..]);
        let mut reader = BytesReader::new(data);
        let header = VideoTagHeader::unmarshal(&mut reader).unwrap();
        assert_eq!(header.frame_type, frame_type::KEY_FRAME);
        assert_eq!(header.codec_id, codec_id::H264);
        assert_eq!(header.avc_packet_type, avc_packet_type::AVC_NALU);
        assert_eq!(header.composition_time, 0x0102);
    }

    #[test]
    fn test_video_tag_header_negative_cts() {
        let data = BytesMut::from(&[0x27, 0x01, 0xFF, 0xFF, 0xFE][..]);
        let mut reader = BytesReader::new(data);
        let header = VideoTagHeader::unmarshal(&mut reader).unwrap();
        assert_eq!(header.frame_type, frame_type::INTER_FRAME);
        assert_eq!(header.composition_time, -2);
    }

    #[test]
    fn test_audio_tag_header_aac() {
        // SoundFormat=10 (AAC), 44kHz stereo 16-bit, raw packet
        let data = BytesMut::from(&[0xAF, 0x01][..]);
        let mut reader = BytesReader::new(data);
        let header = AudioTagHeader::unmarshal(&mut reader).unwrap();
        assert_eq!(header.sound_format, sound_format::AAC);
        assert_eq!(header.aac_packet_type, aac_packet_type::AAC_RAW);
        assert_eq!(header.sound_type, 1);
    }
}
