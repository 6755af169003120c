use {
    crate::{
        bytesio::{bytes_reader::BytesReader, bytes_writer::BytesWriter},
        media::{
            AudioParams, BitstreamFormat, CodecId, MediaKind, MediaPacket, MediaTrack,
            PacketFlags, Timebase, VideoParams,
        },
    },
    byteorder::BigEndian,
    bytes::{Bytes, BytesMut},
    serde::{Deserialize, Serialize},
};

#[derive(Debug, thiserror::Error)]
pub enum OvtFrameError {
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("bytes read error: {0}")]
    BytesReadError(#[from] crate::bytesio::errors::BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[from] crate::bytesio::errors::BytesWriteError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown codec tag: {0}")]
    UnknownCodec(u8),
}

mod frame_type {
    pub const REQUEST: u8 = 0;
    pub const DESCRIBE: u8 = 1;
    pub const PACKET: u8 = 2;
    pub const KEYFRAME_REQUEST: u8 = 3;
    pub const END: u8 = 4;
}

/// Track metadata travels as JSON; packets as a fixed binary header plus
/// payload. Both ride inside length-delimited frames.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OvtTrack {
    pub id: u32,
    pub kind: String,
    pub codec: String,
    pub timebase_num: u32,
    pub timebase_den: u32,
    #[serde(default)]
    pub extradata_hex: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u8,
}

impl OvtTrack {
    #[must_use]
    pub fn from_media(track: &MediaTrack) -> Self {
        Self {
            id: track.id,
            kind: match track.kind {
                MediaKind::Video => "video",
                MediaKind::Audio => "audio",
                MediaKind::Data => "data",
            }
            .to_string(),
            codec: track.codec.to_string(),
            timebase_num: track.timebase.num,
            timebase_den: track.timebase.den,
            extradata_hex: track.extradata.as_ref().map(hex::encode),
            width: track.video.map_or(0, |v| v.width),
            height: track.video.map_or(0, |v| v.height),
            sample_rate: track.audio.map_or(0, |a| a.sample_rate),
            channels: track.audio.map_or(0, |a| a.channels),
        }
    }

    pub fn to_media(&self) -> Result<MediaTrack, OvtFrameError> {
        let codec = match self.codec.as_str() {
            "h264" => CodecId::H264,
            "h265" => CodecId::H265,
            "aac" => CodecId::Aac,
            "opus" => CodecId::Opus,
            "vp8" => CodecId::Vp8,
            _ => return Err(OvtFrameError::UnknownCodec(0)),
        };
        let timebase = Timebase::new(self.timebase_num, self.timebase_den);
        let mut track = match self.kind.as_str() {
            "video" => MediaTrack::video(
                self.id,
                codec,
                timebase,
                VideoParams {
                    width: self.width,
                    height: self.height,
                    fps_milli: 0,
                },
            ),
            _ => MediaTrack::audio(
                self.id,
                codec,
                timebase,
                AudioParams {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                },
            ),
        };
        if let Some(extradata) = &self.extradata_hex {
            if let Ok(bytes) = hex::decode(extradata) {
                track = track.with_extradata(Bytes::from(bytes));
            }
        }
        Ok(track)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OvtRequest {
    pub app: String,
    pub stream: String,
}

#[derive(Debug)]
pub enum OvtFrame {
    /// Edge asks for one stream.
    Request(OvtRequest),
    /// Origin answers with the track set.
    Describe(Vec<OvtTrack>),
    /// One media packet, original DTS and flags preserved end-to-end.
    Packet(MediaPacket),
    /// Edge-side subscriber wants a keyframe.
    KeyframeRequest,
    /// Origin-side stream stopped.
    End,
}

impl OvtFrame {
    pub fn marshal(&self) -> Result<BytesMut, OvtFrameError> {
        let mut writer = BytesWriter::new();
        match self {
            Self::Request(request) => {
                writer.write_u8(frame_type::REQUEST)?;
                writer.write(&serde_json::to_vec(request)?)?;
            }
            Self::Describe(tracks) => {
                writer.write_u8(frame_type::DESCRIBE)?;
                writer.write(&serde_json::to_vec(tracks)?)?;
            }
            Self::Packet(packet) => {
                writer.write_u8(frame_type::PACKET)?;
                writer.write_u32::<BigEndian>(packet.track_id)?;
                writer.write_u64::<BigEndian>(packet.pts as u64)?;
                writer.write_u64::<BigEndian>(packet.dts as u64)?;
                writer.write_u64::<BigEndian>(packet.duration as u64)?;
                writer.write_u32::<BigEndian>(packet.timebase.num)?;
                writer.write_u32::<BigEndian>(packet.timebase.den)?;
                let mut flag_bits = 0u8;
                if packet.flags.keyframe {
                    flag_bits |= 0x01;
                }
                if packet.flags.discontinuity {
                    flag_bits |= 0x02;
                }
                if packet.flags.end_of_stream {
                    flag_bits |= 0x04;
                }
                writer.write_u8(flag_bits)?;
                writer.write_u8(match packet.bitstream {
                    BitstreamFormat::AnnexB => 0,
                    BitstreamFormat::Avcc => 1,
                    BitstreamFormat::Adts => 2,
                    BitstreamFormat::Raw => 3,
                })?;
                writer.write(&packet.payload)?;
            }
            Self::KeyframeRequest => writer.write_u8(frame_type::KEYFRAME_REQUEST)?,
            Self::End => writer.write_u8(frame_type::END)?,
        }
        Ok(writer.extract_current_bytes())
    }

    pub fn parse(data: BytesMut) -> Result<Self, OvtFrameError> {
        let mut reader = BytesReader::new(data);
        let kind = reader.read_u8()?;
        match kind {
            frame_type::REQUEST => {
                let body = reader.extract_remaining_bytes();
                Ok(Self::Request(serde_json::from_slice(&body)?))
            }
            frame_type::DESCRIBE => {
                let body = reader.extract_remaining_bytes();
                Ok(Self::Describe(serde_json::from_slice(&body)?))
            }
            frame_type::PACKET => {
                let track_id = reader.read_u32::<BigEndian>()?;
                let pts = reader.read_u64::<BigEndian>()? as i64;
                let dts = reader.read_u64::<BigEndian>()? as i64;
                let duration = reader.read_u64::<BigEndian>()? as i64;
                let num = reader.read_u32::<BigEndian>()?;
                let den = reader.read_u32::<BigEndian>()?;
                let flag_bits = reader.read_u8()?;
                let bitstream = match reader.read_u8()? {
                    0 => BitstreamFormat::AnnexB,
                    1 => BitstreamFormat::Avcc,
                    2 => BitstreamFormat::Adts,
                    3 => BitstreamFormat::Raw,
                    other => return Err(OvtFrameError::UnknownFrameType(other)),
                };
                Ok(Self::Packet(MediaPacket {
                    track_id,
                    pts,
                    dts,
                    duration,
                    timebase: Timebase::new(num, den),
                    flags: PacketFlags {
                        keyframe: flag_bits & 0x01 != 0,
                        discontinuity: flag_bits & 0x02 != 0,
                        end_of_stream: flag_bits & 0x04 != 0,
                    },
                    bitstream,
                    payload: reader.extract_remaining_bytes().freeze(),
                }))
            }
            frame_type::KEYFRAME_REQUEST => Ok(Self::KeyframeRequest),
            frame_type::END => Ok(Self::End),
            other => Err(OvtFrameError::UnknownFrameType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_frame_round_trip() {
        let packet = MediaPacket {
            track_id: 3,
            pts: 92_970,
            dts: 90_000,
            duration: 2_970,
            timebase: Timebase::MPEG,
            flags: PacketFlags::KEYFRAME,
            bitstream: BitstreamFormat::Avcc,
            payload: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x01]),
        };
        let wire = OvtFrame::Packet(packet.clone()).marshal().unwrap();
        match OvtFrame::parse(wire).unwrap() {
            OvtFrame::Packet(out) => {
                assert_eq!(out.track_id, packet.track_id);
                assert_eq!(out.pts, packet.pts);
                assert_eq!(out.dts, packet.dts);
                assert_eq!(out.timebase, packet.timebase);
                assert!(out.flags.keyframe);
                assert_eq!(out.bitstream, BitstreamFormat::Avcc);
                assert_eq!(out.payload, packet.payload);
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn test_describe_round_trip() {
        let track = MediaTrack::video(
            0,
            CodecId::H264,
            Timebase::MPEG,
            VideoParams {
                width: 1920,
                height: 1080,
                fps_milli: 0,
            },
        )
        .with_extradata(Bytes::from_static(&[1, 2, 3]));
        let ovt = OvtTrack::from_media(&track);
        let wire = OvtFrame::Describe(vec![ovt]).marshal().unwrap();
        match OvtFrame::parse(wire).unwrap() {
            OvtFrame::Describe(tracks) => {
                let media = tracks[0].to_media().unwrap();
                assert_eq!(media, track);
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn test_request_round_trip() {
        let wire = OvtFrame::Request(OvtRequest {
            app: "app".into(),
            stream: "s1".into(),
        })
        .marshal()
        .unwrap();
        match OvtFrame::parse(wire).unwrap() {
            OvtFrame::Request(request) => {
                assert_eq!(request.app, "app");
                assert_eq!(request.stream, "s1");
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(OvtFrame::parse(BytesMut::from(&[0xFFu8][..])).is_err());
    }
}
