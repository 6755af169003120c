use {
    super::{
        aac_packet_type, avc_packet_type, codec_id, errors::FlvError, frame_type, sound_format,
        AudioTagHeader, VideoTagHeader,
    },
    crate::bytesio::bytes_reader::BytesReader,
    crate::codec::{aac::AudioSpecificConfig, h264::AvcDecoderConfigurationRecord},
    crate::media::{
        AudioParams, BitstreamFormat, CodecId, MediaPacket, MediaTrack, PacketFlags, Timebase,
        TrackId, VideoParams,
    },
    bytes::BytesMut,
};

/// What one FLV tag turned into.
pub enum FlvDemuxEvent {
    /// Sequence header observed; the track identity is now known.
    TrackReady(MediaTrack),
    /// A media access unit.
    Packet(MediaPacket),
    /// Nothing usable (config repeat, unsupported codec, EOS marker).
    Skip,
}

/// Demuxes RTMP video message bodies (FLV video tag data) into packets.
///
/// Payloads stay in AVCC framing; the bitstream tag on the packet says so
/// and egress muxers convert where their container wants start codes.
pub struct FlvVideoDemuxer {
    track_id: TrackId,
    config: Option<AvcDecoderConfigurationRecord>,
    track_sent: bool,
}

impl FlvVideoDemuxer {
    #[must_use]
    pub const fn new(track_id: TrackId) -> Self {
        Self {
            track_id,
            config: None,
            track_sent: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> Option<&AvcDecoderConfigurationRecord> {
        self.config.as_ref()
    }

    pub fn demux(&mut self, timestamp: u32, data: BytesMut) -> Result<FlvDemuxEvent, FlvError> {
        let mut reader = BytesReader::new(data);
        let header = VideoTagHeader::unmarshal(&mut reader)?;

        let codec = match header.codec_id {
            codec_id::H264 => CodecId::H264,
            codec_id::H265 => CodecId::H265,
            other => {
                tracing::warn!(codec_id = other, "unsupported flv video codec, dropping tag");
                return Err(FlvError::UnsupportedCodec(other));
            }
        };

        match header.avc_packet_type {
            avc_packet_type::AVC_SEQHDR => {
                let body = reader.extract_remaining_bytes().freeze();
                let record = AvcDecoderConfigurationRecord::parse(&body)?;
                let params = record
                    .sps
                    .first()
                    .and_then(|sps| crate::codec::h264::SpsInfo::parse(sps).ok())
                    .map_or(
                        VideoParams {
                            width: 0,
                            height: 0,
                            fps_milli: 0,
                        },
                        |info| VideoParams {
                            width: info.width,
                            height: info.height,
                            fps_milli: 0,
                        },
                    );
                self.config = Some(record);
                if self.track_sent {
                    return Ok(FlvDemuxEvent::Skip);
                }
                self.track_sent = true;
                let track = MediaTrack::video(self.track_id, codec, Timebase::MILLIS, params)
                    .with_extradata(body);
                Ok(FlvDemuxEvent::TrackReady(track))
            }
            avc_packet_type::AVC_NALU => {
                if self.config.is_none() {
                    return Err(FlvError::MissingSequenceHeader);
                }
                let payload = reader.extract_remaining_bytes().freeze();
                let keyframe = header.frame_type == frame_type::KEY_FRAME;
                Ok(FlvDemuxEvent::Packet(MediaPacket {
                    track_id: self.track_id,
                    pts: i64::from(timestamp) + i64::from(header.composition_time),
                    dts: i64::from(timestamp),
                    duration: 0,
                    timebase: Timebase::MILLIS,
                    flags: PacketFlags {
                        keyframe,
                        ..PacketFlags::NONE
                    },
                    bitstream: BitstreamFormat::Avcc,
                    payload,
                }))
            }
            _ => Ok(FlvDemuxEvent::Skip),
        }
    }
}

/// Demuxes RTMP audio message bodies (FLV audio tag data) into raw AAC
/// packets plus the AudioSpecificConfig track identity.
pub struct FlvAudioDemuxer {
    track_id: TrackId,
    config: Option<AudioSpecificConfig>,
    track_sent: bool,
}

impl FlvAudioDemuxer {
    #[must_use]
    pub const fn new(track_id: TrackId) -> Self {
        Self {
            track_id,
            config: None,
            track_sent: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> Option<&AudioSpecificConfig> {
        self.config.as_ref()
    }

    pub fn demux(&mut self, timestamp: u32, data: BytesMut) -> Result<FlvDemuxEvent, FlvError> {
        let mut reader = BytesReader::new(data);
        let header = AudioTagHeader::unmarshal(&mut reader)?;

        if header.sound_format != sound_format::AAC {
            tracing::warn!(
                sound_format = header.sound_format,
                "unsupported flv sound format, dropping tag"
            );
            return Err(FlvError::UnsupportedSoundFormat(header.sound_format));
        }

        match header.aac_packet_type {
            aac_packet_type::AAC_SEQHDR => {
                let body = reader.extract_remaining_bytes().freeze();
                let config = AudioSpecificConfig::parse(&body)?;
                self.config = Some(config);
                if self.track_sent {
                    return Ok(FlvDemuxEvent::Skip);
                }
                self.track_sent = true;
                let track = MediaTrack::audio(
                    self.track_id,
                    CodecId::Aac,
                    Timebase::MILLIS,
                    AudioParams {
                        sample_rate: config.sample_rate(),
                        channels: config.channel_configuration,
                    },
                )
                .with_extradata(body);
                Ok(FlvDemuxEvent::TrackReady(track))
            }
            aac_packet_type::AAC_RAW => {
                if self.config.is_none() {
                    return Err(FlvError::MissingSequenceHeader);
                }
                Ok(FlvDemuxEvent::Packet(MediaPacket {
                    track_id: self.track_id,
                    pts: i64::from(timestamp),
                    dts: i64::from(timestamp),
                    duration: 0,
                    timebase: Timebase::MILLIS,
                    flags: PacketFlags::NONE,
                    bitstream: BitstreamFormat::Raw,
                    payload: reader.extract_remaining_bytes().freeze(),
                }))
            }
            _ => Ok(FlvDemuxEvent::Skip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn avc_seq_header_body() -> BytesMut {
        let record = AvcDecoderConfigurationRecord {
            profile_indication: 0x42,
            profile_compatibility: 0x00,
            level_indication: 0x1E,
            nalu_length_size: 4,
            sps: vec![bytes::Bytes::from_static(&[
                0x67, 0x42, 0x00, 0x1E, 0xF4, 0x21, 0x32,
            ])],
            pps: vec![bytes::Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])],
        };
        let mut tag = BytesMut::new();
        tag.put_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]); // keyframe, AVC, seqhdr, cts 0
        tag.put_slice(&record.marshal().unwrap());
        tag
    }

    #[test]
    fn test_video_sequence_header_produces_track() {
        let mut demuxer = FlvVideoDemuxer::new(0);
        match demuxer.demux(0, avc_seq_header_body()).unwrap() {
            FlvDemuxEvent::TrackReady(track) => {
                assert_eq!(track.codec, CodecId::H264);
                assert_eq!(track.video.unwrap().width, 64);
                assert!(track.extradata.is_some());
            }
            _ => panic!("expected TrackReady"),
        }
        assert!(demuxer.config().is_some());
    }

    #[test]
    fn test_video_nalu_before_seqhdr_rejected() {
        let mut demuxer = FlvVideoDemuxer::new(0);
        let mut tag = BytesMut::new();
        tag.put_slice(&[0x17, 0x01, 0x00, 0x00, 0x00]);
        tag.put_slice(&[0, 0, 0, 2, 0x65, 0x00]);
        assert!(matches!(
            demuxer.demux(0, tag),
            Err(FlvError::MissingSequenceHeader)
        ));
    }

    #[test]
    fn test_video_nalu_keyframe_packet() {
        let mut demuxer = FlvVideoDemuxer::new(0);
        demuxer.demux(0, avc_seq_header_body()).unwrap();

        let mut tag = BytesMut::new();
        tag.put_slice(&[0x17, 0x01, 0x00, 0x00, 0x21]); // cts 33
        tag.put_slice(&[0, 0, 0, 2, 0x65, 0x00]);
        match demuxer.demux(1_000, tag).unwrap() {
            FlvDemuxEvent::Packet(pkt) => {
                assert!(pkt.flags.keyframe);
                assert_eq!(pkt.dts, 1_000);
                assert_eq!(pkt.pts, 1_033);
                assert_eq!(pkt.bitstream, BitstreamFormat::Avcc);
            }
            _ => panic!("expected Packet"),
        }
    }

    #[test]
    fn test_audio_sequence_then_raw() {
        let mut demuxer = FlvAudioDemuxer::new(1);
        let asc = AudioSpecificConfig::from_params(2, 44_100, 2).unwrap();

        let mut seq = BytesMut::new();
        seq.put_slice(&[0xAF, 0x00]);
        seq.put_slice(&asc.marshal());
        match demuxer.demux(0, seq).unwrap() {
            FlvDemuxEvent::TrackReady(track) => {
                assert_eq!(track.audio.unwrap().sample_rate, 44_100);
            }
            _ => panic!("expected TrackReady"),
        }

        let mut raw = BytesMut::new();
        raw.put_slice(&[0xAF, 0x01, 0xAA, 0xBB]);
        match demuxer.demux(23, raw).unwrap() {
            FlvDemuxEvent::Packet(pkt) => {
                assert_eq!(pkt.payload.as_ref(), &[0xAA, 0xBB]);
                assert_eq!(pkt.dts, 23);
                assert_eq!(pkt.bitstream, BitstreamFormat::Raw);
            }
            _ => panic!("expected Packet"),
        }
    }

    #[test]
    fn test_non_aac_rejected() {
        let mut demuxer = FlvAudioDemuxer::new(1);
        let tag = BytesMut::from(&[0x2F, 0x01, 0x00][..]); // MP3
        assert!(matches!(
            demuxer.demux(0, tag),
            Err(FlvError::UnsupportedSoundFormat(_))
        ));
    }
}
