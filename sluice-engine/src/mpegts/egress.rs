use {
    super::{define, errors::MpegTsError, muxer::{TsMuxer, MPEG_FLAG_IDR_FRAME}},
    crate::{
        codec::{aac::AudioSpecificConfig, h264},
        media::{BitstreamFormat, CodecId, MediaPacket, MediaTrack, Timebase, TrackId},
    },
    bytes::{BufMut, BytesMut},
    std::collections::HashMap,
};

struct EgressTrack {
    pid: u16,
    codec: CodecId,
    aac_config: Option<AudioSpecificConfig>,
    avc_record: Option<h264::AvcDecoderConfigurationRecord>,
}

/// Re-muxes routed packets into a transport stream: the egress half of
/// SRT delivery and the recording sink's container.
///
/// Continuity counters live in the inner muxer and stay consistent for
/// the lifetime of one subscriber.
pub struct TsEgressMuxer {
    muxer: TsMuxer,
    tracks: HashMap<TrackId, EgressTrack>,
}

impl TsEgressMuxer {
    pub fn new(tracks: &[MediaTrack]) -> Result<Self, MpegTsError> {
        let mut muxer = TsMuxer::new();
        let mut map = HashMap::new();
        for track in tracks {
            let (stream_type, es_info) = match track.codec {
                CodecId::H264 => (define::PSI_STREAM_H264, BytesMut::new()),
                CodecId::H265 => (define::PSI_STREAM_H265, BytesMut::new()),
                CodecId::Aac => (define::PSI_STREAM_AAC, BytesMut::new()),
                CodecId::Opus => (
                    define::PSI_STREAM_PRIVATE_DATA,
                    BytesMut::from(&define::OPUS_REGISTRATION_DESCRIPTOR[..]),
                ),
                CodecId::Vp8 => {
                    tracing::warn!(track = track.id, "vp8 cannot ride mpeg-ts, track skipped");
                    continue;
                }
            };
            let pid = muxer.add_stream(stream_type, es_info)?;
            let aac_config = (track.codec == CodecId::Aac)
                .then(|| {
                    track
                        .extradata
                        .as_deref()
                        .and_then(|d| AudioSpecificConfig::parse(d).ok())
                })
                .flatten();
            let avc_record = (track.codec == CodecId::H264)
                .then(|| {
                    track
                        .extradata
                        .as_deref()
                        .and_then(|d| h264::AvcDecoderConfigurationRecord::parse(d).ok())
                })
                .flatten();
            map.insert(
                track.id,
                EgressTrack {
                    pid,
                    codec: track.codec,
                    aac_config,
                    avc_record,
                },
            );
        }
        Ok(Self { muxer, tracks: map })
    }

    /// Mux one packet; returns the TS bytes produced (possibly empty for
    /// skipped tracks).
    pub fn write(&mut self, packet: &MediaPacket) -> Result<BytesMut, MpegTsError> {
        let Some(track) = self.tracks.get(&packet.track_id) else {
            return Ok(BytesMut::new());
        };
        let ninety = packet.rescaled(Timebase::MPEG);
        let mut flags = 0u16;
        if packet.flags.keyframe {
            flags |= MPEG_FLAG_IDR_FRAME;
        }

        let payload = match track.codec {
            CodecId::H264 | CodecId::H265 => {
                let mut annexb = match packet.bitstream {
                    BitstreamFormat::AnnexB => BytesMut::from(&packet.payload[..]),
                    BitstreamFormat::Avcc => {
                        let length_size = track
                            .avc_record
                            .as_ref()
                            .map_or(4, |r| r.nalu_length_size);
                        h264::avcc_to_annexb(&packet.payload, length_size).map_err(|_| {
                            MpegTsError::UnsupportedStreamType(define::PSI_STREAM_H264)
                        })?
                    }
                    _ => return Ok(BytesMut::new()),
                };
                // Repeat parameter sets before each keyframe so mid-stream
                // joiners can decode without the init segment.
                if packet.flags.keyframe {
                    if let Some(record) = &track.avc_record {
                        let mut with_params =
                            BytesMut::from(&record.annexb_parameter_sets()[..]);
                        with_params.put_slice(&annexb);
                        annexb = with_params;
                    }
                }
                annexb
            }
            CodecId::Aac => match packet.bitstream {
                BitstreamFormat::Adts => BytesMut::from(&packet.payload[..]),
                BitstreamFormat::Raw => {
                    let Some(config) = &track.aac_config else {
                        return Ok(BytesMut::new());
                    };
                    config.adts_frame(&packet.payload)
                }
                _ => return Ok(BytesMut::new()),
            },
            CodecId::Opus => {
                let mut framed = BytesMut::with_capacity(packet.payload.len() + 4);
                framed.put_slice(&[0x7F, 0xE0]);
                let mut size = packet.payload.len();
                while size >= 0xFF {
                    framed.put_u8(0xFF);
                    size -= 0xFF;
                }
                framed.put_u8(size as u8);
                framed.put_slice(&packet.payload);
                framed
            }
            CodecId::Vp8 => return Ok(BytesMut::new()),
        };

        self.muxer
            .write(track.pid, ninety.pts, ninety.dts, flags, payload)?;
        Ok(self.muxer.get_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioParams, PacketFlags, VideoParams};
    use bytes::Bytes;

    fn h265_track() -> MediaTrack {
        MediaTrack::video(
            0,
            CodecId::H265,
            Timebase::MPEG,
            VideoParams {
                width: 1920,
                height: 1080,
                fps_milli: 30_000,
            },
        )
    }

    fn opus_track() -> MediaTrack {
        MediaTrack::audio(
            1,
            CodecId::Opus,
            Timebase::rtp(48_000),
            AudioParams {
                sample_rate: 48_000,
                channels: 2,
            },
        )
    }

    #[test]
    fn test_h265_opus_egress_produces_ts() {
        let mut egress = TsEgressMuxer::new(&[h265_track(), opus_track()]).unwrap();
        let video = MediaPacket {
            track_id: 0,
            pts: 3_003,
            dts: 0,
            duration: 0,
            timebase: Timebase::MPEG,
            flags: PacketFlags::KEYFRAME,
            bitstream: BitstreamFormat::AnnexB,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x26, 0x01, 0xAA]),
        };
        let out = egress.write(&video).unwrap();
        assert!(!out.is_empty());
        assert_eq!(out.len() % define::TS_PACKET_SIZE, 0);

        let audio = MediaPacket {
            track_id: 1,
            pts: 960,
            dts: 960,
            duration: 960,
            timebase: Timebase::rtp(48_000),
            flags: PacketFlags::NONE,
            bitstream: BitstreamFormat::Raw,
            payload: Bytes::from_static(&[0x01, 0x02, 0x03]),
        };
        let out = egress.write(&audio).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn test_round_trip_continuity_over_demuxer() {
        let mut egress = TsEgressMuxer::new(&[h265_track()]).unwrap();
        let mut demuxer = crate::mpegts::demuxer::TsDemuxer::new();
        for i in 0..20 {
            let packet = MediaPacket {
                track_id: 0,
                pts: i * 3_000,
                dts: i * 3_000,
                duration: 3_000,
                timebase: Timebase::MPEG,
                flags: if i % 10 == 0 {
                    PacketFlags::KEYFRAME
                } else {
                    PacketFlags::NONE
                },
                bitstream: BitstreamFormat::AnnexB,
                payload: Bytes::from_static(&[0, 0, 0, 1, 0x02, 0x01, 0x55]),
            };
            let ts = egress.write(&packet).unwrap();
            demuxer.push(&ts).unwrap();
        }
        assert_eq!(demuxer.continuity_gaps, 0);
    }

    #[test]
    fn test_unknown_track_is_skipped() {
        let mut egress = TsEgressMuxer::new(&[h265_track()]).unwrap();
        let packet = MediaPacket {
            track_id: 42,
            pts: 0,
            dts: 0,
            duration: 0,
            timebase: Timebase::MPEG,
            flags: PacketFlags::NONE,
            bitstream: BitstreamFormat::Raw,
            payload: Bytes::from_static(b"x"),
        };
        assert!(egress.write(&packet).unwrap().is_empty());
    }
}
