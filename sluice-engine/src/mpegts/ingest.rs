use {
    super::{
        define,
        demuxer::{ElementaryStream, PesUnit, TsDemuxer, TsDemuxEvent},
        errors::MpegTsError,
    },
    crate::{
        codec::{aac, h264},
        hub::{
            self,
            define::{HubEventSender, ProviderInfo, ProviderKind, PublishAck},
            stream::StreamKey,
        },
        media::{
            AudioParams, BitstreamFormat, CodecId, MediaPacket, MediaTrack, PacketFlags,
            Timebase, TrackId, VideoParams,
        },
    },
    bytes::Bytes,
    std::collections::HashMap,
    uuid::Uuid,
};

/// PES units to examine before publishing even if some track never shows
/// its codec parameters.
const MAX_UNITS_BEFORE_PUBLISH: usize = 32;
/// Pre-publish packet buffer cap.
const PENDING_PACKET_CAP: usize = 512;

struct TrackState {
    track_id: TrackId,
    codec: CodecId,
    extradata: Option<Bytes>,
    audio_params: Option<AudioParams>,
    video_params: Option<VideoParams>,
    saw_unit: bool,
}

/// Feeds raw transport-stream bytes into the hub: resolves PAT/PMT into a
/// track set, converts PES units into packets, registers the stream once
/// codec parameters are known.
///
/// The same adapter serves SRT ingest and plain MPEG-TS/UDP ingest; only
/// the socket differs.
pub struct TsIngestAdapter {
    key: StreamKey,
    provider_kind: ProviderKind,
    remote_addr: String,
    hub: HubEventSender,
    demuxer: TsDemuxer,
    tracks: HashMap<u16, TrackState>,
    pending: Vec<MediaPacket>,
    units_seen: usize,
    ack: Option<PublishAck>,
}

impl TsIngestAdapter {
    #[must_use]
    pub fn new(
        key: StreamKey,
        provider_kind: ProviderKind,
        remote_addr: String,
        hub: HubEventSender,
    ) -> Self {
        Self {
            key,
            provider_kind,
            remote_addr,
            hub,
            demuxer: TsDemuxer::new(),
            tracks: HashMap::new(),
            pending: Vec::new(),
            units_seen: 0,
            ack: None,
        }
    }

    #[must_use]
    pub fn continuity_gaps(&self) -> u64 {
        self.demuxer.continuity_gaps
    }

    pub async fn feed(&mut self, data: &[u8]) -> Result<(), MpegTsError> {
        let events = self.demuxer.push(data)?;
        for event in events {
            self.on_event(event).await?;
        }
        Ok(())
    }

    /// Flush the demuxer and release the stream name.
    pub async fn finish(&mut self) -> Result<(), MpegTsError> {
        let events = self.demuxer.flush()?;
        for event in events {
            self.on_event(event).await?;
        }
        if let Some(ack) = self.ack.take() {
            hub::api::unpublish(&self.hub, ack.handle);
        }
        Ok(())
    }

    async fn on_event(&mut self, event: TsDemuxEvent) -> Result<(), MpegTsError> {
        match event {
            TsDemuxEvent::Program(streams) => self.on_program(&streams),
            TsDemuxEvent::Pes(unit) => {
                self.on_pes(unit).await?;
                self.maybe_publish().await;
            }
        }
        Ok(())
    }

    fn on_program(&mut self, streams: &[ElementaryStream]) {
        if !self.tracks.is_empty() {
            return;
        }
        for (index, stream) in streams.iter().enumerate() {
            let codec = match stream.stream_type {
                define::PSI_STREAM_H264 => CodecId::H264,
                define::PSI_STREAM_H265 => CodecId::H265,
                define::PSI_STREAM_AAC => CodecId::Aac,
                define::PSI_STREAM_PRIVATE_DATA
                    if stream.es_info.as_ref() == define::OPUS_REGISTRATION_DESCRIPTOR =>
                {
                    CodecId::Opus
                }
                other => {
                    tracing::warn!(
                        stream = %self.key,
                        stream_type = format!("{other:#x}"),
                        pid = stream.pid,
                        "unsupported elementary stream ignored"
                    );
                    continue;
                }
            };
            self.tracks.insert(
                stream.pid,
                TrackState {
                    track_id: index as TrackId,
                    codec,
                    extradata: None,
                    audio_params: None,
                    video_params: None,
                    saw_unit: false,
                },
            );
        }
        tracing::info!(stream = %self.key, tracks = self.tracks.len(), "ts program resolved");
    }

    async fn on_pes(&mut self, unit: PesUnit) -> Result<(), MpegTsError> {
        self.units_seen += 1;
        let Some(track) = self.tracks.get_mut(&unit.pid) else {
            return Ok(());
        };
        track.saw_unit = true;

        let packets = match track.codec {
            CodecId::H264 | CodecId::H265 => convert_video(track, &unit),
            CodecId::Aac => convert_aac(track, &unit),
            CodecId::Opus => convert_opus(track, &unit),
            CodecId::Vp8 => Vec::new(),
        };
        for packet in packets {
            self.forward(packet).await;
        }
        Ok(())
    }

    async fn forward(&mut self, packet: MediaPacket) {
        match &self.ack {
            Some(ack) => {
                if ack.packet_sender.send(packet).await.is_err() {
                    tracing::warn!(stream = %self.key, "router gone, dropping ts packet");
                }
            }
            None => {
                if self.pending.len() >= PENDING_PACKET_CAP {
                    self.pending.remove(0);
                }
                self.pending.push(packet);
            }
        }
    }

    /// Register once every track has produced a unit (codec parameters in
    /// hand), or after a bounded number of units.
    async fn maybe_publish(&mut self) {
        if self.ack.is_some() || self.tracks.is_empty() {
            return;
        }
        let all_seen = self.tracks.values().all(|t| t.saw_unit);
        if !all_seen && self.units_seen < MAX_UNITS_BEFORE_PUBLISH {
            return;
        }

        let mut media_tracks: Vec<MediaTrack> = self
            .tracks
            .values()
            .filter(|t| t.saw_unit)
            .map(|t| {
                let mut track = match t.codec {
                    CodecId::H264 | CodecId::H265 | CodecId::Vp8 => MediaTrack::video(
                        t.track_id,
                        t.codec,
                        Timebase::MPEG,
                        t.video_params.unwrap_or(VideoParams {
                            width: 0,
                            height: 0,
                            fps_milli: 0,
                        }),
                    ),
                    CodecId::Aac | CodecId::Opus => MediaTrack::audio(
                        t.track_id,
                        t.codec,
                        Timebase::MPEG,
                        t.audio_params.unwrap_or(AudioParams {
                            sample_rate: 48_000,
                            channels: 2,
                        }),
                    ),
                };
                if let Some(extradata) = &t.extradata {
                    track = track.with_extradata(extradata.clone());
                }
                track
            })
            .collect();
        media_tracks.sort_by_key(|t| t.id);

        let info = ProviderInfo {
            id: Uuid::new_v4(),
            kind: self.provider_kind,
            remote_addr: self.remote_addr.clone(),
        };
        match hub::api::publish(&self.hub, self.key.clone(), info, media_tracks).await {
            Ok(mut ack) => {
                // A TS source cannot produce keyframes on demand either.
                let mut keyframe_requests =
                    std::mem::replace(&mut ack.keyframe_requests, tokio::sync::mpsc::channel(1).1);
                tokio::spawn(async move { while keyframe_requests.recv().await.is_some() {} });

                for packet in self.pending.drain(..) {
                    if ack.packet_sender.send(packet).await.is_err() {
                        break;
                    }
                }
                self.ack = Some(ack);
                tracing::info!(stream = %self.key, "ts stream registered");
            }
            Err(err) => {
                tracing::warn!(stream = %self.key, error = %err, "ts publish failed");
            }
        }
    }
}

fn convert_video(track: &mut TrackState, unit: &PesUnit) -> Vec<MediaPacket> {
    let payload = Bytes::copy_from_slice(&unit.payload);
    let keyframe = match track.codec {
        CodecId::H264 => h264::is_keyframe(&payload, false, 4),
        _ => h265_is_irap(&payload),
    };

    if keyframe && track.extradata.is_none() && track.codec == CodecId::H264 {
        if let Some(record) = extract_h264_parameter_sets(&payload) {
            if let Some(sps) = record.sps.first() {
                if let Ok(info) = h264::SpsInfo::parse(sps) {
                    track.video_params = Some(VideoParams {
                        width: info.width,
                        height: info.height,
                        fps_milli: 0,
                    });
                }
            }
            track.extradata = record.marshal().ok();
        }
    }

    vec![MediaPacket {
        track_id: track.track_id,
        pts: unit.pts,
        dts: unit.dts,
        duration: 0,
        timebase: Timebase::MPEG,
        flags: PacketFlags {
            keyframe,
            ..PacketFlags::NONE
        },
        bitstream: BitstreamFormat::AnnexB,
        payload,
    }]
}

/// An AAC PES may hold several ADTS frames; each becomes one packet with
/// its timestamp advanced by the frame duration.
fn convert_aac(track: &mut TrackState, unit: &PesUnit) -> Vec<MediaPacket> {
    let mut packets = Vec::new();
    let mut offset = 0usize;
    let mut frame_index = 0i64;
    let data = &unit.payload;

    while offset + 7 <= data.len() {
        let Ok(frame) = aac::demux_adts(&data[offset..]) else {
            tracing::debug!("bad adts frame inside pes, resyncing to next unit");
            break;
        };
        let consumed = frame.frame_len;
        let sample_rate = frame.config.sample_rate();
        if track.extradata.is_none() {
            track.extradata = Some(frame.config.marshal());
            track.audio_params = Some(AudioParams {
                sample_rate,
                channels: frame.config.channel_configuration,
            });
        }
        let frame_ticks = i64::from(aac::SAMPLES_PER_FRAME) * 90_000 / i64::from(sample_rate);
        let ts_offset = frame_index * frame_ticks;
        packets.push(MediaPacket {
            track_id: track.track_id,
            pts: unit.pts + ts_offset,
            dts: unit.dts + ts_offset,
            duration: frame_ticks,
            timebase: Timebase::MPEG,
            flags: PacketFlags::NONE,
            bitstream: BitstreamFormat::Raw,
            payload: frame.payload,
        });
        offset += consumed;
        frame_index += 1;
    }
    packets
}

/// Opus in TS (ETSI TS 101 154): each access unit is prefixed with a
/// control header `0x7FE0 | start/end flags` plus a 0xFF-stuffed size.
fn convert_opus(track: &mut TrackState, unit: &PesUnit) -> Vec<MediaPacket> {
    let mut packets = Vec::new();
    let data = &unit.payload;
    let mut offset = 0usize;
    let mut frame_index = 0i64;

    while offset + 2 <= data.len() {
        let prefix = u16::from_be_bytes([data[offset], data[offset + 1]]);
        if prefix & 0xFFE0 != 0x7FE0 {
            break;
        }
        offset += 2;
        let mut size = 0usize;
        while offset < data.len() {
            let byte = data[offset];
            offset += 1;
            size += byte as usize;
            if byte != 0xFF {
                break;
            }
        }
        if offset + size > data.len() {
            break;
        }
        // 20 ms frames at the 90 kHz clock.
        let frame_ticks = 1_800i64;
        let ts_offset = frame_index * frame_ticks;
        packets.push(MediaPacket {
            track_id: track.track_id,
            pts: unit.pts + ts_offset,
            dts: unit.dts + ts_offset,
            duration: frame_ticks,
            timebase: Timebase::MPEG,
            flags: PacketFlags::NONE,
            bitstream: BitstreamFormat::Raw,
            payload: Bytes::copy_from_slice(&data[offset..offset + size]),
        });
        offset += size;
        frame_index += 1;
    }
    packets
}

fn h265_is_irap(annexb: &[u8]) -> bool {
    h264::split_annexb(annexb).iter().any(|nal| {
        if nal.is_empty() {
            return false;
        }
        let nal_type = (nal[0] >> 1) & 0x3F;
        (16..=23).contains(&nal_type)
    })
}

fn extract_h264_parameter_sets(
    annexb: &[u8],
) -> Option<h264::AvcDecoderConfigurationRecord> {
    let mut sps = None;
    let mut pps = None;
    for nal in h264::split_annexb(annexb) {
        if nal.is_empty() {
            continue;
        }
        match nal[0] & 0x1F {
            h264::nal_type::SPS if sps.is_none() => sps = Some(Bytes::copy_from_slice(nal)),
            h264::nal_type::PPS if pps.is_none() => pps = Some(Bytes::copy_from_slice(nal)),
            _ => {}
        }
    }
    h264::AvcDecoderConfigurationRecord::from_parameter_sets(sps?, pps?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, StreamHub};
    use crate::mpegts::muxer::{TsMuxer, MPEG_FLAG_IDR_FRAME};
    use bytes::{BufMut, BytesMut};

    fn annexb_idr_with_params() -> BytesMut {
        let mut au = BytesMut::new();
        au.put_slice(&[0, 0, 0, 1]);
        au.put_slice(&[0x67, 0x42, 0x00, 0x1E, 0xF4, 0x21, 0x32]); // SPS
        au.put_slice(&[0, 0, 0, 1]);
        au.put_slice(&[0x68, 0xCE, 0x3C, 0x80]); // PPS
        au.put_slice(&[0, 0, 0, 1]);
        au.put_slice(&[0x65, 0x88, 0x84, 0x00]); // IDR
        au
    }

    #[tokio::test]
    async fn test_ts_ingest_publishes_tracks() {
        let mut hub = StreamHub::new(HubConfig::default());
        let hub_sender = hub.event_sender();
        let registry = hub.statistics_registry();
        tokio::spawn(async move { hub.run().await });

        let mut ts_muxer = TsMuxer::new();
        let v = ts_muxer
            .add_stream(define::PSI_STREAM_H264, BytesMut::new())
            .unwrap();
        let a = ts_muxer
            .add_stream(define::PSI_STREAM_AAC, BytesMut::new())
            .unwrap();
        ts_muxer
            .write(v, 3_003, 0, MPEG_FLAG_IDR_FRAME, annexb_idr_with_params())
            .unwrap();
        let config = aac::AudioSpecificConfig::from_params(2, 48_000, 2).unwrap();
        let adts = config.adts_frame(&[0x11; 64]);
        ts_muxer.write(a, 0, 0, 0, adts).unwrap();
        // Second video unit so the first one's PES completes.
        ts_muxer
            .write(v, 6_006, 3_003, 0, BytesMut::from(&[0u8, 0, 0, 1, 0x41, 0x9A][..]))
            .unwrap();
        ts_muxer
            .write(a, 1_920, 1_920, 0, config.adts_frame(&[0x22; 64]))
            .unwrap();
        let wire = ts_muxer.get_data();

        let key = StreamKey::default_vhost("app", "s2");
        let mut adapter = TsIngestAdapter::new(
            key.clone(),
            ProviderKind::SrtCaller,
            "10.1.1.1:9000".into(),
            hub_sender,
        );
        adapter.feed(&wire).await.unwrap();
        adapter.finish().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The stream appeared in the statistics registry with a provider.
        assert!(registry.get(&key).is_some());
    }

    #[test]
    fn test_aac_pes_splits_frames() {
        let config = aac::AudioSpecificConfig::from_params(2, 48_000, 2).unwrap();
        let mut payload = BytesMut::new();
        payload.put_slice(&config.adts_frame(&[0xAA; 32]));
        payload.put_slice(&config.adts_frame(&[0xBB; 32]));

        let mut track = TrackState {
            track_id: 1,
            codec: CodecId::Aac,
            extradata: None,
            audio_params: None,
            video_params: None,
            saw_unit: false,
        };
        let unit = PesUnit {
            pid: 0x101,
            stream_type: define::PSI_STREAM_AAC,
            pts: 90_000,
            dts: 90_000,
            payload,
        };
        let packets = convert_aac(&mut track, &unit);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].pts, 90_000);
        // 1024 samples at 48 kHz = 1920 ticks at 90 kHz.
        assert_eq!(packets[1].pts, 91_920);
        assert!(track.extradata.is_some());
        assert_eq!(track.audio_params.unwrap().sample_rate, 48_000);
    }

    #[test]
    fn test_opus_control_header_parse() {
        let mut track = TrackState {
            track_id: 2,
            codec: CodecId::Opus,
            extradata: None,
            audio_params: None,
            video_params: None,
            saw_unit: false,
        };
        let mut payload = BytesMut::new();
        // Two AUs: sizes 3 and 300 (0xFF + 0x2D).
        payload.put_slice(&[0x7F, 0xE0, 0x03, 0x01, 0x02, 0x03]);
        payload.put_slice(&[0x7F, 0xE0, 0xFF, 0x2D]);
        payload.put_bytes(0x55, 300);
        let unit = PesUnit {
            pid: 0x102,
            stream_type: define::PSI_STREAM_PRIVATE_DATA,
            pts: 0,
            dts: 0,
            payload,
        };
        let packets = convert_opus(&mut track, &unit);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload.len(), 3);
        assert_eq!(packets[1].payload.len(), 300);
        assert_eq!(packets[1].pts, 1_800);
    }

    #[test]
    fn test_h265_irap_detection() {
        // NAL type 19 (IDR_W_RADL): (19 << 1) = 0x26.
        let idr: &[u8] = &[0, 0, 0, 1, 0x26, 0x01, 0x00];
        let trail: &[u8] = &[0, 0, 0, 1, 0x02, 0x01, 0x00];
        assert!(h265_is_irap(idr));
        assert!(!h265_is_irap(trail));
    }
}
