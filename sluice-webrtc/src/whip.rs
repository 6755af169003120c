use {
    crate::{config::WebRtcConfig, errors::WebRtcError, peer},
    bytes::Bytes,
    sluice_engine::{
        codec::h264::{self, AvcDecoderConfigurationRecord},
        codec::opus::OpusIdHeader,
        hub::{
            self,
            define::{HubEventSender, ProviderInfo, ProviderKind},
            stream::StreamKey,
        },
        media::{
            AudioParams, BitstreamFormat, CodecId, MediaKind, MediaPacket, MediaTrack,
            PacketFlags, Timebase, TimestampExtender, VideoParams,
        },
        rtsp::{
            depacketize::{H264Depacketizer, Vp8Depacketizer},
            jitter::JitterBuffer,
            rtp::RtpPacket,
        },
    },
    std::sync::Arc,
    std::time::Duration,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
    webrtc::{
        peer_connection::{
            peer_connection_state::RTCPeerConnectionState, RTCPeerConnection,
        },
        rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
        track::track_remote::TrackRemote,
    },
};

/// How long after the first track we wait for the rest of the offer's
/// media (and for H.264 parameter sets) before registering the stream.
const TRACK_GATHER_DEADLINE: Duration = Duration::from_secs(3);
/// Pre-publish packet buffer cap.
const PENDING_PACKET_CAP: usize = 512;
/// Reorder window on top of the interceptor stack's loss recovery.
const WHIP_REORDER_WINDOW: usize = 16;
/// PLI cadence while waiting for the first keyframe.
const STARTUP_PLI_INTERVAL: Duration = Duration::from_millis(500);

enum IngestEvent {
    Track {
        index: u32,
        track: MediaTrack,
        ssrc: u32,
    },
    Packet {
        packet: MediaPacket,
    },
    /// In-band H.264 parameter sets observed for a track.
    ParameterSets {
        index: u32,
        extradata: Bytes,
        width: u32,
        height: u32,
    },
}

/// One WHIP publisher: owns the peer and the hub registration.
pub struct WhipSession {
    pub id: Uuid,
    peer: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
}

impl WhipSession {
    /// Accept a WHIP offer: answer it and wire incoming tracks into the
    /// hub as a new stream.
    pub async fn start(
        config: &WebRtcConfig,
        hub: HubEventSender,
        key: StreamKey,
        offer_sdp: String,
        remote_addr: String,
    ) -> Result<(Self, String), WebRtcError> {
        let peer = peer::new_peer(config).await?;
        let cancel = CancellationToken::new();
        let session_id = Uuid::new_v4();

        let (event_tx, event_rx) = mpsc::channel::<IngestEvent>(1_024);

        {
            let event_tx = event_tx.clone();
            let cancel = cancel.clone();
            let next_index = Arc::new(std::sync::atomic::AtomicU32::new(0));
            peer.on_track(Box::new(move |track, _receiver, _transceiver| {
                let event_tx = event_tx.clone();
                let cancel = cancel.clone();
                let index = next_index.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Box::pin(async move {
                    tokio::spawn(read_track(track, index, event_tx, cancel));
                })
            }));
        }

        {
            let cancel = cancel.clone();
            peer.on_peer_connection_state_change(Box::new(move |state| {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                ) {
                    cancel.cancel();
                }
                Box::pin(async {})
            }));
        }

        let answer = peer::answer_offer(&peer, offer_sdp).await?;

        let coordinator = IngestCoordinator {
            hub,
            key,
            remote_addr,
            peer: peer.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(coordinator.run(event_rx));

        Ok((
            Self {
                id: session_id,
                peer,
                cancel,
            },
            answer,
        ))
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.peer.close().await;
    }
}

/// Per-track RTP → MediaPacket pipeline.
struct TrackRunner {
    index: u32,
    codec: CodecId,
    timebase: Timebase,
    jitter: JitterBuffer,
    h264: Option<H264Depacketizer>,
    vp8: Option<Vp8Depacketizer>,
    extender: TimestampExtender,
    sent_parameter_sets: bool,
}

impl TrackRunner {
    fn new(index: u32, codec: CodecId, clock_rate: u32) -> Self {
        Self {
            index,
            codec,
            timebase: Timebase::rtp(clock_rate),
            jitter: JitterBuffer::new(WHIP_REORDER_WINDOW),
            h264: (codec == CodecId::H264).then(H264Depacketizer::new),
            vp8: (codec == CodecId::Vp8).then(Vp8Depacketizer::new),
            extender: TimestampExtender::rtp(),
            sent_parameter_sets: false,
        }
    }

    async fn ingest(&mut self, raw: RtpPacket, events: &mpsc::Sender<IngestEvent>) {
        let mut ready = Vec::new();
        self.jitter.push(raw, &mut ready);
        for packet in ready {
            if let Some(depack) = self.h264.as_mut() {
                if let Some(unit) = depack.push(&packet) {
                    if !self.sent_parameter_sets {
                        if let Some((extradata, width, height)) =
                            extract_parameter_sets(&unit.data)
                        {
                            self.sent_parameter_sets = true;
                            let _ = events
                                .send(IngestEvent::ParameterSets {
                                    index: self.index,
                                    extradata,
                                    width,
                                    height,
                                })
                                .await;
                        }
                    }
                    let timestamp = self.extender.extend(u64::from(unit.timestamp));
                    let _ = events
                        .send(IngestEvent::Packet {
                            packet: MediaPacket {
                                track_id: self.index,
                                pts: timestamp,
                                dts: timestamp,
                                duration: 0,
                                timebase: self.timebase,
                                flags: PacketFlags {
                                    keyframe: unit.keyframe,
                                    ..PacketFlags::NONE
                                },
                                bitstream: BitstreamFormat::AnnexB,
                                payload: unit.data,
                            },
                        })
                        .await;
                }
            } else if let Some(depack) = self.vp8.as_mut() {
                if let Some(unit) = depack.push(&packet) {
                    let timestamp = self.extender.extend(u64::from(unit.timestamp));
                    let _ = events
                        .send(IngestEvent::Packet {
                            packet: MediaPacket {
                                track_id: self.index,
                                pts: timestamp,
                                dts: timestamp,
                                duration: 0,
                                timebase: self.timebase,
                                flags: PacketFlags {
                                    keyframe: unit.keyframe,
                                    ..PacketFlags::NONE
                                },
                                bitstream: BitstreamFormat::Raw,
                                payload: unit.data,
                            },
                        })
                        .await;
                }
            } else {
                // Opus: one packet per frame, no reassembly.
                let timestamp = self.extender.extend(u64::from(packet.timestamp));
                let _ = events
                    .send(IngestEvent::Packet {
                        packet: MediaPacket {
                            track_id: self.index,
                            pts: timestamp,
                            dts: timestamp,
                            duration: 0,
                            timebase: self.timebase,
                            flags: PacketFlags::NONE,
                            bitstream: BitstreamFormat::Raw,
                            payload: packet.payload.clone(),
                        },
                    })
                    .await;
            }
        }
    }
}

fn extract_parameter_sets(annexb: &[u8]) -> Option<(Bytes, u32, u32)> {
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
    let sps = sps?;
    let (width, height) = h264::SpsInfo::parse(&sps)
        .map(|info| (info.width, info.height))
        .unwrap_or((0, 0));
    let record = AvcDecoderConfigurationRecord::from_parameter_sets(sps, pps?).ok()?;
    let extradata = record.marshal().ok()?;
    Some((extradata, width, height))
}

async fn read_track(
    track: Arc<TrackRemote>,
    index: u32,
    events: mpsc::Sender<IngestEvent>,
    cancel: CancellationToken,
) {
    let params = track.codec();
    let capability = &params.capability;
    let mime = capability.mime_type.to_ascii_lowercase();
    let codec = if mime.ends_with("h264") {
        CodecId::H264
    } else if mime.ends_with("vp8") {
        CodecId::Vp8
    } else if mime.ends_with("opus") {
        CodecId::Opus
    } else {
        tracing::warn!(mime = %capability.mime_type, "unsupported whip codec, track ignored");
        return;
    };
    let clock_rate = capability.clock_rate;

    let media_track = match codec {
        CodecId::H264 | CodecId::Vp8 => MediaTrack::video(
            index,
            codec,
            Timebase::rtp(clock_rate),
            VideoParams {
                width: 0,
                height: 0,
                fps_milli: 0,
            },
        ),
        _ => MediaTrack::audio(
            index,
            codec,
            Timebase::rtp(clock_rate),
            AudioParams {
                sample_rate: clock_rate,
                channels: u8::try_from(capability.channels).unwrap_or(2),
            },
        )
        .with_extradata(
            OpusIdHeader {
                channels: u8::try_from(capability.channels).unwrap_or(2),
                pre_skip: 312,
                input_sample_rate: clock_rate,
            }
            .marshal(),
        ),
    };
    let ssrc = u32::from(track.ssrc());
    if events
        .send(IngestEvent::Track {
            index,
            track: media_track,
            ssrc,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut runner = TrackRunner::new(index, codec, clock_rate);
    loop {
        let read = tokio::select! {
            read = track.read_rtp() => read,
            _ = cancel.cancelled() => return,
        };
        let Ok((rtp_packet, _attributes)) = read else {
            tracing::debug!(index, "whip track reader finished");
            return;
        };
        let raw = RtpPacket {
            marker: rtp_packet.header.marker,
            payload_type: rtp_packet.header.payload_type,
            sequence: rtp_packet.header.sequence_number,
            timestamp: rtp_packet.header.timestamp,
            ssrc: rtp_packet.header.ssrc,
            payload: rtp_packet.payload.clone(),
        };
        runner.ingest(raw, &events).await;
    }
}

struct IngestCoordinator {
    hub: HubEventSender,
    key: StreamKey,
    remote_addr: String,
    peer: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
}

impl IngestCoordinator {
    async fn run(self, mut events: mpsc::Receiver<IngestEvent>) {
        let mut tracks: Vec<MediaTrack> = Vec::new();
        let mut ssrcs: Vec<(u32, u32)> = Vec::new(); // (track index, ssrc)
        let mut pending: Vec<MediaPacket> = Vec::new();
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut pli = tokio::time::interval(STARTUP_PLI_INTERVAL);
        pli.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Phase one: gather tracks (and H.264 parameter sets).
        let ack = loop {
            let ready = tracks.iter().all(|t| {
                t.codec != CodecId::H264 || t.extradata.is_some()
            }) && !tracks.is_empty()
                && deadline.is_some();
            let timed_out = deadline.is_some_and(|d| tokio::time::Instant::now() >= d);
            let has_video = tracks.iter().any(|t| t.kind == MediaKind::Video);
            let has_audio = tracks.iter().any(|t| t.kind == MediaKind::Audio);
            if (ready && has_video && has_audio) || (ready && timed_out) || timed_out {
                if tracks.is_empty() {
                    tracing::warn!(stream = %self.key, "whip peer produced no usable tracks");
                    self.cancel.cancel();
                    return;
                }
                let info = ProviderInfo {
                    id: Uuid::new_v4(),
                    kind: ProviderKind::WhipIngest,
                    remote_addr: self.remote_addr.clone(),
                };
                match hub::api::publish(&self.hub, self.key.clone(), info, tracks.clone()).await
                {
                    Ok(ack) => break ack,
                    Err(err) => {
                        tracing::warn!(stream = %self.key, error = %err, "whip publish failed");
                        self.cancel.cancel();
                        return;
                    }
                }
            }

            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        IngestEvent::Track { track, ssrc, index } => {
                            ssrcs.push((index, ssrc));
                            tracks.push(track);
                            if deadline.is_none() {
                                deadline =
                                    Some(tokio::time::Instant::now() + TRACK_GATHER_DEADLINE);
                            }
                        }
                        IngestEvent::Packet { packet } => {
                            if pending.len() >= PENDING_PACKET_CAP {
                                pending.remove(0);
                            }
                            pending.push(packet);
                        }
                        IngestEvent::ParameterSets { index, extradata, width, height } => {
                            if let Some(track) = tracks.iter_mut().find(|t| t.id == index) {
                                track.extradata = Some(extradata);
                                track.video = Some(VideoParams { width, height, fps_milli: 0 });
                            }
                        }
                    }
                }
                _ = pli.tick() => {
                    // Until parameter sets arrive, nudge the encoder.
                    self.send_pli(&ssrcs, &tracks).await;
                }
                _ = self.cancel.cancelled() => return,
            }
        };

        tracing::info!(stream = %self.key, tracks = tracks.len(), "whip stream registered");
        for packet in pending.drain(..) {
            if ack.packet_sender.send(packet).await.is_err() {
                return;
            }
        }

        // Phase two: pump media; answer keyframe requests with PLI.
        let mut keyframe_requests = ack.keyframe_requests;
        let packet_sender = ack.packet_sender;
        let handle = ack.handle;
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(IngestEvent::Packet { packet }) => {
                            if packet_sender.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Some(IngestEvent::ParameterSets { .. } | IngestEvent::Track { .. }) => {
                            // Track identity is frozen once published.
                        }
                        None => break,
                    }
                }
                request = keyframe_requests.recv() => {
                    if request.is_some() {
                        self.send_pli(&ssrcs, &tracks).await;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        hub::api::unpublish(&self.hub, handle);
        tracing::info!(stream = %self.key, "whip ingest finished");
    }

    async fn send_pli(&self, ssrcs: &[(u32, u32)], tracks: &[MediaTrack]) {
        for (index, ssrc) in ssrcs {
            let is_video = tracks
                .iter()
                .find(|t| t.id == *index)
                .is_some_and(|t| t.kind == MediaKind::Video);
            if !is_video {
                continue;
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: *ssrc,
            };
            if let Err(err) = self.peer.write_rtcp(&[Box::new(pli)]).await {
                tracing::debug!(error = %err, "pli write failed");
            }
        }
    }
}
