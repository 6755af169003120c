use {
    crate::{config::WebRtcConfig, errors::WebRtcError, peer},
    sluice_engine::{
        codec::h264,
        hub::{
            self,
            define::{HubEventSender, SubscriberInfo, SubscriberKind},
            stream::StreamKey,
        },
        media::{BitstreamFormat, CodecId, MediaKind, MediaPacket, Timebase, TrackId},
    },
    std::collections::HashMap,
    std::sync::Arc,
    std::time::Duration,
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
    webrtc::{
        api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        media::Sample,
        peer_connection::{
            peer_connection_state::RTCPeerConnectionState, RTCPeerConnection,
        },
        rtcp::payload_feedbacks::{
            full_intra_request::FullIntraRequest,
            picture_loss_indication::PictureLossIndication,
        },
        rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
        track::track_local::track_local_static_sample::TrackLocalStaticSample,
    },
};

/// How far ahead of wall clock we let delivery run before pacing kicks
/// in; bursts above configured peak bitrate otherwise follow GOP preload.
const PACING_SLACK: Duration = Duration::from_millis(50);

/// One WHEP subscriber: a peer with local tracks fed from the hub.
pub struct WhepSession {
    pub id: Uuid,
    peer: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
}

impl WhepSession {
    pub async fn start(
        config: &WebRtcConfig,
        hub: HubEventSender,
        key: StreamKey,
        offer_sdp: String,
        remote_addr: String,
    ) -> Result<(Self, String), WebRtcError> {
        let session_id = Uuid::new_v4();
        let info = SubscriberInfo {
            id: session_id,
            kind: SubscriberKind::Whep,
            remote_addr,
            request_url: format!("/{}/{}/whep", key.app, key.name),
        };
        let mut ack = hub::api::subscribe(&hub, key.clone(), info.clone()).await?;

        let peer = peer::new_peer(config).await?;
        let cancel = CancellationToken::new();

        // One local track per hub track webrtc can carry.
        let mut writers: HashMap<TrackId, TrackWriter> = HashMap::new();
        for track in &ack.tracks {
            let (mime, clock_rate, channels) = match track.codec {
                CodecId::H264 => (MIME_TYPE_H264, 90_000, 0),
                CodecId::Vp8 => (MIME_TYPE_VP8, 90_000, 0),
                CodecId::Opus => (
                    MIME_TYPE_OPUS,
                    48_000,
                    u16::from(track.audio.map_or(2, |a| a.channels)),
                ),
                CodecId::H265 | CodecId::Aac => {
                    tracing::debug!(codec = %track.codec, "codec not deliverable over webrtc, skipped");
                    continue;
                }
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_string(),
                    clock_rate,
                    channels,
                    ..Default::default()
                },
                format!("track-{}", track.id),
                format!("{}-{}", key.app, key.name),
            ));
            let sender = peer.add_track(local.clone()).await?;

            // RTCP from the viewer: PLI/FIR turn into upstream keyframe
            // requests.
            {
                let hub = hub.clone();
                let stream_key = key.clone();
                let cancel = cancel.clone();
                let is_video = track.kind == MediaKind::Video;
                tokio::spawn(async move {
                    loop {
                        let read = tokio::select! {
                            read = sender.read_rtcp() => read,
                            _ = cancel.cancelled() => return,
                        };
                        let Ok((packets, _attributes)) = read else { return };
                        if !is_video {
                            continue;
                        }
                        for packet in packets {
                            let any = packet.as_any();
                            if any.downcast_ref::<PictureLossIndication>().is_some()
                                || any.downcast_ref::<FullIntraRequest>().is_some()
                            {
                                hub::api::request_keyframe(&hub, stream_key.clone());
                            }
                        }
                    }
                });
            }

            let extradata = track.extradata.clone();
            writers.insert(
                track.id,
                TrackWriter {
                    local,
                    codec: track.codec,
                    extradata_annexb: extradata.and_then(|e| {
                        h264::AvcDecoderConfigurationRecord::parse(&e)
                            .ok()
                            .map(|r| r.annexb_parameter_sets())
                    }),
                    last_dts: None,
                    last_duration: Duration::from_millis(20),
                },
            );
        }
        if writers.is_empty() {
            hub::api::unsubscribe(&hub, key.clone(), info);
            return Err(WebRtcError::NoUsableTracks);
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

        // Media pump with light pacing against the first-packet anchor.
        {
            let hub = hub.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut pacer: Option<(Instant, i64)> = None; // wall, media ms
                loop {
                    let packet = tokio::select! {
                        packet = ack.receiver.recv() => packet,
                        _ = cancel.cancelled() => break,
                    };
                    let Some(packet) = packet else { break };
                    if packet.flags.end_of_stream {
                        break;
                    }
                    let Some(writer) = writers.get_mut(&packet.track_id) else {
                        continue;
                    };

                    let media_ms = packet.timebase.rescale(packet.dts, Timebase::MILLIS);
                    match pacer {
                        None => pacer = Some((Instant::now(), media_ms)),
                        Some((wall_start, media_start)) => {
                            let media_elapsed = media_ms - media_start;
                            let wall_elapsed = wall_start.elapsed().as_millis() as i64;
                            let ahead = media_elapsed - wall_elapsed;
                            if ahead > PACING_SLACK.as_millis() as i64 {
                                tokio::time::sleep(Duration::from_millis(
                                    (ahead as u64).min(500),
                                ))
                                .await;
                            }
                        }
                    }

                    if let Err(err) = writer.write(&packet).await {
                        tracing::debug!(error = %err, "whep write failed, closing viewer");
                        break;
                    }
                }
                hub::api::unsubscribe(&hub, key, info);
            });
        }

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

struct TrackWriter {
    local: Arc<TrackLocalStaticSample>,
    codec: CodecId,
    /// Annex-B SPS/PPS prefix re-inserted before keyframes.
    extradata_annexb: Option<bytes::Bytes>,
    last_dts: Option<i64>,
    last_duration: Duration,
}

impl TrackWriter {
    async fn write(&mut self, packet: &MediaPacket) -> Result<(), webrtc::Error> {
        // Duration from DTS deltas; the previous delta stands in for the
        // first packet.
        let millis = packet.timebase.rescale(packet.dts, Timebase::MILLIS);
        if let Some(last) = self.last_dts {
            let delta = millis - last;
            if delta > 0 && delta < 10_000 {
                self.last_duration = Duration::from_millis(delta as u64);
            }
        }
        self.last_dts = Some(millis);

        let data = match (self.codec, packet.bitstream) {
            (CodecId::H264, BitstreamFormat::Avcc) => {
                match h264::avcc_to_annexb(&packet.payload, 4) {
                    Ok(annexb) => annexb.freeze(),
                    Err(_) => return Ok(()),
                }
            }
            (CodecId::H264, BitstreamFormat::AnnexB)
            | (CodecId::Vp8 | CodecId::Opus, _) => packet.payload.clone(),
            _ => return Ok(()),
        };

        let data = if packet.flags.keyframe && self.codec == CodecId::H264 {
            match &self.extradata_annexb {
                Some(prefix) if !already_has_sps(&data) => {
                    let mut with_params = bytes::BytesMut::with_capacity(prefix.len() + data.len());
                    with_params.extend_from_slice(prefix);
                    with_params.extend_from_slice(&data);
                    with_params.freeze()
                }
                _ => data,
            }
        } else {
            data
        };

        self.local
            .write_sample(&Sample {
                data,
                duration: self.last_duration,
                ..Default::default()
            })
            .await
    }
}

fn already_has_sps(annexb: &[u8]) -> bool {
    h264::split_annexb(annexb)
        .iter()
        .any(|nal| !nal.is_empty() && nal[0] & 0x1F == h264::nal_type::SPS)
}
