use {
    crate::{
        audio::{AudioDecoder, AudioEncoder, AudioResampler},
        errors::TranscodeError,
        profile::{AudioProfile, OutputProfile, VideoProfile},
        video::{VideoDecoder, VideoEncoder},
    },
    bytes::Bytes,
    sluice_engine::{
        codec::{h264, opus::OpusIdHeader},
        hub::{
            self,
            define::{
                HubEventSender, ProviderInfo, ProviderKind, SubscriberInfo, SubscriberKind,
            },
            stream::StreamKey,
        },
        media::{
            AudioParams, BitstreamFormat, CodecId, MediaKind, MediaPacket, MediaTrack,
            PacketFlags, Timebase, VideoParams,
        },
    },
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::Arc,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// Codec worker input queue depth. When the encoder side backs up past
/// this, whole GOPs are dropped at the decoder input.
const GRAPH_INPUT_CAPACITY: usize = 256;
const GRAPH_OUTPUT_CAPACITY: usize = 256;

/// Track ids inside a rendition stream.
const OUT_VIDEO_TRACK: u32 = 0;
const OUT_AUDIO_TRACK: u32 = 1;

enum WorkerOut {
    Video {
        annexb: Bytes,
        keyframe: bool,
        pts_us: i64,
    },
    Audio {
        packet: Bytes,
        samples_per_channel: usize,
    },
    /// Source audio copied through unchanged (AAC sources).
    Copy(MediaPacket),
}

/// One decode → scale/resample → encode graph producing one rendition.
///
/// Codec work runs on the blocking pool; the async side only moves
/// packets. A fatal codec error tears down this graph alone, never the
/// source stream.
pub struct TranscodeGraph {
    hub: HubEventSender,
    source: StreamKey,
    profile: OutputProfile,
    cancel: CancellationToken,
}

impl TranscodeGraph {
    #[must_use]
    pub fn new(
        hub: HubEventSender,
        source: StreamKey,
        profile: OutputProfile,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            source,
            profile,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), TranscodeError> {
        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::Transcoder,
            remote_addr: String::new(),
            request_url: format!("transcode:{}", self.profile.name),
        };
        let mut ack = hub::api::subscribe(&self.hub, self.source.clone(), info.clone()).await?;

        let video_in = ack
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .cloned();
        let audio_in = ack
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Audio)
            .cloned();

        // Source capabilities bound what the graph can do: video decode
        // is H.264-only, audio transcode is Opus-only; AAC audio rides
        // through unchanged.
        let video_profile = match (&self.profile.video, &video_in) {
            (Some(profile), Some(track)) if track.codec == CodecId::H264 => Some(profile.clone()),
            (Some(_), Some(track)) => {
                return Err(TranscodeError::UnsupportedSource(format!(
                    "cannot decode {} video",
                    track.codec
                )));
            }
            _ => None,
        };
        let audio_mode = match (&self.profile.audio, &audio_in) {
            (Some(profile), Some(track)) if track.codec == CodecId::Opus => {
                AudioMode::Transcode(profile.clone())
            }
            (_, Some(track)) => AudioMode::Copy(track.clone()),
            (_, None) => AudioMode::None,
        };

        let force_keyframe = Arc::new(AtomicBool::new(false));
        let (in_tx, in_rx) = mpsc::channel::<MediaPacket>(GRAPH_INPUT_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<WorkerOut>(GRAPH_OUTPUT_CAPACITY);

        // Codec worker on the blocking pool.
        let worker_video_profile = video_profile.clone();
        let worker_audio = match &audio_mode {
            AudioMode::Transcode(profile) => Some((
                profile.clone(),
                audio_in
                    .as_ref()
                    .and_then(|t| t.audio)
                    .unwrap_or(AudioParams {
                        sample_rate: 48_000,
                        channels: 2,
                    }),
            )),
            _ => None,
        };
        let worker_force = force_keyframe.clone();
        let video_in_id = video_in.as_ref().map(|t| t.id);
        let audio_in_id = audio_in.as_ref().map(|t| t.id);
        let video_extradata = video_in.as_ref().and_then(|t| t.extradata.clone());
        let copy_audio = matches!(audio_mode, AudioMode::Copy(_));
        let worker = tokio::task::spawn_blocking(move || {
            codec_worker(
                in_rx,
                out_tx,
                worker_video_profile,
                worker_audio,
                worker_force,
                video_in_id,
                audio_in_id,
                video_extradata,
                copy_audio,
            )
        });

        // Feed side: GOP-aware drop when the worker backs up.
        let feeder = FeedTask {
            video_in_id,
            audio_in_id,
            in_tx,
            dropping: false,
        };
        let publisher = PublishTask {
            hub: self.hub.clone(),
            source: self.source.clone(),
            profile: self.profile.clone(),
            video_profile,
            audio_mode,
            force_keyframe,
        };

        let result = self
            .pump(&mut ack.receiver, feeder, publisher, out_rx)
            .await;

        hub::api::unsubscribe(&self.hub, self.source.clone(), info);
        drop(worker);
        result
    }

    async fn pump(
        &self,
        receiver: &mut sluice_engine::hub::define::PacketReceiver,
        mut feeder: FeedTask,
        publisher: PublishTask,
        out_rx: mpsc::Receiver<WorkerOut>,
    ) -> Result<(), TranscodeError> {
        let cancel = self.cancel.clone();
        let publish_task = tokio::spawn(publisher.run(out_rx));

        loop {
            let packet = tokio::select! {
                packet = receiver.recv() => packet,
                _ = cancel.cancelled() => break,
            };
            let Some(packet) = packet else { break };
            if packet.flags.end_of_stream {
                break;
            }
            feeder.feed(packet).await;
        }
        drop(feeder); // closes the worker input
        let _ = publish_task.await;
        Ok(())
    }
}

enum AudioMode {
    /// Opus in, profile-shaped Opus out.
    Transcode(AudioProfile),
    /// Source audio packets copied through (AAC sources).
    Copy(MediaTrack),
    None,
}

struct FeedTask {
    video_in_id: Option<u32>,
    audio_in_id: Option<u32>,
    in_tx: mpsc::Sender<MediaPacket>,
    dropping: bool,
}

impl FeedTask {
    async fn feed(&mut self, packet: MediaPacket) {
        let is_video = Some(packet.track_id) == self.video_in_id;
        let is_audio = Some(packet.track_id) == self.audio_in_id;
        if !is_video && !is_audio {
            return;
        }

        // Whole-GOP drop: once a video packet is refused, everything up
        // to the next keyframe goes too, so the decoder never sees a
        // partial GOP.
        if self.dropping {
            if is_video && packet.flags.keyframe {
                self.dropping = false;
            } else if is_video {
                return;
            }
        }
        match self.in_tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(returned)) => {
                if Some(returned.track_id) == self.video_in_id {
                    self.dropping = true;
                    tracing::warn!("transcoder saturated, dropping a gop");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn codec_worker(
    mut input: mpsc::Receiver<MediaPacket>,
    output: mpsc::Sender<WorkerOut>,
    video_profile: Option<VideoProfile>,
    audio: Option<(AudioProfile, AudioParams)>,
    force_keyframe: Arc<AtomicBool>,
    video_in_id: Option<u32>,
    audio_in_id: Option<u32>,
    video_extradata: Option<Bytes>,
    copy_audio: bool,
) {
    let mut video = video_profile.and_then(|profile| {
        let decoder = VideoDecoder::new().ok()?;
        let encoder = VideoEncoder::new(
            profile.width,
            profile.height,
            profile.bitrate_kbps,
            profile.fps,
            profile.gop_ms,
        )
        .ok()?;
        Some((decoder, encoder))
    });
    let nalu_length_size = video_extradata
        .as_deref()
        .and_then(|e| h264::AvcDecoderConfigurationRecord::parse(e).ok())
        .map_or(4, |r| r.nalu_length_size);

    let mut audio_chain = audio.and_then(|(profile, source)| {
        let decoder = AudioDecoder::new(source.sample_rate, source.channels).ok()?;
        let resampler = if source.sample_rate != profile.sample_rate {
            AudioResampler::new(source.sample_rate, profile.sample_rate, source.channels).ok()
        } else {
            None
        };
        let encoder =
            AudioEncoder::new(profile.sample_rate, profile.channels, profile.bitrate_kbps).ok()?;
        Some((decoder, resampler, encoder))
    });

    while let Some(packet) = input.blocking_recv() {
        if Some(packet.track_id) == video_in_id {
            let Some((decoder, encoder)) = video.as_mut() else {
                continue;
            };
            let annexb = match packet.bitstream {
                BitstreamFormat::AnnexB => packet.payload.clone(),
                BitstreamFormat::Avcc => {
                    match h264::avcc_to_annexb(&packet.payload, nalu_length_size) {
                        Ok(converted) => converted.freeze(),
                        Err(_) => continue,
                    }
                }
                _ => continue,
            };
            let pts_us = packet.timebase.rescale(packet.pts, Timebase::new(1, 1_000_000));
            let frame = match decoder.decode(&annexb, pts_us) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "video decode failed, graph stopping");
                    return;
                }
            };
            if force_keyframe.swap(false, Ordering::Relaxed) {
                // Cadence bookkeeping lives in the encoder; a request just
                // moves the next keyframe forward.
                match encoder.encode(&frame) {
                    Ok(Some((annexb, _))) => {
                        let _ = output.blocking_send(WorkerOut::Video {
                            annexb,
                            keyframe: true,
                            pts_us: frame.pts_us,
                        });
                        continue;
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "video encode failed, graph stopping");
                        return;
                    }
                }
            }
            match encoder.encode(&frame) {
                Ok(Some((annexb, keyframe))) => {
                    if output
                        .blocking_send(WorkerOut::Video {
                            annexb,
                            keyframe,
                            pts_us: frame.pts_us,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "video encode failed, graph stopping");
                    return;
                }
            }
        } else if Some(packet.track_id) == audio_in_id {
            if copy_audio {
                let mut copied = packet;
                copied.track_id = OUT_AUDIO_TRACK;
                if output.blocking_send(WorkerOut::Copy(copied)).is_err() {
                    return;
                }
                continue;
            }
            let Some((decoder, resampler, encoder)) = audio_chain.as_mut() else {
                continue;
            };
            let pts_us = packet.timebase.rescale(packet.pts, Timebase::new(1, 1_000_000));
            let frame = match decoder.decode(&packet.payload, pts_us) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(error = %err, "opus decode failed, packet skipped");
                    continue;
                }
            };
            let pcm = match resampler {
                Some(resampler) => match resampler.process(&frame.samples) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        tracing::warn!(error = %err, "resample failed, graph stopping");
                        return;
                    }
                },
                None => frame.samples,
            };
            match encoder.encode(&pcm) {
                Ok(packets) => {
                    for (encoded, samples_per_channel) in packets {
                        if output
                            .blocking_send(WorkerOut::Audio {
                                packet: encoded,
                                samples_per_channel,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "opus encode failed, graph stopping");
                    return;
                }
            }
        }
    }
}

struct PublishTask {
    hub: HubEventSender,
    source: StreamKey,
    profile: OutputProfile,
    video_profile: Option<VideoProfile>,
    audio_mode: AudioMode,
    force_keyframe: Arc<AtomicBool>,
}

impl PublishTask {
    /// Collect encoder output, register the rendition once the first
    /// keyframe (and its parameter sets) appears, then stream.
    async fn run(self, mut out_rx: mpsc::Receiver<WorkerOut>) {
        let rendition = StreamKey::new(
            self.source.vhost.clone(),
            self.source.app.clone(),
            self.profile.rendition_name(&self.source.name),
        );

        let mut pending: Vec<MediaPacket> = Vec::new();
        let mut video_extradata: Option<(Bytes, u32, u32)> = None;
        let mut audio_samples_sent: i64 = 0;
        let mut ack: Option<sluice_engine::hub::define::PublishAck> = None;

        while let Some(item) = out_rx.recv().await {
            let packet = match item {
                WorkerOut::Video {
                    annexb,
                    keyframe,
                    pts_us,
                } => {
                    if video_extradata.is_none() && keyframe {
                        video_extradata = extract_extradata(&annexb);
                    }
                    let ts = Timebase::new(1, 1_000_000).rescale(pts_us, Timebase::MPEG);
                    MediaPacket {
                        track_id: OUT_VIDEO_TRACK,
                        pts: ts,
                        dts: ts,
                        duration: 0,
                        timebase: Timebase::MPEG,
                        flags: PacketFlags {
                            keyframe,
                            ..PacketFlags::NONE
                        },
                        bitstream: BitstreamFormat::AnnexB,
                        payload: annexb,
                    }
                }
                WorkerOut::Copy(copied) => copied,
                WorkerOut::Audio {
                    packet,
                    samples_per_channel,
                } => {
                    let profile_rate = match &self.audio_mode {
                        AudioMode::Transcode(profile) => profile.sample_rate,
                        _ => 48_000,
                    };
                    let ts = audio_samples_sent;
                    audio_samples_sent += samples_per_channel as i64;
                    MediaPacket {
                        track_id: OUT_AUDIO_TRACK,
                        pts: ts,
                        dts: ts,
                        duration: samples_per_channel as i64,
                        timebase: Timebase::rtp(profile_rate),
                        flags: PacketFlags::NONE,
                        bitstream: BitstreamFormat::Raw,
                        payload: packet,
                    }
                }
            };

            match &ack {
                Some(active) => {
                    if active.packet_sender.send(packet).await.is_err() {
                        break;
                    }
                }
                None => {
                    if pending.len() >= 512 {
                        pending.remove(0);
                    }
                    pending.push(packet);
                    let video_ready =
                        self.video_profile.is_none() || video_extradata.is_some();
                    if video_ready {
                        match self.register(&rendition, &video_extradata).await {
                            Some(mut new_ack) => {
                                // Keyframe requests toggle the worker flag.
                                let force = self.force_keyframe.clone();
                                let mut requests = std::mem::replace(
                                    &mut new_ack.keyframe_requests,
                                    tokio::sync::mpsc::channel(1).1,
                                );
                                tokio::spawn(async move {
                                    while requests.recv().await.is_some() {
                                        force.store(true, Ordering::Relaxed);
                                    }
                                });
                                for buffered in pending.drain(..) {
                                    if new_ack.packet_sender.send(buffered).await.is_err() {
                                        return;
                                    }
                                }
                                ack = Some(new_ack);
                            }
                            None => return,
                        }
                    }
                }
            }
        }

        if let Some(active) = ack {
            hub::api::unpublish(&self.hub, active.handle);
        }
        tracing::info!(rendition = %rendition, "transcode graph finished");
    }

    async fn register(
        &self,
        rendition: &StreamKey,
        video_extradata: &Option<(Bytes, u32, u32)>,
    ) -> Option<sluice_engine::hub::define::PublishAck> {
        let mut tracks = Vec::new();
        if let (Some(profile), Some((extradata, width, height))) =
            (&self.video_profile, video_extradata)
        {
            tracks.push(
                MediaTrack::video(
                    OUT_VIDEO_TRACK,
                    CodecId::H264,
                    Timebase::MPEG,
                    VideoParams {
                        width: *width,
                        height: *height,
                        fps_milli: (profile.fps * 1_000.0) as u32,
                    },
                )
                .with_extradata(extradata.clone()),
            );
        }
        match &self.audio_mode {
            AudioMode::Transcode(profile) => {
                tracks.push(
                    MediaTrack::audio(
                        OUT_AUDIO_TRACK,
                        CodecId::Opus,
                        Timebase::rtp(profile.sample_rate),
                        AudioParams {
                            sample_rate: profile.sample_rate,
                            channels: profile.channels,
                        },
                    )
                    .with_extradata(
                        OpusIdHeader {
                            channels: profile.channels,
                            pre_skip: 312,
                            input_sample_rate: profile.sample_rate,
                        }
                        .marshal(),
                    ),
                );
            }
            AudioMode::Copy(source_track) => {
                let mut copied = source_track.clone();
                copied.id = OUT_AUDIO_TRACK;
                tracks.push(copied);
            }
            AudioMode::None => {}
        }
        if tracks.is_empty() {
            tracing::warn!(rendition = %rendition, "profile produced no tracks");
            return None;
        }

        let info = ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::Transcoder,
            remote_addr: String::new(),
        };
        match hub::api::publish(&self.hub, rendition.clone(), info, tracks).await {
            Ok(ack) => Some(ack),
            Err(err) => {
                tracing::warn!(rendition = %rendition, error = %err, "rendition publish failed");
                None
            }
        }
    }
}

fn extract_extradata(annexb: &[u8]) -> Option<(Bytes, u32, u32)> {
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
        .map(|i| (i.width, i.height))
        .unwrap_or((0, 0));
    let record = h264::AvcDecoderConfigurationRecord::from_parameter_sets(sps, pps?).ok()?;
    Some((record.marshal().ok()?, width, height))
}
