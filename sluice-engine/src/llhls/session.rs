use {
    super::cmaf::{CmafMuxer, CmafSample},
    crate::{
        codec::h264,
        hub::{
            self,
            define::{
                BroadcastEvent, BroadcastEventReceiver, HubEventSender, SubscriberInfo,
                SubscriberKind,
            },
            stream::StreamKey,
        },
        media::{BitstreamFormat, MediaKind, MediaPacket, MediaTrack, TrackId},
        record::SegmentStorage,
    },
    bytes::Bytes,
    dashmap::DashMap,
    parking_lot::RwLock,
    std::collections::{HashMap, VecDeque},
    std::sync::Arc,
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// LL-HLS tuning, per application.
#[derive(Debug, Clone)]
pub struct LlHlsConfig {
    /// Target segment duration. Keyframe interval should align to this.
    pub segment_duration_ms: i64,
    /// Target part duration; must divide the segment target.
    pub part_duration_ms: i64,
    /// Segments retained in the playlist (DVR window).
    pub dvr_window_segments: usize,
}

impl Default for LlHlsConfig {
    fn default() -> Self {
        Self {
            segment_duration_ms: 2_000,
            part_duration_ms: 250,
            dvr_window_segments: 6,
        }
    }
}

impl LlHlsConfig {
    /// Part target must divide segment target; round it down to the
    /// nearest divisor rather than serving an invalid playlist.
    #[must_use]
    pub fn normalised(mut self) -> Self {
        if self.part_duration_ms <= 0 {
            self.part_duration_ms = 250;
        }
        while self.segment_duration_ms % self.part_duration_ms != 0 {
            self.part_duration_ms -= 1;
        }
        self
    }
}

pub struct LlPart {
    pub data: Bytes,
    pub duration_ms: i64,
    pub independent: bool,
}

pub struct LlSegment {
    pub msn: u64,
    pub parts: Vec<LlPart>,
    pub complete: bool,
    pub duration_ms: i64,
}

impl LlSegment {
    /// A segment's bytes are the concatenation of its parts.
    #[must_use]
    pub fn concat(&self) -> Bytes {
        let total: usize = self.parts.iter().map(|p| p.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for part in &self.parts {
            out.extend_from_slice(&part.data);
        }
        Bytes::from(out)
    }
}

#[derive(Default)]
pub struct LlHlsPlaylistState {
    pub init_segment: Bytes,
    pub segments: VecDeque<LlSegment>,
    pub ended: bool,
}

/// Shared per-stream LL-HLS state: the segmenter writes, HTTP handlers
/// read, and the notify wakes blocked playlist reloads on each new part.
pub struct LlHlsStreamState {
    pub key: StreamKey,
    pub config: LlHlsConfig,
    pub playlist: RwLock<LlHlsPlaylistState>,
    pub notify: Notify,
}

impl LlHlsStreamState {
    /// Whether playlist position (msn, part) exists yet, for blocking
    /// reload (`_HLS_msn`/`_HLS_part`).
    #[must_use]
    pub fn has_position(&self, msn: u64, part: Option<u64>) -> bool {
        let playlist = self.playlist.read();
        if playlist.ended {
            return true;
        }
        match playlist.segments.iter().find(|s| s.msn == msn) {
            Some(segment) => match part {
                Some(part) => (segment.parts.len() as u64) > part || segment.complete,
                None => segment.complete || !segment.parts.is_empty(),
            },
            None => playlist.segments.back().is_some_and(|s| s.msn > msn),
        }
    }
}

pub type LlHlsRegistry = Arc<DashMap<String, Arc<LlHlsStreamState>>>;

#[must_use]
pub fn registry_key(key: &StreamKey) -> String {
    format!("{}/{}", key.app, key.name)
}

/// Attaches an LL-HLS segmenter to every stream that appears in the hub.
pub struct LlHlsService {
    hub: HubEventSender,
    events: BroadcastEventReceiver,
    registry: LlHlsRegistry,
    config: LlHlsConfig,
    storage: Option<Arc<dyn SegmentStorage>>,
    cancel: CancellationToken,
}

impl LlHlsService {
    #[must_use]
    pub fn new(
        hub: HubEventSender,
        events: BroadcastEventReceiver,
        registry: LlHlsRegistry,
        config: LlHlsConfig,
        storage: Option<Arc<dyn SegmentStorage>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            events,
            registry,
            config: config.normalised(),
            storage,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = self.cancel.cancelled() => return,
            };
            match event {
                Ok(BroadcastEvent::StreamReady { key, tracks }) => {
                    let session = LlHlsSession {
                        hub: self.hub.clone(),
                        key,
                        tracks,
                        registry: self.registry.clone(),
                        config: self.config.clone(),
                        storage: self.storage.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(err) = session.run().await {
                            tracing::warn!(error = %err, "llhls segmenter ended");
                        }
                    });
                }
                Ok(BroadcastEvent::StreamStopped { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "llhls service lagged behind hub events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

struct PendingSample {
    dts: i64,
    sample: CmafSample,
}

struct LlHlsSession {
    hub: HubEventSender,
    key: StreamKey,
    tracks: Vec<MediaTrack>,
    registry: LlHlsRegistry,
    config: LlHlsConfig,
    storage: Option<Arc<dyn SegmentStorage>>,
}

impl LlHlsSession {
    async fn run(self) -> anyhow::Result<()> {
        // CMAF cannot carry every codec the hub can (VP8 stays WebRTC-only).
        let tracks: Vec<MediaTrack> = self
            .tracks
            .iter()
            .filter(|t| t.extradata.is_some() || t.kind == MediaKind::Video)
            .cloned()
            .collect();
        if tracks.is_empty() {
            anyhow::bail!("no cmaf-capable tracks on {}", self.key);
        }

        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::LlHls,
            remote_addr: String::new(),
            request_url: format!("/{}/{}/llhls.m3u8", self.key.app, self.key.name),
        };
        let mut ack = hub::api::subscribe(&self.hub, self.key.clone(), info.clone()).await?;

        // The router may know richer extradata than the broadcast did.
        let muxer = CmafMuxer::new(&ack.tracks)?;
        let init_segment = muxer.init_segment(&ack.tracks)?;

        let state = Arc::new(LlHlsStreamState {
            key: self.key.clone(),
            config: self.config.clone(),
            playlist: RwLock::new(LlHlsPlaylistState {
                init_segment: init_segment.clone(),
                segments: VecDeque::new(),
                ended: false,
            }),
            notify: Notify::new(),
        });
        let registry_id = registry_key(&self.key);
        self.registry.insert(registry_id.clone(), state.clone());

        if let Some(storage) = &self.storage {
            let init_key = format!("{registry_id}/init.mp4");
            if let Err(err) = storage.write(&init_key, init_segment).await {
                tracing::warn!(error = %err, "recording init segment failed");
            }
        }

        let video_track = ack
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .map(|t| t.id);
        let mut segmenter = Segmenter {
            muxer,
            state: state.clone(),
            storage: self.storage.clone(),
            registry_id: registry_id.clone(),
            config: self.config.clone(),
            gate_track: video_track,
            pending: HashMap::new(),
            part_runs: HashMap::new(),
            part_start_dts: None,
            segment_elapsed_ms: 0,
            next_msn: 0,
            timescales: ack
                .tracks
                .iter()
                .map(|t| (t.id, timescale_of(t)))
                .collect(),
        };

        while let Some(packet) = ack.receiver.recv().await {
            if packet.flags.end_of_stream {
                continue;
            }
            segmenter.push(packet).await;
        }

        segmenter.finish().await;
        {
            let mut playlist = state.playlist.write();
            playlist.ended = true;
        }
        state.notify.notify_waiters();

        hub::api::unsubscribe(&self.hub, self.key.clone(), info);

        // Let players fetch the tail of the DVR window before the state
        // disappears.
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        self.registry.remove(&registry_id);
        tracing::info!(stream = %self.key, "llhls state removed");
        Ok(())
    }
}

fn timescale_of(track: &MediaTrack) -> u32 {
    match track.kind {
        MediaKind::Video | MediaKind::Data => 90_000,
        MediaKind::Audio => track.audio.map_or(48_000, |a| a.sample_rate),
    }
}

/// Cuts the routed packet flow into CMAF parts and segments.
struct Segmenter {
    muxer: CmafMuxer,
    state: Arc<LlHlsStreamState>,
    storage: Option<Arc<dyn SegmentStorage>>,
    registry_id: String,
    config: LlHlsConfig,
    /// Track whose keyframes gate segment boundaries (None: audio only).
    gate_track: Option<TrackId>,
    /// One sample per track waiting for its successor to fix its duration.
    pending: HashMap<TrackId, PendingSample>,
    /// Samples accumulated for the current part.
    part_runs: HashMap<TrackId, Vec<CmafSample>>,
    part_start_dts: Option<i64>,
    segment_elapsed_ms: i64,
    next_msn: u64,
    timescales: HashMap<TrackId, u32>,
}

impl Segmenter {
    async fn push(&mut self, packet: MediaPacket) {
        let timescale = self
            .timescales
            .get(&packet.track_id)
            .copied()
            .unwrap_or(90_000);

        // CMAF wants AVCC framing; router video is AVCC or Annex-B.
        let data = match packet.bitstream {
            BitstreamFormat::AnnexB => match h264::annexb_to_avcc(&packet.payload) {
                Ok(avcc) => avcc.freeze(),
                Err(_) => return,
            },
            _ => packet.payload.clone(),
        };

        let sample = CmafSample {
            dts: packet.dts,
            composition_offset: (packet.pts - packet.dts)
                .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            duration: 0, // fixed when the successor arrives
            keyframe: packet.flags.keyframe,
            data,
        };

        let is_gate = Some(packet.track_id) == self.gate_track;
        let gate_keyframe = is_gate && packet.flags.keyframe;

        // Completing the previous pending sample for this track fixes its
        // duration; it then joins the current part run.
        if let Some(previous) = self.pending.remove(&packet.track_id) {
            let mut completed = previous.sample;
            completed.duration = (packet.dts - previous.dts).max(0) as u32;
            self.part_runs
                .entry(packet.track_id)
                .or_default()
                .push(completed);
        }

        // Segment boundary: gate-track keyframe once the segment target
        // has elapsed. Cut before admitting the keyframe so it starts the
        // new segment.
        let part_elapsed_ms = self.part_start_dts.map_or(0, |start| {
            (packet.dts - start) * 1_000 / i64::from(timescale)
        });
        if gate_keyframe
            && self.segment_elapsed_ms + part_elapsed_ms >= self.config.segment_duration_ms
            && self.next_part_has_samples()
        {
            self.cut_part(part_elapsed_ms, true).await;
        } else if is_gate && part_elapsed_ms >= self.config.part_duration_ms
            && self.next_part_has_samples()
        {
            self.cut_part(part_elapsed_ms, false).await;
        } else if self.gate_track.is_none() {
            // Audio-only streams gate on the audio clock.
            if part_elapsed_ms >= self.config.part_duration_ms && self.next_part_has_samples() {
                self.cut_part(part_elapsed_ms, false).await;
            }
        }

        if self.part_start_dts.is_none() {
            self.part_start_dts = Some(packet.dts);
        }
        self.pending.insert(
            packet.track_id,
            PendingSample {
                dts: packet.dts,
                sample,
            },
        );
    }

    fn next_part_has_samples(&self) -> bool {
        self.part_runs.values().any(|run| !run.is_empty())
    }

    async fn cut_part(&mut self, part_duration_ms: i64, segment_boundary: bool) {
        let mut runs: Vec<(TrackId, Vec<CmafSample>)> = self
            .part_runs
            .drain()
            .filter(|(_, samples)| !samples.is_empty())
            .collect();
        runs.sort_by_key(|(track_id, _)| *track_id);
        if runs.is_empty() {
            return;
        }
        let independent = runs
            .iter()
            .any(|(_, samples)| samples.iter().any(|s| s.keyframe));

        let fragment = match self.muxer.fragment(&runs) {
            Ok(fragment) => fragment,
            Err(err) => {
                tracing::warn!(error = %err, "cmaf fragment failed, part dropped");
                return;
            }
        };

        let duration_ms = part_duration_ms.max(1);
        let mut completed_segment: Option<(String, Bytes)> = None;
        {
            let mut playlist = self.state.playlist.write();
            let need_new_segment = match playlist.segments.back() {
                Some(segment) => segment.complete,
                None => true,
            };
            if need_new_segment {
                let msn = self.next_msn;
                self.next_msn += 1;
                playlist.segments.push_back(LlSegment {
                    msn,
                    parts: Vec::new(),
                    complete: false,
                    duration_ms: 0,
                });
            }
            if let Some(segment) = playlist.segments.back_mut() {
                segment.parts.push(LlPart {
                    data: fragment,
                    duration_ms,
                    independent,
                });
                segment.duration_ms += duration_ms;
                if segment_boundary {
                    segment.complete = true;
                    self.segment_elapsed_ms = 0;
                    if self.storage.is_some() {
                        completed_segment = Some((
                            format!("{}/seg_{}.m4s", self.registry_id, segment.msn),
                            segment.concat(),
                        ));
                    }
                } else {
                    self.segment_elapsed_ms += duration_ms;
                }
            }
            while playlist.segments.len() > self.config.dvr_window_segments {
                playlist.segments.pop_front();
            }
        }
        self.state.notify.notify_waiters();

        if let (Some(storage), Some((segment_key, data))) = (&self.storage, completed_segment) {
            if let Err(err) = storage.write(&segment_key, data).await {
                tracing::warn!(error = %err, "recording segment failed");
            }
        }

        self.part_start_dts = None;
    }

    /// Flush pending samples and close the last segment.
    async fn finish(&mut self) {
        let pending: Vec<(TrackId, PendingSample)> = self.pending.drain().collect();
        for (track_id, pending_sample) in pending {
            let mut sample = pending_sample.sample;
            // Last sample: reuse the part target as its duration estimate.
            let timescale = self.timescales.get(&track_id).copied().unwrap_or(90_000);
            sample.duration =
                (self.config.part_duration_ms * i64::from(timescale) / 1_000).max(1) as u32;
            self.part_runs.entry(track_id).or_default().push(sample);
        }
        if self.next_part_has_samples() {
            self.cut_part(self.config.part_duration_ms, true).await;
        } else if let Some(segment) = self.state.playlist.write().segments.back_mut() {
            segment.complete = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_normalisation() {
        let config = LlHlsConfig {
            segment_duration_ms: 2_000,
            part_duration_ms: 300,
            dvr_window_segments: 6,
        }
        .normalised();
        assert_eq!(config.segment_duration_ms % config.part_duration_ms, 0);
        assert!(config.part_duration_ms <= 300);
    }

    #[test]
    fn test_has_position_semantics() {
        let state = LlHlsStreamState {
            key: StreamKey::default_vhost("app", "s1"),
            config: LlHlsConfig::default(),
            playlist: RwLock::new(LlHlsPlaylistState::default()),
            notify: Notify::new(),
        };
        assert!(!state.has_position(0, None));
        {
            let mut playlist = state.playlist.write();
            playlist.segments.push_back(LlSegment {
                msn: 0,
                parts: vec![LlPart {
                    data: Bytes::new(),
                    duration_ms: 250,
                    independent: true,
                }],
                complete: false,
                duration_ms: 250,
            });
        }
        assert!(state.has_position(0, Some(0)));
        assert!(!state.has_position(0, Some(1)));
        assert!(!state.has_position(1, None));
    }

    #[test]
    fn test_segment_concat() {
        let segment = LlSegment {
            msn: 0,
            parts: vec![
                LlPart {
                    data: Bytes::from_static(b"ab"),
                    duration_ms: 250,
                    independent: true,
                },
                LlPart {
                    data: Bytes::from_static(b"cd"),
                    duration_ms: 250,
                    independent: false,
                },
            ],
            complete: true,
            duration_ms: 500,
        };
        assert_eq!(segment.concat().as_ref(), b"abcd");
    }
}
