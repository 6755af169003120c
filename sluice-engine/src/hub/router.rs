use {
    super::{
        define::{
            KeyframeRequestSender, PacketReceiver, RouterEvent, RouterEventReceiver,
            StatisticSender, SubscribeAck, SubscriberInfo, PACKET_CHANNEL_CAPACITY,
        },
        publish_point::PublishPoint,
        statistics::StatisticEvent,
        stream::{StreamKey, StreamState},
    },
    crate::media::{MediaClock, MediaKind, MediaPacket, MediaTrack, PacketAnchor, Timebase, TrackId},
    std::collections::{BTreeMap, HashMap, HashSet, VecDeque},
    tokio::sync::mpsc,
    uuid::Uuid,
};

/// Log slow-subscriber drops every N dropped packets.
const DROP_LOG_INTERVAL: u64 = 100;

/// Admission buffer cap in packets (secondary bound to the time cap).
const ADMISSION_BUFFER_PACKETS: usize = 1_024;

/// Per-track DTS guard and burst-reorder window.
///
/// Protocol adapters already re-sequence where sequence numbers exist
/// (RTP jitter buffers); this layer enforces per-track monotonicity at
/// the hand-off. In-order packets pass straight through with no added
/// latency. When disorder does appear, up to `window` packets buffer
/// until the stream goes ascending again; packets older than anything
/// already emitted are dropped and counted.
struct ReorderBuffer {
    window: usize,
    pending: BTreeMap<i64, MediaPacket>,
    last_emitted: Option<i64>,
    pub late_drops: u64,
    pub duplicate_drops: u64,
}

impl ReorderBuffer {
    fn new(window: usize) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
            last_emitted: None,
            late_drops: 0,
            duplicate_drops: 0,
        }
    }

    fn push(&mut self, packet: MediaPacket, ready: &mut Vec<MediaPacket>) {
        if let Some(last) = self.last_emitted {
            if packet.dts <= last {
                self.late_drops += 1;
                return;
            }
        }
        if self.pending.contains_key(&packet.dts) {
            self.duplicate_drops += 1;
            return;
        }
        let in_order = self
            .pending
            .last_key_value()
            .map_or(true, |(&max, _)| packet.dts > max);
        self.pending.insert(packet.dts, packet);

        if in_order {
            // Ascending arrival: everything held (including any earlier
            // stragglers that were buffering) is now deliverable.
            self.flush(ready);
        } else {
            while self.pending.len() > self.window {
                if let Some((dts, packet)) = self.pending.pop_first() {
                    self.last_emitted = Some(dts);
                    ready.push(packet);
                }
            }
        }
    }

    fn flush(&mut self, ready: &mut Vec<MediaPacket>) {
        while let Some((dts, packet)) = self.pending.pop_first() {
            self.last_emitted = Some(dts);
            ready.push(packet);
        }
    }
}

struct SubscriberSlot {
    info: SubscriberInfo,
    sender: mpsc::Sender<MediaPacket>,
    dropped: u64,
}

/// Per-stream media router: one producer in, N subscribers out.
///
/// Owns every piece of per-stream state, so the task needs no locks; all
/// control arrives on the event channel and all media on the packet
/// channel. The producer is never blocked: full subscriber queues drop
/// (the subscriber's own policy decides what to do about the gap).
pub struct StreamRouter {
    key: StreamKey,
    packet_receiver: PacketReceiver,
    event_receiver: RouterEventReceiver,
    keyframe_requests: KeyframeRequestSender,
    statistics: StatisticSender,
    publish_point: PublishPoint,
    reorder: HashMap<TrackId, ReorderBuffer>,
    canonical: HashMap<TrackId, Timebase>,
    kinds: HashMap<TrackId, MediaKind>,
    monotonic_floor: HashMap<TrackId, i64>,
    subscribers: HashMap<Uuid, SubscriberSlot>,
    /// Video tracks that have not yet produced their first keyframe.
    awaiting_keyframe: HashSet<TrackId>,
    admission: VecDeque<MediaPacket>,
    admission_millis_cap: i64,
    clock: MediaClock,
    anchor: Option<PacketAnchor>,
    routed_packets: u64,
}

impl StreamRouter {
    #[must_use]
    pub fn new(
        key: StreamKey,
        tracks: Vec<MediaTrack>,
        gop_count: usize,
        max_reorder: usize,
        admission_millis_cap: i64,
        packet_receiver: PacketReceiver,
        event_receiver: RouterEventReceiver,
        keyframe_requests: KeyframeRequestSender,
        statistics: StatisticSender,
    ) -> Self {
        let mut reorder = HashMap::new();
        let mut canonical = HashMap::new();
        let mut kinds = HashMap::new();
        let mut awaiting_keyframe = HashSet::new();
        for track in &tracks {
            reorder.insert(track.id, ReorderBuffer::new(max_reorder));
            kinds.insert(track.id, track.kind);
            let tb = match track.kind {
                MediaKind::Video | MediaKind::Data => Timebase::MPEG,
                MediaKind::Audio => track
                    .audio
                    .map_or(Timebase::MPEG, |a| Timebase::rtp(a.sample_rate)),
            };
            canonical.insert(track.id, tb);
            if track.kind == MediaKind::Video {
                awaiting_keyframe.insert(track.id);
            }
        }
        Self {
            key,
            packet_receiver,
            event_receiver,
            keyframe_requests,
            statistics,
            publish_point: PublishPoint::new(tracks, gop_count),
            reorder,
            canonical,
            kinds,
            monotonic_floor: HashMap::new(),
            subscribers: HashMap::new(),
            awaiting_keyframe,
            admission: VecDeque::new(),
            admission_millis_cap,
            clock: MediaClock::new(),
            anchor: None,
            routed_packets: 0,
        }
    }

    /// Canonical timebase for one track (what subscribers observe).
    #[must_use]
    pub fn canonical_timebase(kind: MediaKind, sample_rate: Option<u32>) -> Timebase {
        match kind {
            MediaKind::Video | MediaKind::Data => Timebase::MPEG,
            MediaKind::Audio => sample_rate.map_or(Timebase::MPEG, Timebase::rtp),
        }
    }

    pub async fn run(mut self) {
        if self.awaiting_keyframe.is_empty() {
            self.send_state(StreamState::Publishing);
        }
        loop {
            tokio::select! {
                packet = self.packet_receiver.recv() => {
                    match packet {
                        Some(packet) => self.on_packet(packet),
                        None => {
                            tracing::info!(stream = %self.key, "provider channel closed");
                            break;
                        }
                    }
                }
                event = self.event_receiver.recv() => {
                    match event {
                        Some(RouterEvent::Subscribe { info, result_sender }) => {
                            self.on_subscribe(info, result_sender);
                        }
                        Some(RouterEvent::UnSubscribe { info }) => {
                            self.remove_subscriber(info.id);
                        }
                        Some(RouterEvent::TerminateSubscriber { subscriber_id }) => {
                            tracing::info!(
                                stream = %self.key,
                                subscriber = %subscriber_id,
                                "subscriber terminated by control plane"
                            );
                            self.remove_subscriber(subscriber_id);
                        }
                        Some(RouterEvent::RequestKeyframe) => {
                            // Best effort; a full queue means one is already
                            // on its way.
                            let _ = self.keyframe_requests.try_send(());
                        }
                        Some(RouterEvent::UnPublish) | None => {
                            tracing::info!(stream = %self.key, "unpublish");
                            break;
                        }
                    }
                }
            }
        }
        self.drain();
    }

    fn on_packet(&mut self, packet: MediaPacket) {
        let kind = match self.kinds.get(&packet.track_id) {
            Some(kind) => *kind,
            None => {
                tracing::debug!(
                    stream = %self.key,
                    track = packet.track_id,
                    "packet for undeclared track dropped"
                );
                return;
            }
        };
        let _ = self.statistics.send(StatisticEvent::PacketIn {
            key: self.key.clone(),
            kind,
            bytes: packet.payload.len(),
            keyframe: packet.flags.keyframe,
        });

        if !self.awaiting_keyframe.is_empty() {
            self.admit(packet);
            return;
        }
        self.process(packet);
    }

    /// Track admission: buffer until every declared video track has shown
    /// a keyframe, then replay the buffer in arrival order.
    fn admit(&mut self, packet: MediaPacket) {
        if packet.flags.keyframe {
            self.awaiting_keyframe.remove(&packet.track_id);
        }
        self.admission.push_back(packet);
        self.enforce_admission_cap();

        if self.awaiting_keyframe.is_empty() {
            tracing::info!(stream = %self.key, "all tracks admitted, stream publishing");
            self.send_state(StreamState::Publishing);
            let buffered: Vec<MediaPacket> = self.admission.drain(..).collect();
            for packet in buffered {
                self.process(packet);
            }
        }
    }

    fn enforce_admission_cap(&mut self) {
        let over_time_cap = |q: &VecDeque<MediaPacket>, cap: i64| -> bool {
            match (q.front(), q.back()) {
                (Some(front), Some(back)) => {
                    let span = front
                        .timebase
                        .rescale(back.dts - front.dts, Timebase::MILLIS);
                    span > cap
                }
                _ => false,
            }
        };
        while self.admission.len() > ADMISSION_BUFFER_PACKETS
            || over_time_cap(&self.admission, self.admission_millis_cap)
        {
            // Prefer evicting the oldest non-key packet; if the front is a
            // keyframe the whole buffer resets to it.
            let victim = self.admission.iter().position(|p| !p.flags.keyframe);
            match victim {
                Some(idx) => {
                    self.admission.remove(idx);
                }
                None => {
                    self.admission.pop_front();
                }
            }
            if self.admission.is_empty() {
                break;
            }
        }
    }

    fn process(&mut self, packet: MediaPacket) {
        let mut ready = Vec::new();
        if let Some(buffer) = self.reorder.get_mut(&packet.track_id) {
            buffer.push(packet, &mut ready);
        }
        for packet in ready {
            self.emit(packet);
        }
    }

    fn emit(&mut self, packet: MediaPacket) {
        let canonical = self
            .canonical
            .get(&packet.track_id)
            .copied()
            .unwrap_or(Timebase::MPEG);
        let mut packet = packet.rescaled(canonical);

        // Rescale rounding must never let DTS step backwards.
        let floor = self.monotonic_floor.entry(packet.track_id).or_insert(i64::MIN);
        if packet.dts < *floor {
            packet.dts = *floor;
            if packet.pts < packet.dts {
                packet.pts = packet.dts;
            }
        }
        *floor = packet.dts;

        // First-packet anchor pairs wall time with media time so routing
        // latency shows up in the logs without touching the hot path.
        let now_ns = self.clock.now_ns();
        let anchor = self
            .anchor
            .get_or_insert_with(|| PacketAnchor::new(now_ns, packet.pts, packet.timebase));
        self.routed_packets += 1;
        if self.routed_packets % 1_024 == 0 {
            tracing::debug!(
                stream = %self.key,
                latency_ms = anchor.latency_ns(now_ns, packet.pts) / 1_000_000,
                "router latency sample"
            );
        }

        self.publish_point.save_packet(&packet);
        self.fan_out(packet);
    }

    fn fan_out(&mut self, packet: MediaPacket) {
        let mut closed = Vec::new();
        for (id, slot) in &mut self.subscribers {
            match slot.sender.try_send(packet.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped += 1;
                    if slot.dropped % DROP_LOG_INTERVAL == 0 {
                        tracing::warn!(
                            stream = %self.key,
                            subscriber = %id,
                            dropped = slot.dropped,
                            "subscriber back-pressure drops"
                        );
                        let _ = self.statistics.send(StatisticEvent::SubscriberDropExceeded {
                            key: self.key.clone(),
                            subscriber_id: *id,
                            dropped: slot.dropped,
                        });
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            self.remove_subscriber(id);
        }
    }

    fn on_subscribe(
        &mut self,
        info: SubscriberInfo,
        result_sender: super::define::SubscribeResultSender,
    ) {
        let (sender, receiver) = mpsc::channel(PACKET_CHANNEL_CAPACITY);

        // Pre-load the ring so the subscriber starts on a keyframe without
        // waiting for the next GOP. A cold point instead asks the provider
        // for a keyframe and the subscriber picks up from it live.
        if self.publish_point.has_keyframe() {
            for packet in self.publish_point.snapshot() {
                if sender.try_send(packet).is_err() {
                    tracing::warn!(
                        stream = %self.key,
                        subscriber = %info.id,
                        "gop preload overflowed subscriber queue"
                    );
                    break;
                }
            }
        } else {
            let _ = self.keyframe_requests.try_send(());
        }

        let ack = SubscribeAck {
            tracks: self.publish_point.tracks().to_vec(),
            receiver,
            statistics: self.statistics.clone(),
        };
        if result_sender.send(Ok(ack)).is_err() {
            tracing::debug!(stream = %self.key, "subscriber vanished before ack");
            return;
        }

        let _ = self.statistics.send(StatisticEvent::SubscriberConnected {
            key: self.key.clone(),
            info: info.clone(),
        });
        tracing::info!(
            stream = %self.key,
            subscriber = %info.id,
            kind = ?info.kind,
            "subscriber attached"
        );
        self.subscribers.insert(
            info.id,
            SubscriberSlot {
                info,
                sender,
                dropped: 0,
            },
        );
    }

    fn remove_subscriber(&mut self, id: Uuid) {
        if self.subscribers.remove(&id).is_some() {
            let _ = self.statistics.send(StatisticEvent::SubscriberDisconnected {
                key: self.key.clone(),
                subscriber_id: id,
            });
        }
    }

    fn send_state(&self, state: StreamState) {
        let _ = self.statistics.send(StatisticEvent::StreamStateChanged {
            key: self.key.clone(),
            state,
        });
    }

    /// End of stream: flush reorder windows, mark each track closed, then
    /// drop the senders. Subscribers keep draining whatever is already
    /// queued; their channels close once empty.
    fn drain(&mut self) {
        self.send_state(StreamState::Stopping);
        let mut ready = Vec::new();
        for buffer in self.reorder.values_mut() {
            buffer.flush(&mut ready);
        }
        ready.sort_by_key(|p| p.dts);
        for packet in ready {
            self.emit(packet);
        }

        let track_ids: Vec<TrackId> = self.kinds.keys().copied().collect();
        for track_id in track_ids {
            let canonical = self
                .canonical
                .get(&track_id)
                .copied()
                .unwrap_or(Timebase::MPEG);
            let dts = self
                .monotonic_floor
                .get(&track_id)
                .copied()
                .unwrap_or_default();
            let eos = MediaPacket::end_of_stream(track_id, dts, canonical);
            self.fan_out(eos);
        }
        self.subscribers.clear();
        self.send_state(StreamState::Stopped);
        tracing::info!(stream = %self.key, "router drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::define::SubscriberKind;
    use crate::media::{AudioParams, BitstreamFormat, CodecId, PacketFlags, VideoParams};
    use bytes::Bytes;
    use tokio::sync::oneshot;

    fn tracks() -> Vec<MediaTrack> {
        vec![
            MediaTrack::video(
                0,
                CodecId::H264,
                Timebase::MILLIS,
                VideoParams {
                    width: 1920,
                    height: 1080,
                    fps_milli: 30_000,
                },
            ),
            MediaTrack::audio(
                1,
                CodecId::Aac,
                Timebase::MILLIS,
                AudioParams {
                    sample_rate: 48_000,
                    channels: 2,
                },
            ),
        ]
    }

    fn packet(track_id: TrackId, dts_ms: i64, keyframe: bool) -> MediaPacket {
        MediaPacket {
            track_id,
            pts: dts_ms,
            dts: dts_ms,
            duration: 0,
            timebase: Timebase::MILLIS,
            flags: PacketFlags {
                keyframe,
                ..PacketFlags::NONE
            },
            bitstream: BitstreamFormat::Avcc,
            payload: Bytes::from_static(b"payload"),
        }
    }

    struct Harness {
        packet_tx: mpsc::Sender<MediaPacket>,
        event_tx: mpsc::Sender<RouterEvent>,
        keyframe_rx: mpsc::Receiver<()>,
        _stats_rx: tokio::sync::mpsc::UnboundedReceiver<StatisticEvent>,
    }

    fn spawn_router() -> Harness {
        let (packet_tx, packet_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (keyframe_tx, keyframe_rx) = mpsc::channel(4);
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let router = StreamRouter::new(
            StreamKey::default_vhost("live", "s1"),
            tracks(),
            2,
            4,
            5_000,
            packet_rx,
            event_rx,
            keyframe_tx,
            stats_tx,
        );
        tokio::spawn(router.run());
        Harness {
            packet_tx,
            event_tx,
            keyframe_rx,
            _stats_rx: stats_rx,
        }
    }

    async fn subscribe(h: &Harness) -> SubscribeAck {
        let (tx, rx) = oneshot::channel();
        h.event_tx
            .send(RouterEvent::Subscribe {
                info: SubscriberInfo {
                    id: Uuid::new_v4(),
                    kind: SubscriberKind::HttpFlv,
                    remote_addr: String::new(),
                    request_url: String::new(),
                },
                result_sender: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_subscriber_starts_on_keyframe() {
        let h = spawn_router();
        // Non-key first: held in admission until the keyframe.
        h.packet_tx.send(packet(0, 0, false)).await.unwrap();
        h.packet_tx.send(packet(0, 33, true)).await.unwrap();
        for i in 2..10 {
            h.packet_tx.send(packet(0, i * 33, false)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut ack = subscribe(&h).await;
        let first = ack.receiver.recv().await.unwrap();
        assert!(first.flags.keyframe, "first delivered packet must be a keyframe");
        // Canonical timebase for video is 90 kHz.
        assert_eq!(first.timebase, Timebase::MPEG);
    }

    #[tokio::test]
    async fn test_disordered_input_never_breaks_monotonicity() {
        let h = spawn_router();
        h.packet_tx.send(packet(0, 0, true)).await.unwrap();
        // Interleaved late arrivals: they either re-sequence or drop, but
        // subscribers must never observe a DTS regression.
        for dts in [66i64, 33, 132, 99, 198, 165, 231, 264, 297, 330] {
            h.packet_tx.send(packet(0, dts, false)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut ack = subscribe(&h).await;
        let mut last_dts = i64::MIN;
        // Snapshot is ordered; pull what is buffered.
        while let Ok(p) = ack.receiver.try_recv() {
            assert!(p.dts >= last_dts, "dts regression: {} < {last_dts}", p.dts);
            last_dts = p.dts;
        }
        assert!(last_dts > i64::MIN);
    }

    #[tokio::test]
    async fn test_cold_subscribe_requests_keyframe() {
        let mut h = spawn_router();
        // No packets at all: audio-only admission is still waiting for the
        // video keyframe, so subscribing fires a keyframe request.
        let _ack = subscribe(&h).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.keyframe_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unpublish_closes_subscribers_with_eos() {
        let h = spawn_router();
        h.packet_tx.send(packet(0, 0, true)).await.unwrap();
        h.packet_tx.send(packet(1, 0, false)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut ack = subscribe(&h).await;
        h.event_tx.send(RouterEvent::UnPublish).await.unwrap();

        let mut saw_eos = false;
        while let Some(p) = ack.receiver.recv().await {
            if p.flags.end_of_stream {
                saw_eos = true;
            }
        }
        assert!(saw_eos, "subscriber must observe end-of-stream markers");
    }
}
