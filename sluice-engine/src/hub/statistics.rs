use {
    super::{
        define::{ProviderInfo, StatisticReceiver, SubscriberInfo},
        stream::{StreamKey, StreamState},
    },
    crate::media::MediaKind,
    chrono::{DateTime, Local},
    dashmap::DashMap,
    serde::Serialize,
    std::sync::Arc,
    std::time::Duration,
    uuid::Uuid,
};

/// Bitrate computation tick.
const CALCULATE_INTERVAL: Duration = Duration::from_secs(5);

pub enum StatisticEvent {
    StreamCreated {
        key: StreamKey,
        provider: ProviderInfo,
    },
    StreamStateChanged {
        key: StreamKey,
        state: StreamState,
    },
    StreamRemoved {
        key: StreamKey,
    },
    PacketIn {
        key: StreamKey,
        kind: MediaKind,
        bytes: usize,
        keyframe: bool,
    },
    PacketOut {
        key: StreamKey,
        subscriber_id: Uuid,
        bytes: usize,
    },
    SubscriberConnected {
        key: StreamKey,
        info: SubscriberInfo,
    },
    SubscriberDisconnected {
        key: StreamKey,
        subscriber_id: Uuid,
    },
    SubscriberDropExceeded {
        key: StreamKey,
        subscriber_id: Uuid,
        dropped: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatistics {
    pub info: SubscriberInfo,
    pub start_time: DateTime<Local>,
    pub send_bytes: u64,
    pub send_bitrate_bps: u64,
    pub dropped_packets: u64,
    #[serde(skip)]
    last_send_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatistics {
    pub key: StreamKey,
    pub state: StreamState,
    pub provider: Option<ProviderInfo>,
    pub start_time: DateTime<Local>,
    pub recv_bytes: u64,
    pub recv_video_bytes: u64,
    pub recv_audio_bytes: u64,
    pub recv_bitrate_bps: u64,
    pub send_bytes: u64,
    pub send_bitrate_bps: u64,
    pub video_frames: u64,
    pub keyframes: u64,
    /// Frames in the most recently completed GOP.
    pub gop_frames: u64,
    pub subscriber_count: usize,
    pub subscribers: Vec<SubscriberStatistics>,
    #[serde(skip)]
    last_recv_bytes: u64,
    #[serde(skip)]
    last_send_bytes: u64,
    #[serde(skip)]
    frames_in_gop: u64,
}

impl StreamStatistics {
    fn new(key: StreamKey, provider: ProviderInfo) -> Self {
        Self {
            key,
            state: StreamState::Initialising,
            provider: Some(provider),
            start_time: Local::now(),
            recv_bytes: 0,
            recv_video_bytes: 0,
            recv_audio_bytes: 0,
            recv_bitrate_bps: 0,
            send_bytes: 0,
            send_bitrate_bps: 0,
            video_frames: 0,
            keyframes: 0,
            gop_frames: 0,
            subscriber_count: 0,
            subscribers: Vec::new(),
            last_recv_bytes: 0,
            last_send_bytes: 0,
            frames_in_gop: 0,
        }
    }
}

/// Shared, read-mostly statistics the admin surface serves without ever
/// touching the media plane.
pub type StatisticsRegistry = Arc<DashMap<StreamKey, StreamStatistics>>;

/// Aggregates statistic events from providers, routers and publishers,
/// and recomputes bitrates on a fixed tick.
pub struct StatisticsAggregator {
    registry: StatisticsRegistry,
    receiver: StatisticReceiver,
}

impl StatisticsAggregator {
    #[must_use]
    pub fn new(registry: StatisticsRegistry, receiver: StatisticReceiver) -> Self {
        Self { registry, receiver }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(CALCULATE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.receiver.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("statistics channel closed, aggregator exiting");
                        return;
                    };
                    self.apply(event);
                }
                _ = ticker.tick() => {
                    self.calculate_bitrates();
                }
            }
        }
    }

    fn apply(&mut self, event: StatisticEvent) {
        match event {
            StatisticEvent::StreamCreated { key, provider } => {
                self.registry
                    .insert(key.clone(), StreamStatistics::new(key, provider));
            }
            StatisticEvent::StreamStateChanged { key, state } => {
                if let Some(mut stats) = self.registry.get_mut(&key) {
                    stats.state = state;
                }
            }
            StatisticEvent::StreamRemoved { key } => {
                self.registry.remove(&key);
            }
            StatisticEvent::PacketIn {
                key,
                kind,
                bytes,
                keyframe,
            } => {
                if let Some(mut stats) = self.registry.get_mut(&key) {
                    stats.recv_bytes += bytes as u64;
                    match kind {
                        MediaKind::Video => {
                            stats.recv_video_bytes += bytes as u64;
                            stats.video_frames += 1;
                            if keyframe {
                                stats.keyframes += 1;
                                stats.gop_frames = stats.frames_in_gop;
                                stats.frames_in_gop = 1;
                            } else {
                                stats.frames_in_gop += 1;
                            }
                        }
                        MediaKind::Audio => stats.recv_audio_bytes += bytes as u64,
                        MediaKind::Data => {}
                    }
                }
            }
            StatisticEvent::PacketOut {
                key,
                subscriber_id,
                bytes,
            } => {
                if let Some(mut stats) = self.registry.get_mut(&key) {
                    stats.send_bytes += bytes as u64;
                    if let Some(sub) = stats
                        .subscribers
                        .iter_mut()
                        .find(|s| s.info.id == subscriber_id)
                    {
                        sub.send_bytes += bytes as u64;
                    }
                }
            }
            StatisticEvent::SubscriberConnected { key, info } => {
                if let Some(mut stats) = self.registry.get_mut(&key) {
                    stats.subscriber_count += 1;
                    stats.subscribers.push(SubscriberStatistics {
                        info,
                        start_time: Local::now(),
                        send_bytes: 0,
                        send_bitrate_bps: 0,
                        dropped_packets: 0,
                        last_send_bytes: 0,
                    });
                }
            }
            StatisticEvent::SubscriberDisconnected { key, subscriber_id } => {
                if let Some(mut stats) = self.registry.get_mut(&key) {
                    stats.subscriber_count = stats.subscriber_count.saturating_sub(1);
                    stats.subscribers.retain(|s| s.info.id != subscriber_id);
                }
            }
            StatisticEvent::SubscriberDropExceeded {
                key,
                subscriber_id,
                dropped,
            } => {
                if let Some(mut stats) = self.registry.get_mut(&key) {
                    if let Some(sub) = stats
                        .subscribers
                        .iter_mut()
                        .find(|s| s.info.id == subscriber_id)
                    {
                        sub.dropped_packets = dropped;
                    }
                }
            }
        }
    }

    fn calculate_bitrates(&self) {
        let secs = CALCULATE_INTERVAL.as_secs();
        for mut entry in self.registry.iter_mut() {
            let stats = entry.value_mut();
            stats.recv_bitrate_bps = (stats.recv_bytes - stats.last_recv_bytes) * 8 / secs;
            stats.send_bitrate_bps = (stats.send_bytes - stats.last_send_bytes) * 8 / secs;
            stats.last_recv_bytes = stats.recv_bytes;
            stats.last_send_bytes = stats.send_bytes;
            for sub in &mut stats.subscribers {
                sub.send_bitrate_bps = (sub.send_bytes - sub.last_send_bytes) * 8 / secs;
                sub.last_send_bytes = sub.send_bytes;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::define::{ProviderKind, SubscriberKind};

    fn provider() -> ProviderInfo {
        ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::RtmpPush,
            remote_addr: "10.0.0.1:50000".into(),
        }
    }

    #[test]
    fn test_gop_frame_accounting() {
        let registry: StatisticsRegistry = Arc::new(DashMap::new());
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut agg = StatisticsAggregator::new(registry.clone(), rx);
        let key = StreamKey::default_vhost("live", "s1");

        agg.apply(StatisticEvent::StreamCreated {
            key: key.clone(),
            provider: provider(),
        });
        for i in 0..61 {
            agg.apply(StatisticEvent::PacketIn {
                key: key.clone(),
                kind: MediaKind::Video,
                bytes: 1_000,
                keyframe: i % 30 == 0,
            });
        }
        let stats = registry.get(&key).unwrap();
        assert_eq!(stats.keyframes, 3);
        assert_eq!(stats.gop_frames, 30);
        assert_eq!(stats.video_frames, 61);
    }

    #[test]
    fn test_subscriber_lifecycle() {
        let registry: StatisticsRegistry = Arc::new(DashMap::new());
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut agg = StatisticsAggregator::new(registry.clone(), rx);
        let key = StreamKey::default_vhost("live", "s1");
        let sub_id = Uuid::new_v4();

        agg.apply(StatisticEvent::StreamCreated {
            key: key.clone(),
            provider: provider(),
        });
        agg.apply(StatisticEvent::SubscriberConnected {
            key: key.clone(),
            info: SubscriberInfo {
                id: sub_id,
                kind: SubscriberKind::LlHls,
                remote_addr: String::new(),
                request_url: "/live/s1/llhls.m3u8".into(),
            },
        });
        agg.apply(StatisticEvent::PacketOut {
            key: key.clone(),
            subscriber_id: sub_id,
            bytes: 4_096,
        });
        {
            let stats = registry.get(&key).unwrap();
            assert_eq!(stats.subscriber_count, 1);
            assert_eq!(stats.subscribers[0].send_bytes, 4_096);
        }
        agg.apply(StatisticEvent::SubscriberDisconnected {
            key: key.clone(),
            subscriber_id: sub_id,
        });
        let stats = registry.get(&key).unwrap();
        assert_eq!(stats.subscriber_count, 0);
        assert!(stats.subscribers.is_empty());
    }
}
