pub mod define;
pub mod errors;
pub mod publish_point;
pub mod router;
pub mod statistics;
pub mod stream;

use {
    define::{
        BroadcastEvent, BroadcastEventReceiver, BroadcastEventSender, HubEventReceiver,
        HubEventSender, ProviderInfo, PublishAck, RouterEvent, RouterEventSender, StatisticSender,
        StreamHubEvent, SubscribeAck, SubscriberInfo, ADMISSION_BUFFER_MILLIS,
        DEFAULT_GOP_CACHE_COUNT, DEFAULT_MAX_REORDER, HUB_EVENT_CHANNEL_CAPACITY,
        PACKET_CHANNEL_CAPACITY, ROUTER_EVENT_CHANNEL_CAPACITY,
    },
    errors::HubError,
    router::StreamRouter,
    statistics::{StatisticEvent, StatisticsAggregator, StatisticsRegistry},
    std::collections::HashMap,
    stream::{StreamHandle, StreamKey, StreamState},
    tokio::sync::{broadcast, mpsc, oneshot},
    crate::media::MediaTrack,
};

/// Tuning knobs the hub passes to every router it spawns.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub gop_cache_count: usize,
    pub max_reorder: usize,
    pub admission_millis_cap: i64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            gop_cache_count: DEFAULT_GOP_CACHE_COUNT,
            max_reorder: DEFAULT_MAX_REORDER,
            admission_millis_cap: ADMISSION_BUFFER_MILLIS,
        }
    }
}

struct StreamEntry {
    epoch: u64,
    state: StreamState,
    router_events: RouterEventSender,
    tracks: Vec<MediaTrack>,
}

/// Process-wide stream registry and event loop.
///
/// All lifecycle mutation flows through this single task: providers
/// publish, subscribers attach, admin terminates. Media never touches the
/// hub; each stream's packets flow provider → router → subscribers on
/// their own channels. Lookups for the admin surface go through the
/// statistics registry snapshot, never this loop.
pub struct StreamHub {
    streams: HashMap<StreamKey, StreamEntry>,
    epochs: HashMap<StreamKey, u64>,
    pending_subscribers: HashMap<StreamKey, Vec<(SubscriberInfo, define::SubscribeResultSender)>>,
    event_receiver: HubEventReceiver,
    event_sender: HubEventSender,
    broadcast_sender: BroadcastEventSender,
    statistics_sender: StatisticSender,
    statistics_registry: StatisticsRegistry,
    config: HubConfig,
}

impl StreamHub {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let (event_sender, event_receiver) = mpsc::channel(HUB_EVENT_CHANNEL_CAPACITY);
        let (broadcast_sender, _) = broadcast::channel(1_000);
        let (statistics_sender, statistics_receiver) = mpsc::unbounded_channel();
        let statistics_registry: StatisticsRegistry =
            std::sync::Arc::new(dashmap::DashMap::new());

        let aggregator =
            StatisticsAggregator::new(statistics_registry.clone(), statistics_receiver);
        tokio::spawn(aggregator.run());

        Self {
            streams: HashMap::new(),
            epochs: HashMap::new(),
            pending_subscribers: HashMap::new(),
            event_receiver,
            event_sender,
            broadcast_sender,
            statistics_sender,
            statistics_registry,
            config,
        }
    }

    #[must_use]
    pub fn event_sender(&self) -> HubEventSender {
        self.event_sender.clone()
    }

    #[must_use]
    pub fn subscribe_broadcast(&self) -> BroadcastEventReceiver {
        self.broadcast_sender.subscribe()
    }

    #[must_use]
    pub fn statistics_registry(&self) -> StatisticsRegistry {
        self.statistics_registry.clone()
    }

    pub async fn run(&mut self) {
        while let Some(event) = self.event_receiver.recv().await {
            match event {
                StreamHubEvent::Publish {
                    key,
                    info,
                    tracks,
                    result_sender,
                } => {
                    let result = self.publish(key, info, tracks);
                    if result_sender.send(result).is_err() {
                        tracing::warn!("publisher dropped before publish ack");
                    }
                }
                StreamHubEvent::UnPublish { handle } => self.unpublish(&handle),
                StreamHubEvent::Subscribe {
                    key,
                    info,
                    result_sender,
                } => self.subscribe(key, info, result_sender).await,
                StreamHubEvent::UnSubscribe { key, info } => {
                    if let Some(entry) = self.streams.get(&key) {
                        let _ = entry
                            .router_events
                            .try_send(RouterEvent::UnSubscribe { info });
                    }
                }
                StreamHubEvent::RequestKeyframe { key } => {
                    if let Some(entry) = self.streams.get(&key) {
                        let _ = entry.router_events.try_send(RouterEvent::RequestKeyframe);
                    }
                }
                StreamHubEvent::Terminate { key } => {
                    if let Some(entry) = self.streams.get(&key) {
                        let handle = StreamHandle {
                            key,
                            epoch: entry.epoch,
                        };
                        self.unpublish(&handle);
                    }
                }
                StreamHubEvent::TerminateSubscriber { key, subscriber_id } => {
                    if let Some(entry) = self.streams.get(&key) {
                        let _ = entry
                            .router_events
                            .try_send(RouterEvent::TerminateSubscriber { subscriber_id });
                    }
                }
            }
        }
        tracing::error!("stream hub event loop exited: all event senders dropped");
    }

    fn publish(
        &mut self,
        key: StreamKey,
        info: ProviderInfo,
        tracks: Vec<MediaTrack>,
    ) -> Result<PublishAck, HubError> {
        if let Some(existing) = self.streams.get(&key) {
            if matches!(
                existing.state,
                StreamState::Initialising | StreamState::Ready | StreamState::Publishing
            ) {
                return Err(HubError::AlreadyPublishing);
            }
        }
        if tracks.is_empty() {
            return Err(HubError::InvalidTracks("empty track set".into()));
        }

        let epoch = self.epochs.entry(key.clone()).or_insert(0);
        *epoch += 1;
        let epoch = *epoch;

        let (packet_sender, packet_receiver) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (router_events, router_event_receiver) =
            mpsc::channel(ROUTER_EVENT_CHANNEL_CAPACITY);
        let (keyframe_sender, keyframe_receiver) = mpsc::channel(4);

        let router = StreamRouter::new(
            key.clone(),
            tracks.clone(),
            self.config.gop_cache_count,
            self.config.max_reorder,
            self.config.admission_millis_cap,
            packet_receiver,
            router_event_receiver,
            keyframe_sender,
            self.statistics_sender.clone(),
        );
        tokio::spawn(router.run());

        let _ = self.statistics_sender.send(StatisticEvent::StreamCreated {
            key: key.clone(),
            provider: info.clone(),
        });
        let _ = self
            .statistics_sender
            .send(StatisticEvent::StreamStateChanged {
                key: key.clone(),
                state: StreamState::Ready,
            });

        self.streams.insert(
            key.clone(),
            StreamEntry {
                epoch,
                state: StreamState::Ready,
                router_events: router_events.clone(),
                tracks: tracks.clone(),
            },
        );
        tracing::info!(stream = %key, epoch, provider = ?info.kind, "stream published");

        // Park-and-resolve: anyone who subscribed before the stream existed
        // is attached now.
        if let Some(waiters) = self.pending_subscribers.remove(&key) {
            for (sub_info, result_sender) in waiters {
                let _ = router_events.try_send(RouterEvent::Subscribe {
                    info: sub_info,
                    result_sender,
                });
            }
        }

        let _ = self.broadcast_sender.send(BroadcastEvent::StreamReady {
            key: key.clone(),
            tracks,
        });

        Ok(PublishAck {
            handle: StreamHandle { key, epoch },
            packet_sender,
            keyframe_requests: keyframe_receiver,
            statistics: self.statistics_sender.clone(),
        })
    }

    fn unpublish(&mut self, handle: &StreamHandle) {
        let Some(entry) = self.streams.get(&handle.key) else {
            // Idempotent: stopping a stopped stream is a no-op.
            return;
        };
        if entry.epoch != handle.epoch {
            tracing::warn!(
                stream = %handle.key,
                held = handle.epoch,
                current = entry.epoch,
                "stale handle ignored on unpublish"
            );
            return;
        }
        let _ = entry.router_events.try_send(RouterEvent::UnPublish);
        self.streams.remove(&handle.key);

        // The name becomes reusable; the bumped epoch (on next publish)
        // keeps stale handles dead forever.
        let _ = self.statistics_sender.send(StatisticEvent::StreamRemoved {
            key: handle.key.clone(),
        });
        let _ = self.broadcast_sender.send(BroadcastEvent::StreamStopped {
            key: handle.key.clone(),
        });
        tracing::info!(stream = %handle.key, epoch = handle.epoch, "stream unpublished");
    }

    async fn subscribe(
        &mut self,
        key: StreamKey,
        info: SubscriberInfo,
        result_sender: define::SubscribeResultSender,
    ) {
        match self.streams.get(&key) {
            Some(entry) if entry.state != StreamState::Stopping => {
                if entry
                    .router_events
                    .send(RouterEvent::Subscribe {
                        info,
                        result_sender,
                    })
                    .await
                    .is_err()
                {
                    tracing::warn!(stream = %key, "router gone during subscribe");
                }
            }
            _ => {
                tracing::info!(stream = %key, subscriber = %info.id, "subscription parked");
                self.pending_subscribers
                    .entry(key)
                    .or_default()
                    .push((info, result_sender));
            }
        }
    }
}

/// Convenience wrappers over the hub event channel for protocol modules.
pub mod api {
    use super::*;

    pub async fn publish(
        hub: &HubEventSender,
        key: StreamKey,
        info: ProviderInfo,
        tracks: Vec<MediaTrack>,
    ) -> Result<PublishAck, HubError> {
        let (result_sender, result_receiver) = oneshot::channel();
        hub.send(StreamHubEvent::Publish {
            key,
            info,
            tracks,
            result_sender,
        })
        .await
        .map_err(|_| HubError::SendError)?;
        result_receiver.await?
    }

    pub async fn subscribe(
        hub: &HubEventSender,
        key: StreamKey,
        info: SubscriberInfo,
    ) -> Result<SubscribeAck, HubError> {
        let (result_sender, result_receiver) = oneshot::channel();
        hub.send(StreamHubEvent::Subscribe {
            key,
            info,
            result_sender,
        })
        .await
        .map_err(|_| HubError::SendError)?;
        result_receiver.await?
    }

    pub fn unsubscribe(hub: &HubEventSender, key: StreamKey, info: SubscriberInfo) {
        let _ = hub.try_send(StreamHubEvent::UnSubscribe { key, info });
    }

    pub fn unpublish(hub: &HubEventSender, handle: StreamHandle) {
        let _ = hub.try_send(StreamHubEvent::UnPublish { handle });
    }

    pub fn request_keyframe(hub: &HubEventSender, key: StreamKey) {
        let _ = hub.try_send(StreamHubEvent::RequestKeyframe { key });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::define::{ProviderKind, SubscriberKind};
    use crate::media::{CodecId, MediaKind, Timebase, VideoParams};
    use uuid::Uuid;

    fn video_tracks() -> Vec<MediaTrack> {
        vec![MediaTrack::video(
            0,
            CodecId::H264,
            Timebase::MILLIS,
            VideoParams {
                width: 1280,
                height: 720,
                fps_milli: 30_000,
            },
        )]
    }

    fn provider_info() -> ProviderInfo {
        ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::RtmpPush,
            remote_addr: "127.0.0.1:12345".into(),
        }
    }

    fn subscriber_info() -> SubscriberInfo {
        SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::HttpFlv,
            remote_addr: String::new(),
            request_url: String::new(),
        }
    }

    async fn spawn_hub() -> HubEventSender {
        let mut hub = StreamHub::new(HubConfig::default());
        let sender = hub.event_sender();
        tokio::spawn(async move { hub.run().await });
        sender
    }

    #[tokio::test]
    async fn test_duplicate_publish_rejected() {
        let hub = spawn_hub().await;
        let key = StreamKey::default_vhost("live", "s1");
        let _ack = api::publish(&hub, key.clone(), provider_info(), video_tracks())
            .await
            .unwrap();
        let second = api::publish(&hub, key, provider_info(), video_tracks()).await;
        assert!(matches!(second, Err(HubError::AlreadyPublishing)));
    }

    #[tokio::test]
    async fn test_name_reusable_after_unpublish_with_new_epoch() {
        let hub = spawn_hub().await;
        let key = StreamKey::default_vhost("live", "s1");
        let ack1 = api::publish(&hub, key.clone(), provider_info(), video_tracks())
            .await
            .unwrap();
        assert_eq!(ack1.handle.epoch, 1);
        api::unpublish(&hub, ack1.handle.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let ack2 = api::publish(&hub, key, provider_info(), video_tracks())
            .await
            .unwrap();
        assert_eq!(ack2.handle.epoch, 2);
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_stop_new_stream() {
        let hub = spawn_hub().await;
        let key = StreamKey::default_vhost("live", "s1");
        let ack1 = api::publish(&hub, key.clone(), provider_info(), video_tracks())
            .await
            .unwrap();
        let stale = ack1.handle.clone();
        api::unpublish(&hub, ack1.handle);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let ack2 = api::publish(&hub, key.clone(), provider_info(), video_tracks())
            .await
            .unwrap();

        // Replay the stale stop; the new incarnation must survive.
        api::unpublish(&hub, stale);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let third = api::publish(&hub, key, provider_info(), video_tracks()).await;
        assert!(matches!(third, Err(HubError::AlreadyPublishing)));
        drop(ack2);
    }

    #[tokio::test]
    async fn test_pending_subscription_resolves_on_publish() {
        let hub = spawn_hub().await;
        let key = StreamKey::default_vhost("live", "s1");

        let hub_clone = hub.clone();
        let key_clone = key.clone();
        let waiter = tokio::spawn(async move {
            api::subscribe(&hub_clone, key_clone, subscriber_info()).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let _ack = api::publish(&hub, key, provider_info(), video_tracks())
            .await
            .unwrap();
        let sub = waiter.await.unwrap().unwrap();
        assert_eq!(sub.tracks.len(), 1);
        assert_eq!(sub.tracks[0].kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn test_empty_track_set_rejected() {
        let hub = spawn_hub().await;
        let key = StreamKey::default_vhost("live", "s1");
        let result = api::publish(&hub, key, provider_info(), Vec::new()).await;
        assert!(matches!(result, Err(HubError::InvalidTracks(_))));
    }
}
