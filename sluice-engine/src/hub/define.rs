use {
    super::{errors::HubError, statistics::StatisticEvent, stream::{StreamHandle, StreamKey}},
    crate::media::{MediaPacket, MediaTrack},
    serde::Serialize,
    std::fmt,
    tokio::sync::{broadcast, mpsc, oneshot},
    uuid::Uuid,
};

/// Per-subscriber packet channel depth. Bounded so a stalled subscriber
/// costs drops, never memory; at a few KB per access unit this is roughly
/// two seconds of 1080p30 video.
pub const PACKET_CHANNEL_CAPACITY: usize = 512;

/// Hub control-event channel depth.
pub const HUB_EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Router control-event channel depth.
pub const ROUTER_EVENT_CHANNEL_CAPACITY: usize = 256;

/// How many trailing GOPs each publish point retains.
pub const DEFAULT_GOP_CACHE_COUNT: usize = 2;

/// Admission buffer cap while a stream is still initialising, in
/// milliseconds of buffered media.
pub const ADMISSION_BUFFER_MILLIS: i64 = 5_000;

/// Per-track reorder window, in packets.
pub const DEFAULT_MAX_REORDER: usize = 32;

/// Drain budget when a stream stops before subscribers are cut off.
pub const STOP_DRAIN_BUDGET_SECS: u64 = 5;

pub type PacketSender = mpsc::Sender<MediaPacket>;
pub type PacketReceiver = mpsc::Receiver<MediaPacket>;

pub type HubEventSender = mpsc::Sender<StreamHubEvent>;
pub type HubEventReceiver = mpsc::Receiver<StreamHubEvent>;

pub type RouterEventSender = mpsc::Sender<RouterEvent>;
pub type RouterEventReceiver = mpsc::Receiver<RouterEvent>;

pub type BroadcastEventSender = broadcast::Sender<BroadcastEvent>;
pub type BroadcastEventReceiver = broadcast::Receiver<BroadcastEvent>;

pub type StatisticSender = mpsc::UnboundedSender<StatisticEvent>;
pub type StatisticReceiver = mpsc::UnboundedReceiver<StatisticEvent>;

/// Best-effort keyframe request back to the provider. RTMP ingest cannot
/// honour it; WebRTC and RTSP forward it upstream as PLI/FIR.
pub type KeyframeRequestSender = mpsc::Sender<()>;
pub type KeyframeRequestReceiver = mpsc::Receiver<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    RtmpPush,
    SrtCaller,
    MpegtsUdp,
    RtspPull,
    WhipIngest,
    OvtPull,
    Transcoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberKind {
    LlHls,
    HttpFlv,
    SrtListener,
    RtmpPlay,
    RtmpPush,
    Whep,
    Ovt,
    Thumbnail,
    Transcoder,
    Record,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: Uuid,
    pub kind: ProviderKind,
    pub remote_addr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: Uuid,
    pub kind: SubscriberKind,
    pub remote_addr: String,
    pub request_url: String,
}

/// Everything a provider gets back from a successful publish.
pub struct PublishAck {
    pub handle: StreamHandle,
    pub packet_sender: PacketSender,
    pub keyframe_requests: KeyframeRequestReceiver,
    pub statistics: StatisticSender,
}

/// Everything a subscriber gets back from a successful subscribe. The
/// receiver is pre-loaded with the publish point's ring starting at a
/// keyframe; live packets follow seamlessly.
pub struct SubscribeAck {
    pub tracks: Vec<MediaTrack>,
    pub receiver: PacketReceiver,
    pub statistics: StatisticSender,
}

pub type PublishResultSender = oneshot::Sender<Result<PublishAck, HubError>>;
pub type SubscribeResultSender = oneshot::Sender<Result<SubscribeAck, HubError>>;

pub enum StreamHubEvent {
    Publish {
        key: StreamKey,
        info: ProviderInfo,
        tracks: Vec<MediaTrack>,
        result_sender: PublishResultSender,
    },
    UnPublish {
        handle: StreamHandle,
    },
    Subscribe {
        key: StreamKey,
        info: SubscriberInfo,
        result_sender: SubscribeResultSender,
    },
    UnSubscribe {
        key: StreamKey,
        info: SubscriberInfo,
    },
    /// Downstream PLI/FIR or first-subscriber-wants-keyframe, forwarded to
    /// the provider.
    RequestKeyframe {
        key: StreamKey,
    },
    /// Admin: tear down a stream regardless of its provider.
    Terminate {
        key: StreamKey,
    },
    /// Admin: disconnect one subscriber.
    TerminateSubscriber {
        key: StreamKey,
        subscriber_id: Uuid,
    },
}

impl fmt::Debug for StreamHubEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Publish { key, info, .. } => {
                write!(f, "Publish({key}, {:?})", info.kind)
            }
            Self::UnPublish { handle } => write!(f, "UnPublish({})", handle.key),
            Self::Subscribe { key, info, .. } => {
                write!(f, "Subscribe({key}, {:?})", info.kind)
            }
            Self::UnSubscribe { key, info } => {
                write!(f, "UnSubscribe({key}, {:?})", info.kind)
            }
            Self::RequestKeyframe { key } => write!(f, "RequestKeyframe({key})"),
            Self::Terminate { key } => write!(f, "Terminate({key})"),
            Self::TerminateSubscriber { key, subscriber_id } => {
                write!(f, "TerminateSubscriber({key}, {subscriber_id})")
            }
        }
    }
}

/// Events a per-stream router consumes.
pub enum RouterEvent {
    Subscribe {
        info: SubscriberInfo,
        result_sender: SubscribeResultSender,
    },
    UnSubscribe {
        info: SubscriberInfo,
    },
    TerminateSubscriber {
        subscriber_id: Uuid,
    },
    RequestKeyframe,
    /// Provider gone; drain and stop.
    UnPublish,
}

/// Lifecycle notifications for components that attach to streams as they
/// appear (LL-HLS segmenters, transcoders, thumbnailers, edge relays).
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    StreamReady {
        key: StreamKey,
        tracks: Vec<MediaTrack>,
    },
    StreamStopped {
        key: StreamKey,
    },
}
