//! End-to-end registry/router behaviour: publish, subscribe, ordering,
//! GOP preload, epoch safety, teardown.

use {
    bytes::Bytes,
    sluice_engine::{
        hub::{
            api,
            define::{
                ProviderInfo, ProviderKind, StreamHubEvent, SubscriberInfo, SubscriberKind,
            },
            stream::StreamKey,
            HubConfig, StreamHub,
        },
        media::{
            AudioParams, BitstreamFormat, CodecId, MediaPacket, MediaTrack, PacketFlags,
            Timebase, VideoParams,
        },
    },
    uuid::Uuid,
};

fn tracks() -> Vec<MediaTrack> {
    vec![
        MediaTrack::video(
            0,
            CodecId::H264,
            Timebase::MILLIS,
            VideoParams {
                width: 1280,
                height: 720,
                fps_milli: 30_000,
            },
        )
        .with_extradata(Bytes::from_static(b"avcc")),
        MediaTrack::audio(
            1,
            CodecId::Aac,
            Timebase::MILLIS,
            AudioParams {
                sample_rate: 48_000,
                channels: 2,
            },
        )
        .with_extradata(Bytes::from_static(b"asc")),
    ]
}

fn video_packet(dts_ms: i64, keyframe: bool) -> MediaPacket {
    MediaPacket {
        track_id: 0,
        pts: dts_ms + 33,
        dts: dts_ms,
        duration: 33,
        timebase: Timebase::MILLIS,
        flags: PacketFlags {
            keyframe,
            ..PacketFlags::NONE
        },
        bitstream: BitstreamFormat::Avcc,
        payload: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x00]),
    }
}

fn audio_packet(dts_ms: i64) -> MediaPacket {
    MediaPacket {
        track_id: 1,
        pts: dts_ms,
        dts: dts_ms,
        duration: 21,
        timebase: Timebase::MILLIS,
        flags: PacketFlags::NONE,
        bitstream: BitstreamFormat::Raw,
        payload: Bytes::from_static(&[0xAA, 0xBB]),
    }
}

fn provider() -> ProviderInfo {
    ProviderInfo {
        id: Uuid::new_v4(),
        kind: ProviderKind::RtmpPush,
        remote_addr: "10.0.0.1:5000".into(),
    }
}

fn subscriber(kind: SubscriberKind) -> SubscriberInfo {
    SubscriberInfo {
        id: Uuid::new_v4(),
        kind,
        remote_addr: String::new(),
        request_url: String::new(),
    }
}

async fn start_hub() -> (
    sluice_engine::hub::define::HubEventSender,
    sluice_engine::hub::statistics::StatisticsRegistry,
) {
    let mut hub = StreamHub::new(HubConfig::default());
    let sender = hub.event_sender();
    let registry = hub.statistics_registry();
    tokio::spawn(async move { hub.run().await });
    (sender, registry)
}

#[tokio::test]
async fn publish_route_subscribe_delivers_in_order() {
    let (hub, _registry) = start_hub().await;
    let key = StreamKey::default_vhost("live", "flow");

    let ack = api::publish(&hub, key.clone(), provider(), tracks())
        .await
        .expect("publish");

    // One GOP then a second keyframe.
    for i in 0..30i64 {
        ack.packet_sender
            .send(video_packet(i * 33, i == 0))
            .await
            .expect("send");
        if i % 2 == 0 {
            ack.packet_sender.send(audio_packet(i * 33)).await.expect("send");
        }
    }
    ack.packet_sender
        .send(video_packet(30 * 33, true))
        .await
        .expect("send");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut sub = api::subscribe(&hub, key.clone(), subscriber(SubscriberKind::HttpFlv))
        .await
        .expect("subscribe");
    assert_eq!(sub.tracks.len(), 2);

    // First video packet delivered must be a keyframe; per-track DTS must
    // be non-decreasing throughout.
    let mut last_dts = [i64::MIN; 2];
    let mut first_video_seen = false;
    while let Ok(Some(packet)) =
        tokio::time::timeout(std::time::Duration::from_millis(200), sub.receiver.recv()).await
    {
        if packet.track_id == 0 && !first_video_seen {
            assert!(packet.flags.keyframe, "subscriber joined off-keyframe");
            first_video_seen = true;
        }
        let slot = packet.track_id as usize;
        assert!(packet.dts >= last_dts[slot], "dts went backwards");
        last_dts[slot] = packet.dts;
    }
    assert!(first_video_seen, "no video delivered");
}

#[tokio::test]
async fn unpublish_ends_subscribers_cleanly() {
    let (hub, _registry) = start_hub().await;
    let key = StreamKey::default_vhost("live", "enders");

    let ack = api::publish(&hub, key.clone(), provider(), tracks())
        .await
        .expect("publish");
    ack.packet_sender.send(video_packet(0, true)).await.expect("send");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut sub = api::subscribe(&hub, key.clone(), subscriber(SubscriberKind::Whep))
        .await
        .expect("subscribe");

    api::unpublish(&hub, ack.handle);

    // The receiver drains buffered packets, sees end-of-stream markers,
    // then closes.
    let mut saw_eos = false;
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(1), sub.receiver.recv()).await
        {
            Ok(Some(packet)) => {
                if packet.flags.end_of_stream {
                    saw_eos = true;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("subscriber never observed stream end"),
        }
    }
    assert!(saw_eos);
}

#[tokio::test]
async fn statistics_track_stream_lifecycle() {
    let (hub, registry) = start_hub().await;
    let key = StreamKey::default_vhost("live", "stats");

    let ack = api::publish(&hub, key.clone(), provider(), tracks())
        .await
        .expect("publish");
    for i in 0..10i64 {
        ack.packet_sender
            .send(video_packet(i * 33, i == 0))
            .await
            .expect("send");
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    {
        let stats = registry.get(&key).expect("stats entry");
        assert!(stats.recv_bytes > 0);
        assert_eq!(stats.video_frames, 10);
    }

    api::unpublish(&hub, ack.handle);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(registry.get(&key).is_none(), "stats must clear on stop");
}

#[tokio::test]
async fn admin_terminate_stops_stream() {
    let (hub, registry) = start_hub().await;
    let key = StreamKey::default_vhost("live", "doomed");

    let ack = api::publish(&hub, key.clone(), provider(), tracks())
        .await
        .expect("publish");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(registry.get(&key).is_some());

    hub.send(StreamHubEvent::Terminate { key: key.clone() })
        .await
        .expect("terminate");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The name is free again for a fresh publish at a higher epoch.
    let second = api::publish(&hub, key, provider(), tracks())
        .await
        .expect("republish after terminate");
    assert!(second.handle.epoch > ack.handle.epoch);
}
