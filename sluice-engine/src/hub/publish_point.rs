use {
    crate::media::{MediaKind, MediaPacket, MediaTrack, TrackId},
    std::collections::{HashMap, VecDeque},
};

/// Max packets per GOP bucket; a bucket that grows past this stops
/// caching so a keyframe-less source cannot pin unbounded memory.
const MAX_PACKETS_PER_GOP: usize = 4_096;

#[derive(Clone, Default)]
pub struct Gop {
    packets: Vec<MediaPacket>,
}

impl Gop {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            packets: Vec::new(),
        }
    }

    fn save(&mut self, packet: MediaPacket) {
        if self.packets.len() >= MAX_PACKETS_PER_GOP {
            return;
        }
        self.packets.push(packet);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Per-stream publish point: track identities plus a ring of the most
/// recent GOPs in routed (canonical-timebase) form.
///
/// Bucket rotation is keyed to the *gating* video track: the one with the
/// longest observed keyframe interval. With a single video track that is
/// simply its GOP; with several, rotating on the slowest track guarantees
/// a join inside the retained window can start every video track on a
/// keyframe.
pub struct PublishPoint {
    tracks: Vec<MediaTrack>,
    gops: VecDeque<Gop>,
    gop_count: usize,
    gating_track: Option<TrackId>,
    /// Per video track: (last keyframe dts, longest observed interval).
    keyframe_intervals: HashMap<TrackId, (i64, i64)>,
}

impl PublishPoint {
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>, gop_count: usize) -> Self {
        let gating_track = tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .map(|t| t.id);
        Self {
            tracks,
            gops: VecDeque::from([Gop::new()]),
            gop_count: gop_count.max(1),
            gating_track,
            keyframe_intervals: HashMap::new(),
        }
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Replace a track whose parameters were learned after publish
    /// (in-band SPS on WebRTC ingest). Only allowed while the extradata
    /// was previously absent; established identities stay frozen.
    pub fn update_track_extradata(&mut self, track_id: TrackId, extradata: bytes::Bytes) {
        if let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.id == track_id && t.extradata.is_none())
        {
            track.extradata = Some(extradata);
        }
    }

    pub fn save_packet(&mut self, packet: &MediaPacket) {
        if packet.flags.keyframe {
            self.observe_keyframe(packet.track_id, packet.dts);
            if Some(packet.track_id) == self.gating_track {
                if self.gops.len() >= self.gop_count {
                    self.gops.pop_front();
                }
                self.gops.push_back(Gop::new());
            }
        }
        if let Some(gop) = self.gops.back_mut() {
            gop.save(packet.clone());
        }
    }

    fn observe_keyframe(&mut self, track_id: TrackId, dts: i64) {
        let entry = self.keyframe_intervals.entry(track_id).or_insert((dts, 0));
        let interval = dts - entry.0;
        if interval > entry.1 {
            entry.1 = interval;
        }
        entry.0 = dts;

        // Re-elect the gating track if another video track turns out to
        // have a longer GOP.
        if let Some((&slowest, _)) = self
            .keyframe_intervals
            .iter()
            .max_by_key(|(_, (_, interval))| *interval)
        {
            self.gating_track = Some(slowest);
        }
    }

    /// Snapshot for a new subscriber: the newest bucket that starts on a
    /// gating-track keyframe, with each video track trimmed forward to its
    /// own first keyframe so every track starts decodable.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MediaPacket> {
        // Newest non-empty bucket whose first video packet is a keyframe.
        let bucket = self
            .gops
            .iter()
            .rev()
            .find(|g| g.packets.iter().any(|p| p.flags.keyframe));
        let Some(bucket) = bucket else {
            return Vec::new();
        };

        let mut started: HashMap<TrackId, bool> = HashMap::new();
        let mut out = Vec::with_capacity(bucket.packets.len());
        for packet in &bucket.packets {
            let is_video = self
                .tracks
                .iter()
                .find(|t| t.id == packet.track_id)
                .map_or(false, |t| t.kind == MediaKind::Video);
            if is_video {
                let begun = started.entry(packet.track_id).or_insert(false);
                if !*begun {
                    if !packet.flags.keyframe {
                        continue;
                    }
                    *begun = true;
                }
            }
            out.push(packet.clone());
        }
        out
    }

    /// Whether any cached keyframe exists yet (cold streams have none; the
    /// joining subscriber then waits for the next natural keyframe).
    #[must_use]
    pub fn has_keyframe(&self) -> bool {
        self.gops
            .iter()
            .any(|g| g.packets.iter().any(|p| p.flags.keyframe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{
        AudioParams, BitstreamFormat, CodecId, PacketFlags, Timebase, VideoParams,
    };
    use bytes::Bytes;

    fn video_track(id: TrackId) -> MediaTrack {
        MediaTrack::video(
            id,
            CodecId::H264,
            Timebase::MPEG,
            VideoParams {
                width: 1280,
                height: 720,
                fps_milli: 30_000,
            },
        )
    }

    fn audio_track(id: TrackId) -> MediaTrack {
        MediaTrack::audio(
            id,
            CodecId::Aac,
            Timebase::rtp(48_000),
            AudioParams {
                sample_rate: 48_000,
                channels: 2,
            },
        )
    }

    fn packet(track_id: TrackId, dts: i64, keyframe: bool) -> MediaPacket {
        MediaPacket {
            track_id,
            pts: dts,
            dts,
            duration: 0,
            timebase: Timebase::MPEG,
            flags: PacketFlags {
                keyframe,
                ..PacketFlags::NONE
            },
            bitstream: BitstreamFormat::Avcc,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_cold_point_has_no_keyframe() {
        let point = PublishPoint::new(vec![video_track(0)], 2);
        assert!(!point.has_keyframe());
        assert!(point.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_starts_on_keyframe() {
        let mut point = PublishPoint::new(vec![video_track(0), audio_track(1)], 2);
        point.save_packet(&packet(0, 0, true));
        point.save_packet(&packet(1, 10, false));
        point.save_packet(&packet(0, 3_000, false));
        point.save_packet(&packet(0, 6_000, true)); // next gop
        point.save_packet(&packet(1, 6_010, false));
        point.save_packet(&packet(0, 9_000, false));

        let snap = point.snapshot();
        assert!(!snap.is_empty());
        let first_video = snap.iter().find(|p| p.track_id == 0).unwrap();
        assert!(first_video.flags.keyframe);
        assert_eq!(first_video.dts, 6_000);
    }

    #[test]
    fn test_ring_evicts_old_gops() {
        let mut point = PublishPoint::new(vec![video_track(0)], 2);
        for gop in 0..5 {
            point.save_packet(&packet(0, gop * 6_000, true));
            point.save_packet(&packet(0, gop * 6_000 + 3_000, false));
        }
        // Only the last two buckets remain; a snapshot starts at the most
        // recent keyframe.
        let snap = point.snapshot();
        assert_eq!(snap[0].dts, 24_000);
    }

    #[test]
    fn test_two_video_tracks_gate_on_slowest() {
        let mut point = PublishPoint::new(vec![video_track(0), video_track(1)], 2);
        // Track 0 keys every 3000 ticks, track 1 every 9000.
        for i in 0..12 {
            let dts = i * 1_500;
            point.save_packet(&packet(0, dts, dts % 3_000 == 0));
            point.save_packet(&packet(1, dts, dts % 9_000 == 0));
        }
        // After observation the gating track is the slow one.
        assert_eq!(point.gating_track, Some(1));
        // Every video track in the snapshot starts with a keyframe.
        let snap = point.snapshot();
        for track in [0u32, 1u32] {
            let first = snap.iter().find(|p| p.track_id == track);
            if let Some(first) = first {
                assert!(first.flags.keyframe, "track {track} starts on non-key");
            }
        }
    }

    #[test]
    fn test_late_extradata_fills_once() {
        let mut point = PublishPoint::new(vec![video_track(0)], 1);
        point.update_track_extradata(0, Bytes::from_static(b"sps"));
        assert_eq!(
            point.tracks()[0].extradata.as_deref(),
            Some(b"sps".as_ref())
        );
        point.update_track_extradata(0, Bytes::from_static(b"other"));
        assert_eq!(
            point.tracks()[0].extradata.as_deref(),
            Some(b"sps".as_ref())
        );
    }
}
