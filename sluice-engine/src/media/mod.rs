pub mod clock;
pub mod timebase;

use bytes::Bytes;
use serde::Serialize;
use std::fmt;

pub use clock::{MediaClock, PacketAnchor, TimestampExtender};
pub use timebase::Timebase;

pub type TrackId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    H264,
    H265,
    Aac,
    Opus,
    Vp8,
}

impl CodecId {
    #[must_use]
    pub const fn kind(self) -> MediaKind {
        match self {
            Self::H264 | Self::H265 | Self::Vp8 => MediaKind::Video,
            Self::Aac | Self::Opus => MediaKind::Audio,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Vp8 => "vp8",
        };
        write!(f, "{name}")
    }
}

/// Byte framing of the payload inside a `MediaPacket`. The same access unit
/// travels in different framings depending on the wire protocol; muxers
/// convert at the edges, the hub never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BitstreamFormat {
    /// H.26x NAL units with start codes.
    AnnexB,
    /// H.26x NAL units with 4-byte length prefixes.
    Avcc,
    /// AAC frames wrapped in ADTS headers.
    Adts,
    /// Codec frames with no extra framing (raw AAC, Opus, VP8).
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    /// Frames per second times 1000 (29970 = 29.97), 0 when unknown.
    pub fps_milli: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
}

/// Identity of one elementary stream within a `Stream`.
///
/// Immutable after the first keyframe is observed; a parameter change on
/// the wire forces a new stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: MediaKind,
    pub codec: CodecId,
    /// Codec-specific out-of-band config: SPS/PPS, AudioSpecificConfig,
    /// Opus identification header.
    pub extradata: Option<Bytes>,
    pub timebase: Timebase,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl MediaTrack {
    #[must_use]
    pub fn video(id: TrackId, codec: CodecId, timebase: Timebase, params: VideoParams) -> Self {
        Self {
            id,
            kind: MediaKind::Video,
            codec,
            extradata: None,
            timebase,
            video: Some(params),
            audio: None,
        }
    }

    #[must_use]
    pub fn audio(id: TrackId, codec: CodecId, timebase: Timebase, params: AudioParams) -> Self {
        Self {
            id,
            kind: MediaKind::Audio,
            codec,
            extradata: None,
            timebase,
            video: None,
            audio: Some(params),
        }
    }

    #[must_use]
    pub fn with_extradata(mut self, extradata: Bytes) -> Self {
        self.extradata = Some(extradata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags {
    pub keyframe: bool,
    pub discontinuity: bool,
    pub end_of_stream: bool,
}

impl PacketFlags {
    pub const KEYFRAME: Self = Self {
        keyframe: true,
        discontinuity: false,
        end_of_stream: false,
    };
    pub const NONE: Self = Self {
        keyframe: false,
        discontinuity: false,
        end_of_stream: false,
    };
}

/// One access unit on the wire.
///
/// The header travels by value; the payload is a refcounted `Bytes`, so
/// cloning for fan-out never copies media data, and a packet is immutable
/// once it has been published into the router.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub track_id: TrackId,
    pub pts: i64,
    pub dts: i64,
    /// Duration in `timebase` units; 0 when the protocol doesn't carry it.
    pub duration: i64,
    pub timebase: Timebase,
    pub flags: PacketFlags,
    pub bitstream: BitstreamFormat,
    pub payload: Bytes,
}

impl MediaPacket {
    #[must_use]
    pub fn rescaled(&self, to: Timebase) -> Self {
        let mut out = self.clone();
        out.pts = self.timebase.rescale(self.pts, to);
        out.dts = self.timebase.rescale(self.dts, to);
        out.duration = self.timebase.rescale(self.duration, to);
        out.timebase = to;
        out
    }

    /// Marker packet closing a track; carries no payload.
    #[must_use]
    pub fn end_of_stream(track_id: TrackId, dts: i64, timebase: Timebase) -> Self {
        Self {
            track_id,
            pts: dts,
            dts,
            duration: 0,
            timebase,
            flags: PacketFlags {
                keyframe: false,
                discontinuity: false,
                end_of_stream: true,
            },
            bitstream: BitstreamFormat::Raw,
            payload: Bytes::new(),
        }
    }
}

/// Decoded sample block, confined to one transcoder graph.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl MediaFrame {
    #[must_use]
    pub const fn pts_us(&self) -> i64 {
        match self {
            Self::Video(f) => f.pts_us,
            Self::Audio(f) => f.pts_us,
        }
    }
}

/// Planar YUV 4:2:0 picture. `data` holds Y, then U, then V, each plane
/// tightly packed at its own resolution.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts_us: i64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub keyframe: bool,
}

impl VideoFrame {
    #[must_use]
    pub fn plane_sizes(width: u32, height: u32) -> (usize, usize) {
        let luma = (width * height) as usize;
        let chroma = ((width + 1) / 2 * ((height + 1) / 2)) as usize;
        (luma, chroma)
    }
}

/// Interleaved f32 PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts_us: i64,
    pub sample_rate: u32,
    pub channels: u8,
    pub samples: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_rescale_updates_all_timestamps() {
        let pkt = MediaPacket {
            track_id: 1,
            pts: 1_033,
            dts: 1_000,
            duration: 33,
            timebase: Timebase::MILLIS,
            flags: PacketFlags::KEYFRAME,
            bitstream: BitstreamFormat::AnnexB,
            payload: Bytes::from_static(b"nal"),
        };
        let out = pkt.rescaled(Timebase::MPEG);
        assert_eq!(out.dts, 90_000);
        assert_eq!(out.pts, 92_970);
        assert_eq!(out.duration, 2_970);
        assert_eq!(out.timebase, Timebase::MPEG);
        // Payload is shared, not copied.
        assert_eq!(out.payload.as_ptr(), pkt.payload.as_ptr());
    }

    #[test]
    fn test_codec_kind_mapping() {
        assert_eq!(CodecId::H264.kind(), MediaKind::Video);
        assert_eq!(CodecId::Opus.kind(), MediaKind::Audio);
        assert_eq!(CodecId::Vp8.kind(), MediaKind::Video);
    }

    #[test]
    fn test_eos_marker() {
        let eos = MediaPacket::end_of_stream(2, 5_000, Timebase::MPEG);
        assert!(eos.flags.end_of_stream);
        assert!(eos.payload.is_empty());
        assert_eq!(eos.dts, 5_000);
    }
}
