//! Sluice engine: the media-plane core of a live streaming origin.
//!
//! Ingest protocols (RTMP, SRT, MPEG-TS/UDP, RTSP pull, OVT pull)
//! normalise encoded media into a shared packet model and publish it into
//! the [`hub`]; delivery protocols (LL-HLS, HTTP-FLV, SRT, RTMP, OVT)
//! subscribe there. The hub owns stream lifecycle, per-track ordering,
//! the GOP cache every subscriber joins on, and statistics.

pub mod access;
pub mod amf0;
pub mod bytesio;
pub mod codec;
pub mod flv;
pub mod httpflv;
pub mod hub;
pub mod llhls;
pub mod media;
pub mod mpegts;
pub mod mpegts_udp;
pub mod ovt;
pub mod record;
pub mod rtmp;
pub mod rtsp;
pub mod srt;
