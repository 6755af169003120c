use {
    super::errors::RtspError,
    crate::media::{CodecId, MediaKind},
    base64::{engine::general_purpose::STANDARD, Engine as _},
    bytes::Bytes,
};

/// One `m=` section reduced to what the pull session needs.
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub kind: MediaKind,
    pub codec: CodecId,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u8,
    /// `a=control` value, absolute or relative.
    pub control: String,
    /// H.264 `sprop-parameter-sets`: (SPS, PPS).
    pub parameter_sets: Option<(Bytes, Bytes)>,
}

#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub medias: Vec<SdpMedia>,
}

/// Parse the subset of SDP a live camera or origin actually sends:
/// `m=`, `a=rtpmap`, `a=fmtp` (sprop), `a=control`.
pub fn parse(text: &str) -> Result<SessionDescription, RtspError> {
    let mut medias: Vec<SdpMedia> = Vec::new();
    let mut current: Option<SdpMedia> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("m=") {
            if let Some(media) = current.take() {
                medias.push(media);
            }
            let mut fields = rest.split_whitespace();
            let kind = match fields.next() {
                Some("video") => MediaKind::Video,
                Some("audio") => MediaKind::Audio,
                _ => {
                    current = None;
                    continue;
                }
            };
            // proto and port are irrelevant here; the first payload type
            // listed is the one we bind.
            let payload_type = fields
                .nth(2)
                .and_then(|pt| pt.parse::<u8>().ok())
                .ok_or_else(|| RtspError::MalformedSdp("m= line without payload type".into()))?;
            current = Some(SdpMedia {
                kind,
                codec: CodecId::H264, // refined by rtpmap
                payload_type,
                clock_rate: 90_000,
                channels: if kind == MediaKind::Audio { 2 } else { 0 },
                control: String::new(),
                parameter_sets: None,
            });
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut unsupported = false;
            if let Some(media) = current.as_mut() {
                let Some((pt, spec)) = rest.split_once(' ') else { continue };
                if pt.parse::<u8>().ok() != Some(media.payload_type) {
                    continue;
                }
                let mut parts = spec.split('/');
                let codec_name = parts.next().unwrap_or_default().to_ascii_lowercase();
                media.clock_rate = parts
                    .next()
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(media.clock_rate);
                if let Some(ch) = parts.next().and_then(|c| c.parse().ok()) {
                    media.channels = ch;
                }
                match codec_name.as_str() {
                    "h264" => media.codec = CodecId::H264,
                    "h265" | "hevc" => media.codec = CodecId::H265,
                    "opus" => media.codec = CodecId::Opus,
                    "vp8" => media.codec = CodecId::Vp8,
                    other => {
                        tracing::warn!(codec = other, "unsupported rtsp codec, section dropped");
                        unsupported = true;
                    }
                }
            }
            if unsupported {
                current = None;
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let Some(media) = current.as_mut() else { continue };
            let Some((pt, params)) = rest.split_once(' ') else { continue };
            if pt.parse::<u8>().ok() != Some(media.payload_type) {
                continue;
            }
            for param in params.split(';') {
                let param = param.trim();
                if let Some(sets) = param.strip_prefix("sprop-parameter-sets=") {
                    let mut decoded = sets.split(',').filter_map(|s| STANDARD.decode(s).ok());
                    if let (Some(sps), Some(pps)) = (decoded.next(), decoded.next()) {
                        media.parameter_sets = Some((Bytes::from(sps), Bytes::from(pps)));
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("a=control:") {
            if let Some(media) = current.as_mut() {
                media.control = rest.to_string();
            }
        }
    }
    if let Some(media) = current.take() {
        medias.push(media);
    }

    if medias.is_empty() {
        return Err(RtspError::NoSupportedMedia);
    }
    Ok(SessionDescription { medias })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=0\r\n\
o=- 0 0 IN IP4 10.0.0.2\r\n\
s=cam\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAHvQhMg==,aM48gA==\r\n\
a=control:trackID=0\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 opus/48000/2\r\n\
a=control:trackID=1\r\n";

    #[test]
    fn test_parse_two_tracks() {
        let sdp = parse(SAMPLE).unwrap();
        assert_eq!(sdp.medias.len(), 2);

        let video = &sdp.medias[0];
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.codec, CodecId::H264);
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.clock_rate, 90_000);
        assert_eq!(video.control, "trackID=0");
        let (sps, pps) = video.parameter_sets.as_ref().unwrap();
        assert_eq!(sps[0] & 0x1F, 7);
        assert_eq!(pps[0] & 0x1F, 8);

        let audio = &sdp.medias[1];
        assert_eq!(audio.codec, CodecId::Opus);
        assert_eq!(audio.clock_rate, 48_000);
        assert_eq!(audio.channels, 2);
    }

    #[test]
    fn test_unsupported_codec_dropped() {
        let text = "m=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_empty_sdp_rejected() {
        assert!(parse("v=0\r\n").is_err());
    }
}
