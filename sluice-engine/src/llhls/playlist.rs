use super::session::{LlHlsConfig, LlHlsPlaylistState};

/// Render the media playlist: `#EXT-X-PART` for the live edge,
/// `#EXTINF` for completed segments, preload hint for the next part,
/// blocking reload advertised via `EXT-X-SERVER-CONTROL`.
#[must_use]
pub fn render(state: &LlHlsPlaylistState, config: &LlHlsConfig) -> String {
    let mut out = String::with_capacity(2_048);
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:9\n");

    let target_duration_s = (config.segment_duration_ms + 999) / 1_000;
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration_s}\n"));

    let part_target_s = config.part_duration_ms as f64 / 1_000.0;
    out.push_str(&format!(
        "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.3}\n",
        part_target_s * 3.0
    ));
    out.push_str(&format!("#EXT-X-PART-INF:PART-TARGET={part_target_s:.3}\n"));

    let first_msn = state.segments.front().map_or(0, |s| s.msn);
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_msn}\n"));
    out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");

    let last_index = state.segments.len().saturating_sub(1);
    for (index, segment) in state.segments.iter().enumerate() {
        // Parts are listed for the last few segments only; older ones are
        // reachable as whole segments.
        let list_parts = index + 2 >= state.segments.len();
        if list_parts {
            for (part_index, part) in segment.parts.iter().enumerate() {
                out.push_str(&format!(
                    "#EXT-X-PART:DURATION={:.3},URI=\"part_{}_{}.m4s\"{}\n",
                    part.duration_ms as f64 / 1_000.0,
                    segment.msn,
                    part_index,
                    if part.independent { ",INDEPENDENT=YES" } else { "" },
                ));
            }
        }
        if segment.complete {
            out.push_str(&format!(
                "#EXTINF:{:.3},\nseg_{}.m4s\n",
                segment.duration_ms as f64 / 1_000.0,
                segment.msn
            ));
        } else if index == last_index {
            let next_part = segment.parts.len();
            out.push_str(&format!(
                "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part_{}_{}.m4s\"\n",
                segment.msn, next_part
            ));
        }
    }

    if state.ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llhls::session::{LlPart, LlSegment};
    use bytes::Bytes;

    fn state_with_parts() -> LlHlsPlaylistState {
        let mut state = LlHlsPlaylistState::default();
        state.segments.push_back(LlSegment {
            msn: 4,
            parts: vec![
                LlPart {
                    data: Bytes::new(),
                    duration_ms: 250,
                    independent: true,
                },
                LlPart {
                    data: Bytes::new(),
                    duration_ms: 250,
                    independent: false,
                },
            ],
            complete: true,
            duration_ms: 500,
        });
        state.segments.push_back(LlSegment {
            msn: 5,
            parts: vec![LlPart {
                data: Bytes::new(),
                duration_ms: 250,
                independent: true,
            }],
            complete: false,
            duration_ms: 250,
        });
        state
    }

    #[test]
    fn test_playlist_contains_required_tags() {
        let playlist = render(&state_with_parts(), &LlHlsConfig::default());
        assert!(playlist.contains("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-PART-INF:PART-TARGET=0.250"));
        assert!(playlist.contains("CAN-BLOCK-RELOAD=YES"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:4"));
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        assert!(playlist.contains("#EXT-X-PART:DURATION=0.250,URI=\"part_4_0.m4s\",INDEPENDENT=YES"));
        assert!(playlist.contains("#EXTINF:0.500,\nseg_4.m4s"));
        assert!(playlist.contains("#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part_5_1.m4s\""));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_ended_playlist_has_endlist() {
        let mut state = state_with_parts();
        state.ended = true;
        let playlist = render(&state, &LlHlsConfig::default());
        assert!(playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_empty_playlist_is_valid() {
        let playlist = render(&LlHlsPlaylistState::default(), &LlHlsConfig::default());
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:2"));
    }
}
