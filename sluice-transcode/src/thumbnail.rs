use {
    crate::{errors::TranscodeError, video::VideoDecoder},
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::get,
        Router,
    },
    bytes::Bytes,
    dashmap::DashMap,
    sluice_engine::{
        codec::h264,
        hub::{
            self,
            define::{
                BroadcastEvent, BroadcastEventReceiver, HubEventSender, SubscriberInfo,
                SubscriberKind,
            },
            stream::StreamKey,
        },
        media::{BitstreamFormat, CodecId, MediaKind, VideoFrame},
    },
    std::io::Cursor,
    std::sync::Arc,
    std::time::Duration,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// Latest JPEG per stream, keyed `app/name`.
pub type ThumbnailRegistry = Arc<DashMap<String, Bytes>>;

/// How often a fresh thumbnail is produced.
const THUMBNAIL_INTERVAL: Duration = Duration::from_secs(2);

/// Renders a periodic JPEG from the latest keyframe of each live stream
/// and serves it at `GET /<app>/<stream>/thumb.jpg`.
pub struct ThumbnailService {
    hub: HubEventSender,
    events: BroadcastEventReceiver,
    registry: ThumbnailRegistry,
    cancel: CancellationToken,
}

impl ThumbnailService {
    #[must_use]
    pub fn new(
        hub: HubEventSender,
        events: BroadcastEventReceiver,
        registry: ThumbnailRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            events,
            registry,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = self.cancel.cancelled() => return,
            };
            match event {
                Ok(BroadcastEvent::StreamReady { key, tracks }) => {
                    let has_h264 = tracks
                        .iter()
                        .any(|t| t.kind == MediaKind::Video && t.codec == CodecId::H264);
                    if !has_h264 {
                        continue;
                    }
                    let session = ThumbnailSession {
                        hub: self.hub.clone(),
                        key,
                        registry: self.registry.clone(),
                        cancel: self.cancel.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(err) = session.run().await {
                            tracing::debug!(error = %err, "thumbnail session ended");
                        }
                    });
                }
                Ok(BroadcastEvent::StreamStopped { key }) => {
                    self.registry.remove(&format!("{}/{}", key.app, key.name));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "thumbnail service lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

struct ThumbnailSession {
    hub: HubEventSender,
    key: StreamKey,
    registry: ThumbnailRegistry,
    cancel: CancellationToken,
}

impl ThumbnailSession {
    async fn run(self) -> Result<(), TranscodeError> {
        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::Thumbnail,
            remote_addr: String::new(),
            request_url: format!("/{}/{}/thumb.jpg", self.key.app, self.key.name),
        };
        let mut ack = hub::api::subscribe(&self.hub, self.key.clone(), info.clone()).await?;
        let video_id = ack
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video && t.codec == CodecId::H264)
            .map(|t| t.id);
        let length_size = ack
            .tracks
            .iter()
            .find(|t| Some(t.id) == video_id)
            .and_then(|t| t.extradata.as_deref())
            .and_then(|e| h264::AvcDecoderConfigurationRecord::parse(e).ok())
            .map_or(4, |r| r.nalu_length_size);

        let registry_id = format!("{}/{}", self.key.app, self.key.name);
        let mut latest_keyframe: Option<Bytes> = None;
        let mut ticker = tokio::time::interval(THUMBNAIL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                packet = ack.receiver.recv() => {
                    let Some(packet) = packet else { break };
                    if Some(packet.track_id) != video_id || !packet.flags.keyframe {
                        continue;
                    }
                    let annexb = match packet.bitstream {
                        BitstreamFormat::AnnexB => packet.payload.clone(),
                        BitstreamFormat::Avcc => {
                            match h264::avcc_to_annexb(&packet.payload, length_size) {
                                Ok(converted) => converted.freeze(),
                                Err(_) => continue,
                            }
                        }
                        _ => continue,
                    };
                    // Parameter sets must precede the IDR for a cold decoder.
                    let with_params = self.prepend_parameter_sets(&ack.tracks, annexb);
                    latest_keyframe = Some(with_params);
                }
                _ = ticker.tick() => {
                    let Some(keyframe) = latest_keyframe.take() else { continue };
                    let registry = self.registry.clone();
                    let registry_id = registry_id.clone();
                    let encoded = tokio::task::spawn_blocking(move || {
                        encode_jpeg(&keyframe)
                    })
                    .await;
                    match encoded {
                        Ok(Ok(jpeg)) => {
                            registry.insert(registry_id, jpeg);
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(error = %err, "thumbnail encode failed");
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "thumbnail task failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        hub::api::unsubscribe(&self.hub, self.key.clone(), info);
        Ok(())
    }

    fn prepend_parameter_sets(
        &self,
        tracks: &[sluice_engine::media::MediaTrack],
        annexb: Bytes,
    ) -> Bytes {
        let prefix = tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .and_then(|t| t.extradata.as_deref())
            .and_then(|e| h264::AvcDecoderConfigurationRecord::parse(e).ok())
            .map(|r| r.annexb_parameter_sets());
        match prefix {
            Some(prefix) => {
                let mut out = bytes::BytesMut::with_capacity(prefix.len() + annexb.len());
                out.extend_from_slice(&prefix);
                out.extend_from_slice(&annexb);
                out.freeze()
            }
            None => annexb,
        }
    }
}

/// Decode one keyframe and encode it as JPEG.
fn encode_jpeg(annexb: &[u8]) -> Result<Bytes, TranscodeError> {
    let mut decoder = VideoDecoder::new()?;
    let frame = decoder
        .decode(annexb, 0)?
        .ok_or_else(|| TranscodeError::Decoder("keyframe produced no picture".into()))?;
    let rgb = yuv420_to_rgb(&frame);

    let mut jpeg = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), 80);
    image::ImageEncoder::write_image(
        encoder,
        &rgb,
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )
    .map_err(|e| TranscodeError::Encoder(e.to_string()))?;
    Ok(Bytes::from(jpeg))
}

fn yuv420_to_rgb(frame: &VideoFrame) -> Vec<u8> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let (luma, chroma) = VideoFrame::plane_sizes(frame.width, frame.height);
    let y_plane = &frame.data[..luma];
    let u_plane = &frame.data[luma..luma + chroma];
    let v_plane = &frame.data[luma + chroma..];
    let chroma_w = width.div_ceil(2);

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let y = f32::from(y_plane[row * width + col]);
            let u = f32::from(u_plane[(row / 2) * chroma_w + col / 2]) - 128.0;
            let v = f32::from(v_plane[(row / 2) * chroma_w + col / 2]) - 128.0;
            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            rgb.push(r);
            rgb.push(g);
            rgb.push(b);
        }
    }
    rgb
}

/// HTTP delivery of the thumbnail registry.
pub struct ThumbnailServer {
    address: String,
    registry: ThumbnailRegistry,
    cancel: CancellationToken,
}

impl ThumbnailServer {
    #[must_use]
    pub fn new(address: String, registry: ThumbnailRegistry, cancel: CancellationToken) -> Self {
        Self {
            address,
            registry,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = Router::new()
            .route("/{app}/{stream}/thumb.jpg", get(serve_thumbnail))
            .with_state(self.registry);
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        tracing::info!(address = %self.address, "thumbnail server listening");
        let cancel = self.cancel;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn serve_thumbnail(
    Path((app, stream)): Path<(String, String)>,
    State(registry): State<ThumbnailRegistry>,
) -> Response {
    match registry.get(&format!("{app}/{stream}")) {
        Some(jpeg) => (
            StatusCode::OK,
            [("Content-Type", "image/jpeg"), ("Cache-Control", "no-cache")],
            jpeg.clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "no thumbnail yet").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv_to_rgb_grey() {
        let (luma, chroma) = VideoFrame::plane_sizes(4, 4);
        let mut data = vec![128u8; luma];
        data.extend(vec![128u8; chroma * 2]);
        let frame = VideoFrame {
            pts_us: 0,
            width: 4,
            height: 4,
            data,
            keyframe: true,
        };
        let rgb = yuv420_to_rgb(&frame);
        assert_eq!(rgb.len(), 4 * 4 * 3);
        // Neutral chroma: R == G == B == Y.
        assert!(rgb.chunks(3).all(|px| px[0] == 128 && px[1] == 128 && px[2] == 128));
    }
}
