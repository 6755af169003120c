use {
    crate::{
        codec::h264,
        flv::{
            muxer::{tag_body, FlvMuxer, HEADER_LENGTH},
            tag_type,
        },
        hub::{
            self,
            define::{HubEventSender, SubscriberInfo, SubscriberKind},
            statistics::StatisticEvent,
            stream::StreamKey,
        },
        media::{BitstreamFormat, MediaKind, MediaPacket, Timebase},
    },
    axum::{
        body::Body,
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::get,
        Router,
    },
    bytes::BytesMut,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// Response channel depth: at typical tag sizes roughly four megabytes of
/// buffered FLV per slow client, then frames drop.
pub const FLV_RESPONSE_CHANNEL_CAPACITY: usize = 512;

#[derive(Clone)]
struct HttpFlvState {
    hub: HubEventSender,
    vhost: String,
}

/// HTTP-FLV delivery: `GET /<app>/<stream>.flv` remuxes the routed stream
/// into a chunked FLV body.
pub struct HttpFlvServer {
    address: String,
    state: HttpFlvState,
    cancel: CancellationToken,
}

impl HttpFlvServer {
    #[must_use]
    pub fn new(
        address: String,
        vhost: String,
        hub: HubEventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            state: HttpFlvState { hub, vhost },
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = Router::new()
            .route("/{app}/{stream_flv}", get(serve_flv))
            .with_state(self.state);
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        tracing::info!(address = %self.address, "http-flv server listening");
        let cancel = self.cancel;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn serve_flv(
    Path((app, stream_flv)): Path<(String, String)>,
    State(state): State<HttpFlvState>,
) -> Response {
    let Some(stream) = stream_flv.strip_suffix(".flv") else {
        return (StatusCode::NOT_FOUND, "expected <stream>.flv").into_response();
    };
    let key = StreamKey::new(state.vhost.clone(), app, stream);

    let (body_sender, body_receiver) =
        mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(FLV_RESPONSE_CHANNEL_CAPACITY);
    let session = HttpFlvSession::new(key, state.hub.clone(), body_sender);
    tokio::spawn(async move {
        if let Err(err) = session.run().await {
            tracing::info!(error = %err, "http-flv session ended");
        }
    });

    let stream_body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(body_receiver));
    (
        StatusCode::OK,
        [
            ("Content-Type", "video/x-flv"),
            ("Cache-Control", "no-cache"),
        ],
        stream_body,
    )
        .into_response()
}

/// One HTTP-FLV viewer: subscribes to the hub and feeds the response
/// channel. Drops frames (counted) instead of buffering when the client
/// cannot keep up.
pub struct HttpFlvSession {
    key: StreamKey,
    hub: HubEventSender,
    response: mpsc::Sender<Result<bytes::Bytes, std::io::Error>>,
    muxer: FlvMuxer,
    subscriber_id: Uuid,
    dropped: u64,
}

impl HttpFlvSession {
    #[must_use]
    pub fn new(
        key: StreamKey,
        hub: HubEventSender,
        response: mpsc::Sender<Result<bytes::Bytes, std::io::Error>>,
    ) -> Self {
        Self {
            key,
            hub,
            response,
            muxer: FlvMuxer::new(),
            subscriber_id: Uuid::new_v4(),
            dropped: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let info = SubscriberInfo {
            id: self.subscriber_id,
            kind: SubscriberKind::HttpFlv,
            remote_addr: String::new(),
            request_url: format!("/{}/{}.flv", self.key.app, self.key.name),
        };
        let mut ack = hub::api::subscribe(&self.hub, self.key.clone(), info.clone()).await?;
        let statistics = ack.statistics.clone();

        let video = ack.tracks.iter().find(|t| t.kind == MediaKind::Video);
        let audio = ack.tracks.iter().find(|t| t.kind == MediaKind::Audio);
        let video_id = video.map(|t| t.id);
        let audio_id = audio.map(|t| t.id);

        self.muxer.write_flv_header(audio.is_some(), video.is_some())?;
        self.muxer.write_previous_tag_size(0)?;

        // Sequence-header tags so players can configure decoders.
        if let Some(extradata) = video.and_then(|t| t.extradata.as_ref()) {
            let body = tag_body::avc_sequence_header(extradata);
            self.write_tag(tag_type::VIDEO, 0, body)?;
        }
        if let Some(extradata) = audio.and_then(|t| t.extradata.as_ref()) {
            let body = tag_body::aac_sequence_header(extradata);
            self.write_tag(tag_type::AUDIO, 0, body)?;
        }
        self.flush()?;

        while let Some(packet) = ack.receiver.recv().await {
            if packet.flags.end_of_stream {
                break;
            }
            let sent = if Some(packet.track_id) == video_id {
                self.write_video(&packet)?
            } else if Some(packet.track_id) == audio_id {
                self.write_audio(&packet)?
            } else {
                0
            };
            if sent > 0 {
                let _ = statistics.send(StatisticEvent::PacketOut {
                    key: self.key.clone(),
                    subscriber_id: self.subscriber_id,
                    bytes: sent,
                });
            }
            if self.response.is_closed() {
                break;
            }
        }

        hub::api::unsubscribe(&self.hub, self.key.clone(), info);
        Ok(())
    }

    fn write_video(&mut self, packet: &MediaPacket) -> anyhow::Result<usize> {
        let millis = packet.rescaled(Timebase::MILLIS);
        let avcc = match packet.bitstream {
            BitstreamFormat::Avcc => packet.payload.clone(),
            BitstreamFormat::AnnexB => h264::annexb_to_avcc(&packet.payload)?.freeze(),
            _ => return Ok(0),
        };
        let cts = (millis.pts - millis.dts).clamp(0, 0xFF_FFFF) as u32;
        let body = tag_body::avc_nalu(packet.flags.keyframe, cts, &avcc);
        self.write_tag(tag_type::VIDEO, millis.dts as u32, body)?;
        self.flush()
    }

    fn write_audio(&mut self, packet: &MediaPacket) -> anyhow::Result<usize> {
        let millis = packet.rescaled(Timebase::MILLIS);
        let body = tag_body::aac_raw(&packet.payload);
        self.write_tag(tag_type::AUDIO, millis.dts as u32, body)?;
        self.flush()
    }

    fn write_tag(&mut self, tag: u8, timestamp: u32, body: BytesMut) -> anyhow::Result<()> {
        let len = body.len() as u32;
        self.muxer.write_flv_tag_header(tag, len, timestamp)?;
        self.muxer.write_flv_tag_body(body)?;
        self.muxer.write_previous_tag_size(len + HEADER_LENGTH)?;
        Ok(())
    }

    /// Push muxed bytes to the client; a full channel drops the chunk.
    fn flush(&mut self) -> anyhow::Result<usize> {
        let data = self.muxer.extract_current_bytes();
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        match self.response.try_send(Ok(bytes::Bytes::from(data.to_vec()))) {
            Ok(()) => Ok(len),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped % 100 == 0 {
                    tracing::warn!(
                        stream = %self.key,
                        dropped = self.dropped,
                        "slow http-flv client, dropping chunks"
                    );
                }
                Ok(0)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                anyhow::bail!("http-flv client gone")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_construction() {
        let (hub, _rx) = mpsc::channel(8);
        let (response, _body) = mpsc::channel(FLV_RESPONSE_CHANNEL_CAPACITY);
        let session = HttpFlvSession::new(
            StreamKey::default_vhost("live", "s1"),
            hub,
            response,
        );
        assert_eq!(session.dropped, 0);
    }
}
