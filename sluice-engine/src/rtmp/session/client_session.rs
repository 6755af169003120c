use {
    super::{Connection, IDLE_READ_TIMEOUT},
    crate::{
        codec::h264,
        flv::muxer::tag_body,
        hub::{
            self,
            define::{HubEventSender, SubscriberInfo, SubscriberKind},
            stream::StreamKey,
        },
        media::{BitstreamFormat, MediaKind, Timebase},
        rtmp::{
            chunk::csid,
            errors::RtmpError,
            messages::{self, msg_type_id, RtmpMessage},
            netconnection::NetConnection,
            netstream::NetStream,
        },
    },
    rand::Rng,
    std::time::Duration,
    tokio::net::TcpStream,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Re-streams one local stream to an external RTMP ingest URL
/// (`rtmp://host[:port]/<app>/<stream>`), reconnecting with exponential
/// back-off and ±20% jitter for as long as the source stream lives.
pub struct RtmpPushSession {
    hub: HubEventSender,
    source: StreamKey,
    target_url: String,
    cancel: CancellationToken,
}

impl RtmpPushSession {
    #[must_use]
    pub fn new(
        hub: HubEventSender,
        source: StreamKey,
        target_url: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            source,
            target_url,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.push_once().await {
                Ok(()) => {
                    tracing::info!(source = %self.source, target = %self.target_url, "push finished");
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        source = %self.source,
                        target = %self.target_url,
                        error = %err,
                        "push attempt failed, reconnecting"
                    );
                }
            }
            let jitter = rand::thread_rng().gen_range(0.8..=1.2);
            let delay = backoff.mul_f64(jitter);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// One connect-and-stream attempt. Returning `Ok` means the source
    /// stream ended cleanly; any error triggers a reconnect.
    async fn push_once(&self) -> Result<(), RtmpError> {
        let (host, port, app, stream) = parse_rtmp_url(&self.target_url)?;

        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::RtmpPush,
            remote_addr: String::new(),
            request_url: self.target_url.clone(),
        };
        let mut ack = hub::api::subscribe(&self.hub, self.source.clone(), info.clone())
            .await
            .map_err(RtmpError::Hub)?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        let remote = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let mut connection = Connection::new(tcp, remote);
        connection.handshake_as_client().await?;
        connection.negotiate_chunk_size().await?;

        let tc_url = format!("rtmp://{host}:{port}/{app}");
        connection
            .send_message(
                csid::COMMAND,
                msg_type_id::COMMAND_AMF0,
                0,
                0,
                NetConnection::connect(1.0, &app, &tc_url)?,
            )
            .await?;
        self.await_result(&mut connection).await?;

        connection
            .send_message(
                csid::COMMAND,
                msg_type_id::COMMAND_AMF0,
                0,
                0,
                NetConnection::create_stream(2.0)?,
            )
            .await?;
        self.await_result(&mut connection).await?;

        connection
            .send_message(
                csid::COMMAND,
                msg_type_id::COMMAND_AMF0,
                0,
                1,
                NetStream::publish(&stream, "live")?,
            )
            .await?;

        // Sequence headers, then media until the source closes.
        let video_id = ack
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .map(|t| t.id);
        let audio_id = ack
            .tracks
            .iter()
            .find(|t| t.kind == MediaKind::Audio)
            .map(|t| t.id);
        for track in &ack.tracks {
            let Some(extradata) = &track.extradata else {
                continue;
            };
            let (chunk_id, type_id, tag) = match track.kind {
                MediaKind::Video => (
                    csid::VIDEO,
                    msg_type_id::VIDEO,
                    tag_body::avc_sequence_header(extradata),
                ),
                MediaKind::Audio => (
                    csid::AUDIO,
                    msg_type_id::AUDIO,
                    tag_body::aac_sequence_header(extradata),
                ),
                MediaKind::Data => continue,
            };
            connection.send_message(chunk_id, type_id, 0, 1, tag).await?;
        }

        let result = loop {
            let packet = tokio::select! {
                packet = ack.receiver.recv() => packet,
                _ = self.cancel.cancelled() => break Ok(()),
            };
            let Some(packet) = packet else {
                break Ok(());
            };
            if packet.flags.end_of_stream {
                continue;
            }
            if Some(packet.track_id) == video_id {
                let millis = packet.rescaled(Timebase::MILLIS);
                let cts = (millis.pts - millis.dts).clamp(0, 0xFF_FFFF) as u32;
                let avcc = match packet.bitstream {
                    BitstreamFormat::Avcc => packet.payload.clone(),
                    BitstreamFormat::AnnexB => h264::annexb_to_avcc(&packet.payload)?.freeze(),
                    _ => continue,
                };
                let tag = tag_body::avc_nalu(packet.flags.keyframe, cts, &avcc);
                connection
                    .send_message(csid::VIDEO, msg_type_id::VIDEO, millis.dts as u32, 1, tag)
                    .await?;
            } else if Some(packet.track_id) == audio_id {
                let millis = packet.rescaled(Timebase::MILLIS);
                let tag = tag_body::aac_raw(&packet.payload);
                connection
                    .send_message(csid::AUDIO, msg_type_id::AUDIO, millis.dts as u32, 1, tag)
                    .await?;
            }
        };
        hub::api::unsubscribe(&self.hub, self.source.clone(), info);
        result
    }

    /// Read until the peer answers `_result` (or `_error`).
    async fn await_result(&self, connection: &mut Connection) -> Result<(), RtmpError> {
        loop {
            for chunk in connection.read_messages(IDLE_READ_TIMEOUT).await? {
                match messages::parse(chunk)? {
                    RtmpMessage::SetChunkSize(size) => {
                        connection.unpacketizer.update_max_chunk_size(size as usize)?;
                    }
                    RtmpMessage::Amf0Command { name, .. } if name == "_result" => return Ok(()),
                    RtmpMessage::Amf0Command { name, .. } if name == "_error" => {
                        return Err(RtmpError::UnexpectedCommand("_error".into()));
                    }
                    _ => {}
                }
            }
        }
    }
}

/// `rtmp://host[:port]/app/stream[?query]` → (host, port, app, stream).
fn parse_rtmp_url(raw: &str) -> Result<(String, u16, String, String), RtmpError> {
    let url = url::Url::parse(raw)
        .map_err(|e| RtmpError::MalformedCommand(format!("push url: {e}")))?;
    if url.scheme() != "rtmp" {
        return Err(RtmpError::MalformedCommand(format!(
            "push url scheme must be rtmp, got {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| RtmpError::MalformedCommand("push url missing host".into()))?
        .to_string();
    let port = url.port().unwrap_or(1935);
    let mut segments = url
        .path_segments()
        .ok_or_else(|| RtmpError::MalformedCommand("push url missing path".into()))?;
    let app = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RtmpError::MalformedCommand("push url missing app".into()))?
        .to_string();
    let stream = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RtmpError::MalformedCommand("push url missing stream".into()))?
        .to_string();
    Ok((host, port, app, stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtmp_url() {
        let (host, port, app, stream) =
            parse_rtmp_url("rtmp://ingest.example.com/live/abc123").unwrap();
        assert_eq!(host, "ingest.example.com");
        assert_eq!(port, 1935);
        assert_eq!(app, "live");
        assert_eq!(stream, "abc123");

        let (_, port, ..) = parse_rtmp_url("rtmp://h:19350/a/s").unwrap();
        assert_eq!(port, 19_350);
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(parse_rtmp_url("http://h/a/s").is_err());
        assert!(parse_rtmp_url("rtmp://h/only-app").is_err());
    }
}
