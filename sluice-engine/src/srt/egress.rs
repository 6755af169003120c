use {
    super::stream_id,
    crate::{
        access::{AccessDirection, AccessRequest, AdmissionPolicy},
        hub::{
            self,
            define::{HubEventSender, SubscriberInfo, SubscriberKind},
            stream::StreamKey,
        },
        mpegts::egress::TsEgressMuxer,
    },
    futures::{SinkExt, StreamExt},
    srt_tokio::{SrtListener, SrtSocket},
    std::sync::Arc,
    std::time::Instant,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// SRT egress listener: subscribers connect with stream id
/// `<app>/<stream>` and receive a freshly muxed transport stream with
/// gap-free continuity counters.
pub struct SrtEgressServer {
    port: u16,
    vhost: String,
    hub: HubEventSender,
    access: Arc<dyn AdmissionPolicy>,
    cancel: CancellationToken,
}

impl SrtEgressServer {
    #[must_use]
    pub fn new(
        port: u16,
        vhost: String,
        hub: HubEventSender,
        access: Arc<dyn AdmissionPolicy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            vhost,
            hub,
            access,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let (_listener, mut incoming) = SrtListener::builder().bind(self.port).await?;
        tracing::info!(port = self.port, "srt egress listening (udp)");

        loop {
            let request = tokio::select! {
                request = incoming.incoming().next() => match request {
                    Some(request) => request,
                    None => return Ok(()),
                },
                _ = self.cancel.cancelled() => {
                    tracing::info!("srt egress shutting down");
                    return Ok(());
                }
            };

            let remote = request.remote().to_string();
            let parsed = match stream_id::parse_egress(request.stream_id().map(|v| v.as_str())) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    tracing::warn!(
                        %remote,
                        reject_code = reason.code(),
                        "srt subscriber rejected: {reason:?}"
                    );
                    continue;
                }
            };
            let key = StreamKey::new(self.vhost.clone(), parsed.app, parsed.stream);

            let access_request = AccessRequest {
                direction: AccessDirection::Play,
                protocol: "srt",
                url: format!(
                    "srt://0.0.0.0:{}?streamid={}/{}",
                    self.port, key.app, key.name
                ),
                stream: key.clone(),
                remote_addr: remote.clone(),
                user_agent: None,
            };
            if let Err(denied) = self.access.admit(&access_request).await {
                tracing::warn!(stream = %key, error = %denied, "srt play denied");
                continue;
            }

            let socket = match request.accept(None).await {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::warn!(%remote, error = %err, "srt accept failed");
                    continue;
                }
            };

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(err) = egress_session(socket, key.clone(), remote, hub).await {
                    tracing::info!(stream = %key, error = %err, "srt egress session ended");
                }
            });
        }
    }
}

async fn egress_session(
    mut socket: SrtSocket,
    key: StreamKey,
    remote: String,
    hub: HubEventSender,
) -> Result<(), std::io::Error> {
    let info = SubscriberInfo {
        id: Uuid::new_v4(),
        kind: SubscriberKind::SrtListener,
        remote_addr: remote,
        request_url: format!("srt:{}/{}", key.app, key.name),
    };
    let mut ack = hub::api::subscribe(&hub, key.clone(), info.clone())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let mut muxer = TsEgressMuxer::new(&ack.tracks)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let result: Result<(), std::io::Error> = async {
        while let Some(packet) = ack.receiver.recv().await {
            if packet.flags.end_of_stream {
                continue;
            }
            let ts = muxer
                .write(&packet)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            if ts.is_empty() {
                continue;
            }
            // SRT payloads are limited to ~1316 bytes: seven 188-byte TS
            // packets per datagram.
            for datagram in ts.chunks(7 * crate::mpegts::define::TS_PACKET_SIZE) {
                socket
                    .send((Instant::now(), bytes::Bytes::copy_from_slice(datagram)))
                    .await?;
            }
        }
        Ok(())
    }
    .await;

    hub::api::unsubscribe(&hub, key, info);
    let _ = socket.close().await;
    result
}
