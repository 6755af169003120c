use {
    super::stream_id,
    crate::{
        access::{AccessDirection, AccessRequest, AdmissionPolicy},
        hub::{define::HubEventSender, define::ProviderKind, stream::StreamKey},
        mpegts::ingest::TsIngestAdapter,
    },
    futures::StreamExt,
    srt_tokio::{SrtListener, SrtSocket},
    std::sync::Arc,
    tokio_util::sync::CancellationToken,
};

/// SRT ingest listener: callers push MPEG-TS with stream id
/// `input/<app>/<stream>`.
pub struct SrtIngestServer {
    port: u16,
    vhost: String,
    hub: HubEventSender,
    access: Arc<dyn AdmissionPolicy>,
    cancel: CancellationToken,
}

impl SrtIngestServer {
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
        tracing::info!(port = self.port, "srt ingest listening (udp)");

        loop {
            let request = tokio::select! {
                request = incoming.incoming().next() => match request {
                    Some(request) => request,
                    None => return Ok(()),
                },
                _ = self.cancel.cancelled() => {
                    tracing::info!("srt ingest shutting down");
                    return Ok(());
                }
            };

            let remote = request.remote().to_string();
            let parsed = match stream_id::parse_ingest(request.stream_id().map(|v| v.as_str())) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    tracing::warn!(
                        %remote,
                        stream_id = ?request.stream_id(),
                        reject_code = reason.code(),
                        "srt caller rejected: {reason:?}"
                    );
                    // Dropping the request refuses the handshake.
                    continue;
                }
            };

            let key = StreamKey::new(self.vhost.clone(), parsed.app.clone(), parsed.stream.clone());
            let access_request = AccessRequest {
                direction: AccessDirection::Publish,
                protocol: "srt",
                url: format!(
                    "srt://0.0.0.0:{}?streamid=input/{}/{}",
                    self.port, parsed.app, parsed.stream
                ),
                stream: key.clone(),
                remote_addr: remote.clone(),
                user_agent: None,
            };
            if let Err(denied) = self.access.admit(&access_request).await {
                tracing::warn!(stream = %key, error = %denied, "srt publish denied");
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
                if let Err(err) = ingest_session(socket, key.clone(), remote, hub).await {
                    tracing::warn!(stream = %key, error = %err, "srt ingest session ended");
                }
            });
        }
    }
}

async fn ingest_session(
    mut socket: SrtSocket,
    key: StreamKey,
    remote: String,
    hub: HubEventSender,
) -> Result<(), std::io::Error> {
    let mut adapter = TsIngestAdapter::new(key.clone(), ProviderKind::SrtCaller, remote, hub);

    while let Some(item) = socket.next().await {
        match item {
            Ok((_instant, bytes)) => {
                if let Err(err) = adapter.feed(&bytes).await {
                    tracing::warn!(stream = %key, error = %err, "ts demux error, closing caller");
                    break;
                }
            }
            Err(err) => {
                tracing::info!(stream = %key, error = %err, "srt caller gone");
                break;
            }
        }
    }
    if let Err(err) = adapter.finish().await {
        tracing::debug!(stream = %key, error = %err, "flush after srt close");
    }
    tracing::info!(
        stream = %key,
        continuity_gaps = adapter.continuity_gaps(),
        "srt ingest finished"
    );
    Ok(())
}
