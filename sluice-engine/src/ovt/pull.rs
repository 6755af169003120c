use {
    super::frame::{OvtFrame, OvtRequest},
    crate::hub::{
        self,
        define::{HubEventSender, ProviderInfo, ProviderKind},
        stream::StreamKey,
    },
    futures::{SinkExt, StreamExt},
    rand::Rng,
    std::time::Duration,
    tokio::net::TcpStream,
    tokio_util::codec::Framed,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Edge side of the origin-to-edge link: pulls one stream from an
/// upstream origin and republishes it locally, reconnecting with
/// exponential back-off. Plain pull with reconnect, nothing more.
pub struct OvtPullSession {
    origin_address: String,
    upstream_app: String,
    upstream_stream: String,
    local_key: StreamKey,
    hub: HubEventSender,
    cancel: CancellationToken,
}

impl OvtPullSession {
    #[must_use]
    pub fn new(
        origin_address: String,
        upstream_app: String,
        upstream_stream: String,
        local_key: StreamKey,
        hub: HubEventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            origin_address,
            upstream_app,
            upstream_stream,
            local_key,
            hub,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.pull_once().await {
                Ok(()) => backoff = BACKOFF_BASE,
                Err(err) => {
                    tracing::warn!(
                        origin = %self.origin_address,
                        stream = %self.local_key,
                        error = %err,
                        "ovt pull failed, reconnecting"
                    );
                }
            }
            let jitter = rand::thread_rng().gen_range(0.8..=1.2);
            tokio::select! {
                _ = tokio::time::sleep(backoff.mul_f64(jitter)) => {}
                _ = self.cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn pull_once(&self) -> Result<(), std::io::Error> {
        let stream = TcpStream::connect(&self.origin_address).await?;
        let mut framed = Framed::new(stream, super::codec());

        let request = OvtFrame::Request(OvtRequest {
            app: self.upstream_app.clone(),
            stream: self.upstream_stream.clone(),
        })
        .marshal()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
        framed.send(request.freeze()).await?;

        // The origin answers with the track set before any media.
        let tracks = match framed.next().await {
            Some(Ok(bytes)) => match OvtFrame::parse(bytes.into()) {
                Ok(OvtFrame::Describe(tracks)) => tracks
                    .iter()
                    .filter_map(|t| t.to_media().ok())
                    .collect::<Vec<_>>(),
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "origin did not describe the stream",
                    ))
                }
            },
            _ => return Err(std::io::Error::other("origin closed during describe")),
        };

        let info = ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::OvtPull,
            remote_addr: self.origin_address.clone(),
        };
        let mut ack = hub::api::publish(&self.hub, self.local_key.clone(), info, tracks)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let handle = ack.handle.clone();

        let result = loop {
            tokio::select! {
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(bytes)) => match OvtFrame::parse(bytes.into()) {
                            Ok(OvtFrame::Packet(packet)) => {
                                if ack.packet_sender.send(packet).await.is_err() {
                                    break Ok(());
                                }
                            }
                            Ok(OvtFrame::End) => break Ok(()),
                            Ok(_) => {}
                            Err(err) => {
                                break Err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    err.to_string(),
                                ))
                            }
                        },
                        Some(Err(err)) => break Err(err),
                        None => break Err(std::io::Error::other("origin gone")),
                    }
                }
                // Downstream PLI/FIR propagates across the edge link.
                request = ack.keyframe_requests.recv() => {
                    if request.is_some() {
                        let frame = OvtFrame::KeyframeRequest
                            .marshal()
                            .map_err(|e| std::io::Error::other(e.to_string()))?;
                        framed.send(frame.freeze()).await?;
                    }
                }
                _ = self.cancel.cancelled() => break Ok(()),
            }
        };

        hub::api::unpublish(&self.hub, handle);
        result
    }
}
