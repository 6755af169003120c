use {
    super::frame::{OvtFrame, OvtTrack},
    crate::hub::{
        self,
        define::{HubEventSender, SubscriberInfo, SubscriberKind},
        stream::StreamKey,
    },
    futures::{SinkExt, StreamExt},
    tokio::net::{TcpListener, TcpStream},
    tokio_util::codec::Framed,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// Origin side of the origin-to-edge link: serves already-encoded packets
/// to downstream edges over a framed TCP protocol, DTS and flags
/// preserved end-to-end.
pub struct OvtServer {
    address: String,
    vhost: String,
    hub: HubEventSender,
    cancel: CancellationToken,
}

impl OvtServer {
    #[must_use]
    pub fn new(
        address: String,
        vhost: String,
        hub: HubEventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            vhost,
            hub,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.address).await?;
        tracing::info!(address = %self.address, "ovt server listening");

        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.cancel.cancelled() => {
                    tracing::info!("ovt server shutting down");
                    return Ok(());
                }
            };
            let hub = self.hub.clone();
            let vhost = self.vhost.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_edge(stream, remote.to_string(), vhost, hub, cancel).await {
                    tracing::info!(%remote, error = %err, "ovt edge session ended");
                }
            });
        }
    }
}

async fn serve_edge(
    stream: TcpStream,
    remote: String,
    vhost: String,
    hub: HubEventSender,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let mut framed = Framed::new(stream, super::codec());

    // First frame must be the request.
    let request = match framed.next().await {
        Some(Ok(bytes)) => match OvtFrame::parse(bytes.into()) {
            Ok(OvtFrame::Request(request)) => request,
            Ok(_) | Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "edge did not open with a request frame",
                ))
            }
        },
        _ => return Ok(()),
    };
    let key = StreamKey::new(vhost, request.app, request.stream);

    let info = SubscriberInfo {
        id: Uuid::new_v4(),
        kind: SubscriberKind::Ovt,
        remote_addr: remote,
        request_url: format!("ovt:{}/{}", key.app, key.name),
    };
    let mut ack = hub::api::subscribe(&hub, key.clone(), info.clone())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let describe = OvtFrame::Describe(ack.tracks.iter().map(OvtTrack::from_media).collect())
        .marshal()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    framed.send(describe.freeze()).await?;

    let result = loop {
        tokio::select! {
            packet = ack.receiver.recv() => {
                let Some(packet) = packet else {
                    let end = OvtFrame::End
                        .marshal()
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    let _ = framed.send(end.freeze()).await;
                    break Ok(());
                };
                let frame = OvtFrame::Packet(packet)
                    .marshal()
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                framed.send(frame.freeze()).await?;
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(bytes)) => {
                        if let Ok(OvtFrame::KeyframeRequest) = OvtFrame::parse(bytes.into()) {
                            hub::api::request_keyframe(&hub, key.clone());
                        }
                    }
                    _ => break Ok(()),
                }
            }
            _ = cancel.cancelled() => break Ok(()),
        }
    };

    hub::api::unsubscribe(&hub, key, info);
    result
}
