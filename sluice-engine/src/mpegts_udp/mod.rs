use {
    crate::{
        hub::{define::HubEventSender, define::ProviderKind, stream::StreamKey},
        mpegts::ingest::TsIngestAdapter,
    },
    std::net::Ipv4Addr,
    tokio::net::UdpSocket,
    tokio_util::sync::CancellationToken,
};

/// One configured MPEG-TS/UDP ingest port bound to a fixed stream name.
#[derive(Debug, Clone)]
pub struct MpegTsBinding {
    pub port: u16,
    pub app: String,
    pub stream: String,
    /// Optional multicast group to join.
    pub multicast_group: Option<Ipv4Addr>,
}

/// Raw MPEG-TS over UDP: no handshake, no stream id; the port *is* the
/// stream identity, as configured.
pub struct MpegTsUdpServer {
    bindings: Vec<MpegTsBinding>,
    vhost: String,
    hub: HubEventSender,
    cancel: CancellationToken,
}

impl MpegTsUdpServer {
    #[must_use]
    pub fn new(
        bindings: Vec<MpegTsBinding>,
        vhost: String,
        hub: HubEventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bindings,
            vhost,
            hub,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        for binding in self.bindings {
            let hub = self.hub.clone();
            let vhost = self.vhost.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = listen_one(binding.clone(), vhost, hub, cancel).await {
                    tracing::error!(port = binding.port, error = %err, "mpegts/udp listener failed");
                }
            });
        }
        Ok(())
    }
}

async fn listen_one(
    binding: MpegTsBinding,
    vhost: String,
    hub: HubEventSender,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let socket = UdpSocket::bind(("0.0.0.0", binding.port)).await?;
    if let Some(group) = binding.multicast_group {
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        tracing::info!(port = binding.port, %group, "joined multicast group");
    }
    tracing::info!(
        port = binding.port,
        stream = format!("{}/{}", binding.app, binding.stream),
        "mpegts/udp ingest listening"
    );

    let key = StreamKey::new(vhost, binding.app, binding.stream);
    let mut adapter: Option<TsIngestAdapter> = None;
    let mut buf = vec![0u8; 65_536];
    // A source that goes quiet for this long is treated as ended.
    let idle = std::time::Duration::from_secs(10);

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = tokio::time::sleep(idle), if adapter.is_some() => {
                tracing::info!(stream = %key, "mpegts/udp source idle, stopping stream");
                if let Some(mut done) = adapter.take() {
                    let _ = done.finish().await;
                }
                continue;
            }
            _ = cancel.cancelled() => {
                if let Some(mut done) = adapter.take() {
                    let _ = done.finish().await;
                }
                return Ok(());
            }
        };
        let (len, from) = received?;
        let feed = adapter.get_or_insert_with(|| {
            tracing::info!(stream = %key, source = %from, "mpegts/udp source appeared");
            TsIngestAdapter::new(
                key.clone(),
                ProviderKind::MpegtsUdp,
                from.to_string(),
                hub.clone(),
            )
        });
        if let Err(err) = feed.feed(&buf[..len]).await {
            tracing::warn!(stream = %key, error = %err, "ts demux error, resetting source");
            if let Some(mut done) = adapter.take() {
                let _ = done.finish().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_holds_identity() {
        let binding = MpegTsBinding {
            port: 4_000,
            app: "app".into(),
            stream: "cam1".into(),
            multicast_group: None,
        };
        let key = StreamKey::new("default", binding.app.clone(), binding.stream.clone());
        assert_eq!(key.to_string(), "default/app/cam1");
    }

    #[test]
    fn test_multicast_binding_parses() {
        let binding = MpegTsBinding {
            port: 4_001,
            app: "app".into(),
            stream: "mc".into(),
            multicast_group: Some("239.0.0.1".parse().unwrap()),
        };
        assert!(binding.multicast_group.unwrap().is_multicast());
    }
}
