use {
    crate::{errors::TranscodeError, profile::OutputProfile},
    sluice_engine::{
        hub::{
            self,
            define::{
                HubEventSender, ProviderInfo, ProviderKind, SubscriberInfo, SubscriberKind,
            },
            stream::StreamKey,
        },
    },
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// The degenerate graph: no decode, no encode; the source's packets are
/// republished under the rendition name. Useful for exposing the source
/// rendition inside an ABR ladder.
pub struct PassthroughGraph {
    hub: HubEventSender,
    source: StreamKey,
    profile: OutputProfile,
    cancel: CancellationToken,
}

impl PassthroughGraph {
    #[must_use]
    pub fn new(
        hub: HubEventSender,
        source: StreamKey,
        profile: OutputProfile,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            source,
            profile,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), TranscodeError> {
        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            kind: SubscriberKind::Transcoder,
            remote_addr: String::new(),
            request_url: format!("passthrough:{}", self.profile.name),
        };
        let mut ack = hub::api::subscribe(&self.hub, self.source.clone(), info.clone()).await?;

        let rendition = StreamKey::new(
            self.source.vhost.clone(),
            self.source.app.clone(),
            self.profile.rendition_name(&self.source.name),
        );
        let provider = ProviderInfo {
            id: Uuid::new_v4(),
            kind: ProviderKind::Transcoder,
            remote_addr: String::new(),
        };
        let mut out =
            hub::api::publish(&self.hub, rendition.clone(), provider, ack.tracks.clone()).await?;

        // Keyframe requests against the rendition forward to the source.
        {
            let hub = self.hub.clone();
            let source = self.source.clone();
            let mut requests = std::mem::replace(
                &mut out.keyframe_requests,
                tokio::sync::mpsc::channel(1).1,
            );
            tokio::spawn(async move {
                while requests.recv().await.is_some() {
                    hub::api::request_keyframe(&hub, source.clone());
                }
            });
        }

        loop {
            let packet = tokio::select! {
                packet = ack.receiver.recv() => packet,
                _ = self.cancel.cancelled() => break,
            };
            let Some(packet) = packet else { break };
            if packet.flags.end_of_stream {
                continue;
            }
            if out.packet_sender.send(packet).await.is_err() {
                break;
            }
        }

        hub::api::unpublish(&self.hub, out.handle);
        hub::api::unsubscribe(&self.hub, self.source.clone(), info);
        tracing::info!(rendition = %rendition, "passthrough graph finished");
        Ok(())
    }
}
