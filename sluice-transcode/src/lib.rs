//! Transcoding for the sluice media origin: per-stream
//! decode → scale/resample → encode graphs producing additional
//! renditions, plus the thumbnail generator. Codec work runs on the
//! blocking pool, never on I/O tasks.

pub mod audio;
pub mod errors;
pub mod graph;
pub mod passthrough;
pub mod profile;
pub mod thumbnail;
pub mod video;

use {
    graph::TranscodeGraph,
    passthrough::PassthroughGraph,
    profile::OutputProfile,
    sluice_engine::hub::define::{BroadcastEvent, BroadcastEventReceiver, HubEventSender},
    std::collections::HashMap,
    tokio_util::sync::CancellationToken,
};

/// Watches the hub and launches one graph per (source stream, profile)
/// for applications that configure output profiles.
pub struct TranscodeService {
    hub: HubEventSender,
    events: BroadcastEventReceiver,
    /// Profiles per application name.
    profiles: HashMap<String, Vec<OutputProfile>>,
    cancel: CancellationToken,
}

impl TranscodeService {
    #[must_use]
    pub fn new(
        hub: HubEventSender,
        events: BroadcastEventReceiver,
        profiles: HashMap<String, Vec<OutputProfile>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            events,
            profiles,
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
                Ok(BroadcastEvent::StreamReady { key, .. }) => {
                    // Renditions must not be transcoded again.
                    if OutputProfile::is_rendition_name(&key.name) {
                        continue;
                    }
                    let Some(profiles) = self.profiles.get(&key.app) else {
                        continue;
                    };
                    for profile in profiles.clone() {
                        let hub = self.hub.clone();
                        let source = key.clone();
                        let cancel = self.cancel.clone();
                        tokio::spawn(async move {
                            let result = if profile.passthrough {
                                PassthroughGraph::new(hub, source.clone(), profile, cancel)
                                    .run()
                                    .await
                            } else {
                                TranscodeGraph::new(hub, source.clone(), profile, cancel)
                                    .run()
                                    .await
                            };
                            if let Err(err) = result {
                                tracing::warn!(
                                    source = %source,
                                    error = %err,
                                    "transcode graph failed"
                                );
                            }
                        });
                    }
                }
                Ok(BroadcastEvent::StreamStopped { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "transcode service lagged behind hub events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
