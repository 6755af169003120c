use {
    crate::{admin::AdminServer, config::{PullConfig, ServerConfig}},
    sluice_engine::{
        access::{
            AccessController, AdmissionPolicy, AdmissionWebhook, SignedPolicyValidator,
        },
        httpflv::HttpFlvServer,
        hub::{HubConfig, StreamHub},
        llhls::{
            server::LlHlsServer,
            session::{LlHlsConfig, LlHlsRegistry, LlHlsService},
        },
        mpegts_udp::MpegTsUdpServer,
        ovt::{pull::OvtPullSession, server::OvtServer},
        record::{FileStorage, SegmentStorage},
        rtmp::{server::RtmpServer, session::client_session::RtmpPushSession},
        rtsp::client::{RtspPullConfig, RtspPullSession, RtspTransport, DEFAULT_REORDER_WINDOW},
        srt::{egress::SrtEgressServer, ingest::SrtIngestServer},
        hub::stream::StreamKey,
    },
    sluice_transcode::{
        thumbnail::{ThumbnailRegistry, ThumbnailServer, ThumbnailService},
        TranscodeService,
    },
    sluice_webrtc::{config::WebRtcConfig, WebRtcServer},
    std::sync::Arc,
    tokio_util::sync::CancellationToken,
};

/// The whole origin as one value: configuration snapshot, the hub, and
/// the cancellation token every listener and session hangs off.
pub struct Server {
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
}

impl Server {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind every configured listener and run until cancelled. A port
    /// that fails to bind disables that listener, not the process.
    pub async fn run(self) -> anyhow::Result<()> {
        let vhost = self.config.primary_vhost();
        let mut hub = StreamHub::new(HubConfig::default());
        let hub_sender = hub.event_sender();
        let statistics = hub.statistics_registry();
        let broadcast_for_llhls = hub.subscribe_broadcast();
        let broadcast_for_transcode = hub.subscribe_broadcast();
        let broadcast_for_thumbnail = hub.subscribe_broadcast();
        tokio::spawn(async move { hub.run().await });

        let access = self.build_access_controller();

        // ---- providers ----
        if let Some(address) = &self.config.server.bind.providers.rtmp {
            let server = RtmpServer::new(
                address.clone(),
                vhost.clone(),
                hub_sender.clone(),
                access.clone(),
                self.cancel.clone(),
            );
            spawn_listener("rtmp", async move { server.run().await });
        }
        if let Some(port) = self.config.server.bind.providers.srt {
            let server = SrtIngestServer::new(
                port,
                vhost.clone(),
                hub_sender.clone(),
                access.clone(),
                self.cancel.clone(),
            );
            spawn_listener("srt-ingest", async move { server.run().await });
        }
        if !self.config.server.bind.providers.mpegts.is_empty() {
            let bindings = self
                .config
                .server
                .bind
                .providers
                .mpegts
                .iter()
                .map(|b| b.to_binding())
                .collect();
            let server = MpegTsUdpServer::new(
                bindings,
                vhost.clone(),
                hub_sender.clone(),
                self.cancel.clone(),
            );
            spawn_listener("mpegts-udp", async move { server.run().await });
        }
        if let Some(webrtc_bind) = &self.config.server.bind.providers.webrtc {
            let mut webrtc_config = WebRtcConfig {
                signalling_address: webrtc_bind.signalling.clone(),
                ..WebRtcConfig::default()
            };
            if !webrtc_bind.ice_servers.is_empty() {
                webrtc_config.ice_servers = webrtc_bind.ice_servers.clone();
            }
            let server = WebRtcServer::new(
                webrtc_config,
                vhost.clone(),
                hub_sender.clone(),
                access.clone(),
                self.cancel.clone(),
            );
            spawn_listener("webrtc", async move { server.run().await });
        }

        // ---- pulls (edge mode, cameras) ----
        for pull in &self.config.pulls {
            match pull.clone() {
                PullConfig::Ovt {
                    origin,
                    upstream_app,
                    upstream_stream,
                    app,
                    stream,
                } => {
                    let session = OvtPullSession::new(
                        origin,
                        upstream_app,
                        upstream_stream,
                        StreamKey::new(vhost.clone(), app, stream),
                        hub_sender.clone(),
                        self.cancel.clone(),
                    );
                    tokio::spawn(session.run());
                }
                PullConfig::Rtsp {
                    url,
                    app,
                    stream,
                    username,
                    password,
                    transport,
                } => {
                    let pull_config = RtspPullConfig {
                        url,
                        key: StreamKey::new(vhost.clone(), app, stream),
                        credentials: username.zip(password),
                        transport: if transport.eq_ignore_ascii_case("udp") {
                            RtspTransport::Udp
                        } else {
                            RtspTransport::Tcp
                        },
                        reorder_window: DEFAULT_REORDER_WINDOW,
                    };
                    let session =
                        RtspPullSession::new(pull_config, hub_sender.clone(), self.cancel.clone());
                    tokio::spawn(session.run());
                }
            }
        }

        // ---- publishers ----
        if let Some(address) = &self.config.server.bind.publishers.llhls {
            let registry: LlHlsRegistry = Arc::new(dashmap::DashMap::new());
            let llhls_config = self.llhls_config();
            let storage = self.recording_storage();
            let service = LlHlsService::new(
                hub_sender.clone(),
                broadcast_for_llhls,
                registry.clone(),
                llhls_config,
                storage,
                self.cancel.clone(),
            );
            tokio::spawn(service.run());
            let server =
                LlHlsServer::new(address.clone(), vhost.clone(), registry, self.cancel.clone());
            spawn_listener("llhls", async move { server.run().await });
        }
        if let Some(port) = self.config.server.bind.publishers.srt {
            let server = SrtEgressServer::new(
                port,
                vhost.clone(),
                hub_sender.clone(),
                access.clone(),
                self.cancel.clone(),
            );
            spawn_listener("srt-egress", async move { server.run().await });
        }
        if let Some(address) = &self.config.server.bind.publishers.httpflv {
            let server = HttpFlvServer::new(
                address.clone(),
                vhost.clone(),
                hub_sender.clone(),
                self.cancel.clone(),
            );
            spawn_listener("http-flv", async move { server.run().await });
        }
        if let Some(address) = &self.config.server.bind.publishers.ovt {
            let server = OvtServer::new(
                address.clone(),
                vhost.clone(),
                hub_sender.clone(),
                self.cancel.clone(),
            );
            spawn_listener("ovt", async move { server.run().await });
        }
        if let Some(address) = &self.config.server.bind.publishers.thumbnail {
            let registry: ThumbnailRegistry = Arc::new(dashmap::DashMap::new());
            let service = ThumbnailService::new(
                hub_sender.clone(),
                broadcast_for_thumbnail,
                registry.clone(),
                self.cancel.clone(),
            );
            tokio::spawn(service.run());
            let server = ThumbnailServer::new(address.clone(), registry, self.cancel.clone());
            spawn_listener("thumbnail", async move { server.run().await });
        }

        // ---- rtmp push re-streams ----
        for vhost_config in &self.config.vhosts {
            for app in &vhost_config.applications {
                for (stream_name, target) in &app.push_targets {
                    let session = RtmpPushSession::new(
                        hub_sender.clone(),
                        StreamKey::new(vhost.clone(), app.name.clone(), stream_name.clone()),
                        target.clone(),
                        self.cancel.clone(),
                    );
                    tokio::spawn(session.run());
                }
            }
        }

        // ---- transcoder ----
        let profiles = self.config.transcode_profiles();
        if !profiles.is_empty() {
            let service = TranscodeService::new(
                hub_sender.clone(),
                broadcast_for_transcode,
                profiles,
                self.cancel.clone(),
            );
            tokio::spawn(service.run());
        }

        // ---- admin ----
        if let Some(token) = &self.config.admin.token {
            let server = AdminServer::new(
                self.config.clone(),
                hub_sender.clone(),
                statistics,
                token.clone(),
                self.cancel.clone(),
            );
            spawn_listener("admin", async move { server.run().await });
        } else {
            tracing::info!("admin api disabled (no token configured)");
        }

        tracing::info!(server = %self.config.server.name, "sluice origin running");
        self.cancel.cancelled().await;
        tracing::info!("shutdown requested, draining sessions");
        Ok(())
    }

    fn build_access_controller(&self) -> Arc<dyn AdmissionPolicy> {
        // Access control comes from the first application that defines
        // one; per-application scoping would need per-key dispatch, which
        // admission requests already carry.
        for vhost in &self.config.vhosts {
            for app in &vhost.applications {
                if let Some(access) = &app.access_control {
                    let signed = access
                        .signed_policy_secret
                        .as_ref()
                        .map(|secret| SignedPolicyValidator::new(secret.clone()));
                    let webhook = access
                        .admission_webhook
                        .as_ref()
                        .map(|endpoint| AdmissionWebhook::new(endpoint.clone()));
                    if signed.is_some() || webhook.is_some() {
                        return AccessController::new(signed, webhook);
                    }
                }
            }
        }
        AccessController::allow_all()
    }

    fn llhls_config(&self) -> LlHlsConfig {
        for vhost in &self.config.vhosts {
            for app in &vhost.applications {
                if let Some(llhls) = &app.llhls {
                    return LlHlsConfig {
                        segment_duration_ms: llhls.segment_duration_ms,
                        part_duration_ms: llhls.part_duration_ms,
                        dvr_window_segments: llhls.dvr_window_segments,
                    };
                }
            }
        }
        LlHlsConfig::default()
    }

    fn recording_storage(&self) -> Option<Arc<dyn SegmentStorage>> {
        for vhost in &self.config.vhosts {
            for app in &vhost.applications {
                if let Some(recording) = &app.recording {
                    return Some(Arc::new(FileStorage::new(recording.path.clone())));
                }
            }
        }
        None
    }
}

fn spawn_listener<F>(name: &'static str, future: F)
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            // A failed bind disables one listener, never the process.
            tracing::error!(listener = name, error = %err, "listener failed");
        }
    });
}
