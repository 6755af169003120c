use {
    super::{
        playlist,
        session::{registry_key, LlHlsRegistry, LlHlsStreamState},
    },
    crate::hub::stream::StreamKey,
    axum::{
        extract::{Path, Query, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::get,
        Router,
    },
    serde::Deserialize,
    std::sync::Arc,
    std::time::Duration,
    tokio_util::sync::CancellationToken,
};

/// Hard ceiling on one blocking playlist reload.
const BLOCKING_RELOAD_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct LlHlsServerState {
    pub registry: LlHlsRegistry,
    pub vhost: String,
}

/// LL-HLS delivery: playlist (with `_HLS_msn`/`_HLS_part` blocking
/// reload), init segment, whole segments and parts, all out of the
/// in-memory ring.
pub struct LlHlsServer {
    address: String,
    state: LlHlsServerState,
    cancel: CancellationToken,
}

impl LlHlsServer {
    #[must_use]
    pub fn new(
        address: String,
        vhost: String,
        registry: LlHlsRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            state: LlHlsServerState { registry, vhost },
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = Router::new()
            .route("/{app}/{stream}/llhls.m3u8", get(serve_playlist))
            .route("/{app}/{stream}/init.mp4", get(serve_init))
            .route("/{app}/{stream}/{resource}", get(serve_media))
            .with_state(self.state);

        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        tracing::info!(address = %self.address, "llhls server listening");
        let cancel = self.cancel;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        tracing::info!("llhls server stopped");
        Ok(())
    }
}

fn lookup(
    state: &LlHlsServerState,
    app: &str,
    stream: &str,
) -> Option<Arc<LlHlsStreamState>> {
    let key = StreamKey::new(state.vhost.clone(), app, stream);
    state.registry.get(&registry_key(&key)).map(|s| s.clone())
}

#[derive(Deserialize)]
struct PlaylistQuery {
    #[serde(rename = "_HLS_msn")]
    msn: Option<u64>,
    #[serde(rename = "_HLS_part")]
    part: Option<u64>,
}

async fn serve_playlist(
    Path((app, stream)): Path<(String, String)>,
    Query(query): Query<PlaylistQuery>,
    State(state): State<LlHlsServerState>,
) -> Response {
    let Some(stream_state) = lookup(&state, &app, &stream) else {
        return (StatusCode::NOT_FOUND, "stream not found").into_response();
    };

    // Blocking reload: wait until the requested position materialises.
    if let Some(msn) = query.msn {
        let deadline = tokio::time::Instant::now() + BLOCKING_RELOAD_DEADLINE;
        while !stream_state.has_position(msn, query.part) {
            let notified = stream_state.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return (StatusCode::SERVICE_UNAVAILABLE, "playlist position timeout")
                    .into_response();
            }
        }
    }

    let body = {
        let playlist_state = stream_state.playlist.read();
        playlist::render(&playlist_state, &stream_state.config)
    };
    (
        StatusCode::OK,
        [
            ("Content-Type", "application/vnd.apple.mpegurl"),
            ("Cache-Control", "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn serve_init(
    Path((app, stream)): Path<(String, String)>,
    State(state): State<LlHlsServerState>,
) -> Response {
    let Some(stream_state) = lookup(&state, &app, &stream) else {
        return (StatusCode::NOT_FOUND, "stream not found").into_response();
    };
    let init = stream_state.playlist.read().init_segment.clone();
    (
        StatusCode::OK,
        [
            ("Content-Type", "video/mp4"),
            ("Cache-Control", "max-age=3600"),
        ],
        init,
    )
        .into_response()
}

/// `seg_<msn>.m4s` or `part_<msn>_<index>.m4s`.
async fn serve_media(
    Path((app, stream, resource)): Path<(String, String, String)>,
    State(state): State<LlHlsServerState>,
) -> Response {
    let Some(stream_state) = lookup(&state, &app, &stream) else {
        return (StatusCode::NOT_FOUND, "stream not found").into_response();
    };
    let name = resource.trim_end_matches(".m4s");

    let playlist_state = stream_state.playlist.read();
    let body = if let Some(msn) = name.strip_prefix("seg_").and_then(|m| m.parse::<u64>().ok()) {
        playlist_state
            .segments
            .iter()
            .find(|s| s.msn == msn && s.complete)
            .map(|s| s.concat())
    } else if let Some(rest) = name.strip_prefix("part_") {
        rest.split_once('_').and_then(|(msn, part)| {
            let msn = msn.parse::<u64>().ok()?;
            let part = part.parse::<usize>().ok()?;
            playlist_state
                .segments
                .iter()
                .find(|s| s.msn == msn)
                .and_then(|s| s.parts.get(part))
                .map(|p| p.data.clone())
        })
    } else {
        None
    };
    drop(playlist_state);

    match body {
        Some(data) => (
            StatusCode::OK,
            [
                ("Content-Type", "video/mp4"),
                ("Cache-Control", "max-age=90"),
            ],
            data,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "no such media").into_response(),
    }
}
