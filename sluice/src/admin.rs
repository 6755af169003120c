use {
    crate::config::ServerConfig,
    axum::{
        extract::{Path, State},
        http::{header, Request, StatusCode},
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::{delete, get},
        Json, Router,
    },
    serde::Serialize,
    serde_json::json,
    sluice_engine::hub::{
        define::{HubEventSender, StreamHubEvent},
        statistics::StatisticsRegistry,
        stream::StreamKey,
    },
    std::sync::Arc,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// Every admin response rides the same envelope.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    #[serde(rename = "statusCode")]
    status_code: u16,
    message: String,
    response: T,
}

fn ok<T: Serialize>(response: T) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            status_code: 200,
            message: "OK".to_string(),
            response,
        }),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(Envelope {
            status_code: 404,
            message: message.to_string(),
            response: (),
        }),
    )
        .into_response()
}

#[derive(Clone)]
struct AdminState {
    config: Arc<ServerConfig>,
    hub: HubEventSender,
    statistics: StatisticsRegistry,
    vhost: String,
    token: String,
}

/// Read-mostly admin API over the statistics snapshot plus two mutating
/// operations (terminate stream / subscriber). It never touches the
/// media plane directly.
pub struct AdminServer {
    state: AdminState,
    address: String,
    cancel: CancellationToken,
}

impl AdminServer {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        hub: HubEventSender,
        statistics: StatisticsRegistry,
        token: String,
        cancel: CancellationToken,
    ) -> Self {
        let address = config.admin.address.clone();
        let vhost = config.primary_vhost();
        Self {
            state: AdminState {
                config,
                hub,
                statistics,
                vhost,
                token,
            },
            address,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let state = self.state.clone();
        let router = Router::new()
            .route("/v1/vhosts", get(list_vhosts))
            .route("/v1/vhosts/{vhost}/apps", get(list_apps))
            .route("/v1/stats/streams", get(list_streams))
            .route("/v1/stats/streams/{app}/{stream}", get(stream_stats))
            .route("/v1/streams/{app}/{stream}", delete(terminate_stream))
            .route(
                "/v1/streams/{app}/{stream}/subscribers/{id}",
                delete(terminate_subscriber),
            )
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_bearer,
            ))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        tracing::info!(address = %self.address, "admin api listening");
        let cancel = self.cancel;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn require_bearer(
    State(state): State<AdminState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let authorised = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.token);
    if !authorised {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Envelope {
                status_code: 401,
                message: "missing or invalid bearer token".to_string(),
                response: (),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

async fn list_vhosts(State(state): State<AdminState>) -> Response {
    let names: Vec<&str> = state.config.vhosts.iter().map(|v| v.name.as_str()).collect();
    ok(json!({ "vhosts": names }))
}

async fn list_apps(Path(vhost): Path<String>, State(state): State<AdminState>) -> Response {
    match state.config.vhosts.iter().find(|v| v.name == vhost) {
        Some(vhost) => {
            let apps: Vec<_> = vhost
                .applications
                .iter()
                .map(|a| json!({ "name": a.name, "type": a.kind }))
                .collect();
            ok(json!({ "applications": apps }))
        }
        None => not_found("no such vhost"),
    }
}

async fn list_streams(State(state): State<AdminState>) -> Response {
    let streams: Vec<_> = state
        .statistics
        .iter()
        .map(|entry| {
            let stats = entry.value();
            json!({
                "name": stats.key.to_string(),
                "state": stats.state,
                "provider": stats.provider.as_ref().map(|p| p.kind),
                "subscribers": stats.subscriber_count,
                "recvBitrateBps": stats.recv_bitrate_bps,
                "sendBitrateBps": stats.send_bitrate_bps,
            })
        })
        .collect();
    ok(json!({ "streams": streams }))
}

async fn stream_stats(
    Path((app, stream)): Path<(String, String)>,
    State(state): State<AdminState>,
) -> Response {
    let key = StreamKey::new(state.vhost.clone(), app, stream);
    match state.statistics.get(&key) {
        Some(stats) => ok(stats.value().clone()),
        None => not_found("no such stream"),
    }
}

async fn terminate_stream(
    Path((app, stream)): Path<(String, String)>,
    State(state): State<AdminState>,
) -> Response {
    let key = StreamKey::new(state.vhost.clone(), app, stream);
    if state.statistics.get(&key).is_none() {
        return not_found("no such stream");
    }
    let _ = state.hub.try_send(StreamHubEvent::Terminate { key: key.clone() });
    tracing::info!(stream = %key, "stream terminated via admin api");
    ok(json!({ "terminated": key.to_string() }))
}

async fn terminate_subscriber(
    Path((app, stream, id)): Path<(String, String, String)>,
    State(state): State<AdminState>,
) -> Response {
    let Ok(subscriber_id) = id.parse::<Uuid>() else {
        return not_found("bad subscriber id");
    };
    let key = StreamKey::new(state.vhost.clone(), app, stream);
    let _ = state.hub.try_send(StreamHubEvent::TerminateSubscriber {
        key: key.clone(),
        subscriber_id,
    });
    ok(json!({ "terminated": subscriber_id }))
}
