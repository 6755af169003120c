//! WHIP ingest and WHEP playback for the sluice media origin, built on
//! the `webrtc` crate: the library owns ICE/DTLS/SRTP and loss recovery,
//! this crate owns signalling, depayloading into the hub's packet model,
//! and PLI plumbing in both directions.

pub mod config;
pub mod errors;
pub mod peer;
pub mod whep;
pub mod whip;

use {
    axum::{
        extract::{Path, State},
        http::{header, StatusCode},
        response::{IntoResponse, Response},
        routing::{delete, post},
        Router,
    },
    config::WebRtcConfig,
    dashmap::DashMap,
    sluice_engine::{
        access::{AccessDirection, AccessRequest, AdmissionPolicy},
        hub::{define::HubEventSender, stream::StreamKey},
    },
    std::sync::Arc,
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
    whep::WhepSession,
    whip::WhipSession,
};

enum AnySession {
    Whip(WhipSession),
    Whep(WhepSession),
}

#[derive(Clone)]
struct SignallingState {
    config: Arc<WebRtcConfig>,
    hub: HubEventSender,
    access: Arc<dyn AdmissionPolicy>,
    vhost: String,
    sessions: Arc<DashMap<Uuid, AnySession>>,
}

/// WHIP/WHEP signalling server: `POST /<app>/<stream>/whip` publishes,
/// `POST /<app>/<stream>/whep` plays, `DELETE /session/<id>` hangs up.
pub struct WebRtcServer {
    state: SignallingState,
    cancel: CancellationToken,
}

impl WebRtcServer {
    #[must_use]
    pub fn new(
        config: WebRtcConfig,
        vhost: String,
        hub: HubEventSender,
        access: Arc<dyn AdmissionPolicy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: SignallingState {
                config: Arc::new(config),
                hub,
                access,
                vhost,
                sessions: Arc::new(DashMap::new()),
            },
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let address = self.state.config.signalling_address.clone();
        let router = Router::new()
            .route("/{app}/{stream}/whip", post(handle_whip))
            .route("/{app}/{stream}/whep", post(handle_whep))
            .route("/session/{id}", delete(handle_delete))
            .with_state(self.state);

        let listener = tokio::net::TcpListener::bind(&address).await?;
        tracing::info!(address = %address, "webrtc signalling listening");
        let cancel = self.cancel;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn handle_whip(
    Path((app, stream)): Path<(String, String)>,
    State(state): State<SignallingState>,
    body: String,
) -> Response {
    if state.sessions.len() >= state.config.max_peers {
        return (StatusCode::SERVICE_UNAVAILABLE, "peer limit reached").into_response();
    }
    let key = StreamKey::new(state.vhost.clone(), app.clone(), stream.clone());
    let request = AccessRequest {
        direction: AccessDirection::Publish,
        protocol: "webrtc",
        url: format!("/{app}/{stream}/whip"),
        stream: key.clone(),
        remote_addr: String::new(),
        user_agent: None,
    };
    if let Err(denied) = state.access.admit(&request).await {
        return (StatusCode::FORBIDDEN, denied.to_string()).into_response();
    }

    match WhipSession::start(&state.config, state.hub.clone(), key, body, String::new()).await {
        Ok((session, answer)) => {
            let id = session.id;
            state.sessions.insert(id, AnySession::Whip(session));
            (
                StatusCode::CREATED,
                [
                    (header::CONTENT_TYPE, "application/sdp".to_string()),
                    (header::LOCATION, format!("/session/{id}")),
                ],
                answer,
            )
                .into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "whip offer rejected");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

async fn handle_whep(
    Path((app, stream)): Path<(String, String)>,
    State(state): State<SignallingState>,
    body: String,
) -> Response {
    if state.sessions.len() >= state.config.max_peers {
        return (StatusCode::SERVICE_UNAVAILABLE, "peer limit reached").into_response();
    }
    let key = StreamKey::new(state.vhost.clone(), app.clone(), stream.clone());
    let request = AccessRequest {
        direction: AccessDirection::Play,
        protocol: "webrtc",
        url: format!("/{app}/{stream}/whep"),
        stream: key.clone(),
        remote_addr: String::new(),
        user_agent: None,
    };
    if let Err(denied) = state.access.admit(&request).await {
        return (StatusCode::FORBIDDEN, denied.to_string()).into_response();
    }

    match WhepSession::start(&state.config, state.hub.clone(), key, body, String::new()).await {
        Ok((session, answer)) => {
            let id = session.id;
            state.sessions.insert(id, AnySession::Whep(session));
            (
                StatusCode::CREATED,
                [
                    (header::CONTENT_TYPE, "application/sdp".to_string()),
                    (header::LOCATION, format!("/session/{id}")),
                ],
                answer,
            )
                .into_response()
        }
        Err(err) => {
            tracing::info!(error = %err, "whep offer rejected");
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
    }
}

async fn handle_delete(
    Path(id): Path<String>,
    State(state): State<SignallingState>,
) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return (StatusCode::BAD_REQUEST, "bad session id").into_response();
    };
    match state.sessions.remove(&id) {
        Some((_, session)) => {
            match session {
                AnySession::Whip(whip) => whip.close().await,
                AnySession::Whep(whep) => whep.close().await,
            }
            StatusCode::OK.into_response()
        }
        None => (StatusCode::NOT_FOUND, "no such session").into_response(),
    }
}
