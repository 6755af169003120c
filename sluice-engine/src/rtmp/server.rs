use {
    super::session::server_session::RtmpServerSession,
    crate::{access::AdmissionPolicy, hub::define::HubEventSender},
    std::sync::Arc,
    tokio::net::{TcpListener, TcpStream},
    tokio::sync::{OwnedSemaphorePermit, Semaphore},
    tokio_util::sync::CancellationToken,
};

/// Session slots per listener. Each accepted connection holds one permit
/// for its lifetime; when none are left, new peers are turned away at
/// accept time.
const DEFAULT_SESSION_SLOTS: usize = 1_000;

/// RTMP listener: accepts encoder pushes and player pulls.
pub struct RtmpServer {
    address: String,
    vhost: String,
    hub: HubEventSender,
    access: Arc<dyn AdmissionPolicy>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl RtmpServer {
    #[must_use]
    pub fn new(
        address: String,
        vhost: String,
        hub: HubEventSender,
        access: Arc<dyn AdmissionPolicy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            vhost,
            hub,
            access,
            slots: Arc::new(Semaphore::new(DEFAULT_SESSION_SLOTS)),
            cancel,
        }
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.slots = Arc::new(Semaphore::new(max));
        self
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.address).await?;
        tracing::info!(
            address = %self.address,
            slots = self.slots.available_permits(),
            "rtmp listener up"
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.cancel.cancelled() => {
                    tracing::info!("rtmp listener stopping");
                    return Ok(());
                }
            };
            self.dispatch(accepted);
        }
    }

    /// Hand one accepted connection its session slot, or turn it away.
    fn dispatch(&self, (stream, remote_addr): (TcpStream, std::net::SocketAddr)) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Saturated: refuse at the door rather than queueing, so
                // established sessions keep their bandwidth.
                tracing::warn!(%remote_addr, "rtmp session slots exhausted, peer refused");
                return;
            }
        };
        tokio::spawn(serve_connection(
            stream,
            remote_addr.to_string(),
            self.hub.clone(),
            self.access.clone(),
            self.vhost.clone(),
            permit,
        ));
    }
}

/// One connection from accept to teardown. The slot permit travels with
/// the task and frees itself on any exit path.
async fn serve_connection(
    stream: TcpStream,
    remote_addr: String,
    hub: HubEventSender,
    access: Arc<dyn AdmissionPolicy>,
    vhost: String,
    _permit: OwnedSemaphorePermit,
) {
    let mut session = RtmpServerSession::new(stream, remote_addr, hub, access, vhost);
    match session.run().await {
        Ok(()) => tracing::debug!(
            app = %session.app_name,
            stream = %session.stream_name,
            "rtmp session closed"
        ),
        Err(err) => tracing::info!(
            app = %session.app_name,
            stream = %session.stream_name,
            error = %err,
            "rtmp session ended"
        ),
    }
}
