use crate::{
    config::{Config, DetectorMode, ServerConfig, SessionConfig},
    routes::api_routes,
    session::Dispatcher,
    telemetry::Metrics,
};
use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

/// Room for the JSON envelope and a `data:` URL prefix.
const MESSAGE_OVERHEAD_BYTES: usize = 4 * 1024;

#[derive(Clone)]
pub struct SharedState {
    pub dispatcher: Dispatcher,
    pub metrics: Arc<Metrics>,
    pub mode: DetectorMode,
    pub max_message_bytes: usize,
}

impl SharedState {
    pub fn new(dispatcher: Dispatcher, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            dispatcher,
            metrics,
            mode: config.detector.mode,
            max_message_bytes: max_message_bytes(&config.session),
        }
    }
}

/// Largest WebSocket message a session will buffer. Frames up to twice the
/// configured size still reach the decoder and get an `Invalid image` reply;
/// anything larger is refused by the socket and ends the session.
pub fn max_message_bytes(session: &SessionConfig) -> usize {
    let encoded_frame_bytes = session.max_frame_bytes.div_ceil(3).saturating_mul(4);

    encoded_frame_bytes
        .saturating_mul(2)
        .saturating_add(MESSAGE_OVERHEAD_BYTES)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let router = Router::new().merge(api_routes()).with_state(state);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, mut shutdown_rx: Receiver<()>) -> JoinHandle<anyhow::Result<()>> {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Starting app on {}", addr),
            Err(e) => tracing::warn!("Starting app on an unknown address: {}", e),
        }

        let listener = self.listener;
        let router = self.router;

        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await.ok();
            })
            .await?;

            tracing::info!("Server stopped");
            Ok(())
        })
    }
}
