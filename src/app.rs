use crate::{
    config::Config,
    detector::build_detector,
    registry::SessionRegistry,
    server::{HttpServer, SharedState},
    session::Dispatcher,
    telemetry::Metrics,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast};

/// A bound server with its collaborators, ready to run.
pub struct App {
    server: HttpServer,
    registry: Arc<SessionRegistry>,
}

impl App {
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let detector = match build_detector(&config.detector).await {
            Ok(detector) => detector,
            Err(e) => {
                tracing::error!("Failed to initialize detector: {:?}", e);
                return Err(e.into());
            }
        };

        let registry = Arc::new(SessionRegistry::new(Arc::clone(&metrics)));
        let dispatcher = Dispatcher::new(
            &config.session,
            detector,
            Arc::clone(&metrics),
            Arc::clone(&registry),
        );

        let state = SharedState::new(dispatcher, metrics, config);
        let server = HttpServer::new(state, &config.server).await?;

        Ok(Self { server, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serves until `shutdown` resolves, then closes every session and
    /// waits for the listener to stop.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        let server_handle = self.server.run(shutdown_tx.subscribe());

        shutdown.await;
        tracing::info!("Shutdown signal received, starting graceful shutdown.");

        self.registry.shutdown();
        let _ = shutdown_tx.send(());
        server_handle.await??;

        Ok(())
    }
}

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        mode = config.detector.mode.as_str(),
        address = %config.server.get_address(),
        "Starting frame gateway"
    );

    App::build(&config).await?.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
