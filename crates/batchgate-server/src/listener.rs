//! Metrics and health listener.
//!
//! Plain HTTP by default, TLS when the metrics section names a certificate
//! and key.

use anyhow::Context;
use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use batchgate_config::MetricsConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Upper bound on the connection drain after a graceful stop.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running metrics server.
pub struct MetricsServer {
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
}

impl MetricsServer {
    /// Bind `config.addr` and start serving `app` in the background.
    pub async fn start(config: &MetricsConfig, app: Router) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.addr))?;
        let local_addr = listener.local_addr()?;
        let listener = listener.into_std()?;

        let handle = Handle::new();
        let service = app.into_make_service();
        let task = match config.tls_files() {
            Some((cert, key)) => {
                // reqwest links rustls with ring; pin it as the process provider
                let _ = rustls::crypto::ring::default_provider().install_default();
                let tls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .with_context(|| format!("Failed to load TLS files {}", cert.display()))?;
                let server = axum_server::from_tcp_rustls(listener, tls).handle(handle.clone());
                info!("Serving metrics on https://{local_addr}");
                tokio::spawn(async move { server.serve(service).await })
            }
            None => {
                let server = axum_server::from_tcp(listener).handle(handle.clone());
                info!("Serving metrics on http://{local_addr}");
                tokio::spawn(async move { server.serve(service).await })
            }
        };

        Ok(Self {
            handle,
            task,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server. A forced stop closes connections at once and does
    /// not wait for the server task.
    pub async fn stop(self, forced: bool) {
        if forced {
            self.handle.shutdown();
            self.task.abort();
            return;
        }

        self.handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Metrics server failed"),
            Err(e) => warn!(error = %e, "Metrics server task panicked"),
        }
    }
}
