//! Liveness endpoint
//!
//! Answers every request, whatever the method or path, with `200 Alive!`.
//! It shares nothing with the pipeline, so it only proves the process is
//! up and scheduling tasks.

use std::io;
use std::net::SocketAddr;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::common::ShutdownReceiver;

/// Response body of the liveness endpoint
pub const ALIVE_BODY: &str = "Alive!";

/// Liveness endpoint errors
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Failed to bind liveness endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Liveness endpoint failed: {0}")]
    Serve(#[source] io::Error),
}

async fn alive() -> &'static str {
    ALIVE_BODY
}

/// Router answering any method on any path
pub fn router() -> Router {
    Router::new().fallback(alive)
}

/// Liveness HTTP server bound to its port
pub struct HealthServer {
    listener: TcpListener,
}

impl HealthServer {
    /// Bind on all interfaces; port 0 picks an ephemeral port
    pub async fn bind(port: u16) -> Result<Self, HealthError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HealthError::Bind { addr, source })?;
        Ok(Self { listener })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown
    pub async fn serve(self, mut shutdown: ShutdownReceiver) -> Result<(), HealthError> {
        if let Ok(addr) = self.local_addr() {
            info!(address = %addr, "Liveness endpoint started");
        }

        axum::serve(self.listener, router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(HealthError::Serve)?;

        info!("Liveness endpoint stopped");
        Ok(())
    }
}
