//! Listener setup and the accept loop.
//!
//! One task accepts connections and hands each to the worker pool with a
//! zero-wait submission. When the queue is full the connection is shed
//! right here with a minimal 503, so accepted work always has a reserved
//! slot and the pool's liveness is never at stake.

use crate::{
    config::ServerConfig,
    http::{
        response::{send_all, Response},
        types::StatusCode,
    },
    security::rate::RateLimiter,
    server::{
        connection::ServerState,
        pool::{Conn, PoolCounters, WorkerPool},
    },
};
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};

/// Startup failures; all of them exit the process with code 1.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("resource root {0:?} does not exist or is not a directory")]
    ResourceRoot(PathBuf),
    #[error("failed to prepare upload directory: {0}")]
    Uploads(io::Error),
}

/// Triggers a graceful shutdown from anywhere (signal handler, tests).
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// A bound server, ready to run.
pub struct Server {
    listener: TcpListener,
    pool: WorkerPool,
    state: Arc<ServerState>,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validates the filesystem layout, binds the listener and spawns
    /// the worker pool. When `config.port` is 0 the config is updated
    /// with the bound port so Host validation matches reality.
    pub async fn bind(mut config: ServerConfig) -> Result<Self, StartupError> {
        if !config.resource_root.is_dir() {
            return Err(StartupError::ResourceRoot(config.resource_root.clone()));
        }
        tokio::fs::create_dir_all(config.uploads_dir())
            .await
            .map_err(StartupError::Uploads)?;

        let addr = SocketAddr::new(config.host, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;
        config.port = local_addr.port();

        let limiter = RateLimiter::new(config.rate_limit.clone());
        let state = Arc::new(ServerState { config, limiter });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let pool = WorkerPool::spawn(
            Arc::clone(&state),
            Arc::clone(&shutdown),
            shutdown_rx.clone(),
        );

        tracing::info!(
            addr = %local_addr,
            workers = state.config.workers,
            queue = state.config.queue_capacity,
            "server listening"
        );

        Ok(Self {
            listener,
            pool,
            state,
            shutdown,
            shutdown_rx,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Accepts until the shutdown signal fires, then drains the pool.
    /// Workers finish their current request; the drain is bounded.
    pub async fn run(mut self) -> PoolCounters {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.dispatch_connection(stream, peer).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        tracing::info!("shutdown requested; draining worker pool");
        drop(self.listener);
        let _ = self.shutdown.send(true);

        let counters = self.pool.shutdown(true).await;
        tracing::info!(
            completed = counters.completed,
            failed = counters.failed,
            "shutdown complete"
        );
        counters
    }

    async fn dispatch_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if let Err(mut shed) = self.pool.try_submit(Conn { stream, peer }) {
            tracing::warn!(client = %peer, "connection queue full; shedding with 503");
            let wire = Response::new(StatusCode::ServiceUnavailable)
                .header("Content-Type", "text/plain")
                .header("Retry-After", "1")
                .with_body(b"Service Unavailable".to_vec())
                .close()
                .serialize(&self.state.config.server_name);
            let _ = send_all(
                &mut shed.stream,
                &wire,
                self.state.config.write_timeout,
            )
            .await;
        }
    }
}
