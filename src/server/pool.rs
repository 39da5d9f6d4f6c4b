//! Bounded worker pool.
//!
//! A fixed set of long-lived worker tasks consumes accepted connections
//! from a bounded FIFO. Submission never waits: when the queue is full
//! the caller sheds the connection at the edge instead of queueing
//! unboundedly. Workers are created once at startup and reused for the
//! life of the server.

use crate::server::connection::{self, ServerState};
use crossbeam::queue::ArrayQueue;
use metrics::{counter, gauge};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpStream, sync::watch, task::JoinHandle, time};

/// How long an idle worker sleeps between queue polls.
const POLL_INTERVAL: Duration = Duration::from_micros(50);
/// Per-worker join ceiling during shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One accepted connection waiting for a worker.
pub(crate) struct Conn {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
}

/// Completed-or-failed totals, updated under one lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounters {
    pub completed: u64,
    pub failed: u64,
}

pub(crate) struct WorkerPool {
    queue: Arc<ArrayQueue<Conn>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Mutex<PoolCounters>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    /// Spawns the workers. `shutdown` is the process-wide stop signal;
    /// workers exit once it is set and the queue has drained.
    pub(crate) fn spawn(
        state: Arc<ServerState>,
        shutdown: Arc<watch::Sender<bool>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let queue = Arc::new(ArrayQueue::new(state.config.queue_capacity));
        let counters = Arc::new(Mutex::new(PoolCounters::default()));

        let workers = (0..state.config.workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&state),
                    Arc::clone(&counters),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Self {
            queue,
            workers,
            counters,
            shutdown,
        }
    }

    /// Non-blocking submission: succeeds iff the queue has room, handing
    /// the connection back otherwise so the caller can shed it.
    pub(crate) fn try_submit(&self, conn: Conn) -> Result<(), Conn> {
        let result = self.queue.push(conn);
        if result.is_ok() {
            gauge!("pool_queue_depth").set(self.queue.len() as f64);
        } else {
            counter!("pool_submissions_rejected").increment(1);
        }
        result
    }

    pub(crate) fn counters(&self) -> PoolCounters {
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Signals stop and, when `wait` is set, joins every worker with a
    /// bounded deadline. Workers that overrun the deadline are abandoned
    /// with a warning; process exit is never held hostage. Returns the
    /// final counters.
    pub(crate) async fn shutdown(mut self, wait: bool) -> PoolCounters {
        let _ = self.shutdown.send(true);
        if wait {
            for (id, handle) in self.workers.drain(..).enumerate() {
                if time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                    tracing::warn!(worker = id, "worker did not stop in time; abandoning");
                }
            }
        }
        self.counters()
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<ArrayQueue<Conn>>,
    state: Arc<ServerState>,
    counters: Arc<Mutex<PoolCounters>>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match queue.pop() {
            Some(conn) => {
                gauge!("pool_queue_depth").set(queue.len() as f64);
                gauge!("pool_active_workers").increment(1.0);

                let peer = conn.peer;
                let result = connection::serve(conn, &state, &shutdown).await;

                gauge!("pool_active_workers").decrement(1.0);
                let mut totals = counters.lock().unwrap_or_else(|e| e.into_inner());
                match result {
                    Ok(()) => totals.completed += 1,
                    Err(e) => {
                        totals.failed += 1;
                        tracing::error!(worker = id, client = %peer, error = %e, "connection failed");
                    }
                }
            }
            // Exit only once shutdown is signalled AND the queue is dry.
            None => {
                if *shutdown.borrow() {
                    break;
                }
                time::sleep(POLL_INTERVAL).await;
            }
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}
