#![forbid(unsafe_code)]

// Worker pool for the media engine

use crate::config::Config;
use mediasoup::prelude::*;
use mediasoup::worker_manager::WorkerManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};
use anyhow::{Context, Result};

/// How long to wait after a worker dies before exiting, so in-flight log
/// writes flush and a supervisor observes a clean restart.
const WORKER_DEATH_GRACE: Duration = Duration::from_secs(2);

/// A fixed pool of media-engine worker processes.
///
/// Workers are spawned once at startup and handed out round-robin. Workers
/// carry non-reconstructible RTP state, so the pool never attempts in-place
/// recovery: any worker death schedules a process exit and leaves the restart
/// to the supervisor.
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    // The manager owns the IPC channels; it must outlive the workers.
    _manager: WorkerManager,
}

impl WorkerPool {
    /// Spawns `config.num_workers` workers, each with the configured UDP port
    /// range for RTP/RTCP.
    pub async fn new(config: &Config) -> Result<Self> {
        let manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(config.num_workers);

        for index in 0..config.num_workers {
            let worker = manager
                .create_worker(config.worker_settings())
                .await
                .with_context(|| format!("failed to create worker {index}"))?;

            info!("Created worker {} ({})", index, worker.id());
            Self::arm_death_handler(&worker, index);
            workers.push(worker);
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            _manager: manager,
        })
    }

    /// Exits the process shortly after a worker dies.
    fn arm_death_handler(worker: &Worker, index: usize) {
        let worker_id = worker.id();
        let handle = Handle::current();
        worker
            .on_dead(move |reason| {
                error!(
                    "Worker {} ({}) died: {:?}; exiting in {:?}",
                    index, worker_id, reason, WORKER_DEATH_GRACE
                );
                handle.spawn(async {
                    tokio::time::sleep(WORKER_DEATH_GRACE).await;
                    std::process::exit(1);
                });
            })
            .detach();
    }

    /// Hands out the next worker round-robin.
    pub fn next_worker(&self) -> &Worker {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[idx]
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_rotates_round_robin() {
        let config = Config {
            num_workers: 2,
            ..Config::default()
        };
        let pool = WorkerPool::new(&config).await.unwrap();
        assert_eq!(pool.len(), 2);

        let first = pool.next_worker().id();
        let second = pool.next_worker().id();
        let third = pool.next_worker().id();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
