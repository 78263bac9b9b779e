//! Background sync task
//!
//! Drives a `CompositeAdapter`: drains the queue when local writes arrive
//! or a timer fires, and pulls tracked collections periodically. While the
//! remote keeps failing the drain timer backs off exponentially.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::composite::CompositeAdapter;

/// Commands sent to the sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Drain the pending queue now
    Drain,
    /// Pull tracked collections now
    Pull,
    /// Stop the task after persisting the queue
    Shutdown,
}

/// Connection status as seen by the last sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Remote unreachable, or the task has stopped
    Disconnected,
    /// Last exchange with the remote succeeded
    Connected,
    /// Draining or pulling
    Syncing,
}

/// Configuration for the sync task
#[derive(Debug, Clone)]
pub struct SyncTaskConfig {
    /// Drain interval while the remote is healthy
    pub drain_interval: Duration,
    /// Upper bound for the drain interval while the remote fails
    pub max_drain_interval: Duration,
    /// Pull interval; `None` disables periodic pulls
    pub pull_interval: Option<Duration>,
}

impl Default for SyncTaskConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(5),
            max_drain_interval: Duration::from_secs(60),
            pull_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Handle to control the sync task
pub struct SyncTaskHandle {
    /// Send commands to the sync task
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Watch connection status
    pub status_rx: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl SyncTaskHandle {
    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Ask for an immediate drain
    pub async fn drain_now(&self) {
        let _ = self.command_tx.send(SyncCommand::Drain).await;
    }

    /// Ask for an immediate pull
    pub async fn pull_now(&self) {
        let _ = self.command_tx.send(SyncCommand::Pull).await;
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Sync task ended abnormally: {}", e);
        }
    }
}

/// Spawn the background sync task
pub fn spawn_sync_task(adapter: Arc<CompositeAdapter>, config: SyncTaskConfig) -> SyncTaskHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

    let task = tokio::spawn(sync_task_loop(adapter, config, command_rx, status_tx));

    SyncTaskHandle {
        command_tx,
        status_rx,
        task,
    }
}

enum Work {
    Drain,
    Pull,
}

async fn sync_task_loop(
    adapter: Arc<CompositeAdapter>,
    config: SyncTaskConfig,
    mut command_rx: mpsc::Receiver<SyncCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut drain_delay = config.drain_interval;
    let mut next_drain = Instant::now();
    let mut next_pull = Instant::now() + config.pull_interval.unwrap_or_default();
    let mut last_status = ConnectionStatus::Disconnected;

    loop {
        let work = tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::Drain) => Work::Drain,
                    Some(SyncCommand::Pull) => Work::Pull,
                    Some(SyncCommand::Shutdown) | None => break,
                }
            }
            _ = adapter.wait_for_writes() => Work::Drain,
            _ = tokio::time::sleep_until(next_drain) => Work::Drain,
            _ = tokio::time::sleep_until(next_pull), if config.pull_interval.is_some() => Work::Pull,
        };

        let _ = status_tx.send(ConnectionStatus::Syncing);

        // None when nothing reached the remote (empty or backed-off queue)
        let reachable = match work {
            Work::Drain => match adapter.drain().await {
                Ok(report) if report.retried > 0 => Some(false),
                Ok(report) if report.synced + report.failed == 0 => None,
                Ok(_) => Some(true),
                Err(e) => {
                    warn!("Drain failed: {}", e);
                    Some(!e.is_transient())
                }
            },
            Work::Pull => {
                if let Some(interval) = config.pull_interval {
                    next_pull = Instant::now() + interval;
                }
                match adapter.pull_all().await {
                    Ok(_) => Some(true),
                    Err(e) => {
                        debug!("Pull failed: {}", e);
                        Some(!e.is_transient())
                    }
                }
            }
        };

        match reachable {
            Some(true) => {
                drain_delay = config.drain_interval;
                last_status = ConnectionStatus::Connected;
            }
            Some(false) => {
                // Exponential backoff
                drain_delay = (drain_delay * 2).min(config.max_drain_interval);
                last_status = ConnectionStatus::Disconnected;
            }
            None => {}
        }
        let _ = status_tx.send(last_status);
        next_drain = Instant::now() + drain_delay;
    }

    if let Err(e) = adapter.persist().await {
        warn!("Failed to persist sync queue on shutdown: {}", e);
    }
    let _ = status_tx.send(ConnectionStatus::Disconnected);
    info!("Sync task stopped");
}
