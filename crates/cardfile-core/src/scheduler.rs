//! Background persistence timers.
//!
//! Three tasks run against one shared vault: a rapid pass that only acts
//! on a dirty roster, an unconditional full pass with an optional remote
//! push, and an hourly retention sweep. All three stop on a shared watch
//! channel; shutdown signals and then joins so in-flight writes finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Vault;
use crate::error::ConfigError;
use crate::snapshot::Snapshot;

/// Future returned by a remote sink push.
pub type SyncFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Best-effort off-site copy of full snapshots.
///
/// Push failures are logged and forgotten; the local stores are the
/// source of truth and a sink must never block or fail a backup pass.
pub trait RemoteSink: Send + Sync {
    /// Sink identifier used in logs.
    fn name(&self) -> &'static str;

    /// Ship one snapshot.
    fn push<'a>(&'a self, snapshot: &'a Snapshot) -> SyncFuture<'a>;
}

/// Timer cadences and the retention window for the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_rapid_secs")]
    pub rapid_secs: u64,
    #[serde(default = "default_full_secs")]
    pub full_secs: u64,
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_secs: u64,
    /// Timestamped snapshots older than this many days are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_rapid_secs() -> u64 {
    30
}

fn default_full_secs() -> u64 {
    300
}

fn default_cleanup_secs() -> u64 {
    3_600
}

fn default_retention_days() -> u64 {
    7
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rapid_secs: default_rapid_secs(),
            full_secs: default_full_secs(),
            cleanup_secs: default_cleanup_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("scheduler.rapid_secs", self.rapid_secs),
            ("scheduler.full_secs", self.full_secs),
            ("scheduler.cleanup_secs", self.cleanup_secs),
            ("scheduler.retention_days", self.retention_days),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 86_400)
    }
}

/// Owns the spawned timer tasks and their shutdown channel.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal shutdown without waiting.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for every task to finish its current
    /// pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

/// Spawn the three timer tasks against a shared vault.
///
/// Each interval fires once immediately, so starting the scheduler also
/// takes a startup full snapshot.
pub fn start(vault: Arc<Vault>, remote: Option<Arc<dyn RemoteSink>>) -> SchedulerHandle {
    let config = vault.config().scheduler;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tasks = vec![
        tokio::spawn(run_rapid(
            Arc::clone(&vault),
            Duration::from_secs(config.rapid_secs),
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_full(
            Arc::clone(&vault),
            remote,
            Duration::from_secs(config.full_secs),
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_cleanup(
            vault,
            Duration::from_secs(config.cleanup_secs),
            shutdown_rx,
        )),
    ];
    info!(
        rapid_secs = config.rapid_secs,
        full_secs = config.full_secs,
        cleanup_secs = config.cleanup_secs,
        "scheduler started"
    );
    SchedulerHandle {
        shutdown: shutdown_tx,
        tasks,
    }
}

async fn run_rapid(vault: Arc<Vault>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match vault.rapid_backup().await {
                    Ok(Some(receipt)) => {
                        debug!(key = %receipt.key, records = receipt.record_count, "rapid pass wrote a snapshot");
                    }
                    Ok(None) => debug!("rapid pass skipped, roster clean"),
                    Err(e) => warn!(error = %e, "rapid pass failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("rapid task shutting down");
                break;
            }
        }
    }
}

async fn run_full(
    vault: Arc<Vault>,
    remote: Option<Arc<dyn RemoteSink>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match vault.full_backup().await {
                    Ok((receipt, snapshot)) => {
                        info!(key = %receipt.key, records = receipt.record_count, "full pass wrote a snapshot");
                        if let Some(sink) = &remote {
                            match sink.push(&snapshot).await {
                                Ok(()) => debug!(sink = sink.name(), "remote sync delivered"),
                                Err(e) => warn!(sink = sink.name(), error = %e, "remote sync failed"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "full pass failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("full task shutting down");
                break;
            }
        }
    }
}

async fn run_cleanup(vault: Arc<Vault>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match vault.cleanup_expired().await {
                    Ok(report) if report.kv_deleted > 0 || report.sql_deleted > 0 => {
                        info!(
                            kv_deleted = report.kv_deleted,
                            sql_deleted = report.sql_deleted,
                            "retention sweep pruned snapshots"
                        );
                    }
                    Ok(_) => debug!("retention sweep found nothing expired"),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("cleanup task shutting down");
                break;
            }
        }
    }
}
