//! Agent daemon.
//!
//! Wires the scheduler to the dataplane descriptors, applies the desired
//! state at start-up as a full resync and re-applies it whenever the
//! desired-state file changes.

use crate::config::AgentConfig;
use crate::dataplane::SimDataplane;
use crate::descriptors;
use crate::desired::{DesiredFile, DesiredState};
use crate::error::{AgentError, Result};
use kvscheduler::{Scheduler, TransactionError, TxnReport, ValueStatusUpdate};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STATUS_CHANNEL_CAPACITY: usize = 1024;

pub struct AgentDaemon {
    config: AgentConfig,
    scheduler: Scheduler,
    dataplane: Arc<SimDataplane>,
    desired: Option<DesiredFile>,
    shutdown: CancellationToken,
    status_task: Option<JoinHandle<()>>,
}

impl AgentDaemon {
    /// Creates the scheduler and registers every descriptor.
    pub fn new(config: AgentConfig, dataplane: Arc<SimDataplane>) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(config.scheduler.clone())?;
        descriptors::register_all(&scheduler, dataplane.clone())?;
        let desired = config.agent.desired_config.clone().map(DesiredFile::new);
        Ok(Self {
            config,
            scheduler,
            dataplane,
            desired,
            shutdown: CancellationToken::new(),
            status_task: None,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dataplane(&self) -> &Arc<SimDataplane> {
        &self.dataplane
    }

    /// Token that stops [`AgentDaemon::run`] when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the status watcher and runs the initial full resync.
    ///
    /// A resync that fails for individual values does not fail the start-up;
    /// those values are left to retries and later reloads.
    pub async fn init(&mut self) -> Result<()> {
        if self.config.agent.log_status_updates && self.status_task.is_none() {
            let (tx, rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
            self.scheduler.watch_value_status(tx, Vec::new());
            self.status_task = Some(tokio::spawn(log_status_updates(rx)));
        }

        let state = match self.desired.as_mut() {
            Some(desired) => {
                info!("Loading desired state from {}", desired.path().display());
                desired.poll()?.unwrap_or_default()
            }
            None => DesiredState::default(),
        };
        match self.apply_desired(&state).await {
            Ok(_) | Err(AgentError::Transaction(TransactionError::Failed { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Applies `state` as a full resync.
    pub async fn apply_desired(&self, state: &DesiredState) -> Result<TxnReport> {
        info!(
            "Applying desired state: {} interfaces, {} bridge domains, {} FIB entries",
            state.interfaces.len(),
            state.bridge_domains.len(),
            state.fib_entries.len()
        );
        match self.scheduler.resync_config(state.to_kvs()).await {
            Ok(report) => {
                info!("Desired state applied in transaction #{}", report.seq_num);
                Ok(report)
            }
            Err(e) => {
                warn!("Desired state not fully applied: {}", e);
                Err(e.into())
            }
        }
    }

    /// Re-applies the desired-state file if its content changed.
    ///
    /// Returns true when a resync was run.
    pub async fn reload(&mut self) -> Result<bool> {
        let Some(desired) = self.desired.as_mut() else {
            return Ok(false);
        };
        let Some(state) = desired.poll()? else {
            return Ok(false);
        };
        info!("Desired state file {} changed", desired.path().display());
        self.apply_desired(&state).await?;
        Ok(true)
    }

    /// Polls the desired-state file until stopped.
    pub async fn run(&mut self) {
        info!("Starting kvagentd event loop");
        let interval = self.config.agent.reload_interval().filter(|_| self.desired.is_some());
        let Some(interval) = interval else {
            self.shutdown.cancelled().await;
            info!("kvagentd event loop stopped");
            return;
        };

        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately and init already applied the file
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!("Reload failed: {}", e);
                    }
                }
            }
        }
        info!("kvagentd event loop stopped");
    }

    pub fn stop(&self) {
        info!("Stopping kvagentd");
        self.shutdown.cancel();
    }

    /// Closes the scheduler and stops the status watcher.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.scheduler.close().await;
        if let Some(task) = self.status_task.take() {
            task.abort();
        }
    }
}

async fn log_status_updates(mut rx: mpsc::Receiver<ValueStatusUpdate>) {
    while let Some(update) = rx.recv().await {
        match &update.error {
            Some(error) => tracing::warn!(
                txn = update.txn_seq,
                key = %update.key,
                from = %update.old_state,
                to = %update.new_state,
                error = %error,
                "value state changed"
            ),
            None => tracing::info!(
                txn = update.txn_seq,
                key = %update.key,
                from = %update.old_state,
                to = %update.new_state,
                "value state changed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{interface, Interface};
    use kvscheduler::ValueState;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_init_without_desired_file() {
        let dp = Arc::new(SimDataplane::with_physical_ports(["eth0"]));
        let mut daemon = AgentDaemon::new(AgentConfig::default(), dp).unwrap();
        daemon.init().await.unwrap();

        let status = daemon
            .scheduler()
            .get_value_status(&interface::key("eth0"))
            .await
            .unwrap();
        assert_eq!(status.state, ValueState::Obtained);
        assert!(!daemon.reload().await.unwrap());
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_desired_creates_interface() {
        let dp = Arc::new(SimDataplane::new());
        let daemon = AgentDaemon::new(AgentConfig::default(), dp.clone()).unwrap();
        let state = DesiredState {
            interfaces: vec![Interface::tap("tap1")],
            ..Default::default()
        };
        daemon.apply_desired(&state).await.unwrap();

        let idx = dp.interface_index("tap1").unwrap();
        assert!(dp.interface(idx).unwrap().admin_up);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_returns_when_stopped() {
        let mut daemon = AgentDaemon::new(AgentConfig::default(), Arc::new(SimDataplane::new())).unwrap();
        daemon.stop();
        daemon.run().await;
        daemon.shutdown().await;
    }
}
