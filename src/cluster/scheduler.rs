use super::state::ClusterState;
use crate::core::{DbError, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Background task running a tend pass every `tend_interval`.
///
/// The interval is re-read from the configuration before each sleep, so a
/// reconfiguration takes effect on the next cycle.
pub struct TendScheduler {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TendScheduler {
    pub fn start(state: Arc<ClusterState>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            loop {
                let interval = state.config().tend_interval;
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        if state.run_tend_pass().await.is_none() {
                            log::debug!("tend pass skipped, previous pass still running");
                        }
                    }
                }
            }
            log::debug!("tend scheduler stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signals the task to stop and waits for the current pass to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DbError::Fatal(format!("tend scheduler join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for TendScheduler {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
