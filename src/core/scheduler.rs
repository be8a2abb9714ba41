use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use super::ledger_manager::LedgerManager;

/// Handle to the background worker that runs due recurring entries.
///
/// The worker stops when [`SchedulerHandle::stop`] is called or the handle is dropped.
pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<u64>>,
}

/// Starts a worker that calls [`LedgerManager::run_due`] every `interval`.
pub fn spawn(manager: Arc<LedgerManager>, interval: Duration) -> SchedulerHandle {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("ledger-scheduler".into())
        .spawn(move || {
            info!(interval_ms = interval.as_millis() as u64, "scheduler started");
            let mut ticks = 0u64;
            loop {
                ticks += 1;
                match manager.run_due() {
                    Ok(report) => debug!(
                        tick = ticks,
                        posted = report.posted(),
                        failed = report.failed(),
                        "scheduler tick"
                    ),
                    Err(err) => error!(tick = ticks, error = %err, "scheduler tick failed"),
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!(ticks, "scheduler stopped");
            ticks
        });

    match join {
        Ok(join) => SchedulerHandle {
            stop: Some(stop_tx),
            join: Some(join),
        },
        Err(err) => {
            error!(error = %err, "failed to spawn scheduler thread");
            SchedulerHandle {
                stop: None,
                join: None,
            }
        }
    }
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .is_some_and(|join| !join.is_finished())
    }

    /// Signals the worker and waits for it. Returns the number of ticks it ran.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join
            .take()
            .and_then(|join| join.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
