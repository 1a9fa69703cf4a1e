//! Background synchronisation of the mech controller clock.
//!
//! The controller clock drifts and resets on reboot, and its timestamps end up in
//! every reply sentence. The task below sets it from the host clock once per
//! `interval`, retrying every `retry` after a failure, and reads the clock back
//! after each successful set.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::link::MechLink;
use crate::config::MechConfig;

/// Handle to the running clock synchronisation task.
pub struct ClockSync {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ClockSync {
    /// Start synchronising with the intervals from the mech configuration.
    pub fn spawn(link: MechLink, config: &MechConfig) -> Self {
        Self::spawn_with(
            link,
            Duration::from_secs(config.clock_sync_interval_secs),
            Duration::from_secs(config.clock_retry_secs),
            config.command_timeout(),
        )
    }

    /// Start synchronising with explicit intervals. The first attempt is immediate.
    pub fn spawn_with(
        link: MechLink,
        interval: Duration,
        retry: Duration,
        command_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            info!(?interval, "Mech clock synchronisation started");
            loop {
                let wait = match link.set_time(Utc::now(), command_timeout).await {
                    Ok(()) => {
                        match link.clock(command_timeout).await {
                            Ok(clock) => info!(
                                controller_time = %clock.time,
                                set_time = %clock.set_time,
                                "Mech clock set"
                            ),
                            Err(e) => warn!(error = %e, "Mech clock set but read-back failed"),
                        }
                        interval
                    }
                    Err(e) => {
                        warn!(error = %e, ?retry, "Failed to set mech clock; retrying");
                        retry
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("Mech clock synchronisation stopped");
        });

        Self {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ClockSync {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mech::mock::MockMech;

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_is_retried_sooner() {
        let mock = MockMech::new();
        mock.fail_command("st", 1);
        let link = MechLink::new(mock.connector(), Duration::from_secs(1), None);

        let sync = ClockSync::spawn_with(
            link,
            Duration::from_secs(86_400),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        let attempts = mock
            .commands()
            .iter()
            .filter(|c| c.starts_with("st"))
            .count();
        assert_eq!(attempts, 2);
        // Only the successful attempt is read back
        assert_eq!(mock.commands_starting_with("rt").len(), 1);

        // Next attempt only after a full day.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(
            mock.commands().iter().filter(|c| c.starts_with("st")).count(),
            2
        );

        sync.shutdown().await;
    }
}
