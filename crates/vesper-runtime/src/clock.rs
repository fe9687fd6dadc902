//! Wall-clock driver
//!
//! Pattern deadlines and group reclamation run on engine time, which only
//! moves when someone calls [`StatementRuntime::advance_time`]. For live
//! (non-replay) use, [`spawn_clock`] advances it to `Utc::now()` on a fixed
//! interval and forwards whatever the statements produce.

use crate::statement::{StatementOutput, StatementRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to a running clock task. Dropping it stops the clock.
#[derive(Debug)]
pub struct ClockHandle {
    handle: JoinHandle<()>,
}

impl ClockHandle {
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a task advancing `runtime` to wall-clock time every `interval`
///
/// # Arguments
/// * `runtime` - Runtime whose engine time is driven
/// * `interval` - Tick period; clamped to at least one millisecond
/// * `output_tx` - Channel receiving statement output produced by ticks
///
/// The task ends on its own once `output_tx` is closed.
pub fn spawn_clock(
    runtime: Arc<StatementRuntime>,
    interval: Duration,
    output_tx: mpsc::Sender<StatementOutput>,
) -> ClockHandle {
    let interval = interval.max(Duration::from_millis(1));
    let handle = tokio::spawn(async move {
        debug!(?interval, "Clock starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            for output in runtime.advance_time(chrono::Utc::now()) {
                if output_tx.send(output).await.is_err() {
                    debug!("Clock stopping: channel closed");
                    return;
                }
            }
            if output_tx.is_closed() {
                debug!("Clock stopping: channel closed");
                return;
            }
        }
    });
    ClockHandle { handle }
}
