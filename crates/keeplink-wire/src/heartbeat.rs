//! Heartbeat monitor — per-connection idle clock.
//!
//! A background tokio task advances an idle clock by one `precision` tick at
//! a time. When the accumulated idle time reaches the `target` interval the
//! timeout callback runs once and the target is subtracted, carrying any
//! remainder into the next cycle. When `target` is not a multiple of
//! `precision` this makes successive timeouts drift by up to one tick.
//!
//! [`HeartbeatMonitor::ref_heartbeat`] records activity by raising a reset
//! flag; the clock is zeroed at the next tick boundary, not immediately.
//! Activity is therefore only observed with tick precision: a tick that
//! consumes a reset still adds one `precision` to the fresh clock, so with
//! `target <= precision` the timeout fires on every tick regardless of
//! activity. This is the monitor's timing tolerance.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
struct Flags {
    running: AtomicBool,
    reset_requested: AtomicBool,
}

/// Handle to a running idle clock. Dropping the handle stops the clock.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    flags: Arc<Flags>,
    stop_tx: watch::Sender<bool>,
    target: Duration,
    precision: Duration,
}

impl HeartbeatMonitor {
    /// Spawn the clock task. Must be called inside a tokio runtime.
    ///
    /// `on_timeout` runs on the clock task; the clock does not advance while
    /// it is running.
    pub fn start<F, Fut>(target: Duration, precision: Duration, mut on_timeout: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let precision = precision.max(Duration::from_millis(1));
        let flags = Arc::new(Flags {
            running: AtomicBool::new(true),
            reset_requested: AtomicBool::new(false),
        });
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_flags = Arc::clone(&flags);
        tokio::spawn(async move {
            let mut clock = Duration::ZERO;
            while task_flags.running.load(Ordering::Acquire) {
                tokio::select! {
                    _ = tokio::time::sleep(precision) => {}
                    _ = stop_rx.changed() => break,
                }
                if !task_flags.running.load(Ordering::Acquire) {
                    break;
                }

                if task_flags.reset_requested.swap(false, Ordering::AcqRel) {
                    clock = Duration::ZERO;
                }

                clock += precision;
                if clock >= target {
                    clock -= target;
                    on_timeout().await;
                }
            }
            task_flags.running.store(false, Ordering::Release);
            debug!("heartbeat clock stopped");
        });

        Self {
            flags,
            stop_tx,
            target,
            precision,
        }
    }

    /// Record activity; the idle clock restarts at the next tick.
    pub fn ref_heartbeat(&self) {
        self.flags.reset_requested.store(true, Ordering::Release);
    }

    /// Stop the clock. Idempotent; an in-flight sleep is interrupted.
    pub fn stop(&self) {
        self.flags.running.store(false, Ordering::Release);
        let _ = self.stop_tx.send(true);
    }

    /// Whether the clock task is still ticking.
    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::Acquire)
    }

    /// Idle time that triggers the callback.
    pub fn target(&self) -> Duration {
        self.target
    }

    /// Length of one tick.
    pub fn precision(&self) -> Duration {
        self.precision
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
