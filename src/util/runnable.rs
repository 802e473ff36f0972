use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::watch, time::Instant};

use super::wait_until_set;

/// Runs `run_once` every `interval`, measured start to start. An iteration in
/// flight is never cancelled; shutdown is only observed between iterations.
pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_loop_time = Instant::now();
    loop {
        if *shutdown.borrow() {
            break;
        }
        runnable.run_once().await;

        let elapsed = Instant::now() - last_loop_time;
        if elapsed < interval {
            let mut shutdown_signal = false;
            tokio::select! {
                _ = wait_until_set(&mut shutdown) => { shutdown_signal = true }
                _ = tokio::time::sleep(interval - elapsed) => {}
            }
            if shutdown_signal {
                break;
            }
        }
        last_loop_time = Instant::now();
    }

    runnable.before_shutdown_complete().await;
}

/// Runs `run_once`, then sleeps `delay`, forever until shutdown.
pub(crate) async fn run_with_fixed_delay<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        runnable.run_once().await;

        let mut shutdown_signal = false;
        tokio::select! {
            _ = wait_until_set(&mut shutdown) => { shutdown_signal = true }
            _ = tokio::time::sleep(delay) => {}
        }
        if shutdown_signal {
            break;
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}
