use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

pub(crate) mod retry;
pub(crate) mod runnable;

/// Wall-clock milliseconds since the Unix epoch. Lease expiry is compared in
/// this unit so hosts on different machines agree on it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Resolves once the flag is true, or when its sender is gone.
pub(crate) async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}
