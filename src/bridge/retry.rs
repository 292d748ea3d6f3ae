//! Fixed-interval retry

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Run `attempt` until it succeeds, pausing `interval` after each failure.
///
/// There is no attempt limit. Returns `None` if shutdown fires while
/// waiting between attempts.
pub async fn retry_forever<T, E, F, Fut>(
    what: &str,
    interval: Duration,
    shutdown: &mut broadcast::Receiver<()>,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures: u64 = 0;
    loop {
        match attempt().await {
            Ok(value) => {
                if failures > 0 {
                    debug!("Bridge: {} connected after {} failed attempts", what, failures);
                }
                return Some(value);
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Bridge: {} connection failed: {}, retrying in {:?}",
                    what, e, interval
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => {
                debug!("Bridge: Stopped retrying {}", what);
                return None;
            }
        }
    }
}
