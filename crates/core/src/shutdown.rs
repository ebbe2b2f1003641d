use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const STOP_POLL: Duration = Duration::from_millis(100);

/// Sleeps for `duration`, waking early once `stop` is set.
///
/// Returns `false` if the stop flag was observed.
pub async fn sleep_or_stop(stop: &AtomicBool, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(STOP_POLL);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    !stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_stop() {
        let stop = AtomicBool::new(false);
        assert!(sleep_or_stop(&stop, Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_sleeper() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let sleeper = tokio::spawn(async move { sleep_or_stop(&flag, Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_millis(250)).await;
        stop.store(true, Ordering::SeqCst);
        assert!(!sleeper.await.unwrap());
    }
}
