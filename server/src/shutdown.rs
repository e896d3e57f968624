use std::time::Duration;

use tokio::time::{Instant, interval};

use sockline_core::Error;

/// Interval between condition checks while waiting a server state out.
pub(crate) const STOP_POLL: Duration = Duration::from_millis(5);

/// Cap on each individual stop/drain wait.
pub(crate) const STOP_CAP: Duration = Duration::from_secs(10);

/// Outer cap on a full graceful shutdown (drain + stop).
pub(crate) const SHUTDOWN_CAP: Duration = Duration::from_secs(25);

/// Poll `cond` every [`STOP_POLL`] until it holds or [`STOP_CAP`]
/// elapses, in which case `timeout_err` is returned.
pub(crate) async fn wait_until<F>(cond: F, timeout_err: Error) -> Result<(), Error>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let mut tick = interval(STOP_POLL);

    while start.elapsed() < STOP_CAP {
        if cond() {
            return Ok(());
        }
        tick.tick().await;
    }

    if cond() { Ok(()) } else { Err(timeout_err) }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn resolves_when_condition_holds() {
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { wait_until(|| flag.load(Ordering::SeqCst), Error::ShutdownTimeout).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::SeqCst);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_given_error() {
        let res = wait_until(|| false, Error::GoneTimeout).await;
        assert!(matches!(res, Err(Error::GoneTimeout)));
    }
}
