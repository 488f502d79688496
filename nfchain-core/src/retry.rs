//! Fixed-backoff polling shared by the start/stop verification paths.
//!
//! The kernel handshake checks (pinned file created, pinned file removed,
//! program ID published) all poll the same way: a bounded number of
//! attempts with a one-second pause in between. The attempt count and the
//! interval are part of the supervisor's contract with the NF artifacts.

use std::time::Duration;

use log::debug;
use nfchain_common::Error;
use tokio::sync::watch;
use tokio::time::sleep;

/// Attempts made by every verification poll.
pub const POLL_ATTEMPTS: u32 = 10;

/// Pause between verification attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Signals cancellation to retry loops and sampler tasks.
#[derive(Debug)]
pub struct CancelSender(watch::Sender<bool>);

impl CancelSender {
    /// Wake every clone of the paired [`Cancel`] token.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Cooperative cancellation token checked between retry iterations.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
}

impl Cancel {
    /// A token that never fires; used for instances the caller does not
    /// intend to cancel.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled; pends forever when the
    /// sender is gone without having signalled.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Create a connected cancellation pair.
pub fn cancellation() -> (CancelSender, Cancel) {
    let (tx, rx) = watch::channel(false);
    (CancelSender(tx), Cancel { rx })
}

/// Run `op` up to `attempts` times, sleeping `interval` between attempts.
///
/// Returns the first success or the last error. Cancellation is honored
/// between iterations only; a running `op` is never interrupted.
pub async fn retry<T, F>(
    attempts: u32,
    interval: Duration,
    cancel: &mut Cancel,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut result = op();
    let mut attempt = 1;
    while attempt < attempts && result.is_err() {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = cancel.cancelled() => {
                debug!("retry cancelled after {attempt} attempts");
                break;
            }
        }
        result = op();
        attempt += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_first_success() {
        let mut calls = 0;
        let mut cancel = Cancel::never();
        let result = retry(10, Duration::from_millis(1), &mut cancel, || {
            calls += 1;
            Ok::<_, Error>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let mut calls = 0u32;
        let mut cancel = Cancel::never();
        let result: Result<(), Error> = retry(3, Duration::from_millis(1), &mut cancel, || {
            calls += 1;
            Err(Error::PinnedMapMissing("m".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_midway() {
        let mut calls = 0u32;
        let mut cancel = Cancel::never();
        let result = retry(10, Duration::from_millis(1), &mut cancel, || {
            calls += 1;
            if calls < 4 {
                Err(Error::PinnedMapMissing("m".into()))
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_retry_honors_cancellation() {
        let (sender, mut cancel) = cancellation();
        sender.cancel();
        let mut calls = 0u32;
        let result: Result<(), Error> = retry(10, Duration::from_secs(5), &mut cancel, || {
            calls += 1;
            Err(Error::PinnedMapMissing("m".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
