//! Async test helpers
//!
//! Channel receive helpers with timeouts. Under `start_paused` runtimes the
//! timeouts advance virtual time, so a missing event fails the test instead
//! of hanging it.

use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

/// Default timeout for waiting on a single event
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Receive from a channel with a timeout
pub async fn recv_timeout<T>(
    rx: &mut mpsc::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Skip items until one matches `predicate`, panicking after [`DEFAULT_TEST_TIMEOUT`]
pub async fn recv_until<T, P>(rx: &mut mpsc::Receiver<T>, mut predicate: P) -> T
where
    T: std::fmt::Debug,
    P: FnMut(&T) -> bool,
{
    let found = timeout(DEFAULT_TEST_TIMEOUT, async {
        while let Some(item) = rx.recv().await {
            if predicate(&item) {
                return Some(item);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(item)) => item,
        Ok(None) => panic!("channel closed before a matching item arrived"),
        Err(_) => panic!("no matching item within {:?}", DEFAULT_TEST_TIMEOUT),
    }
}

/// Wait until a watch channel's value satisfies `predicate`
pub async fn wait_for_state<T, P>(rx: &mut watch::Receiver<T>, predicate: P) -> T
where
    T: Clone,
    P: FnMut(&T) -> bool,
{
    match timeout(DEFAULT_TEST_TIMEOUT, rx.wait_for(predicate)).await {
        Ok(Ok(value)) => value.clone(),
        Ok(Err(_)) => panic!("watch sender dropped"),
        Err(_) => panic!("state not reached within {:?}", DEFAULT_TEST_TIMEOUT),
    }
}

/// Drain everything currently queued without waiting
pub fn try_drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut results = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        results.push(msg);
    }
    results
}

/// Assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}
