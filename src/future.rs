//! Async plumbing shared by the stores and trackers.
//!
//! Channel-backed streams and task helpers that keep the public surface free
//! of boxed futures: events travel over bounded channels, background work is
//! spawned with its errors logged, and debounced operations cancel the
//! previous pending timer before scheduling the next.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;

/// Lock a mutex, recovering the inner state if a panicking holder poisoned
/// it. All critical sections in this crate are short and leave the state
/// consistent at every await-free step.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A stream of events backed by a bounded channel.
///
/// The sending half lives with whoever produces the events (a gateway's
/// realtime transport, or a test driving the feed by hand); dropping every
/// sender ends the stream.
pub struct ChangeStream<T> {
    receiver: mpsc::Receiver<T>,
    _task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> ChangeStream<T> {
    /// Wrap an existing receiver.
    pub fn from_receiver(receiver: mpsc::Receiver<T>) -> Self {
        Self { receiver, _task: None }
    }

    /// Create a stream fed by a spawned producer task. The task is detached
    /// when the stream is dropped; it notices via the closed channel.
    pub fn spawn<F>(capacity: usize, producer: impl FnOnce(mpsc::Sender<T>) -> F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity);
        let task = tokio::spawn(producer(sender));
        Self { receiver, _task: Some(task) }
    }

    /// Receive the next event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

impl<T: Send + 'static> Stream for ChangeStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Spawn a best-effort task whose failure is logged and swallowed.
///
/// Used for the fire-and-forget side effects (presence heartbeat after a
/// fetch, remote read-cursor sync) that must never fail the primary
/// operation.
pub fn spawn_logged<F>(context: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            warn!("{context}: {err}");
        }
    })
}

/// A single-slot debounce timer.
///
/// Scheduling a new operation aborts the previous pending one, so only the
/// last operation inside the window runs.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, pending: Mutex::new(None) }
    }

    /// Schedule `operation` to run after the debounce delay, cancelling any
    /// previously scheduled operation.
    pub fn run<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            operation.await;
        });

        if let Some(previous) = lock(&self.pending).replace(task) {
            previous.abort();
        }
    }

    /// Cancel the pending operation, if any.
    pub fn cancel(&self) {
        if let Some(previous) = lock(&self.pending).take() {
            previous.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
