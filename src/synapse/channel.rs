//! Channels: a consumer's inbound impulse queue.
//!
//! A [`Channel`] is owned by exactly one consumer. Pathways never hold a
//! channel itself, only a `Weak` to its [`ChanQueue`], so dropping the
//! channel is enough to stop delivery to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{signalled, ChanId, Impulse};
use crate::{Error, Result};

/// The sending half of a channel, as seen by the dispatcher.
pub(crate) struct ChanQueue {
    pub(crate) id: ChanId,
    tx: mpsc::UnboundedSender<Impulse>,
}

impl ChanQueue {
    /// Queue an impulse. False if the receiving side is gone.
    pub(crate) fn deliver(&self, imp: Impulse) -> bool {
        self.tx.send(imp).is_ok()
    }
}

pub struct Channel {
    queue: Arc<ChanQueue>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Impulse>>,
    paths: Mutex<HashSet<String>>,
    last_pull: Mutex<Instant>,
    /// Pulls waiting on or holding the receiver.
    pulling: AtomicUsize,
    shutdown: watch::Receiver<bool>,
}

/// Marks a pull in flight; stamps `last_pull` when it ends.
struct PullGuard<'a>(&'a Channel);

impl<'a> PullGuard<'a> {
    fn new(chan: &'a Channel) -> Self {
        chan.pulling.fetch_add(1, Ordering::AcqRel);
        *chan.last_pull.lock() = Instant::now();
        Self(chan)
    }
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        *self.0.last_pull.lock() = Instant::now();
        self.0.pulling.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Channel {
    pub(crate) fn new(shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            queue: Arc::new(ChanQueue { id: ChanId::random(), tx }),
            rx: tokio::sync::Mutex::new(rx),
            paths: Mutex::new(HashSet::new()),
            last_pull: Mutex::new(Instant::now()),
            pulling: AtomicUsize::new(0),
            shutdown,
        }
    }

    pub fn id(&self) -> ChanId {
        self.queue.id
    }

    /// Pathways this channel is currently joined to.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().iter().cloned().collect()
    }

    pub fn is_joined(&self, path: &str) -> bool {
        self.paths.lock().contains(path)
    }

    pub(crate) fn queue(&self) -> &Arc<ChanQueue> {
        &self.queue
    }

    /// Record membership; false if already joined.
    pub(crate) fn join(&self, path: &str) -> bool {
        self.paths.lock().insert(path.to_owned())
    }

    pub(crate) fn leave(&self, path: &str) -> bool {
        self.paths.lock().remove(path)
    }

    pub(crate) fn last_pull(&self) -> Instant {
        *self.last_pull.lock()
    }

    /// True while a consumer is inside `recv_timeout` or `next_batch`.
    pub(crate) fn is_pulling(&self) -> bool {
        self.pulling.load(Ordering::Acquire) > 0
    }

    /// Idle for longer than `limit` with no pull in flight.
    pub(crate) fn idle_longer_than(&self, now: Instant, limit: Duration) -> bool {
        !self.is_pulling() && now.saturating_duration_since(self.last_pull()) > limit
    }

    /// Wait up to `timeout` for the next impulse.
    ///
    /// `Error::ConsumerTimeout` when nothing arrived in time (retry);
    /// `Error::ShutdownInProgress` once the owning synapse is shut down.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Impulse> {
        let _pull = PullGuard::new(self);
        let mut rx = self.rx.lock().await;
        self.recv_locked(&mut rx, timeout).await
    }

    /// Wait up to `timeout` for at least one impulse, then take everything
    /// already queued. An empty batch means no data within the timeout.
    pub async fn next_batch(&self, timeout: Duration) -> Result<Vec<Impulse>> {
        let _pull = PullGuard::new(self);
        let mut rx = self.rx.lock().await;
        let first = match self.recv_locked(&mut rx, timeout).await {
            Ok(imp) => imp,
            Err(Error::ConsumerTimeout(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut batch = vec![first];
        while let Ok(imp) = rx.try_recv() {
            batch.push(imp);
        }
        Ok(batch)
    }

    async fn recv_locked(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Impulse>,
        timeout: Duration,
    ) -> Result<Impulse> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = signalled(&mut shutdown) => Err(Error::ShutdownInProgress),
            imp = rx.recv() => imp.ok_or(Error::ShutdownInProgress),
            _ = tokio::time::sleep(timeout) => Err(Error::ConsumerTimeout(timeout)),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("paths", &self.paths())
            .finish()
    }
}
