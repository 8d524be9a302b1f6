//! Realtime graph synchronization over a synapse.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Graph, SyncTarget};
use crate::synapse::{signalled, ChanId, Synapse};
use crate::{Error, Result};

/// A running graph ↔ synapse sync. Dropping the handle detaches the
/// outbound hook and stops the inbound task without waiting for it;
/// [`SyncHandle::stop`] also waits.
pub struct SyncHandle {
    graph: Arc<Graph>,
    chan: ChanId,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Graph {
    /// Use a synapse to synchronize realtime graph changes on `pathway`.
    ///
    /// Every local mutation is fired as an impulse on `pathway`; impulses
    /// arriving on `pathway` from anywhere else are applied as remote
    /// events (persisted if a save sink is attached, never refired by the
    /// graph). The graph's own impulses carry its channel id as `skip`,
    /// so they are not delivered back to it.
    pub fn sync_with_synapse(self: &Arc<Self>, synapse: &Synapse, pathway: &str) -> Result<SyncHandle> {
        let chan = synapse.init_syn_chan(&[pathway])?;
        let chan_id = chan.id();
        let pull_timeout = synapse.config().pull_timeout;

        let previous = self.inner.write().hooks.sync.replace(SyncTarget {
            synapse: synapse.clone(),
            path: pathway.to_owned(),
            chan: chan_id,
        });
        if let Some(previous) = previous {
            warn!(path = %previous.path, chan = %previous.chan, "replacing existing graph sync");
        }

        let (stop, mut stopped) = watch::channel(false);
        let graph = Arc::clone(self);
        let syn = synapse.clone();
        let path = pathway.to_owned();
        let task = synapse.runtime().spawn(async move {
            info!(path = %path, chan = %chan_id, "graph sync started");
            loop {
                let pulled = tokio::select! {
                    _ = signalled(&mut stopped) => break,
                    pulled = chan.recv_timeout(pull_timeout) => pulled,
                };
                match pulled {
                    Ok(imp) => {
                        if let Err(e) = graph.apply_impulse(&imp) {
                            warn!(impulse = %imp.id, evt = %imp.evt, error = %e, "skipping unappliable impulse");
                        }
                    }
                    Err(Error::ConsumerTimeout(_)) => continue,
                    Err(e) => {
                        debug!(path = %path, error = %e, "graph sync channel closed");
                        break;
                    }
                }
            }
            syn.fini_syn_chan(&chan);
            info!(path = %path, chan = %chan_id, "graph sync stopped");
        });

        Ok(SyncHandle { graph: Arc::clone(self), chan: chan_id, stop, task: Some(task) })
    }
}

impl SyncHandle {
    pub fn chan_id(&self) -> ChanId {
        self.chan
    }

    /// Stop syncing: detach the outbound hook and wait for the inbound task.
    pub async fn stop(mut self) {
        self.detach();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "graph sync task failed");
            }
        }
    }

    /// Clear the outbound hook unless a newer sync replaced it, and signal
    /// the inbound task.
    fn detach(&self) {
        {
            let mut inner = self.graph.inner.write();
            if inner.hooks.sync.as_ref().is_some_and(|sync| sync.chan == self.chan) {
                inner.hooks.sync = None;
            }
        }
        self.stop.send_replace(true);
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.detach();
        }
    }
}
