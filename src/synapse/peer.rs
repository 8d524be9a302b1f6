//! Peer links between synapses.
//!
//! A link pulls every pathway from a remote synapse through a channel it
//! opens there, and refires what it pulls into the local synapse with the
//! remote channel id as `skip`. Since the local dispatcher forwards to each
//! link with that link's remote channel as `skip`, the remote side never
//! gets an impulse back on the link it arrived through; the impulse
//! window drops anything that still comes around.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{signalled, ChanId, Impulse, Synapse};
use crate::{Error, Result};

/// Back-off after a failed pull that was not an abandonment.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// The remote surface a peer link needs. Implemented by [`Synapse`]
/// itself, so two in-process synapses can be linked directly; a network
/// transport implements it for the far end of a connection.
#[async_trait]
pub trait Peer: Send + Sync + 'static {
    /// Open a channel by id. `None` subscribes to every pathway.
    async fn init_syn_chan_id(&self, paths: Option<Vec<String>>) -> Result<ChanId>;

    /// Pull a batch from the channel. An empty batch means nothing arrived
    /// within `timeout`; `Error::PeerAbandoned` means the channel is gone.
    async fn iter_syn_chan_id(&self, chan: ChanId, timeout: Duration) -> Result<Vec<Impulse>>;

    async fn fini_syn_chan_id(&self, chan: ChanId) -> Result<()>;

    /// Fire an impulse. Ok(false) when the remote already saw it.
    async fn fire_syn_impulse(&self, imp: Impulse, skip: Option<ChanId>) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Opening the remote channel.
    Init,
    /// Pulling from and forwarding to the remote.
    Active,
    /// The remote dropped our channel; about to re-init.
    Abandoned,
    Shutdown,
}

pub(crate) struct PeerLink {
    pub(crate) remote: Arc<dyn Peer>,
    chan: Mutex<Option<ChanId>>,
    state: Mutex<LinkState>,
}

impl PeerLink {
    pub(crate) fn new(remote: Arc<dyn Peer>) -> Self {
        Self { remote, chan: Mutex::new(None), state: Mutex::new(LinkState::Init) }
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// The remote channel id, while the link is active.
    pub(crate) fn active_chan(&self) -> Option<ChanId> {
        match self.state() {
            LinkState::Active => *self.chan.lock(),
            _ => None,
        }
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    fn set_chan(&self, chan: Option<ChanId>) {
        *self.chan.lock() = chan;
    }
}

/// Drive one link until shutdown.
pub(crate) async fn run_peer_link(
    local: Synapse,
    link: Arc<PeerLink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pull_timeout = local.config().pull_timeout;
    info!("peer link started");

    'link: loop {
        link.set_state(LinkState::Init);
        link.set_chan(None);

        let opened = tokio::select! {
            biased;
            _ = signalled(&mut shutdown) => break 'link,
            opened = link.remote.init_syn_chan_id(None) => opened,
        };
        let chan = match opened {
            Ok(chan) => chan,
            Err(Error::ShutdownInProgress) => break 'link,
            Err(e) => {
                warn!(error = %e, "peer link could not open remote channel");
                if sleep_or_shutdown(&mut shutdown, RETRY_DELAY).await {
                    break 'link;
                }
                continue 'link;
            }
        };
        link.set_chan(Some(chan));
        link.set_state(LinkState::Active);
        debug!(chan = %chan, "peer link active");

        loop {
            let pulled = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break 'link,
                pulled = link.remote.iter_syn_chan_id(chan, pull_timeout) => pulled,
            };
            match pulled {
                Ok(batch) => {
                    for imp in batch {
                        match local.fire_syn_impulse(imp, Some(chan)) {
                            Ok(_) => {}
                            Err(Error::ShutdownInProgress) => break 'link,
                            Err(e) => warn!(error = %e, "peer link could not refire impulse"),
                        }
                    }
                }
                Err(Error::PeerAbandoned(_)) => {
                    // impulses queued between abandonment and re-init are lost
                    warn!(chan = %chan, "remote abandoned peer link channel, re-initializing");
                    link.set_state(LinkState::Abandoned);
                    link.set_chan(None);
                    continue 'link;
                }
                Err(Error::ShutdownInProgress) => break 'link,
                Err(e) => {
                    warn!(chan = %chan, error = %e, "peer link pull failed");
                    if sleep_or_shutdown(&mut shutdown, RETRY_DELAY).await {
                        break 'link;
                    }
                }
            }
        }
    }

    let chan = link.chan.lock().take();
    link.set_state(LinkState::Shutdown);
    if let Some(chan) = chan {
        if let Err(e) = link.remote.fini_syn_chan_id(chan).await {
            debug!(chan = %chan, error = %e, "could not close remote channel");
        }
    }
    info!("peer link stopped");
}

/// Sleep for `delay`; true if shutdown was signalled first.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = signalled(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
