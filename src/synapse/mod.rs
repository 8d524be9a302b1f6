//! Synapse: pathway-routed impulse distribution.
//!
//! Producers fire impulses into an unbounded work queue and never block.
//! A single dispatcher task drains the queue, delivering each impulse to
//! the channels joined to its pathway and forwarding it to every linked
//! peer. The [`ImpulseWindow`] refuses ids it has already seen, which is
//! what keeps impulses from looping forever between linked synapses.
//!
//! ```no_run
//! # async fn demo() -> cortex::Result<()> {
//! use std::time::Duration;
//! use cortex::{Synapse, Value};
//!
//! let syn = Synapse::with_defaults()?;
//! let chan = syn.init_syn_chan(&["woot"])?;
//! syn.new_syn_impulse("woot", "hehe", Value::from(10))?;
//! let imp = chan.recv_timeout(Duration::from_secs(1)).await?;
//! assert_eq!(imp.evt, "hehe");
//! syn.fini_synapse().await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod impulse;
mod peer;
mod window;

pub use channel::Channel;
pub use impulse::{ChanId, Impulse, ImpulseId};
pub use peer::{LinkState, Peer};
pub use window::ImpulseWindow;

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use channel::ChanQueue;
use peer::{run_peer_link, PeerLink};

use crate::model::Value;
use crate::{Error, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Synapse tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynapseConfig {
    /// Number of recent impulse ids remembered for loop prevention.
    pub window_size: usize,
    /// How long one pull (local channel or peer link) waits for data.
    pub pull_timeout: Duration,
    /// An id-registered channel not pulled for this long is dropped.
    pub abandon_after: Duration,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            window_size: 100_000,
            pull_timeout: Duration::from_secs(4),
            abandon_after: Duration::from_secs(60),
        }
    }
}

impl SynapseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Config("window_size must be at least 1".into()));
        }
        if self.pull_timeout.is_zero() {
            return Err(Error::Config("pull_timeout must be non-zero".into()));
        }
        if self.abandon_after <= self.pull_timeout {
            return Err(Error::Config(format!(
                "abandon_after ({:?}) must exceed pull_timeout ({:?})",
                self.abandon_after, self.pull_timeout
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

type Subscribers = SmallVec<[Weak<ChanQueue>; 4]>;

/// Routing state shared by the public handle and the dispatcher task.
struct Registry {
    config: SynapseConfig,
    /// pathway → weak subscriber queues
    paths: Mutex<HashMap<String, Subscribers>>,
    /// Channels that receive every pathway.
    taps: Mutex<Subscribers>,
    /// Channels owned by the synapse on behalf of id-based consumers.
    chans: Mutex<HashMap<ChanId, Arc<Channel>>>,
    peers: Mutex<Vec<Arc<PeerLink>>>,
}

impl Registry {
    fn join(&self, path: &str, chan: &Channel) {
        if chan.join(path) {
            self.paths
                .lock()
                .entry(path.to_owned())
                .or_default()
                .push(Arc::downgrade(chan.queue()));
        }
    }

    fn leave(&self, path: &str, chan: &Channel) {
        if !chan.leave(path) {
            return;
        }
        let mut paths = self.paths.lock();
        if let Some(subs) = paths.get_mut(path) {
            subs.retain(|sub| sub.upgrade().is_some_and(|q| q.id != chan.id()));
            if subs.is_empty() {
                paths.remove(path);
            }
        }
    }

    fn forget(&self, chan: &Channel) {
        for path in chan.paths() {
            self.leave(&path, chan);
        }
        let id = chan.id();
        self.taps.lock().retain(|sub| sub.upgrade().is_some_and(|q| q.id != id));
    }

    /// Live subscribers for `path`, pruning dead entries on the way.
    fn targets(&self, path: &str) -> Vec<Arc<ChanQueue>> {
        let mut out = Vec::new();
        {
            let mut paths = self.paths.lock();
            if let Some(subs) = paths.get_mut(path) {
                subs.retain(|sub| match sub.upgrade() {
                    Some(q) => {
                        out.push(q);
                        true
                    }
                    None => false,
                });
                if subs.is_empty() {
                    paths.remove(path);
                }
            }
        }
        self.taps.lock().retain(|sub| match sub.upgrade() {
            Some(q) => {
                out.push(q);
                true
            }
            None => false,
        });
        out
    }

    fn deliver(&self, imp: &Impulse, skip: Option<ChanId>) -> usize {
        let mut delivered = 0;
        for queue in self.targets(&imp.path) {
            if Some(queue.id) == skip {
                continue;
            }
            if queue.deliver(imp.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop id-registered channels nobody has pulled from recently.
    fn reap_abandoned(&self, now: Instant) {
        let stale: Vec<Arc<Channel>> = {
            let mut chans = self.chans.lock();
            let ids: Vec<ChanId> = chans
                .iter()
                .filter(|(_, chan)| chan.idle_longer_than(now, self.config.abandon_after))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| chans.remove(id)).collect()
        };
        for chan in stale {
            warn!(chan = %chan.id(), "abandoning channel that stopped pulling");
            self.forget(&chan);
        }
    }
}

// ============================================================================
// Synapse
// ============================================================================

/// Handle to a synapse. Clones share the same dispatcher.
///
/// Must be created inside a tokio runtime. Call [`Synapse::fini_synapse`]
/// to stop the dispatcher and every peer link.
#[derive(Clone)]
pub struct Synapse {
    inner: Arc<SynapseInner>,
}

struct SynapseInner {
    runtime: tokio::runtime::Handle,
    window: ImpulseWindow,
    fireq: mpsc::UnboundedSender<(Impulse, Option<ChanId>)>,
    registry: Arc<Registry>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    isshut: Mutex<bool>,
}

impl Synapse {
    pub fn new(config: SynapseConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("synapse requires a tokio runtime: {e}")))?;

        let window = ImpulseWindow::new(config.window_size)?;
        let (fireq, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(Registry {
            config,
            paths: Mutex::new(HashMap::new()),
            taps: Mutex::new(SmallVec::new()),
            chans: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
        });

        let dispatcher = runtime.spawn(dispatch(Arc::clone(&registry), rx, shutdown_rx));
        debug!(window = registry.config.window_size, "synapse started");

        Ok(Self {
            inner: Arc::new(SynapseInner {
                runtime,
                window,
                fireq,
                registry,
                dispatcher: Mutex::new(Some(dispatcher)),
                links: Mutex::new(Vec::new()),
                shutdown,
                isshut: Mutex::new(false),
            }),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(SynapseConfig::default())
    }

    pub fn config(&self) -> &SynapseConfig {
        &self.inner.registry.config
    }

    /// The runtime the synapse was created on; its tasks run there.
    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.inner.runtime
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.isshut.lock()
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    /// Fire an impulse into the synapse.
    ///
    /// Returns `Ok(false)` without enqueueing when the impulse id is still
    /// in the window. The channel `skip` (if any) is left out of delivery.
    pub fn fire_syn_impulse(&self, imp: Impulse, skip: Option<ChanId>) -> Result<bool> {
        self.check_running()?;
        if !self.inner.window.append(imp.id) {
            return Ok(false);
        }
        self.inner.fireq.send((imp, skip)).map_err(|_| Error::ShutdownInProgress)?;
        Ok(true)
    }

    /// Fire a new impulse on `path`, returning its id.
    pub fn new_syn_impulse(&self, path: &str, evt: &str, info: Value) -> Result<ImpulseId> {
        let imp = Impulse::new(path, evt, info);
        let id = imp.id;
        self.fire_syn_impulse(imp, None)?;
        Ok(id)
    }

    /// Open a channel owned by the caller, joined to `paths`.
    ///
    /// Pathways only hold the channel weakly: dropping it unsubscribes.
    pub fn init_syn_chan(&self, paths: &[&str]) -> Result<Channel> {
        self.check_running()?;
        let chan = Channel::new(self.inner.shutdown.subscribe());
        for path in paths {
            self.inner.registry.join(path, &chan);
        }
        Ok(chan)
    }

    /// Join `chan` to `path`. Joining twice is a no-op.
    pub fn init_syn_path(&self, path: &str, chan: &Channel) -> Result<()> {
        self.check_running()?;
        self.inner.registry.join(path, chan);
        Ok(())
    }

    pub fn fini_syn_path(&self, path: &str, chan: &Channel) {
        self.inner.registry.leave(path, chan);
    }

    /// Leave every pathway `chan` is joined to.
    pub fn fini_syn_chan(&self, chan: &Channel) {
        self.inner.registry.forget(chan);
    }

    /// Open a synapse-owned channel and return its id. With `None` the
    /// channel receives every pathway.
    pub fn init_syn_chan_id(&self, paths: Option<Vec<String>>) -> Result<ChanId> {
        self.check_running()?;
        let registry = &self.inner.registry;
        let chan = Arc::new(Channel::new(self.inner.shutdown.subscribe()));
        match paths {
            Some(paths) => {
                for path in &paths {
                    registry.join(path, &chan);
                }
            }
            None => registry.taps.lock().push(Arc::downgrade(chan.queue())),
        }
        let id = chan.id();
        registry.chans.lock().insert(id, chan);
        debug!(chan = %id, "opened channel by id");
        Ok(id)
    }

    /// Pull the next batch from a synapse-owned channel.
    ///
    /// An empty batch means nothing arrived within `timeout`.
    /// `Error::PeerAbandoned` means the channel is unknown, closed, or was
    /// reaped for not being pulled.
    pub async fn iter_syn_chan_id(&self, id: ChanId, timeout: Duration) -> Result<Vec<Impulse>> {
        self.check_running()?;
        let chan = self
            .inner
            .registry
            .chans
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::PeerAbandoned(id.to_string()))?;
        chan.next_batch(timeout).await
    }

    pub fn fini_syn_chan_id(&self, id: ChanId) {
        let removed = self.inner.registry.chans.lock().remove(&id);
        if let Some(chan) = removed {
            self.inner.registry.forget(&chan);
            debug!(chan = %id, "closed channel by id");
        }
    }

    /// Link a remote peer: pull everything it distributes and forward
    /// everything fired here to it.
    pub fn fire_syn_peer(&self, remote: Arc<dyn Peer>) -> Result<()> {
        // hold the shutdown flag so fini_synapse cannot miss this link
        let isshut = self.inner.isshut.lock();
        if *isshut {
            return Err(Error::ShutdownInProgress);
        }
        let link = Arc::new(PeerLink::new(remote));
        self.inner.registry.peers.lock().push(Arc::clone(&link));
        let task = self.inner.runtime.spawn(run_peer_link(self.clone(), link, self.inner.shutdown.subscribe()));
        self.inner.links.lock().push(task);
        Ok(())
    }

    /// States of every peer link, in link order.
    pub fn peer_states(&self) -> Vec<LinkState> {
        self.inner.registry.peers.lock().iter().map(|link| link.state()).collect()
    }

    /// Number of pathways with at least one subscriber entry.
    pub fn pathway_count(&self) -> usize {
        self.inner.registry.paths.lock().len()
    }

    /// Shut down: reject new calls, stop the dispatcher and peer links,
    /// and drop whatever is still queued. Safe to call more than once.
    pub async fn fini_synapse(&self) -> Result<()> {
        {
            let mut isshut = self.inner.isshut.lock();
            if *isshut {
                return Ok(());
            }
            *isshut = true;
        }

        let registry = &self.inner.registry;
        for link in registry.peers.lock().iter() {
            link.set_state(LinkState::Shutdown);
        }
        self.inner.shutdown.send_replace(true);

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            if let Err(e) = task.await {
                warn!(error = %e, "synapse dispatcher failed");
            }
        }
        let links: Vec<JoinHandle<()>> = self.inner.links.lock().drain(..).collect();
        for task in links {
            if let Err(e) = task.await {
                warn!(error = %e, "peer link task failed");
            }
        }

        registry.chans.lock().clear();
        registry.paths.lock().clear();
        registry.taps.lock().clear();
        registry.peers.lock().clear();
        info!("synapse shut down");
        Ok(())
    }
}

/// Resolves once `flag` is set or its sender is gone.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

/// The dispatcher: sole consumer of the work queue.
async fn dispatch(
    registry: Arc<Registry>,
    mut fireq: mpsc::UnboundedReceiver<(Impulse, Option<ChanId>)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reap = tokio::time::interval(registry.config.pull_timeout);
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut forward_stop = shutdown.clone();
    loop {
        tokio::select! {
            biased;
            _ = signalled(&mut shutdown) => break,
            next = fireq.recv() => {
                let Some((imp, skip)) = next else { break };
                let delivered = registry.deliver(&imp, skip);
                debug!(impulse = %imp.id, path = %imp.path, delivered, "dispatched impulse");
                if !forward_to_peers(&registry, &imp, skip, &mut forward_stop).await {
                    break;
                }
            }
            _ = reap.tick() => registry.reap_abandoned(Instant::now()),
        }
    }

    fireq.close();
    let mut dropped = 0usize;
    while fireq.try_recv().is_ok() {
        dropped += 1;
    }
    debug!(dropped, "dispatcher stopped");
}

/// Forward to every active peer except the one the impulse came from.
/// False if shutdown interrupted forwarding.
async fn forward_to_peers(
    registry: &Registry,
    imp: &Impulse,
    skip: Option<ChanId>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let links: Vec<Arc<PeerLink>> = registry.peers.lock().clone();
    for link in links {
        let Some(chan) = link.active_chan() else { continue };
        if Some(chan) == skip {
            continue;
        }
        let sent = tokio::select! {
            biased;
            _ = signalled(shutdown) => return false,
            sent = link.remote.fire_syn_impulse(imp.clone(), Some(chan)) => sent,
        };
        if let Err(e) = sent {
            warn!(impulse = %imp.id, chan = %chan, error = %e, "failed to forward impulse to peer");
        }
    }
    true
}

#[async_trait]
impl Peer for Synapse {
    async fn init_syn_chan_id(&self, paths: Option<Vec<String>>) -> Result<ChanId> {
        Synapse::init_syn_chan_id(self, paths)
    }

    async fn iter_syn_chan_id(&self, chan: ChanId, timeout: Duration) -> Result<Vec<Impulse>> {
        Synapse::iter_syn_chan_id(self, chan, timeout).await
    }

    async fn fini_syn_chan_id(&self, chan: ChanId) -> Result<()> {
        Synapse::fini_syn_chan_id(self, chan);
        Ok(())
    }

    async fn fire_syn_impulse(&self, imp: Impulse, skip: Option<ChanId>) -> Result<bool> {
        Synapse::fire_syn_impulse(self, imp, skip)
    }
}

impl std::fmt::Debug for Synapse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synapse")
            .field("config", self.config())
            .field("window", &self.inner.window.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
