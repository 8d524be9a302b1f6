//! A fixed size window of recently seen impulse ids.
//!
//! The window is the synapse's loop breaker: an id already inside it is
//! refused, so an impulse bouncing between linked synapses dies on its
//! second visit. Eviction is strict FIFO by insertion; lookups do not
//! refresh an entry.

use std::collections::VecDeque;

use hashbrown::HashSet;
use parking_lot::Mutex;

use super::ImpulseId;
use crate::{Error, Result};

pub struct ImpulseWindow {
    inner: Mutex<WindowInner>,
    max_size: usize,
}

struct WindowInner {
    has: HashSet<ImpulseId>,
    que: VecDeque<ImpulseId>,
}

impl WindowInner {
    fn push(&mut self, id: ImpulseId) -> bool {
        if !self.has.insert(id) {
            return false;
        }
        self.que.push_back(id);
        true
    }

    fn evict_to(&mut self, max_size: usize) {
        while self.que.len() > max_size {
            if let Some(old) = self.que.pop_front() {
                self.has.remove(&old);
            }
        }
    }
}

impl ImpulseWindow {
    pub fn new(max_size: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(Error::Config("impulse window size must be at least 1".into()));
        }
        Ok(Self {
            inner: Mutex::new(WindowInner {
                has: HashSet::with_capacity(max_size.min(4096)),
                que: VecDeque::with_capacity(max_size.min(4096)),
            }),
            max_size,
        })
    }

    /// Record `id`. Returns false, changing nothing, if it is already in
    /// the window.
    pub fn append(&self, id: ImpulseId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.push(id) {
            return false;
        }
        inner.evict_to(self.max_size);
        true
    }

    /// Record a batch under one lock acquisition. Ids already present
    /// (or repeated within the batch) are skipped. Returns how many were
    /// new.
    pub fn extend<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = ImpulseId>,
    {
        let mut inner = self.inner.lock();
        let added = ids.into_iter().filter(|id| inner.push(*id)).count();
        inner.evict_to(self.max_size);
        added
    }

    pub fn contains(&self, id: &ImpulseId) -> bool {
        self.inner.lock().has.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().que.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Ids currently held, oldest first.
    pub fn ids(&self) -> Vec<ImpulseId> {
        self.inner.lock().que.iter().copied().collect()
    }
}
