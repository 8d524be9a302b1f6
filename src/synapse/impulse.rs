//! Impulses: the routed unit of distribution.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Value;

/// Globally unique impulse identifier (random 128-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImpulseId(pub Uuid);

impl ImpulseId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ImpulseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Channel identifier. Also names a peer link: a link is known by the id
/// of the channel it pulls from on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChanId(pub Uuid);

impl ChanId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// An event flowing through the synapse, routed by `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impulse {
    pub id: ImpulseId,
    /// Pathway (topic) the impulse is delivered on.
    pub path: String,
    /// Event name.
    pub evt: String,
    /// Event payload.
    pub info: Value,
}

impl Impulse {
    /// A new impulse with a fresh id.
    pub fn new(path: impl Into<String>, evt: impl Into<String>, info: Value) -> Self {
        Self { id: ImpulseId::random(), path: path.into(), evt: evt.into(), info }
    }
}
