//! Edge in the property graph.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{NodeId, PropertyMap, Value, FORM_PROP};

/// Opaque edge identifier (random 128-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Snapshot of a directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub src: NodeId,
    pub dst: NodeId,
    pub properties: PropertyMap,
}

impl Edge {
    pub fn new(id: EdgeId, src: NodeId, dst: NodeId, properties: PropertyMap) -> Self {
        Self { id, src, dst, properties }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn form(&self) -> Option<&str> {
        self.properties.get(FORM_PROP).and_then(Value::as_str)
    }

    pub fn formval(&self) -> Option<&Value> {
        self.form().and_then(|form| self.properties.get(form))
    }
}
