//! Node in the property graph.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PropertyMap, Value, FORM_PROP};

/// Opaque node identifier (random 128-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Snapshot of a node as stored in a [`crate::Graph`].
///
/// Snapshots are detached copies: mutate through the graph, not through
/// this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub properties: PropertyMap,
}

impl Node {
    pub fn new(id: NodeId, properties: PropertyMap) -> Self {
        Self { id, properties }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Name of the identity property.
    pub fn form(&self) -> Option<&str> {
        self.properties.get(FORM_PROP).and_then(Value::as_str)
    }

    /// Value of the identity property.
    pub fn formval(&self) -> Option<&Value> {
        self.form().and_then(|form| self.properties.get(form))
    }
}
