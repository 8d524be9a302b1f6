//! # cortex: In-Memory Property Graph with Event Distribution
//!
//! Nodes and edges are *formed* from an identity key rather than inserted,
//! every mutation is an event, and events can be persisted to a log or
//! distributed to other processes over a synapse.
//!
//! ## Design Principles
//!
//! 1. **Identity by form**: `(form, formval)` names a node; forming it twice returns the same node
//! 2. **Events are the truth**: the log replays into an isomorphic graph
//! 3. **One lock per store**: a reader never sees a property map and its index disagree
//! 4. **Producers never block**: firing an impulse only enqueues it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cortex::{Graph, Synapse, Value};
//!
//! # async fn example() -> cortex::Result<()> {
//! let graph = Arc::new(Graph::new());
//! let synapse = Synapse::with_defaults()?;
//! let sync = graph.sync_with_synapse(&synapse, "cortex")?;
//!
//! let ada = graph.form_node("person", "ada")?;
//! graph.set_node_prop(ada.id, "born", 1815)?;
//! assert_eq!(graph.get_nodes_by_prop("born", Some(&Value::Int(1815))).len(), 1);
//!
//! sync.stop().await;
//! synapse.fini_synapse().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `model` | DTOs: `Node`, `Edge`, `Value`, name interning |
//! | `index` | Property value → id indices |
//! | `event` | Graph events and their log encoding |
//! | `graph` | The entity store, event log replay, synapse sync |
//! | `synapse` | Impulse window, channels, dispatcher, peer links |

use std::time::Duration;

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod index;
pub mod event;
pub mod graph;
pub mod synapse;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Node, Edge, Value, ValueKind, PropertyMap,
    NodeId, EdgeId, Direction, OneRef,
};

// ============================================================================
// Re-exports: Store and events
// ============================================================================

pub use graph::{Graph, NodeCtor, EdgeCtor, SaveSink, SyncHandle};
pub use event::{GraphEvent, EventKind, EventInfo, EdgeDef, EventOrigin};

// ============================================================================
// Re-exports: Distribution
// ============================================================================

pub use synapse::{
    Synapse, SynapseConfig, Channel, Impulse, ImpulseId,
    ChanId, ImpulseWindow, Peer, LinkState,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {prop:?}: {reason}")]
    InvalidValue { prop: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Corrupt event log at byte {offset}: {message}")]
    Decode { offset: usize, message: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("No impulse within {0:?}")]
    ConsumerTimeout(Duration),

    #[error("Channel {0} abandoned")]
    PeerAbandoned(String),

    #[error("Synapse is shutting down")]
    ShutdownInProgress,

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
