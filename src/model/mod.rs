//! # Property Graph Model
//!
//! Plain DTOs shared by the store, the event log and the synapse.
//! These types cross every boundary: store ↔ log ↔ impulse ↔ user.
//!
//! Design rule: no I/O and no async here. The only lock is the name
//! registry inside [`OneRef`].

pub mod node;
pub mod edge;
pub mod value;
pub mod property_map;
pub mod oneref;

pub use node::{Node, NodeId};
pub use edge::{Edge, EdgeId, Direction};
pub use value::{Value, ValueKind};
pub use property_map::PropertyMap;
pub use oneref::OneRef;

/// Property naming the identity key of a node or edge.
pub const FORM_PROP: &str = "form";
/// Edge property holding the source node id.
pub const NODE1_PROP: &str = "node1";
/// Edge property holding the destination node id.
pub const NODE2_PROP: &str = "node2";
