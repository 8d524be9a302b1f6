//! # Entity Store
//!
//! The in-memory property graph. Nodes and edges are *formed* rather than
//! inserted: a node is addressed by its `(form, formval)` pair and forming
//! the same pair twice yields the same node. Edges are addressed by
//! `(src, dst, form, formval)`.
//!
//! All mutations, index updates and event emission happen under the write
//! half of one `RwLock` per graph, so a reader never observes a property map
//! and its index out of step.
//!
//! ```rust
//! use cortex::{Graph, Value};
//!
//! # fn main() -> cortex::Result<()> {
//! let g = Graph::new();
//! let a = g.form_node("woot", 10)?;
//! let b = g.form_node("woot", 20)?;
//! g.form_edge(a.id, b.id, "foo", "bar")?;
//!
//! g.set_node_prop(a.id, "getme", 8)?;
//! g.set_node_prop(b.id, "getme", 8)?;
//! assert_eq!(g.get_nodes_by_prop("getme", Some(&Value::Int(8))).len(), 2);
//! # Ok(())
//! # }
//! ```

mod replay;
mod sync;

pub use sync::SyncHandle;

use std::io::Write;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::event::{EdgeDef, EventInfo, EventKind, EventOrigin, GraphEvent};
use crate::index::PropIndex;
use crate::model::*;
use crate::synapse::{ChanId, Impulse, Synapse};
use crate::{Error, Result};

type NoNodeCtor = fn(&mut NodeCtor<'_>) -> Result<()>;
type NoEdgeCtor = fn(&Node, &mut EdgeCtor<'_>, &Node) -> Result<()>;

/// Boxed sink receiving appended events.
pub type SaveSink = Box<dyn Write + Send + Sync>;

// ============================================================================
// Graph
// ============================================================================

pub struct Graph {
    inner: RwLock<GraphInner>,
    oneref: OneRef,
}

struct GraphInner {
    nodes: HashMap<NodeId, PropertyMap>,
    edges: HashMap<EdgeId, EdgeEntry>,
    /// form → formval → node
    form_nodes: HashMap<Arc<str>, HashMap<Value, NodeId>>,
    form_edges: HashMap<EdgeKey, EdgeId>,
    /// node → incident edges (both directions)
    adjacency: HashMap<NodeId, HashSet<EdgeId>>,
    nodes_by_prop: PropIndex<NodeId>,
    edges_by_prop: PropIndex<EdgeId>,
    hooks: EventHooks,
}

struct EdgeEntry {
    src: NodeId,
    dst: NodeId,
    properties: PropertyMap,
}

impl EdgeEntry {
    fn snapshot(&self, id: EdgeId) -> Edge {
        Edge::new(id, self.src, self.dst, self.properties.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    src: NodeId,
    dst: NodeId,
    form: Arc<str>,
    formval: Value,
}

#[derive(Default)]
struct EventHooks {
    save: Option<SaveSink>,
    sync: Option<SyncTarget>,
}

struct SyncTarget {
    synapse: Synapse,
    path: String,
    chan: ChanId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner {
                nodes: HashMap::new(),
                edges: HashMap::new(),
                form_nodes: HashMap::new(),
                form_edges: HashMap::new(),
                adjacency: HashMap::new(),
                nodes_by_prop: PropIndex::new(),
                edges_by_prop: PropIndex::new(),
                hooks: EventHooks::default(),
            }),
            oneref: OneRef::new(),
        }
    }

    /// The name registry shared by every property key in this graph.
    pub fn oneref(&self) -> &OneRef {
        &self.oneref
    }

    /// Drop every node and edge. Hooks stay attached; no events are emitted.
    pub fn wipe(&self) {
        let mut inner = self.inner.write();
        inner.nodes.clear();
        inner.edges.clear();
        inner.form_nodes.clear();
        inner.form_edges.clear();
        inner.adjacency.clear();
        inner.nodes_by_prop.clear();
        inner.edges_by_prop.clear();
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Add (or retrieve the existing) node for `(form, value)`.
    pub fn form_node(&self, form: &str, value: impl Into<Value>) -> Result<Node> {
        self.inner
            .write()
            .form_node(&self.oneref, form, value.into(), None::<NoNodeCtor>, EventOrigin::Local)
    }

    /// Like [`Graph::form_node`], running `ctor` only when the node is new.
    ///
    /// The ctor runs under the graph's write lock and must not call back
    /// into this `Graph`; use the [`NodeCtor`] it receives instead.
    ///
    /// ```rust
    /// # use cortex::Graph;
    /// # fn main() -> cortex::Result<()> {
    /// let g = Graph::new();
    /// let node = g.form_node_with("element", "au", |n| {
    ///     n.set_prop("foocount", 0)?;
    ///     Ok(())
    /// })?;
    /// assert_eq!(node.get("foocount").and_then(|v| v.as_int()), Some(0));
    /// # Ok(())
    /// # }
    /// ```
    pub fn form_node_with<F>(&self, form: &str, value: impl Into<Value>, ctor: F) -> Result<Node>
    where
        F: FnOnce(&mut NodeCtor<'_>) -> Result<()>,
    {
        self.inner
            .write()
            .form_node(&self.oneref, form, value.into(), Some(ctor), EventOrigin::Local)
    }

    pub fn get_node(&self, id: NodeId) -> Option<Node> {
        self.inner.read().node_snapshot(id)
    }

    pub fn get_node_by_form(&self, form: &str, value: impl Into<Value>) -> Option<Node> {
        let inner = self.inner.read();
        inner.find_node(form, &value.into()).and_then(|id| inner.node_snapshot(id))
    }

    /// Nodes whose `prop` equals `value`, or every node carrying `prop` at
    /// all when `value` is `None`.
    pub fn get_nodes_by_prop(&self, prop: &str, value: Option<&Value>) -> Vec<Node> {
        let inner = self.inner.read();
        inner
            .nodes_by_prop
            .lookup(prop, value)
            .into_iter()
            .filter_map(|id| inner.node_snapshot(id))
            .collect()
    }

    pub fn set_node_prop(&self, id: NodeId, prop: &str, value: impl Into<Value>) -> Result<Node> {
        self.inner
            .write()
            .set_node_prop(&self.oneref, id, prop, value.into(), EventOrigin::Local)
    }

    pub fn del_node_prop(&self, id: NodeId, prop: &str) -> Result<Node> {
        self.inner.write().del_node_prop(id, prop, EventOrigin::Local)
    }

    /// Delete a node and every edge touching it. Returns false if absent.
    pub fn del_node(&self, id: NodeId) -> Result<bool> {
        self.inner.write().del_node(id, EventOrigin::Local)
    }

    pub fn nodes(&self) -> Vec<Node> {
        let inner = self.inner.read();
        inner.nodes.keys().filter_map(|id| inner.node_snapshot(*id)).collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    // ========================================================================
    // Edges
    // ========================================================================

    /// Add (or retrieve the existing) edge `n1 -> n2` for `(form, value)`.
    ///
    /// Edges are unique per endpoint pair *and* form, not by form alone.
    pub fn form_edge(&self, n1: NodeId, n2: NodeId, form: &str, value: impl Into<Value>) -> Result<Edge> {
        self.inner.write().form_edge(
            &self.oneref,
            n1,
            n2,
            form,
            value.into(),
            None::<NoEdgeCtor>,
            EventOrigin::Local,
        )
    }

    /// Like [`Graph::form_edge`], running `ctor(node1, edge, node2)` only
    /// when the edge is new.
    pub fn form_edge_with<F>(
        &self,
        n1: NodeId,
        n2: NodeId,
        form: &str,
        value: impl Into<Value>,
        ctor: F,
    ) -> Result<Edge>
    where
        F: FnOnce(&Node, &mut EdgeCtor<'_>, &Node) -> Result<()>,
    {
        self.inner
            .write()
            .form_edge(&self.oneref, n1, n2, form, value.into(), Some(ctor), EventOrigin::Local)
    }

    pub fn get_edge(&self, id: EdgeId) -> Option<Edge> {
        self.inner.read().edge_snapshot(id)
    }

    pub fn get_edge_by_form(&self, n1: NodeId, n2: NodeId, form: &str, value: impl Into<Value>) -> Option<Edge> {
        let inner = self.inner.read();
        let key = EdgeKey { src: n1, dst: n2, form: Arc::from(form), formval: value.into() };
        inner.form_edges.get(&key).and_then(|id| inner.edge_snapshot(*id))
    }

    /// Edges incident to `node` in the given direction.
    pub fn get_edges(&self, node: NodeId, dir: Direction) -> Vec<Edge> {
        let inner = self.inner.read();
        let Some(incident) = inner.adjacency.get(&node) else { return Vec::new() };
        incident
            .iter()
            .filter_map(|id| inner.edge_snapshot(*id))
            .filter(|edge| match dir {
                Direction::Outgoing => edge.src == node,
                Direction::Incoming => edge.dst == node,
                Direction::Both => true,
            })
            .collect()
    }

    pub fn get_edges_by_prop(&self, prop: &str, value: Option<&Value>) -> Vec<Edge> {
        let inner = self.inner.read();
        inner
            .edges_by_prop
            .lookup(prop, value)
            .into_iter()
            .filter_map(|id| inner.edge_snapshot(id))
            .collect()
    }

    pub fn set_edge_prop(&self, id: EdgeId, prop: &str, value: impl Into<Value>) -> Result<Edge> {
        self.inner
            .write()
            .set_edge_prop(&self.oneref, id, prop, value.into(), EventOrigin::Local)
    }

    pub fn del_edge_prop(&self, id: EdgeId, prop: &str) -> Result<Edge> {
        self.inner.write().del_edge_prop(id, prop, EventOrigin::Local)
    }

    pub fn del_edge(&self, id: EdgeId) -> Result<bool> {
        self.inner.write().del_edge(id, EventOrigin::Local)
    }

    pub fn edges(&self) -> Vec<Edge> {
        let inner = self.inner.read();
        inner.edges.keys().filter_map(|id| inner.edge_snapshot(*id)).collect()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }

    // ========================================================================
    // Save sink
    // ========================================================================

    /// Append every event emitted from now on to `sink`.
    ///
    /// Must be attached *before* the changes you wish to capture; earlier
    /// events are not replayed into it.
    pub fn set_save_file<W>(&self, sink: W)
    where
        W: Write + Send + Sync + 'static,
    {
        self.inner.write().hooks.save = Some(Box::new(sink));
    }

    /// Detach the save sink, flushing it first.
    pub fn take_save_file(&self) -> Result<Option<SaveSink>> {
        let sink = self.inner.write().hooks.save.take();
        match sink {
            Some(mut sink) => {
                sink.flush()?;
                Ok(Some(sink))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// Constructor contexts
// ============================================================================

/// Handle given to a node ctor; mutates the freshly formed node.
pub struct NodeCtor<'a> {
    inner: &'a mut GraphInner,
    oneref: &'a OneRef,
    id: NodeId,
    origin: EventOrigin,
}

impl NodeCtor<'_> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node(&self) -> Option<Node> {
        self.inner.node_snapshot(self.id)
    }

    pub fn set_prop(&mut self, prop: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.inner.set_node_prop(self.oneref, self.id, prop, value.into(), self.origin)?;
        Ok(self)
    }
}

/// Handle given to an edge ctor; mutates the freshly formed edge.
pub struct EdgeCtor<'a> {
    inner: &'a mut GraphInner,
    oneref: &'a OneRef,
    id: EdgeId,
    origin: EventOrigin,
}

impl EdgeCtor<'_> {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn edge(&self) -> Option<Edge> {
        self.inner.edge_snapshot(self.id)
    }

    pub fn set_prop(&mut self, prop: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.inner.set_edge_prop(self.oneref, self.id, prop, value.into(), self.origin)?;
        Ok(self)
    }
}

// ============================================================================
// GraphInner: everything below runs under the write lock
// ============================================================================

fn not_found_node(id: NodeId) -> Error {
    Error::NotFound(format!("Node {id}"))
}

fn not_found_edge(id: EdgeId) -> Error {
    Error::NotFound(format!("Edge {id}"))
}

/// `(form, formval)` recorded in a property map.
fn identity(props: &PropertyMap) -> Option<(String, Value)> {
    let form = props.get(FORM_PROP)?.as_str()?;
    let formval = props.get(form)?.clone();
    Some((form.to_owned(), formval))
}

fn is_node_identity(prop: &str, form: &str) -> bool {
    prop == FORM_PROP || prop == form
}

fn is_edge_identity(prop: &str, form: &str) -> bool {
    prop == FORM_PROP || prop == NODE1_PROP || prop == NODE2_PROP || prop == form
}

fn check_storable(prop: &str, value: &Value) -> Result<()> {
    match value.storable_error() {
        Some(reason) => Err(Error::InvalidValue { prop: prop.to_owned(), reason }),
        None => Ok(()),
    }
}

fn check_form_name(form: &str, reserved: &[&str]) -> Result<()> {
    if form.is_empty() || reserved.contains(&form) {
        return Err(Error::ConstraintViolation(format!("{form:?} cannot be used as a form name")));
    }
    Ok(())
}

impl GraphInner {
    fn node_snapshot(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).map(|props| Node::new(id, props.clone()))
    }

    fn edge_snapshot(&self, id: EdgeId) -> Option<Edge> {
        self.edges.get(&id).map(|entry| entry.snapshot(id))
    }

    fn find_node(&self, form: &str, formval: &Value) -> Option<NodeId> {
        self.form_nodes.get(form).and_then(|vals| vals.get(formval)).copied()
    }

    fn node_identity(&self, id: NodeId) -> Result<(String, Value)> {
        let props = self.nodes.get(&id).ok_or_else(|| not_found_node(id))?;
        identity(props).ok_or_else(|| Error::ConstraintViolation(format!("Node {id} has no form")))
    }

    fn edgedef(&self, id: EdgeId) -> Result<EdgeDef> {
        let entry = self.edges.get(&id).ok_or_else(|| not_found_edge(id))?;
        let (form, formval) = identity(&entry.properties)
            .ok_or_else(|| Error::ConstraintViolation(format!("Edge {id} has no form")))?;
        let (node1form, node1formval) = self.node_identity(entry.src)?;
        let (node2form, node2formval) = self.node_identity(entry.dst)?;
        Ok(EdgeDef { node1form, node1formval, node2form, node2formval, form, formval })
    }

    /// Hand an event to the save sink and the synapse, as `origin` allows.
    ///
    /// A sink failure does not stop distribution; it is returned once the
    /// event has gone out.
    fn emit(&mut self, kind: EventKind, info: EventInfo, origin: EventOrigin) -> Result<()> {
        let event = GraphEvent::new(kind, info);

        let mut persisted = Ok(());
        if origin.persists() {
            if let Some(sink) = self.hooks.save.as_mut() {
                persisted = serde_cbor::to_writer(sink, &event).map_err(|e| Error::Encode(e.to_string()));
                if let Err(e) = &persisted {
                    warn!(event = %kind, error = %e, "graph event not persisted");
                }
            }
        }

        if origin.distributes() {
            if let Some(sync) = &self.hooks.sync {
                let imp = Impulse::new(sync.path.clone(), kind.tag(), event.info.to_value());
                if let Err(e) = sync.synapse.fire_syn_impulse(imp, Some(sync.chan)) {
                    warn!(event = %kind, error = %e, "graph event not distributed");
                }
            }
        }
        persisted
    }

    // ------------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------------

    fn form_node<F>(
        &mut self,
        oneref: &OneRef,
        form: &str,
        formval: Value,
        ctor: Option<F>,
        origin: EventOrigin,
    ) -> Result<Node>
    where
        F: FnOnce(&mut NodeCtor<'_>) -> Result<()>,
    {
        check_form_name(form, &[FORM_PROP])?;
        check_storable(form, &formval)?;

        if let Some(id) = self.find_node(form, &formval) {
            return self.node_snapshot(id).ok_or_else(|| not_found_node(id));
        }

        let form = oneref.intern(form);
        let form_prop = oneref.intern(FORM_PROP);
        let form_name = Value::String(form.to_string());
        let id = NodeId::random();

        let mut props = PropertyMap::new();
        props.insert(Arc::clone(&form_prop), form_name.clone());
        props.insert(Arc::clone(&form), formval.clone());
        self.nodes_by_prop.insert(&form_prop, &form_name, id);
        self.nodes_by_prop.insert(&form, &formval, id);
        self.nodes.insert(id, props);
        self.adjacency.insert(id, HashSet::new());
        self.form_nodes.entry(Arc::clone(&form)).or_default().insert(formval.clone(), id);

        debug!(node = %id, form = %form, "formed node");
        // the node exists now; a sink error must not skip its ctor
        let emitted = self.emit(EventKind::FormNode, EventInfo::node(&*form, formval), origin);

        if let Some(ctor) = ctor {
            let mut ctx = NodeCtor { inner: &mut *self, oneref, id, origin };
            ctor(&mut ctx)?;
        }
        emitted?;
        self.node_snapshot(id).ok_or_else(|| not_found_node(id))
    }

    fn set_node_prop(
        &mut self,
        oneref: &OneRef,
        id: NodeId,
        prop: &str,
        value: Value,
        origin: EventOrigin,
    ) -> Result<Node> {
        check_storable(prop, &value)?;
        let (form, formval) = self.node_identity(id)?;
        let props = self.nodes.get_mut(&id).ok_or_else(|| not_found_node(id))?;

        if props.get(prop) == Some(&value) {
            return Ok(Node::new(id, props.clone()));
        }
        if is_node_identity(prop, &form) {
            return Err(Error::ConstraintViolation(format!(
                "identity property {prop:?} of node {id} cannot change"
            )));
        }

        let key = oneref.intern(prop);
        let old = props.insert(Arc::clone(&key), value.clone());
        self.nodes_by_prop.replace(&key, old.as_ref(), &value, id);
        let node = Node::new(id, props.clone());

        let info = EventInfo::node(form, formval).with_prop(prop, old, Some(value));
        self.emit(EventKind::SetNodeProp, info, origin)?;
        Ok(node)
    }

    fn del_node_prop(&mut self, id: NodeId, prop: &str, origin: EventOrigin) -> Result<Node> {
        let (form, formval) = self.node_identity(id)?;
        if is_node_identity(prop, &form) {
            return Err(Error::ConstraintViolation(format!(
                "identity property {prop:?} of node {id} cannot be deleted"
            )));
        }
        let props = self.nodes.get_mut(&id).ok_or_else(|| not_found_node(id))?;
        let Some(old) = props.remove(prop) else {
            return Ok(Node::new(id, props.clone()));
        };
        self.nodes_by_prop.remove(prop, &old, id);
        let node = Node::new(id, props.clone());

        let info = EventInfo::node(form, formval).with_prop(prop, Some(old), None);
        self.emit(EventKind::DelNodeProp, info, origin)?;
        Ok(node)
    }

    fn del_node(&mut self, id: NodeId, origin: EventOrigin) -> Result<bool> {
        let Some((form, formval)) = self.nodes.get(&id).and_then(identity) else {
            return Ok(false);
        };

        let incident: Vec<EdgeId> = self
            .adjacency
            .get(&id)
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default();
        for edge in incident {
            self.del_edge(edge, origin)?;
        }

        let Some(props) = self.nodes.remove(&id) else { return Ok(false) };
        for (prop, value) in &props {
            self.nodes_by_prop.remove(prop, value, id);
        }
        let emptied = match self.form_nodes.get_mut(form.as_str()) {
            Some(vals) => {
                vals.remove(&formval);
                vals.is_empty()
            }
            None => false,
        };
        if emptied {
            self.form_nodes.remove(form.as_str());
        }
        self.adjacency.remove(&id);

        debug!(node = %id, form = %form, "deleted node");
        self.emit(EventKind::DelNode, EventInfo::node(form, formval), origin)?;
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn form_edge<F>(
        &mut self,
        oneref: &OneRef,
        n1: NodeId,
        n2: NodeId,
        form: &str,
        formval: Value,
        ctor: Option<F>,
        origin: EventOrigin,
    ) -> Result<Edge>
    where
        F: FnOnce(&Node, &mut EdgeCtor<'_>, &Node) -> Result<()>,
    {
        check_form_name(form, &[FORM_PROP, NODE1_PROP, NODE2_PROP])?;
        check_storable(form, &formval)?;
        let node1 = self.node_snapshot(n1).ok_or_else(|| Error::NotFound(format!("Source node {n1}")))?;
        let node2 = self.node_snapshot(n2).ok_or_else(|| Error::NotFound(format!("Target node {n2}")))?;

        let form = oneref.intern(form);
        let key = EdgeKey { src: n1, dst: n2, form: Arc::clone(&form), formval: formval.clone() };
        if let Some(id) = self.form_edges.get(&key).copied() {
            return self.edge_snapshot(id).ok_or_else(|| not_found_edge(id));
        }

        let id = EdgeId::random();
        let mut props = PropertyMap::new();
        props.insert(oneref.intern(FORM_PROP), Value::String(form.to_string()));
        props.insert(Arc::clone(&form), formval);
        props.insert(oneref.intern(NODE1_PROP), Value::String(n1.to_string()));
        props.insert(oneref.intern(NODE2_PROP), Value::String(n2.to_string()));
        for (prop, value) in &props {
            self.edges_by_prop.insert(prop, value, id);
        }
        self.edges.insert(id, EdgeEntry { src: n1, dst: n2, properties: props });
        self.form_edges.insert(key, id);
        self.adjacency.entry(n1).or_default().insert(id);
        self.adjacency.entry(n2).or_default().insert(id);

        debug!(edge = %id, form = %form, src = %n1, dst = %n2, "formed edge");
        let def = self.edgedef(id)?;
        let emitted = self.emit(EventKind::FormEdge, EventInfo::edge(def), origin);

        if let Some(ctor) = ctor {
            let mut ctx = EdgeCtor { inner: &mut *self, oneref, id, origin };
            ctor(&node1, &mut ctx, &node2)?;
        }
        emitted?;
        self.edge_snapshot(id).ok_or_else(|| not_found_edge(id))
    }

    fn set_edge_prop(
        &mut self,
        oneref: &OneRef,
        id: EdgeId,
        prop: &str,
        value: Value,
        origin: EventOrigin,
    ) -> Result<Edge> {
        check_storable(prop, &value)?;
        let def = self.edgedef(id)?;
        let entry = self.edges.get_mut(&id).ok_or_else(|| not_found_edge(id))?;

        if entry.properties.get(prop) == Some(&value) {
            return Ok(entry.snapshot(id));
        }
        if is_edge_identity(prop, &def.form) {
            return Err(Error::ConstraintViolation(format!(
                "identity property {prop:?} of edge {id} cannot change"
            )));
        }

        let key = oneref.intern(prop);
        let old = entry.properties.insert(Arc::clone(&key), value.clone());
        self.edges_by_prop.replace(&key, old.as_ref(), &value, id);
        let edge = entry.snapshot(id);

        let info = EventInfo::edge(def).with_prop(prop, old, Some(value));
        self.emit(EventKind::SetEdgeProp, info, origin)?;
        Ok(edge)
    }

    fn del_edge_prop(&mut self, id: EdgeId, prop: &str, origin: EventOrigin) -> Result<Edge> {
        let def = self.edgedef(id)?;
        if is_edge_identity(prop, &def.form) {
            return Err(Error::ConstraintViolation(format!(
                "identity property {prop:?} of edge {id} cannot be deleted"
            )));
        }
        let entry = self.edges.get_mut(&id).ok_or_else(|| not_found_edge(id))?;
        let Some(old) = entry.properties.remove(prop) else {
            return Ok(entry.snapshot(id));
        };
        self.edges_by_prop.remove(prop, &old, id);
        let edge = entry.snapshot(id);

        let info = EventInfo::edge(def).with_prop(prop, Some(old), None);
        self.emit(EventKind::DelEdgeProp, info, origin)?;
        Ok(edge)
    }

    fn del_edge(&mut self, id: EdgeId, origin: EventOrigin) -> Result<bool> {
        if !self.edges.contains_key(&id) {
            return Ok(false);
        }
        let def = self.edgedef(id)?;
        let Some(entry) = self.edges.remove(&id) else { return Ok(false) };

        for (prop, value) in &entry.properties {
            self.edges_by_prop.remove(prop, value, id);
        }
        let key = EdgeKey {
            src: entry.src,
            dst: entry.dst,
            form: Arc::from(def.form.as_str()),
            formval: def.formval.clone(),
        };
        self.form_edges.remove(&key);
        for end in [entry.src, entry.dst] {
            if let Some(incident) = self.adjacency.get_mut(&end) {
                incident.remove(&id);
            }
        }

        debug!(edge = %id, form = %def.form, "deleted edge");
        self.emit(EventKind::DelEdge, EventInfo::edge(def), origin)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_form_and_identity_props() {
        let g = Graph::new();
        let node = g.form_node("woot", 20).unwrap();
        assert_eq!(node.get("woot"), Some(&Value::Int(20)));
        assert_eq!(node.form(), Some("woot"));
        assert_eq!(node.formval(), Some(&Value::Int(20)));

        let again = g.form_node("woot", 20).unwrap();
        let other = g.form_node("woot", 30).unwrap();
        assert_eq!(node.id, again.id);
        assert_ne!(again.id, other.id);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_form_names_are_shared() {
        let g = Graph::new();
        let a = g.form_node("woot", 1).unwrap();
        let b = g.form_node(&String::from("woot"), 2).unwrap();
        let ka = a.properties.keys().find(|k| &***k == "woot").unwrap();
        let kb = b.properties.keys().find(|k| &***k == "woot").unwrap();
        assert!(Arc::ptr_eq(ka, kb));
    }

    #[test]
    fn test_identity_props_are_protected() {
        let g = Graph::new();
        let node = g.form_node("woot", 1).unwrap();
        assert!(matches!(g.set_node_prop(node.id, "woot", 2), Err(Error::ConstraintViolation(_))));
        assert!(matches!(g.set_node_prop(node.id, "form", "x"), Err(Error::ConstraintViolation(_))));
        assert!(matches!(g.del_node_prop(node.id, "form"), Err(Error::ConstraintViolation(_))));
        // setting to the current value is a no-op, not a violation
        assert!(g.set_node_prop(node.id, "woot", 1).is_ok());
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let g = Graph::new();
        let node = g.form_node("woot", 1).unwrap();
        let err = g.set_node_prop(node.id, "x", f64::NAN).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
        assert!(matches!(g.set_node_prop(node.id, "x", Value::Null), Err(Error::InvalidValue { .. })));
        assert!(matches!(g.form_node("woot", Value::Null), Err(Error::InvalidValue { .. })));
        assert!(g.get_node(node.id).unwrap().get("x").is_none());
    }

    #[test]
    fn test_unknown_ids() {
        let g = Graph::new();
        let ghost = NodeId::random();
        assert!(matches!(g.set_node_prop(ghost, "x", 1), Err(Error::NotFound(_))));
        let a = g.form_node("woot", 1).unwrap();
        assert!(matches!(g.form_edge(a.id, ghost, "foo", "bar"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_del_node_detaches_edges() {
        let g = Graph::new();
        let a = g.form_node("woot", 10).unwrap();
        let b = g.form_node("woot", 20).unwrap();
        let c = g.form_node("woot", 30).unwrap();
        g.form_edge(a.id, b.id, "foo", "bar").unwrap();
        let keep = g.form_edge(b.id, c.id, "foo", "baz").unwrap();
        g.set_node_prop(a.id, "getme", 8).unwrap();

        assert!(g.del_node(a.id).unwrap());
        assert!(!g.del_node(a.id).unwrap());
        assert_eq!(g.edge_count(), 1);
        assert!(g.get_node_by_form("woot", 10).is_none());
        assert!(g.get_nodes_by_prop("getme", None).is_empty());
        assert_eq!(g.get_edges(b.id, Direction::Both).len(), 1);
        assert_eq!(g.get_edges(b.id, Direction::Outgoing)[0].id, keep.id);
        assert!(g.get_edges(b.id, Direction::Incoming).is_empty());

        // the freed identity can be formed again
        let again = g.form_node("woot", 10).unwrap();
        assert_ne!(again.id, a.id);
    }

    #[test]
    fn test_edge_props_and_delete() {
        let g = Graph::new();
        let a = g.form_node("woot", 10).unwrap();
        let b = g.form_node("woot", 20).unwrap();
        let edge = g.form_edge(a.id, b.id, "foo", "bar").unwrap();
        assert_eq!(edge.get("node1"), Some(&Value::String(a.id.to_string())));
        assert_eq!(edge.get("node2"), Some(&Value::String(b.id.to_string())));
        assert!(matches!(g.set_edge_prop(edge.id, "node1", "x"), Err(Error::ConstraintViolation(_))));

        g.set_edge_prop(edge.id, "weight", 3).unwrap();
        assert_eq!(g.get_edges_by_prop("weight", Some(&Value::Int(3))).len(), 1);
        g.del_edge_prop(edge.id, "weight").unwrap();
        assert!(g.get_edges_by_prop("weight", None).is_empty());

        assert!(g.del_edge(edge.id).unwrap());
        assert!(g.get_edge_by_form(a.id, b.id, "foo", "bar").is_none());
        assert!(g.get_edges_by_prop("foo", None).is_empty());
        assert!(g.get_edges(a.id, Direction::Both).is_empty());
    }

    #[test]
    fn test_wipe() {
        let g = Graph::new();
        let a = g.form_node("woot", 10).unwrap();
        let b = g.form_node("woot", 20).unwrap();
        g.form_edge(a.id, b.id, "foo", "bar").unwrap();
        g.wipe();
        assert_eq!(g.node_count(), 0);
        assert_eq!(g.edge_count(), 0);
        assert!(g.get_nodes_by_prop("woot", None).is_empty());
        assert!(g.get_node_by_form("woot", 10).is_none());
    }
}
