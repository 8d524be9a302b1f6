//! Event log: snapshot, load and replay.
//!
//! The log is a plain concatenation of CBOR-encoded [`GraphEvent`]
//! records. A snapshot is just the events that would rebuild the graph
//! from empty; an incremental log is whatever [`Graph::set_save_file`]
//! captured. Both load the same way.

use std::io::{Read, Write};

use serde::Deserialize;
use tracing::debug;

use super::{identity, is_edge_identity, is_node_identity, EdgeKey, Graph, GraphInner, NoEdgeCtor, NoNodeCtor};
use crate::event::{EdgeDef, EventInfo, EventKind, EventOrigin, GraphEvent};
use crate::model::{EdgeId, NodeId, OneRef, Value};
use crate::synapse::Impulse;
use crate::{Error, Result};

impl Graph {
    /// Serialize a fresh copy of the entire graph into `writer` as events.
    ///
    /// For every node: `formnode`, then one `setnodeprop` per
    /// non-identity property. Then the same for every edge. Returns the
    /// number of records written.
    pub fn save_to_file<W: Write>(&self, mut writer: W) -> Result<usize> {
        let inner = self.inner.read();
        let mut written = 0;

        for props in inner.nodes.values() {
            let Some((form, formval)) = identity(props) else { continue };
            let base = EventInfo::node(form.as_str(), formval);
            write_event(&mut writer, EventKind::FormNode, base.clone())?;
            written += 1;
            for (prop, value) in props.iter().filter(|(prop, _)| !is_node_identity(prop, &form)) {
                let info = base.clone().with_prop(&**prop, None, Some(value.clone()));
                write_event(&mut writer, EventKind::SetNodeProp, info)?;
                written += 1;
            }
        }

        for (id, entry) in &inner.edges {
            let def = inner.edgedef(*id)?;
            let form = def.form.clone();
            let base = EventInfo::edge(def);
            write_event(&mut writer, EventKind::FormEdge, base.clone())?;
            written += 1;
            for (prop, value) in entry.properties.iter().filter(|(prop, _)| !is_edge_identity(prop, &form)) {
                let info = base.clone().with_prop(&**prop, None, Some(value.clone()));
                write_event(&mut writer, EventKind::SetEdgeProp, info)?;
                written += 1;
            }
        }

        writer.flush()?;
        debug!(records = written, nodes = inner.nodes.len(), edges = inner.edges.len(), "saved graph");
        Ok(written)
    }

    /// Replay every event in `reader` into this graph.
    ///
    /// Replayed events are neither appended to the save sink nor
    /// distributed. The first record that fails to decode or apply aborts
    /// the load with [`Error::Decode`] carrying its byte offset; records
    /// before it stay applied. Returns the number of records applied.
    pub fn load_from_file<R: Read>(&self, mut reader: R) -> Result<usize> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let mut de = serde_cbor::Deserializer::from_slice(&bytes);
        let mut applied = 0;
        loop {
            let offset = de.byte_offset();
            if offset >= bytes.len() {
                break;
            }
            let event = GraphEvent::deserialize(&mut de)
                .map_err(|e| Error::Decode { offset, message: e.to_string() })?;
            self.apply_event(&event, EventOrigin::Replay).map_err(|e| Error::Decode {
                offset,
                message: format!("{} record could not be applied: {e}", event.kind),
            })?;
            applied += 1;
        }

        debug!(records = applied, bytes = bytes.len(), "loaded graph events");
        Ok(applied)
    }

    /// Apply one event through the regular mutation path.
    ///
    /// Formation events are create-or-get and property events are no-ops
    /// when the value already matches, so applying the same event twice
    /// leaves the graph as applying it once.
    pub fn apply_event(&self, event: &GraphEvent, origin: EventOrigin) -> Result<()> {
        self.inner.write().apply(&self.oneref, event, origin)
    }

    /// Decode an impulse carrying a graph event and apply it as remote.
    pub fn apply_impulse(&self, imp: &Impulse) -> Result<()> {
        let kind = EventKind::from_tag(&imp.evt)
            .ok_or_else(|| Error::InvalidEvent(format!("unknown event kind {:?}", imp.evt)))?;
        let info = EventInfo::from_value(&imp.info)?;
        self.apply_event(&GraphEvent::new(kind, info), EventOrigin::Remote)
    }
}

fn write_event<W: Write>(writer: &mut W, kind: EventKind, info: EventInfo) -> Result<()> {
    serde_cbor::to_writer(&mut *writer, &GraphEvent::new(kind, info)).map_err(|e| Error::Encode(e.to_string()))
}

impl GraphInner {
    fn apply(&mut self, oneref: &OneRef, event: &GraphEvent, origin: EventOrigin) -> Result<()> {
        let info = &event.info;
        match event.kind {
            EventKind::FormNode => {
                let (form, formval) = info.require_form()?;
                self.resolve_node(oneref, form, formval, origin)?;
            }
            EventKind::DelNode => {
                let (form, formval) = info.require_form()?;
                if let Some(id) = self.find_node(form, formval) {
                    self.del_node(id, origin)?;
                }
            }
            EventKind::SetNodeProp => {
                let (form, formval) = info.require_form()?;
                let id = self.resolve_node(oneref, form, formval, origin)?;
                self.set_node_prop(oneref, id, info.require_prop()?, info.require_newval()?.clone(), origin)?;
            }
            EventKind::DelNodeProp => {
                let (form, formval) = info.require_form()?;
                if let Some(id) = self.find_node(form, formval) {
                    self.del_node_prop(id, info.require_prop()?, origin)?;
                }
            }
            EventKind::FormEdge => {
                self.resolve_edge(oneref, info.require_edgedef()?, origin)?;
            }
            EventKind::DelEdge => {
                if let Some(id) = self.find_edge(info.require_edgedef()?) {
                    self.del_edge(id, origin)?;
                }
            }
            EventKind::SetEdgeProp => {
                let id = self.resolve_edge(oneref, info.require_edgedef()?, origin)?;
                self.set_edge_prop(oneref, id, info.require_prop()?, info.require_newval()?.clone(), origin)?;
            }
            EventKind::DelEdgeProp => {
                if let Some(id) = self.find_edge(info.require_edgedef()?) {
                    self.del_edge_prop(id, info.require_prop()?, origin)?;
                }
            }
        }
        Ok(())
    }

    fn resolve_node(&mut self, oneref: &OneRef, form: &str, formval: &Value, origin: EventOrigin) -> Result<NodeId> {
        let node = self.form_node(oneref, form, formval.clone(), None::<NoNodeCtor>, origin)?;
        Ok(node.id)
    }

    fn resolve_edge(&mut self, oneref: &OneRef, def: &EdgeDef, origin: EventOrigin) -> Result<EdgeId> {
        let n1 = self.resolve_node(oneref, &def.node1form, &def.node1formval, origin)?;
        let n2 = self.resolve_node(oneref, &def.node2form, &def.node2formval, origin)?;
        let edge = self.form_edge(oneref, n1, n2, &def.form, def.formval.clone(), None::<NoEdgeCtor>, origin)?;
        Ok(edge.id)
    }

    fn find_edge(&self, def: &EdgeDef) -> Option<EdgeId> {
        let src = self.find_node(&def.node1form, &def.node1formval)?;
        let dst = self.find_node(&def.node2form, &def.node2formval)?;
        let key = EdgeKey { src, dst, form: def.form.as_str().into(), formval: def.formval.clone() };
        self.form_edges.get(&key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn seeded() -> Graph {
        let g = Graph::new();
        let a = g.form_node("woot", 10).unwrap();
        let b = g.form_node("woot", 20).unwrap();
        g.set_node_prop(a.id, "getme", 8).unwrap();
        g.set_node_prop(b.id, "getme", 8).unwrap();
        let e = g.form_edge(a.id, b.id, "foo", "bar").unwrap();
        g.set_edge_prop(e.id, "lala", "blahblah").unwrap();
        g
    }

    #[test]
    fn test_snapshot_record_count() {
        let g = seeded();
        let mut buf = Vec::new();
        // 2 formnode + 2 setnodeprop + 1 formedge + 1 setedgeprop
        assert_eq!(g.save_to_file(&mut buf).unwrap(), 6);
    }

    #[test]
    fn test_snapshot_reload() {
        let g = seeded();
        let mut buf = Vec::new();
        g.save_to_file(&mut buf).unwrap();

        let h = Graph::new();
        assert_eq!(h.load_from_file(buf.as_slice()).unwrap(), 6);
        assert_eq!(h.node_count(), 2);
        assert_eq!(h.edge_count(), 1);

        let a = h.get_node_by_form("woot", 10).unwrap();
        let b = h.get_node_by_form("woot", 20).unwrap();
        assert_eq!(a.get("getme"), Some(&Value::Int(8)));
        let edges = h.get_edges(a.id, Direction::Outgoing);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dst, b.id);
        assert_eq!(edges[0].get("lala"), Some(&Value::from("blahblah")));
    }

    #[test]
    fn test_corrupt_record_reports_offset() {
        let g = seeded();
        let mut buf = Vec::new();
        g.save_to_file(&mut buf).unwrap();
        let first_len = {
            let mut de = serde_cbor::Deserializer::from_slice(&buf);
            GraphEvent::deserialize(&mut de).unwrap();
            de.byte_offset()
        };
        buf.truncate(first_len + 3);

        let h = Graph::new();
        match h.load_from_file(buf.as_slice()) {
            Err(Error::Decode { offset, .. }) => assert_eq!(offset, first_len),
            other => panic!("expected decode error, got {other:?}"),
        }
        // the intact first record was applied
        assert_eq!(h.node_count(), 1);
    }

    #[test]
    fn test_unreplayable_record_is_a_decode_error() {
        let mut buf = Vec::new();
        serde_cbor::to_writer(&mut buf, &GraphEvent::new(EventKind::SetNodeProp, EventInfo::default())).unwrap();
        let err = Graph::new().load_from_file(buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Decode { offset: 0, .. }), "{err}");
    }

    #[test]
    fn test_apply_impulse_rejects_unknown_kind() {
        let g = Graph::new();
        let imp = Impulse::new("p", "explode", EventInfo::default().to_value());
        assert!(matches!(g.apply_impulse(&imp), Err(Error::InvalidEvent(_))));
    }
}
