//! Graph mutation events.
//!
//! Every change to a [`crate::Graph`] is described by one `GraphEvent`:
//! an [`EventKind`] tag plus an [`EventInfo`] payload carrying enough to
//! replay the change deterministically against a store that shares no ids
//! with the one that produced it. Nodes are addressed by `(form, formval)`
//! and edges by their [`EdgeDef`].
//!
//! On the wire an event is a two-element sequence `(tag, payload-map)`;
//! an `EdgeDef` is a six-element sequence.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Value;
use crate::{Error, Result};

// ============================================================================
// Event kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    FormNode,
    DelNode,
    SetNodeProp,
    DelNodeProp,
    FormEdge,
    DelEdge,
    SetEdgeProp,
    DelEdgeProp,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::FormNode,
        EventKind::DelNode,
        EventKind::SetNodeProp,
        EventKind::DelNodeProp,
        EventKind::FormEdge,
        EventKind::DelEdge,
        EventKind::SetEdgeProp,
        EventKind::DelEdgeProp,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::FormNode => "formnode",
            EventKind::DelNode => "delnode",
            EventKind::SetNodeProp => "setnodeprop",
            EventKind::DelNodeProp => "delnodeprop",
            EventKind::FormEdge => "formedge",
            EventKind::DelEdge => "deledge",
            EventKind::SetEdgeProp => "setedgeprop",
            EventKind::DelEdgeProp => "deledgeprop",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ============================================================================
// Event origin
// ============================================================================

/// Where a mutation came from; decides which outbound hooks see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// A direct API call. Appended to the save sink and distributed.
    Local,
    /// An impulse received through a synapse. Appended, never redistributed.
    Remote,
    /// Replay of a saved log. Neither appended nor distributed.
    Replay,
}

impl EventOrigin {
    pub fn persists(&self) -> bool {
        !matches!(self, EventOrigin::Replay)
    }

    pub fn distributes(&self) -> bool {
        matches!(self, EventOrigin::Local)
    }
}

// ============================================================================
// Edge definition
// ============================================================================

/// Endpoint-independent address of an edge: both endpoint forms plus the
/// edge's own form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "EdgeDefTuple", into = "EdgeDefTuple")]
pub struct EdgeDef {
    pub node1form: String,
    pub node1formval: Value,
    pub node2form: String,
    pub node2formval: Value,
    pub form: String,
    pub formval: Value,
}

type EdgeDefTuple = (String, Value, String, Value, String, Value);

impl From<EdgeDefTuple> for EdgeDef {
    fn from((node1form, node1formval, node2form, node2formval, form, formval): EdgeDefTuple) -> Self {
        Self { node1form, node1formval, node2form, node2formval, form, formval }
    }
}

impl From<EdgeDef> for EdgeDefTuple {
    fn from(def: EdgeDef) -> Self {
        (def.node1form, def.node1formval, def.node2form, def.node2formval, def.form, def.formval)
    }
}

impl EdgeDef {
    fn to_value(&self) -> Value {
        Value::List(vec![
            Value::String(self.node1form.clone()),
            self.node1formval.clone(),
            Value::String(self.node2form.clone()),
            self.node2formval.clone(),
            Value::String(self.form.clone()),
            self.formval.clone(),
        ])
    }

    fn from_value(value: &Value) -> Result<Self> {
        let bad = || Error::InvalidEvent(format!("edgedef must be a 6-element list, got {value}"));
        let items = value.as_list().ok_or_else(bad)?;
        let [n1f, n1v, n2f, n2v, f, v] = items else { return Err(bad()) };
        let name = |v: &Value| v.as_str().map(str::to_owned).ok_or_else(bad);
        Ok(Self {
            node1form: name(n1f)?,
            node1formval: n1v.clone(),
            node2form: name(n2f)?,
            node2formval: n2v.clone(),
            form: name(f)?,
            formval: v.clone(),
        })
    }
}

// ============================================================================
// Event payload
// ============================================================================

/// Payload of an event. Which fields are present depends on the kind:
///
/// | kind | fields |
/// |------|--------|
/// | `formnode`, `delnode` | form, formval |
/// | `setnodeprop` | form, formval, prop, oldval, newval |
/// | `delnodeprop` | form, formval, prop, oldval |
/// | `formedge`, `deledge` | edgedef |
/// | `setedgeprop` | edgedef, prop, oldval, newval |
/// | `deledgeprop` | edgedef, prop, oldval |
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formval: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edgedef: Option<EdgeDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldval: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newval: Option<Value>,
}

impl EventInfo {
    pub fn node(form: impl Into<String>, formval: Value) -> Self {
        Self { form: Some(form.into()), formval: Some(formval), ..Self::default() }
    }

    pub fn edge(edgedef: EdgeDef) -> Self {
        Self { edgedef: Some(edgedef), ..Self::default() }
    }

    pub fn with_prop(mut self, prop: impl Into<String>, oldval: Option<Value>, newval: Option<Value>) -> Self {
        self.prop = Some(prop.into());
        self.oldval = oldval;
        self.newval = newval;
        self
    }

    pub fn require_form(&self) -> Result<(&str, &Value)> {
        match (&self.form, &self.formval) {
            (Some(form), Some(formval)) => Ok((form, formval)),
            _ => Err(missing("form/formval")),
        }
    }

    pub fn require_edgedef(&self) -> Result<&EdgeDef> {
        self.edgedef.as_ref().ok_or_else(|| missing("edgedef"))
    }

    pub fn require_prop(&self) -> Result<&str> {
        self.prop.as_deref().ok_or_else(|| missing("prop"))
    }

    pub fn require_newval(&self) -> Result<&Value> {
        self.newval.as_ref().ok_or_else(|| missing("newval"))
    }

    /// Payload as a map value, the shape impulses carry.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        if let Some(form) = &self.form {
            map.insert("form".to_string(), Value::String(form.clone()));
        }
        if let Some(formval) = &self.formval {
            map.insert("formval".to_string(), formval.clone());
        }
        if let Some(edgedef) = &self.edgedef {
            map.insert("edgedef".to_string(), edgedef.to_value());
        }
        if let Some(prop) = &self.prop {
            map.insert("prop".to_string(), Value::String(prop.clone()));
        }
        if let Some(oldval) = &self.oldval {
            map.insert("oldval".to_string(), oldval.clone());
        }
        if let Some(newval) = &self.newval {
            map.insert("newval".to_string(), newval.clone());
        }
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::InvalidEvent(format!("payload must be a map, got {}", value.kind())))?;
        let text = |key: &str| -> Result<Option<String>> {
            match map.get(key) {
                None => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(Error::InvalidEvent(format!("{key} must be a string, got {}", other.kind()))),
            }
        };
        Ok(Self {
            form: text("form")?,
            formval: map.get("formval").cloned(),
            edgedef: map.get("edgedef").map(EdgeDef::from_value).transpose()?,
            prop: text("prop")?,
            oldval: map.get("oldval").cloned(),
            newval: map.get("newval").cloned(),
        })
    }
}

fn missing(field: &str) -> Error {
    Error::InvalidEvent(format!("missing required field: {field}"))
}

// ============================================================================
// GraphEvent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(EventKind, EventInfo)", into = "(EventKind, EventInfo)")]
pub struct GraphEvent {
    pub kind: EventKind,
    pub info: EventInfo,
}

impl GraphEvent {
    pub fn new(kind: EventKind, info: EventInfo) -> Self {
        Self { kind, info }
    }
}

impl From<(EventKind, EventInfo)> for GraphEvent {
    fn from((kind, info): (EventKind, EventInfo)) -> Self {
        Self { kind, info }
    }
}

impl From<GraphEvent> for (EventKind, EventInfo) {
    fn from(event: GraphEvent) -> Self {
        (event.kind, event.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_edgedef() -> EdgeDef {
        EdgeDef {
            node1form: "woot".into(),
            node1formval: Value::Int(10),
            node2form: "woot".into(),
            node2formval: Value::Int(20),
            form: "foo".into(),
            formval: Value::from("bar"),
        }
    }

    #[test]
    fn test_tags_match_serde_names() {
        for kind in EventKind::ALL {
            let encoded = serde_cbor::to_vec(&kind).unwrap();
            let tag: String = serde_cbor::from_slice(&encoded).unwrap();
            assert_eq!(tag, kind.tag());
            assert_eq!(EventKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(EventKind::from_tag("nope"), None);
    }

    #[test]
    fn test_event_is_a_pair_on_the_wire() {
        let event = GraphEvent::new(
            EventKind::SetEdgeProp,
            EventInfo::edge(sample_edgedef()).with_prop("getme", None, Some(Value::Int(8))),
        );
        let bytes = serde_cbor::to_vec(&event).unwrap();

        let raw: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        let serde_cbor::Value::Array(items) = raw else { panic!("expected array") };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], serde_cbor::Value::Text("setedgeprop".into()));

        let back: GraphEvent = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_payload_value_conversion() {
        let info = EventInfo::node("woot", Value::Int(10))
            .with_prop("getme", Some(Value::Int(1)), Some(Value::Int(8)));
        assert_eq!(EventInfo::from_value(&info.to_value()).unwrap(), info);

        let info = EventInfo::edge(sample_edgedef());
        assert_eq!(EventInfo::from_value(&info.to_value()).unwrap(), info);
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let info = EventInfo::default();
        assert!(matches!(info.require_form(), Err(Error::InvalidEvent(_))));
        assert!(matches!(info.require_edgedef(), Err(Error::InvalidEvent(_))));
        let err = EventInfo::from_value(&Value::Int(3)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid event: payload must be a map, got int");
    }
}
