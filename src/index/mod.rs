//! Secondary property indices.
//!
//! `PropIndex` maps property name → value → set of entity ids. The graph
//! keeps one for nodes and one for edges and updates them under the same
//! write lock as the property maps they mirror.

use std::hash::Hash;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::model::Value;

#[derive(Debug)]
pub struct PropIndex<Id> {
    by_prop: HashMap<Arc<str>, HashMap<Value, HashSet<Id>>>,
}

impl<Id> Default for PropIndex<Id> {
    fn default() -> Self {
        Self { by_prop: HashMap::new() }
    }
}

impl<Id: Copy + Eq + Hash> PropIndex<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prop: &Arc<str>, value: &Value, id: Id) {
        self.by_prop
            .entry(Arc::clone(prop))
            .or_default()
            .entry(value.clone())
            .or_default()
            .insert(id);
    }

    /// Drop `id` from `index[prop][value]`, pruning emptied buckets.
    pub fn remove(&mut self, prop: &str, value: &Value, id: Id) {
        let Some(values) = self.by_prop.get_mut(prop) else { return };
        if let Some(ids) = values.get_mut(value) {
            ids.remove(&id);
            if ids.is_empty() {
                values.remove(value);
            }
        }
        if values.is_empty() {
            self.by_prop.remove(prop);
        }
    }

    /// Move `id` from `old` (if any) to `new` within one property.
    pub fn replace(&mut self, prop: &Arc<str>, old: Option<&Value>, new: &Value, id: Id) {
        if let Some(old) = old {
            self.remove(prop, old, id);
        }
        self.insert(prop, new, id);
    }

    /// Ids holding exactly `value` for `prop`, or every id holding any value
    /// for `prop` when `value` is `None`.
    pub fn lookup(&self, prop: &str, value: Option<&Value>) -> Vec<Id> {
        let Some(values) = self.by_prop.get(prop) else { return Vec::new() };
        match value {
            Some(value) => values
                .get(value)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            None => values.values().flat_map(|ids| ids.iter().copied()).collect(),
        }
    }

    pub fn contains(&self, prop: &str, value: &Value, id: Id) -> bool {
        self.by_prop
            .get(prop)
            .and_then(|values| values.get(value))
            .is_some_and(|ids| ids.contains(&id))
    }

    pub fn clear(&mut self) {
        self.by_prop.clear();
    }
}
