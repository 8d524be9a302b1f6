//! PropertyMap: the key-value store on nodes and edges.

use std::collections::HashMap;
use std::sync::Arc;

use super::Value;

/// A map of property names to values.
///
/// Keys are shared `Arc<str>` handed out by the store's [`super::OneRef`]
/// registry, so a property name used on a million nodes is allocated once.
pub type PropertyMap = HashMap<Arc<str>, Value>;
