//! Event capability consumed by the evaluation core

use crate::value::Value;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type alias for IndexMap with FxBuildHasher for faster hashing of event fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared event reference. Rows, pattern bindings and aggregation states
/// all hold events through this handle, so an event is never deep-copied
/// once it enters the engine.
pub type EventRef = Arc<dyn EventBean>;

/// The only view of an event the core relies on.
///
/// An implementation answers named-property lookups and exposes the object
/// the event wraps, on which declared instance methods are invoked. How the
/// representation stores its fields is irrelevant to the core.
pub trait EventBean: Send + Sync + fmt::Debug {
    /// Name of the event type this event belongs to.
    fn event_type(&self) -> &str;

    /// Look up a property by name.
    fn get(&self, property: &str) -> Option<Value>;

    /// The object instance methods are invoked on.
    fn underlying(&self) -> &dyn Any;
}

/// Property-map-backed event
#[derive(Debug, Clone)]
pub struct MapEvent {
    /// Event type name (Arc<str> for O(1) clone instead of O(n) String clone)
    pub event_type: Arc<str>,
    /// Event payload
    pub data: FxIndexMap<String, Value>,
}

impl MapEvent {
    pub fn new(event_type: impl Into<Arc<str>>) -> Self {
        Self {
            event_type: event_type.into(),
            data: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    /// Creates a new event from a pre-built fields map.
    pub fn from_fields(event_type: impl Into<Arc<str>>, data: FxIndexMap<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }
}

impl EventBean for MapEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn get(&self, property: &str) -> Option<Value> {
        self.data.get(property).cloned()
    }

    fn underlying(&self) -> &dyn Any {
        &self.data
    }
}
