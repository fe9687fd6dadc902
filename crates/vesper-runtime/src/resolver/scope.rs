//! The streams and names visible to one expression at bind time.

use rustc_hash::FxHashMap;
use vesper_core::{Type, TypeRegistry};

/// One alias visible in a row
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBinding {
    pub alias: String,
    pub event_type: String,
    /// Position of this stream's value in the row
    pub slot: usize,
    /// Bound to a sequence of events (a tag under a repetition)
    pub indexed: bool,
}

impl StreamBinding {
    /// Declared type of the row value at this slot.
    pub fn slot_type(&self) -> Type {
        let event = Type::event(self.event_type.clone());
        if self.indexed {
            Type::array_of(event)
        } else {
            event
        }
    }
}

/// Static shapes of every stream in a row, plus the registry to resolve
/// their members against.
#[derive(Debug, Clone)]
pub struct StreamShapes<'a> {
    registry: &'a TypeRegistry,
    streams: Vec<StreamBinding>,
    default_stream: Option<usize>,
    aggregates: FxHashMap<String, (usize, Type)>,
}

impl<'a> StreamShapes<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            streams: Vec::new(),
            default_stream: None,
            aggregates: FxHashMap::default(),
        }
    }

    /// Add a single-event stream at the next free slot.
    pub fn stream(self, alias: impl Into<String>, event_type: impl Into<String>) -> Self {
        let slot = self.streams.len();
        self.stream_at(alias, event_type, slot, false)
    }

    /// Add a sequence-valued stream at the next free slot.
    pub fn indexed_stream(self, alias: impl Into<String>, event_type: impl Into<String>) -> Self {
        let slot = self.streams.len();
        self.stream_at(alias, event_type, slot, true)
    }

    pub fn stream_at(
        mut self,
        alias: impl Into<String>,
        event_type: impl Into<String>,
        slot: usize,
        indexed: bool,
    ) -> Self {
        self.streams.push(StreamBinding {
            alias: alias.into(),
            event_type: event_type.into(),
            slot,
            indexed,
        });
        self
    }

    /// Unqualified property names resolve against the stream at `slot`.
    pub fn with_default_stream(mut self, slot: usize) -> Self {
        self.default_stream = Some(slot);
        self
    }

    /// Expose an aggregation result computed elsewhere under its canonical
    /// text, e.g. `sum(price)`.
    pub fn with_aggregate(mut self, text: impl Into<String>, slot: usize, ty: Type) -> Self {
        self.aggregates.insert(text.into(), (slot, ty));
        self
    }

    pub fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }

    pub fn streams(&self) -> &[StreamBinding] {
        &self.streams
    }

    pub fn find_alias(&self, alias: &str) -> Option<&StreamBinding> {
        self.streams.iter().find(|s| s.alias == alias)
    }

    pub fn by_slot(&self, slot: usize) -> Option<&StreamBinding> {
        self.streams.iter().find(|s| s.slot == slot)
    }

    /// The stream unqualified names bind to: the declared default, or the
    /// only stream when there is exactly one.
    pub fn default_stream(&self) -> Option<&StreamBinding> {
        match self.default_stream {
            Some(slot) => self.by_slot(slot),
            None if self.streams.len() == 1 => self.streams.first(),
            None => None,
        }
    }

    pub fn aggregate(&self, text: &str) -> Option<&(usize, Type)> {
        self.aggregates.get(text)
    }

    /// Slots of every stream, in slot order.
    pub fn stream_slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.streams.iter().map(|s| s.slot).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Names a bare identifier could have meant, for diagnostics.
    pub fn root_candidates(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.streams.iter().map(|s| s.alias.as_str()).collect();
        if let Some(shape) = self
            .default_stream()
            .and_then(|s| self.registry.class(&s.event_type))
        {
            names.extend(shape.member_names());
        }
        names
    }
}
