//! Type definitions for the statement runtime

use crate::aggregation::{AggregationHandler, StatementInstanceId};
use crate::error::{EvaluationFault, StatementError};
use crate::pattern::CompiledPattern;
use crate::resolver::BoundNode;
use indexmap::IndexMap;
use std::sync::Arc;
use vesper_core::Value;

// =============================================================================
// Public Types (exported from crate)
// =============================================================================

/// One output row, columns in select-list order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputRow {
    pub columns: IndexMap<String, Value>,
}

impl OutputRow {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// What one statement produced for one event or clock advance
#[derive(Debug, Clone)]
pub struct StatementOutput {
    pub statement: StatementInstanceId,
    pub name: Option<String>,
    pub rows: Vec<OutputRow>,
    /// Faults that suppressed a row
    pub faults: Vec<EvaluationFault>,
    /// Set when the statement was stopped while handling this input
    pub error: Option<StatementError>,
}

impl StatementOutput {
    pub(crate) fn new(statement: StatementInstanceId, name: Option<String>) -> Self {
        Self {
            statement,
            name,
            rows: Vec::new(),
            faults: Vec::new(),
            error: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.faults.is_empty() && self.error.is_none()
    }
}

// =============================================================================
// Internal Types
// =============================================================================

pub(crate) enum CompiledSource {
    Stream {
        event_type: String,
        window: Option<usize>,
    },
    Pattern(Arc<CompiledPattern>),
    /// Left stream at slot 0, right stream at slot 1
    Join {
        left: JoinSide,
        right: JoinSide,
        outer: bool,
        on: Option<BoundNode>,
    },
}

/// One joined stream and how many of its events stay joinable
pub(crate) struct JoinSide {
    pub event_type: String,
    pub retain: Option<usize>,
}

/// An aggregation occurrence and the row slot its value is exposed at
pub(crate) struct AggregateSlot {
    pub text: String,
    pub handler: AggregationHandler,
    pub slot: usize,
}

pub(crate) struct OutputColumn {
    pub name: String,
    pub node: BoundNode,
}

/// A statement bound against its streams and aggregation functions
pub(crate) struct CompiledStatement {
    pub name: Option<String>,
    pub source: CompiledSource,
    /// Width of the row before aggregation values are appended
    pub base_width: usize,
    pub aggregates: Vec<AggregateSlot>,
    /// Index of the first occurrence of each distinct state key; rows are
    /// entered once per shared state
    pub distinct_states: Vec<usize>,
    pub where_clause: Option<BoundNode>,
    pub group_by: Vec<BoundNode>,
    pub columns: Vec<OutputColumn>,
}

impl CompiledStatement {
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn window(&self) -> Option<usize> {
        match self.source {
            CompiledSource::Stream { window, .. } => window,
            CompiledSource::Pattern(_) | CompiledSource::Join { .. } => None,
        }
    }
}
