//! Aggregation state and its plugin contract.
//!
//! An aggregation function occurrence is bound once, at statement
//! activation, into an [`AggregationHandler`]: a [`StateKey`] deciding which
//! occurrences share state, a factory creating that state per group, an
//! accessor reading it, and the declared result type. The
//! [`AggregationStateRegistry`] owns every live state, keyed by
//! (statement instance, group key, state key).
//!
//! # State sharing
//!
//! Two occurrences share one state exactly when their handlers return the
//! same [`StateKey`] instance. Keys compare by identity, so a plugin fuses
//! cooperating functions by handing out one key it created once:
//!
//! ```rust,ignore
//! let key = StateKey::new("cycle");
//! // both `cycledetected(a, b)` and `cycleoutput(a, b)` return `key.clone()`
//! ```

pub mod builtin;
pub mod cycle;
pub mod functions;
pub mod group_key;
pub mod registry;

pub use builtin::BuiltinAggregations;
pub use cycle::CycleDetectorFunctions;
pub use functions::{AggregationFunctionFactory, AggregationFunctionRegistry, ValidationContext};
pub use group_key::{GroupKey, ValueKey};
pub use registry::{AggregationStateRegistry, StateHandle};

use crate::error::EvalResult;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use vesper_core::{MethodError, Type, Value};

/// Identity of one activation of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementInstanceId(pub u64);

impl fmt::Display for StatementInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt-{}", self.0)
    }
}

/// Identity token deciding whether two aggregation occurrences share state.
///
/// Clones are equal; two keys created separately never are, whatever their
/// names.
#[derive(Clone)]
pub struct StateKey(Arc<str>);

impl StateKey {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for StateKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for StateKey {}

impl Hash for StateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({}@{:p})", self.0, Arc::as_ptr(&self.0) as *const u8)
    }
}

/// Mutable aggregation state of one group.
///
/// Updates to one group are serialized by the runtime, so implementations
/// need no internal locking.
pub trait AggregationState: Send {
    /// A row entered the aggregation.
    fn enter(&mut self, row: &[Value]) -> EvalResult<()>;

    /// A row left the aggregation (window expiry).
    fn leave(&mut self, row: &[Value]) -> EvalResult<()>;

    /// For accessors that need the concrete state.
    fn as_any(&self) -> &dyn Any;
}

/// What a state factory is told about the state it creates
#[derive(Debug, Clone, Copy)]
pub struct StateContext<'a> {
    pub statement: StatementInstanceId,
    pub group_key: &'a GroupKey,
}

/// Creates the state of one (statement instance, group)
pub trait AggregationStateFactory: Send + Sync {
    fn create(&self, ctx: &StateContext<'_>) -> Result<Box<dyn AggregationState>, MethodError>;
}

impl<F> AggregationStateFactory for F
where
    F: Fn(&StateContext<'_>) -> Result<Box<dyn AggregationState>, MethodError> + Send + Sync,
{
    fn create(&self, ctx: &StateContext<'_>) -> Result<Box<dyn AggregationState>, MethodError> {
        self(ctx)
    }
}

/// Read-only view producing an output value from a state
pub trait AggregationAccessor: Send + Sync {
    fn value(&self, state: &dyn AggregationState) -> Value;
}

impl<F> AggregationAccessor for F
where
    F: Fn(&dyn AggregationState) -> Value + Send + Sync,
{
    fn value(&self, state: &dyn AggregationState) -> Value {
        self(state)
    }
}

/// A bound aggregation function occurrence
#[derive(Clone)]
pub struct AggregationHandler {
    pub function: String,
    pub state_key: StateKey,
    pub factory: Arc<dyn AggregationStateFactory>,
    pub accessor: Arc<dyn AggregationAccessor>,
    pub return_type: Type,
}

impl fmt::Debug for AggregationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationHandler")
            .field("function", &self.function)
            .field("state_key", &self.state_key)
            .field("return_type", &self.return_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_state_key_equality_is_by_identity() {
        let a = StateKey::new("shared");
        let b = StateKey::new("shared");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let set: FxHashSet<StateKey> = [a.clone(), a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.name(), "shared");
    }
}
