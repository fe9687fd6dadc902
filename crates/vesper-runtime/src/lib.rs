//! Vesper Runtime - continuous evaluation core
//!
//! This crate binds and runs continuous queries over event streams:
//!
//! - [`resolver`]: turns property and method chains into typed evaluator trees
//! - [`aggregation`]: per-group aggregation state, shared between cooperating
//!   functions through state keys
//! - [`pattern`]: temporal pattern matching (`every`, `->`, `or`, `and`,
//!   `not`, repetition, `within`, guards, timers)
//! - [`statement`]: the [`StatementRuntime`] tying them together

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod pattern;
pub mod resolver;
pub mod statement;

pub use aggregation::{
    AggregationFunctionFactory, AggregationFunctionRegistry, AggregationHandler,
    AggregationStateRegistry, GroupKey, StateHandle, StateKey, StatementInstanceId,
};
pub use clock::{spawn_clock, ClockHandle};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{
    EvaluationFault, ResolutionError, StateNotFound, StatementActivationError, StatementError,
};
pub use pattern::{CompiledPattern, CompletedMatch, PatternEngine};
pub use resolver::{bind_expression, BoundNode, StreamShapes};
pub use statement::{OutputRow, StatementOutput, StatementRuntime};
