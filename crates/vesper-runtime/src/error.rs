//! Error taxonomy of the evaluation core.
//!
//! Bind-time failures ([`ResolutionError`], [`StatementActivationError`]) are
//! returned synchronously to whoever asked for the binding and the statement
//! never activates. Runtime failures ([`EvaluationFault`]) stay attributed to
//! one statement instance and one event. [`StateNotFound`] is an ordinary
//! outcome meaning "no output".

use thiserror::Error;
use vesper_core::Type;

pub type ResolveResult<T> = Result<T, ResolutionError>;

pub type EvalResult<T> = Result<T, EvaluationFault>;

/// Bind-time expression and pattern resolution failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error(
        "Failed to resolve '{member}': no property, date-time or enumeration method, or method \
         taking {arity} parameter(s) named '{member}' in '{declaring_type}'{hint}"
    )]
    NoSuchMember {
        member: String,
        arity: usize,
        declaring_type: String,
        hint: String,
    },

    #[error(
        "Ambiguous call to '{member}' in '{declaring_type}' with {arity} parameter(s): \
         candidates {candidates:?} are equally specific"
    )]
    AmbiguousOverload {
        member: String,
        arity: usize,
        declaring_type: String,
        candidates: Vec<String>,
    },

    #[error(
        "Failed to resolve property '{stream}.{property}' (property '{stream}' is an indexed \
         property and requires an index or enumeration method to access values)"
    )]
    AmbiguousIndexedProperty { stream: String, property: String },

    #[error("Property '{property}' is ambiguous: declared by streams {streams:?}")]
    AmbiguousProperty { property: String, streams: Vec<String> },

    #[error("Type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Unknown stream or namespace '{name}'{hint}")]
    UnknownStream { name: String, hint: String },

    #[error("Unknown event type '{name}'{hint}")]
    UnknownEventType { name: String, hint: String },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

impl ResolutionError {
    pub fn type_mismatch(context: impl Into<String>, expected: &Type, found: &Type) -> Self {
        ResolutionError::TypeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Statement activation failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatementActivationError {
    #[error("Failed to validate statement: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Unknown aggregation function '{0}'")]
    UnknownAggregation(String),

    #[error("Aggregation function '{function}' failed to create its state: {message}")]
    FactoryFailed { function: String, message: String },

    #[error("Invalid aggregation '{function}': {message}")]
    InvalidAggregation { function: String, message: String },
}

/// A failure raised while evaluating a bound expression against one row
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationFault {
    #[error("Method '{method}' raised: {message}")]
    MethodFailed { method: String, message: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Invalid operand for '{operator}': {message}")]
    InvalidOperand { operator: String, message: String },
}

/// Accessor read against a group whose state no longer exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No aggregation state for this group")]
pub struct StateNotFound;

/// Errors surfaced by the statement runtime
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatementError {
    #[error(transparent)]
    Activation(#[from] StatementActivationError),

    #[error("Statement {statement} has been destroyed")]
    Stopped { statement: u64 },
}
