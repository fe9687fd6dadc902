//! Aggregation function plugins.
//!
//! A plugin is an [`AggregationFunctionFactory`] serving one or more function
//! names. The statement compiler hands each occurrence to the factory's
//! `validate` once, at bind time, and keeps the returned
//! [`AggregationHandler`] for the statement's lifetime.

use super::{AggregationHandler, BuiltinAggregations, CycleDetectorFunctions};
use crate::error::StatementActivationError;
use crate::resolver::BoundNode;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use vesper_core::suggest::did_you_mean;

/// One aggregation occurrence as seen by its plugin at bind time
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Function name as written (lower case)
    pub function: String,
    /// Bound argument expressions, evaluated against each entering row
    pub args: Vec<BoundNode>,
    /// Called as `f(*)`
    pub wildcard: bool,
    /// The statement's rows can leave again (length window)
    pub windowed: bool,
}

impl ValidationContext {
    pub fn new(function: impl Into<String>, args: Vec<BoundNode>) -> Self {
        Self {
            function: function.into(),
            args,
            wildcard: false,
            windowed: false,
        }
    }

    pub fn invalid(&self, message: impl Into<String>) -> StatementActivationError {
        StatementActivationError::InvalidAggregation {
            function: self.function.clone(),
            message: message.into(),
        }
    }

    /// Fail unless called with exactly `n` non-wildcard arguments.
    pub fn expect_args(&self, n: usize) -> Result<(), StatementActivationError> {
        if self.wildcard {
            return Err(self.invalid("wildcard argument is not supported"));
        }
        if self.args.len() != n {
            return Err(self.invalid(format!(
                "expected {} argument(s), found {}",
                n,
                self.args.len()
            )));
        }
        Ok(())
    }
}

/// A plugin supplying handlers for one or more aggregation function names.
pub trait AggregationFunctionFactory: Send + Sync {
    /// Every name this factory serves.
    fn function_names(&self) -> &[&'static str];

    /// Validate one occurrence and produce its handler.
    fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<AggregationHandler, StatementActivationError>;
}

/// Function name to plugin lookup
#[derive(Clone)]
pub struct AggregationFunctionRegistry {
    factories: FxHashMap<String, Arc<dyn AggregationFunctionFactory>>,
}

impl AggregationFunctionRegistry {
    /// A registry without any functions, not even the built-ins.
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Register a factory under every name it serves. Later registrations
    /// replace earlier ones for the same name.
    pub fn register(&mut self, factory: Arc<dyn AggregationFunctionFactory>) -> &mut Self {
        for name in factory.function_names() {
            if self
                .factories
                .insert(name.to_ascii_lowercase(), factory.clone())
                .is_some()
            {
                tracing::debug!(function = name, "Replaced aggregation function");
            }
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AggregationFunctionFactory>> {
        self.factories.get(&name.to_ascii_lowercase())
    }

    pub fn is_aggregation(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Validate an occurrence through the factory registered for its name.
    pub fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<AggregationHandler, StatementActivationError> {
        match self.get(&ctx.function) {
            Some(factory) => factory.validate(ctx),
            None => Err(StatementActivationError::UnknownAggregation(format!(
                "{}{}",
                ctx.function,
                did_you_mean(&ctx.function, self.factories.keys().map(String::as_str))
            ))),
        }
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AggregationFunctionRegistry {
    /// Built-in aggregations plus the cycle detector.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Arc::new(BuiltinAggregations))
            .register(Arc::new(CycleDetectorFunctions::new()));
        registry
    }
}

impl std::fmt::Debug for AggregationFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationFunctionRegistry")
            .field("functions", &self.function_names())
            .finish()
    }
}
