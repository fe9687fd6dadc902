//! Statement runtime for vesper
//!
//! [`StatementRuntime`] owns the type registry, the aggregation function
//! registry and the shared [`AggregationStateRegistry`], and keeps every
//! active statement instance behind its own lock. Events and clock advances
//! are routed to all instances in creation order; within one instance they
//! are processed strictly one at a time.

mod compiler;
mod instance;
mod types;

pub use types::{OutputRow, StatementOutput};

use crate::aggregation::{
    AggregationFunctionRegistry, AggregationHandler, AggregationStateRegistry, GroupKey,
    StateHandle, StatementInstanceId,
};
use crate::config::RuntimeConfig;
use crate::error::{ResolveResult, StatementActivationError, StatementError};
use crate::pattern::{CompiledPattern, CompletedMatch, PatternEngine};
use crate::resolver::{bind_expression, BoundNode, StreamShapes};
use chrono::{DateTime, Utc};
use compiler::compile_statement;
use instance::StatementInstance;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};
use vesper_core::{EventRef, Expr, FxIndexMap, PatternExpr, StatementSpec, TypeRegistry};

type SharedInstance = Arc<Mutex<StatementInstance>>;

/// The continuous-evaluation engine
pub struct StatementRuntime {
    registry: Arc<TypeRegistry>,
    functions: AggregationFunctionRegistry,
    states: Arc<AggregationStateRegistry>,
    config: RuntimeConfig,
    statements: RwLock<FxIndexMap<StatementInstanceId, SharedInstance>>,
    next_id: AtomicU64,
    /// Engine time in nanoseconds
    now: AtomicI64,
}

impl StatementRuntime {
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            functions: AggregationFunctionRegistry::default(),
            states: Arc::new(AggregationStateRegistry::new()),
            config: RuntimeConfig::default(),
            statements: RwLock::new(FxIndexMap::default()),
            next_id: AtomicU64::new(1),
            now: AtomicI64::new(0),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the aggregation functions available to new statements
    pub fn with_functions(mut self, functions: AggregationFunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn functions(&self) -> &AggregationFunctionRegistry {
        &self.functions
    }

    pub fn states(&self) -> &AggregationStateRegistry {
        &self.states
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current engine time in nanoseconds
    pub fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    // =========================================================================
    // Statement lifecycle
    // =========================================================================

    /// Bind and activate a statement. Nothing is left behind on failure.
    pub fn create_statement(
        &self,
        spec: &StatementSpec,
    ) -> Result<StatementInstanceId, StatementActivationError> {
        let compiled = Arc::new(compile_statement(spec, &self.registry, &self.functions)?);
        let id = StatementInstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let instance = StatementInstance::activate(
            id,
            compiled,
            Arc::clone(&self.states),
            &self.config.pattern,
            &self.config.aggregation,
            self.now(),
        )?;

        info!(statement = %id, name = ?spec.name, "Created statement");
        self.write_statements()
            .insert(id, Arc::new(Mutex::new(instance)));
        Ok(id)
    }

    /// Stop a statement, dropping its partial matches and releasing all of
    /// its aggregation state. An event being processed for it finishes
    /// first; nothing observes a half torn-down instance.
    pub fn destroy_statement(&self, id: StatementInstanceId) -> Result<(), StatementError> {
        let removed = self.write_statements().shift_remove(&id);
        let Some(instance) = removed else {
            return Err(StatementError::Stopped { statement: id.0 });
        };
        instance.lock().unwrap_or_else(|e| e.into_inner()).stop();
        // Lazily created groups may have raced the stop
        self.states.release_statement(id);
        debug!(statement = %id, "Destroyed statement");
        Ok(())
    }

    pub fn statement_ids(&self) -> Vec<StatementInstanceId> {
        self.read_statements().keys().copied().collect()
    }

    pub fn statement_count(&self) -> usize {
        self.read_statements().len()
    }

    pub fn statement_name(&self, id: StatementInstanceId) -> Option<String> {
        let instance = self.instance(id)?;
        let guard = instance.lock().unwrap_or_else(|e| e.into_inner());
        guard.name().map(str::to_string)
    }

    /// Whether the statement is still active. A statement stops when it is
    /// destroyed or when a group's state cannot be created.
    pub fn is_active(&self, id: StatementInstanceId) -> bool {
        self.instance(id)
            .map(|i| !i.lock().unwrap_or_else(|e| e.into_inner()).is_stopped())
            .unwrap_or(false)
    }

    /// Open aggregation groups of a statement
    pub fn group_count(&self, id: StatementInstanceId) -> usize {
        self.instance(id)
            .map(|i| i.lock().unwrap_or_else(|e| e.into_inner()).group_count())
            .unwrap_or(0)
    }

    /// Live partial matches of a pattern statement
    pub fn partial_match_count(&self, id: StatementInstanceId) -> usize {
        self.instance(id)
            .and_then(|i| {
                i.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pattern()
                    .map(PatternEngine::partial_match_count)
            })
            .unwrap_or(0)
    }

    // =========================================================================
    // Event and time routing
    // =========================================================================

    /// Route one event to every statement. Returns the output of each
    /// statement that produced rows, faults or an error.
    pub fn send_event(&self, event: &EventRef) -> Vec<StatementOutput> {
        self.snapshot()
            .into_iter()
            .map(|instance| {
                instance
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .send_event(event)
            })
            .filter(|output| !output.is_empty())
            .collect()
    }

    /// Move engine time to `now`, firing pattern timers and reclaiming idle
    /// aggregation groups.
    pub fn advance_time(&self, now: DateTime<Utc>) -> Vec<StatementOutput> {
        self.advance_time_nanos(now.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// [`advance_time`](Self::advance_time) with engine time in nanoseconds.
    /// Time never moves backwards.
    pub fn advance_time_nanos(&self, now: i64) -> Vec<StatementOutput> {
        let previous = self.now.fetch_max(now, Ordering::AcqRel);
        if now < previous {
            return Vec::new();
        }
        self.snapshot()
            .into_iter()
            .map(|instance| {
                instance
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .advance_time(now)
            })
            .filter(|output| !output.is_empty())
            .collect()
    }

    // =========================================================================
    // Component interfaces
    // =========================================================================

    /// An empty scope over this runtime's type registry
    pub fn stream_shapes(&self) -> StreamShapes<'_> {
        StreamShapes::new(&self.registry)
    }

    /// Bind an expression against the given streams.
    pub fn bind_expression(&self, expr: &Expr, scope: &StreamShapes<'_>) -> ResolveResult<BoundNode> {
        bind_expression(expr, scope)
    }

    /// Obtain (creating on first touch) the state of one aggregation
    /// occurrence for one group.
    pub fn obtain_aggregation_state(
        &self,
        statement: StatementInstanceId,
        group_key: &GroupKey,
        handler: &AggregationHandler,
    ) -> Result<StateHandle, StatementActivationError> {
        self.states.obtain_state(
            statement,
            group_key,
            &handler.state_key,
            handler.factory.as_ref(),
            &handler.function,
        )
    }

    /// Compile a pattern and start matching it at the current engine time.
    pub fn bind_pattern(&self, pattern: &PatternExpr) -> ResolveResult<PatternEngine> {
        let compiled = CompiledPattern::compile(pattern, &self.registry)?;
        Ok(PatternEngine::new(
            Arc::new(compiled),
            &self.config.pattern,
            self.now(),
        ))
    }

    /// Offer one event to a pattern bound with [`bind_pattern`](Self::bind_pattern).
    pub fn advance(&self, engine: &mut PatternEngine, event: &EventRef) -> Vec<CompletedMatch> {
        engine.advance(event)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn instance(&self, id: StatementInstanceId) -> Option<SharedInstance> {
        self.read_statements().get(&id).cloned()
    }

    fn snapshot(&self) -> Vec<SharedInstance> {
        self.read_statements().values().cloned().collect()
    }

    fn read_statements(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, FxIndexMap<StatementInstanceId, SharedInstance>> {
        self.statements.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_statements(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, FxIndexMap<StatementInstanceId, SharedInstance>> {
        self.statements.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for StatementRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementRuntime")
            .field("statements", &self.statement_count())
            .field("functions", &self.functions)
            .field("now", &self.now())
            .finish()
    }
}
