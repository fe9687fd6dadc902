//! Ownership of every live aggregation state.
//!
//! The registry is the only state shared across statement instances. It is
//! laid out as statement instance -> group -> state key, and each level is
//! locked separately so that creating the first state of a new group only
//! contends on that group's bucket.

use super::{
    AggregationAccessor, AggregationState, AggregationStateFactory, GroupKey, StateContext,
    StateKey, StatementInstanceId,
};
use crate::error::{EvalResult, StateNotFound, StatementActivationError};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace};
use vesper_core::Value;

type SharedState = Arc<Mutex<Box<dyn AggregationState>>>;

type Bucket = Arc<Mutex<FxHashMap<StateKey, SharedState>>>;

#[derive(Default)]
struct StatementSlice {
    groups: Mutex<FxHashMap<GroupKey, Bucket>>,
}

/// Handle to one live state.
///
/// Handles do not keep the state alive: once its group or statement is
/// released, accessor reads return [`StateNotFound`] and updates are
/// dropped.
#[derive(Clone)]
pub struct StateHandle {
    key: StateKey,
    cell: Weak<Mutex<Box<dyn AggregationState>>>,
}

impl StateHandle {
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn is_live(&self) -> bool {
        self.cell.strong_count() > 0
    }

    pub fn enter(&self, row: &[Value]) -> EvalResult<()> {
        match self.cell.upgrade() {
            Some(cell) => cell.lock().unwrap_or_else(|e| e.into_inner()).enter(row),
            None => {
                trace!(state = self.key.name(), "enter on released state ignored");
                Ok(())
            }
        }
    }

    pub fn leave(&self, row: &[Value]) -> EvalResult<()> {
        match self.cell.upgrade() {
            Some(cell) => cell.lock().unwrap_or_else(|e| e.into_inner()).leave(row),
            None => Ok(()),
        }
    }

    /// Read the state through an accessor.
    pub fn evaluate(&self, accessor: &dyn AggregationAccessor) -> Result<Value, StateNotFound> {
        let cell = self.cell.upgrade().ok_or(StateNotFound)?;
        let state = cell.lock().unwrap_or_else(|e| e.into_inner());
        Ok(accessor.value(state.as_ref()))
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("key", &self.key)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Registry of aggregation states for all statement instances
#[derive(Default)]
pub struct AggregationStateRegistry {
    statements: Mutex<FxHashMap<StatementInstanceId, Arc<StatementSlice>>>,
}

impl AggregationStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the state for (statement, group, key), creating it through
    /// `factory` on first touch. A failing factory leaves nothing behind.
    pub fn obtain_state(
        &self,
        statement: StatementInstanceId,
        group_key: &GroupKey,
        key: &StateKey,
        factory: &dyn AggregationStateFactory,
        function: &str,
    ) -> Result<StateHandle, StatementActivationError> {
        let bucket = self.bucket(statement, group_key);
        let mut states = bucket.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = states.get(key) {
            return Ok(StateHandle {
                key: key.clone(),
                cell: Arc::downgrade(existing),
            });
        }

        let ctx = StateContext {
            statement,
            group_key,
        };
        let state = match factory.create(&ctx) {
            Ok(state) => state,
            Err(e) => {
                let empty = states.is_empty();
                drop(states);
                if empty {
                    self.discard_bucket(statement, group_key, &bucket);
                }
                return Err(StatementActivationError::FactoryFailed {
                    function: function.to_string(),
                    message: e.0,
                });
            }
        };
        trace!(
            statement = %statement,
            group = %group_key,
            state = key.name(),
            "Created aggregation state"
        );

        let cell: SharedState = Arc::new(Mutex::new(state));
        let handle = StateHandle {
            key: key.clone(),
            cell: Arc::downgrade(&cell),
        };
        states.insert(key.clone(), cell);
        Ok(handle)
    }

    /// Look up an existing state without creating one.
    pub fn state(
        &self,
        statement: StatementInstanceId,
        group_key: &GroupKey,
        key: &StateKey,
    ) -> Option<StateHandle> {
        let slice = self.slice(statement)?;
        let bucket = slice
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group_key)
            .cloned()?;
        let states = bucket.lock().unwrap_or_else(|e| e.into_inner());
        states.get(key).map(|cell| StateHandle {
            key: key.clone(),
            cell: Arc::downgrade(cell),
        })
    }

    /// Destroy every state of one group. Returns whether the group existed.
    pub fn release_group(&self, statement: StatementInstanceId, group_key: &GroupKey) -> bool {
        let Some(slice) = self.slice(statement) else {
            return false;
        };
        let removed = slice
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(group_key);
        if removed.is_some() {
            debug!(statement = %statement, group = %group_key, "Released aggregation group");
        }
        removed.is_some()
    }

    /// Destroy every group of one statement instance. Returns the number of
    /// groups released.
    pub fn release_statement(&self, statement: StatementInstanceId) -> usize {
        let removed = self
            .statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&statement);
        let groups = removed.map_or(0, |slice| {
            slice.groups.lock().unwrap_or_else(|e| e.into_inner()).len()
        });
        debug!(statement = %statement, groups, "Released aggregation state");
        groups
    }

    pub fn group_count(&self, statement: StatementInstanceId) -> usize {
        self.slice(statement).map_or(0, |slice| {
            slice.groups.lock().unwrap_or_else(|e| e.into_inner()).len()
        })
    }

    /// Number of live states across all groups of a statement instance.
    pub fn state_count(&self, statement: StatementInstanceId) -> usize {
        let Some(slice) = self.slice(statement) else {
            return 0;
        };
        let groups = slice.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .values()
            .map(|bucket| bucket.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    fn slice(&self, statement: StatementInstanceId) -> Option<Arc<StatementSlice>> {
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&statement)
            .cloned()
    }

    /// Unregister a group bucket that is still empty. Runs without the
    /// bucket's own lock held; groups are always locked before buckets.
    fn discard_bucket(&self, statement: StatementInstanceId, group_key: &GroupKey, bucket: &Bucket) {
        let Some(slice) = self.slice(statement) else {
            return;
        };
        let mut groups = slice.groups.lock().unwrap_or_else(|e| e.into_inner());
        let unused = groups.get(group_key).is_some_and(|current| {
            Arc::ptr_eq(current, bucket) && current.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
        });
        if unused {
            groups.remove(group_key);
        }
    }

    fn bucket(&self, statement: StatementInstanceId, group_key: &GroupKey) -> Bucket {
        let slice = self
            .statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(statement)
            .or_default()
            .clone();
        let mut groups = slice.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.entry(group_key.clone()).or_default().clone()
    }
}
