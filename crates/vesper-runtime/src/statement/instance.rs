//! One activation of a compiled statement.
//!
//! Events are processed one at a time under the instance's lock. For every
//! row that reaches the aggregation stage:
//!
//! 1. the where clause filters it,
//! 2. the group-by values select (and lazily create) the group's states,
//! 3. the row enters each distinct state once, and a row pushed out of a
//!    length window leaves its group's states,
//! 4. accessors append aggregation values to the row and the select list
//!    projects it.
//!
//! Join statements first pair the arriving event with the retained events
//! of the other stream; every pair passing the join condition is one row.
//!
//! A fault at any step suppresses that row only.

use super::types::{CompiledSource, CompiledStatement, JoinSide, OutputRow, StatementOutput};
use crate::aggregation::{AggregationStateRegistry, GroupKey, StateHandle, StatementInstanceId};
use crate::config::{AggregationConfig, PatternConfig};
use crate::error::{EvaluationFault, StatementActivationError, StatementError};
use crate::pattern::{CompletedMatch, PatternEngine};
use crate::resolver::BoundNode;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vesper_core::{EventRef, Value};

struct GroupEntry {
    /// One handle per aggregation slot
    handles: Vec<StateHandle>,
    /// Engine time of the last row entered
    last_update: i64,
}

/// A row held by a length window
struct WindowRow {
    row: Vec<Value>,
    group: GroupKey,
    /// How many of the statement's distinct states the row entered; a
    /// faulting `enter` stops short of the rest
    entered: usize,
}

/// Why a row produced no output
enum Suppressed {
    Filtered,
    Fault(EvaluationFault),
    NoState,
}

impl From<EvaluationFault> for Suppressed {
    fn from(fault: EvaluationFault) -> Self {
        Suppressed::Fault(fault)
    }
}

pub(crate) struct StatementInstance {
    id: StatementInstanceId,
    compiled: Arc<CompiledStatement>,
    states: Arc<AggregationStateRegistry>,
    pattern: Option<PatternEngine>,
    groups: FxHashMap<GroupKey, GroupEntry>,
    /// Rows in the length window
    window: VecDeque<WindowRow>,
    /// Joinable events of the left and right stream
    joined: [VecDeque<EventRef>; 2],
    reclaim_after_ns: Option<i64>,
    reclaim_every_ns: i64,
    last_reclaim: i64,
    now: i64,
    stopped: bool,
}

impl StatementInstance {
    /// Activate a compiled statement. Ungrouped aggregation state is created
    /// here so that a failing factory rejects the statement up front.
    pub fn activate(
        id: StatementInstanceId,
        compiled: Arc<CompiledStatement>,
        states: Arc<AggregationStateRegistry>,
        pattern_config: &PatternConfig,
        aggregation_config: &AggregationConfig,
        now: i64,
    ) -> Result<Self, StatementActivationError> {
        let pattern = match &compiled.source {
            CompiledSource::Pattern(pattern) => {
                Some(PatternEngine::new(Arc::clone(pattern), pattern_config, now))
            }
            CompiledSource::Stream { .. } | CompiledSource::Join { .. } => None,
        };
        let mut instance = Self {
            id,
            compiled,
            states,
            pattern,
            groups: FxHashMap::default(),
            window: VecDeque::new(),
            joined: [VecDeque::new(), VecDeque::new()],
            reclaim_after_ns: aggregation_config
                .reclaim_after()
                .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)),
            reclaim_every_ns: i64::try_from(aggregation_config.reclaim_frequency().as_nanos())
                .unwrap_or(i64::MAX),
            last_reclaim: now,
            now,
            stopped: false,
        };

        if !instance.compiled.is_grouped() && !instance.compiled.aggregates.is_empty() {
            if let Err(e) = instance.group_handles(&GroupKey::ungrouped()) {
                instance.states.release_statement(id);
                return Err(e);
            }
        }
        Ok(instance)
    }

    pub fn name(&self) -> Option<&str> {
        self.compiled.name.as_deref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn pattern(&self) -> Option<&PatternEngine> {
        self.pattern.as_ref()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Process one event. Stream statements ignore events of other types.
    pub fn send_event(&mut self, event: &EventRef) -> StatementOutput {
        let mut output = StatementOutput::new(self.id, self.compiled.name.clone());
        if self.stopped {
            return output;
        }

        let compiled = Arc::clone(&self.compiled);
        let result = match &compiled.source {
            CompiledSource::Stream { event_type, .. } => {
                if event.event_type() == event_type {
                    self.process_row(vec![Value::Event(event.clone())], &mut output)
                } else {
                    Ok(())
                }
            }
            CompiledSource::Pattern(_) => {
                let matches = match self.pattern.as_mut() {
                    Some(engine) => engine.advance(event),
                    None => Vec::new(),
                };
                self.process_matches(matches, &mut output)
            }
            CompiledSource::Join {
                left,
                right,
                outer,
                on,
            } => {
                let rows = self.join_rows(event, [left, right], *outer, on.as_ref(), &mut output);
                rows.into_iter()
                    .try_for_each(|row| self.process_row(row, &mut output))
            }
        };
        self.settle(result, &mut output);
        output
    }

    /// Move engine time: fires pattern deadlines and reclaims idle groups.
    pub fn advance_time(&mut self, now: i64) -> StatementOutput {
        let mut output = StatementOutput::new(self.id, self.compiled.name.clone());
        if self.stopped || now < self.now {
            return output;
        }
        self.now = now;

        let matches = match self.pattern.as_mut() {
            Some(engine) => engine.advance_time(now),
            None => Vec::new(),
        };
        let result = self.process_matches(matches, &mut output);
        self.settle(result, &mut output);

        if !self.stopped {
            self.reclaim_idle_groups();
        }
        output
    }

    /// Drop every partial match and release all aggregation state.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(engine) = self.pattern.as_mut() {
            engine.stop();
        }
        self.groups.clear();
        self.window.clear();
        self.joined = [VecDeque::new(), VecDeque::new()];
        let groups = self.states.release_statement(self.id);
        debug!(statement = %self.id, groups, "Stopped statement");
    }

    fn settle(&mut self, result: Result<(), StatementError>, output: &mut StatementOutput) {
        if let Some(engine) = self.pattern.as_mut() {
            for fault in engine.drain_faults() {
                output.faults.push(fault);
            }
        }
        if let Err(e) = result {
            warn!(statement = %self.id, error = %e, "Statement stopped");
            self.stop();
            output.error = Some(e);
        }
    }

    /// Pair an arriving event with the retained events of the other stream,
    /// then retain it. An event never pairs with itself.
    fn join_rows(
        &mut self,
        event: &EventRef,
        sides: [&JoinSide; 2],
        outer: bool,
        on: Option<&BoundNode>,
        output: &mut StatementOutput,
    ) -> Vec<Vec<Value>> {
        let arrived = sides.map(|side| event.event_type() == side.event_type);
        let mut rows = Vec::new();

        for (side, _) in arrived.iter().enumerate().filter(|(_, hit)| **hit) {
            let mut matched = false;
            for other in &self.joined[1 - side] {
                let mut row = vec![Value::Event(event.clone()), Value::Event(other.clone())];
                if side == 1 {
                    row.swap(0, 1);
                }
                let passes = match on {
                    Some(condition) => condition.evaluate_predicate(&row),
                    None => Ok(true),
                };
                match passes {
                    Ok(true) => {
                        matched = true;
                        rows.push(row);
                    }
                    Ok(false) => {}
                    Err(fault) => {
                        warn!(statement = %self.id, error = %fault, "Join condition fault; pair skipped");
                        output.faults.push(fault);
                    }
                }
            }
            if side == 0 && outer && !matched {
                rows.push(vec![Value::Event(event.clone()), Value::Null]);
            }
        }

        for (side, hit) in arrived.into_iter().enumerate() {
            if !hit {
                continue;
            }
            let retained = &mut self.joined[side];
            retained.push_back(event.clone());
            if let Some(limit) = sides[side].retain {
                while retained.len() > limit {
                    retained.pop_front();
                }
            }
        }
        rows
    }

    fn process_matches(
        &mut self,
        matches: Vec<CompletedMatch>,
        output: &mut StatementOutput,
    ) -> Result<(), StatementError> {
        for m in matches {
            self.process_row(m.into_row(), output)?;
        }
        Ok(())
    }

    fn process_row(&mut self, row: Vec<Value>, output: &mut StatementOutput) -> Result<(), StatementError> {
        match self.evaluate_row(row)? {
            Ok(out) => output.rows.push(out),
            Err(Suppressed::Filtered) => {}
            Err(Suppressed::NoState) => {
                trace!(statement = %self.id, "Aggregation state gone; row suppressed");
            }
            Err(Suppressed::Fault(fault)) => {
                warn!(statement = %self.id, error = %fault, "Evaluation fault; row suppressed");
                output.faults.push(fault);
            }
        }
        Ok(())
    }

    /// Run one row through the statement. The outer error stops the
    /// statement; the inner one only suppresses this row.
    fn evaluate_row(&mut self, row: Vec<Value>) -> Result<Result<OutputRow, Suppressed>, StatementError> {
        let compiled = Arc::clone(&self.compiled);

        let key = match select_group(&compiled, &row) {
            Ok(key) => key,
            Err(suppressed) => return Ok(Err(suppressed)),
        };

        if compiled.aggregates.is_empty() {
            return Ok(project(&compiled, &row));
        }

        let handles = self.group_handles(&key)?;
        let mut entered = 0;
        let mut fault = None;
        for &i in &compiled.distinct_states {
            match handles[i].enter(&row) {
                Ok(()) => entered += 1,
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }

        if let Some(size) = compiled.window() {
            self.window.push_back(WindowRow {
                row: row.clone(),
                group: key.clone(),
                entered,
            });
            while self.window.len() > size {
                if let Some(expired) = self.window.pop_front() {
                    self.expire(&compiled, &expired);
                }
            }
        }

        if let Some(entry) = self.groups.get_mut(&key) {
            entry.last_update = self.now;
        }

        if let Some(fault) = fault {
            return Ok(Err(fault.into()));
        }

        let mut row = row;
        row.resize(compiled.base_width, Value::Null);
        for (aggregate, handle) in compiled.aggregates.iter().zip(&handles) {
            match handle.evaluate(aggregate.handler.accessor.as_ref()) {
                Ok(value) => row.push(value),
                Err(_) => return Ok(Err(Suppressed::NoState)),
            }
        }
        Ok(project(&compiled, &row))
    }

    /// Handles of every aggregation slot for one group, created on first
    /// touch.
    fn group_handles(&mut self, key: &GroupKey) -> Result<Vec<StateHandle>, StatementActivationError> {
        if let Some(entry) = self.groups.get(key) {
            return Ok(entry.handles.clone());
        }
        let mut handles = Vec::with_capacity(self.compiled.aggregates.len());
        for aggregate in &self.compiled.aggregates {
            let handler = &aggregate.handler;
            let handle = self.states.obtain_state(
                self.id,
                key,
                &handler.state_key,
                handler.factory.as_ref(),
                &handler.function,
            )?;
            handles.push(handle);
        }
        trace!(statement = %self.id, group = %key, "Opened aggregation group");
        self.groups.insert(
            key.clone(),
            GroupEntry {
                handles: handles.clone(),
                last_update: self.now,
            },
        );
        Ok(handles)
    }

    /// Take an expired row back out of exactly the states it entered.
    fn expire(&mut self, compiled: &CompiledStatement, expired: &WindowRow) {
        let Some(entry) = self.groups.get(&expired.group) else {
            return;
        };
        for &i in compiled.distinct_states.iter().take(expired.entered) {
            if let Err(fault) = entry.handles[i].leave(&expired.row) {
                warn!(statement = %self.id, error = %fault, "Aggregation leave failed");
            }
        }
    }

    fn reclaim_idle_groups(&mut self) {
        let Some(after) = self.reclaim_after_ns else {
            return;
        };
        if !self.compiled.is_grouped() || self.now - self.last_reclaim < self.reclaim_every_ns {
            return;
        }
        self.last_reclaim = self.now;

        let now = self.now;
        let idle: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.last_update) >= after)
            .map(|(key, _)| key.clone())
            .collect();
        for key in idle {
            self.groups.remove(&key);
            self.window.retain(|w| w.group != key);
            self.states.release_group(self.id, &key);
        }
    }
}

fn select_group(compiled: &CompiledStatement, row: &[Value]) -> Result<GroupKey, Suppressed> {
    if let Some(predicate) = &compiled.where_clause {
        if !predicate.evaluate_predicate(row)? {
            return Err(Suppressed::Filtered);
        }
    }
    if !compiled.is_grouped() {
        return Ok(GroupKey::ungrouped());
    }
    let values = compiled
        .group_by
        .iter()
        .map(|node| node.evaluate(row))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(GroupKey::from_values(values))
}

fn project(compiled: &CompiledStatement, row: &[Value]) -> Result<OutputRow, Suppressed> {
    let mut columns = IndexMap::with_capacity(compiled.columns.len());
    for column in &compiled.columns {
        columns.insert(column.name.clone(), column.node.evaluate(row)?);
    }
    Ok(OutputRow { columns })
}
