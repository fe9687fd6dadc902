//! Running state machine for one compiled pattern.
//!
//! Each live state is an instance of one pattern node with its own binding
//! environment and a parent link. Leaves (filters and timers) wait for an
//! event or a deadline; when a state completes it reports to its parent:
//!
//! - `True { quitting }`: the state matched. A quitting state has already
//!   been freed together with its subtree; a non-quitting one (an `every`
//!   below it, a negation not yet violated) stays alive and may report again.
//! - `False { restartable }`: the state can never match. It is always freed
//!   first. `every` restarts a child that failed restartably.
//!
//! Filters created while an event is being dispatched are not offered that
//! same event, and timers created while deadlines fire wait for the next
//! clock advance.

use super::arena::{Arena, StateId};
use super::compile::{CompiledPattern, NodeId, PatternNode};
use crate::config::PatternConfig;
use crate::error::EvaluationFault;
use crate::resolver::BoundNode;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vesper_core::{EventRef, Value};

type Bindings = Vec<Value>;

/// A complete pattern-variable binding
#[derive(Clone)]
pub struct CompletedMatch {
    row: Vec<Value>,
    pattern: Arc<CompiledPattern>,
}

impl CompletedMatch {
    /// The event, or event sequence for a repeated tag, bound to `tag`.
    pub fn get(&self, tag: &str) -> Option<&Value> {
        let info = self.pattern.tags().iter().find(|t| t.name == tag)?;
        self.row.get(info.slot)
    }

    /// Bindings in tag-slot order
    pub fn row(&self) -> &[Value] {
        &self.row
    }

    pub fn into_row(self) -> Vec<Value> {
        self.row
    }
}

impl fmt::Debug for CompletedMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.pattern
                    .tags()
                    .iter()
                    .map(|t| (t.name.as_str(), self.row.get(t.slot))),
            )
            .finish()
    }
}

enum Signal {
    True { env: Bindings, quitting: bool },
    False { restartable: bool },
}

struct Conjunct {
    id: Option<StateId>,
    env: Option<Bindings>,
}

enum StateKind {
    Filter,
    Timer { deadline: i64 },
    Every { child: Option<StateId> },
    Sequence { left: Option<StateId>, rights: Vec<StateId> },
    Alternation { children: Vec<StateId> },
    Conjunction { children: Vec<Conjunct> },
    Repetition { child: Option<StateId>, count: u32, acc: Bindings },
    Negation { child: Option<StateId> },
    Within { child: Option<StateId>, deadline: i64, held: Option<Bindings> },
    Guard { child: Option<StateId> },
}

impl StateKind {
    fn children(&self) -> Vec<StateId> {
        match self {
            StateKind::Filter | StateKind::Timer { .. } => Vec::new(),
            StateKind::Every { child }
            | StateKind::Repetition { child, .. }
            | StateKind::Negation { child }
            | StateKind::Within { child, .. }
            | StateKind::Guard { child } => child.iter().copied().collect(),
            StateKind::Sequence { left, rights } => {
                left.iter().chain(rights.iter()).copied().collect()
            }
            StateKind::Alternation { children } => children.clone(),
            StateKind::Conjunction { children } => children.iter().filter_map(|c| c.id).collect(),
        }
    }
}

struct State {
    node: NodeId,
    parent: Option<StateId>,
    /// Creation order; also the tie-breaker in the filter and timer indexes
    seq: u64,
    /// Bindings this state started with
    env: Bindings,
    kind: StateKind,
}

/// Live partial matches of one pattern
pub struct PatternEngine {
    pattern: Arc<CompiledPattern>,
    states: Arena<State>,
    root: Option<StateId>,
    /// Waiting filters by (declaration order, creation order)
    filters: BTreeMap<(NodeId, u64), StateId>,
    /// Pending deadlines by (time, creation order)
    deadlines: BTreeMap<(i64, u64), StateId>,
    next_seq: u64,
    now: i64,
    max_partial_matches: usize,
    /// Live filters and timers
    leaves: usize,
    completed: Vec<CompletedMatch>,
    faults: Vec<EvaluationFault>,
}

impl PatternEngine {
    /// Start matching at engine time `now` (nanoseconds).
    pub fn new(pattern: Arc<CompiledPattern>, config: &PatternConfig, now: i64) -> Self {
        let mut engine = Self {
            pattern,
            states: Arena::new(),
            root: None,
            filters: BTreeMap::new(),
            deadlines: BTreeMap::new(),
            next_seq: 0,
            now,
            max_partial_matches: config.max_partial_matches,
            leaves: 0,
            completed: Vec::new(),
            faults: Vec::new(),
        };
        let width = engine.pattern.row_width();
        let root = engine.create(CompiledPattern::ROOT, None, vec![Value::Null; width]);
        engine.root = Some(root);
        engine.activate(root);
        engine
    }

    pub fn pattern(&self) -> &Arc<CompiledPattern> {
        &self.pattern
    }

    /// Offer one event to every waiting filter. Returns the matches it
    /// completed, plus any completed since the last call.
    pub fn advance(&mut self, event: &EventRef) -> Vec<CompletedMatch> {
        let horizon = self.next_seq;
        let pattern = Arc::clone(&self.pattern);
        let event_type = event.event_type();

        let candidates: Vec<(NodeId, StateId)> = self
            .filters
            .iter()
            .filter(|((node, seq), _)| {
                *seq < horizon
                    && matches!(&pattern.nodes[*node], PatternNode::Filter(f) if f.event_type == event_type)
            })
            .map(|((node, _), id)| (*node, *id))
            .collect();

        for (node, id) in candidates {
            let PatternNode::Filter(filter) = &pattern.nodes[node] else {
                continue;
            };
            let Some(mut env) = self.states.get(id).map(|s| s.env.clone()) else {
                continue;
            };

            if let Some(predicate) = &filter.predicate {
                let mut row = env.clone();
                row.push(Value::Event(event.clone()));
                if !self.predicate_holds(predicate, &row) {
                    continue;
                }
            }

            if let Some(slot) = filter.slot {
                env[slot] = Value::Event(event.clone());
            }
            trace!(state = ?id, event_type, "Filter matched");
            self.finish_true(id, env, true);
        }

        std::mem::take(&mut self.completed)
    }

    /// Move engine time forward and fire every deadline now due. Time never
    /// moves backwards; an earlier `now` is ignored.
    pub fn advance_time(&mut self, now: i64) -> Vec<CompletedMatch> {
        if now > self.now {
            self.now = now;
        }
        let horizon = self.next_seq;
        let due: Vec<StateId> = self
            .deadlines
            .range(..=(self.now, u64::MAX))
            .filter(|((_, seq), _)| *seq < horizon)
            .map(|(_, id)| *id)
            .collect();

        for id in due {
            self.fire_deadline(id);
        }
        std::mem::take(&mut self.completed)
    }

    /// Whether the pattern can never produce another match.
    pub fn is_finished(&self) -> bool {
        self.root.is_none()
    }

    /// Live filters and timers.
    pub fn partial_match_count(&self) -> usize {
        self.leaves
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn now(&self) -> i64 {
        self.now
    }

    /// Drop every partial match and pending deadline.
    pub fn stop(&mut self) {
        let states = self.states.len();
        self.states.clear();
        self.filters.clear();
        self.deadlines.clear();
        self.completed.clear();
        self.leaves = 0;
        self.root = None;
        debug!(states, "Stopped pattern");
    }

    /// Evaluation faults raised by filter predicates and guards since the
    /// last call.
    pub fn drain_faults(&mut self) -> Vec<EvaluationFault> {
        std::mem::take(&mut self.faults)
    }

    // =========================================================================
    // State lifecycle
    // =========================================================================

    fn create(&mut self, node: NodeId, parent: Option<StateId>, env: Bindings) -> StateId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let kind = match &self.pattern.nodes[node] {
            PatternNode::Filter(_) => StateKind::Filter,
            PatternNode::Timer(duration) => StateKind::Timer {
                deadline: self.now.saturating_add(*duration),
            },
            PatternNode::Every(_) => StateKind::Every { child: None },
            PatternNode::Sequence(..) => StateKind::Sequence {
                left: None,
                rights: Vec::new(),
            },
            PatternNode::Alternation(_) => StateKind::Alternation {
                children: Vec::new(),
            },
            PatternNode::Conjunction(_) => StateKind::Conjunction {
                children: Vec::new(),
            },
            PatternNode::Repetition { inner_slots, .. } => {
                let mut acc = env.clone();
                for &slot in inner_slots {
                    acc[slot] = Value::Array(Vec::new());
                }
                StateKind::Repetition {
                    child: None,
                    count: 0,
                    acc,
                }
            }
            PatternNode::Negation(_) => StateKind::Negation { child: None },
            PatternNode::Within { duration_ns, .. } => StateKind::Within {
                child: None,
                deadline: self.now.saturating_add(*duration_ns),
                held: None,
            },
            PatternNode::Guard { .. } => StateKind::Guard { child: None },
        };
        self.states.insert(State {
            node,
            parent,
            seq,
            env,
            kind,
        })
    }

    fn activate(&mut self, id: StateId) {
        let pattern = Arc::clone(&self.pattern);
        let Some(state) = self.states.get(id) else {
            return;
        };
        let (node, seq, env) = (state.node, state.seq, state.env.clone());

        match &pattern.nodes[node] {
            PatternNode::Filter(_) => {
                self.filters.insert((node, seq), id);
                self.leaves += 1;
            }
            PatternNode::Timer(_) => {
                if let Some(StateKind::Timer { deadline }) = self.kind(id) {
                    let deadline = *deadline;
                    self.deadlines.insert((deadline, seq), id);
                    self.leaves += 1;
                }
            }
            PatternNode::Every(child) => {
                self.start_child(id, *child, env);
            }
            PatternNode::Sequence(left, _) => {
                let c = self.create(*left, Some(id), env);
                if let Some(StateKind::Sequence { left, .. }) = self.kind_mut(id) {
                    *left = Some(c);
                }
                self.activate(c);
            }
            PatternNode::Alternation(children) | PatternNode::Conjunction(children) => {
                let ids: Vec<StateId> = children
                    .iter()
                    .map(|&child| self.create(child, Some(id), env.clone()))
                    .collect();
                match self.kind_mut(id) {
                    Some(StateKind::Alternation { children }) => *children = ids.clone(),
                    Some(StateKind::Conjunction { children }) => {
                        *children = ids
                            .iter()
                            .map(|&c| Conjunct {
                                id: Some(c),
                                env: None,
                            })
                            .collect();
                    }
                    _ => {}
                }
                for c in ids {
                    if !self.states.contains(id) {
                        // An earlier operand already decided this state
                        self.free(c);
                        continue;
                    }
                    self.activate(c);
                }
            }
            PatternNode::Repetition {
                child, inner_slots, ..
            } => {
                let iteration = self.iteration_env(id, inner_slots);
                self.start_child(id, *child, iteration);
            }
            PatternNode::Negation(child) => {
                self.start_child(id, *child, env.clone());
                // Absence holds until the child matches
                if self.states.contains(id) {
                    let parent = self.parent(id);
                    self.signal(
                        parent,
                        id,
                        Signal::True {
                            env,
                            quitting: false,
                        },
                    );
                }
            }
            PatternNode::Within { child, .. } => {
                if let Some(StateKind::Within { deadline, .. }) = self.kind(id) {
                    let deadline = *deadline;
                    self.deadlines.insert((deadline, seq), id);
                }
                self.start_child(id, *child, env);
            }
            PatternNode::Guard { child, .. } => {
                self.start_child(id, *child, env);
            }
        }
    }

    /// Create and activate the single child of `id`.
    fn start_child(&mut self, id: StateId, child_node: NodeId, env: Bindings) {
        let c = self.create(child_node, Some(id), env);
        match self.kind_mut(id) {
            Some(
                StateKind::Every { child }
                | StateKind::Repetition { child, .. }
                | StateKind::Negation { child }
                | StateKind::Within { child, .. }
                | StateKind::Guard { child },
            ) => *child = Some(c),
            _ => {}
        }
        self.activate(c);
    }

    /// Remove a state and its whole subtree. Returns the removed state.
    fn free(&mut self, id: StateId) -> Option<State> {
        let state = self.states.remove(id)?;
        match &state.kind {
            StateKind::Filter => {
                if self.filters.remove(&(state.node, state.seq)).is_some() {
                    self.leaves -= 1;
                }
            }
            StateKind::Timer { deadline } => {
                if self.deadlines.remove(&(*deadline, state.seq)).is_some() {
                    self.leaves -= 1;
                }
            }
            StateKind::Within { deadline, .. } => {
                self.deadlines.remove(&(*deadline, state.seq));
            }
            _ => {}
        }
        for child in state.kind.children() {
            self.free(child);
        }
        Some(state)
    }

    fn finish_true(&mut self, id: StateId, env: Bindings, quitting: bool) {
        let parent = if quitting {
            match self.free(id) {
                Some(state) => state.parent,
                None => return,
            }
        } else {
            self.parent(id)
        };
        self.signal(parent, id, Signal::True { env, quitting });
    }

    fn finish_false(&mut self, id: StateId, restartable: bool) {
        if let Some(state) = self.free(id) {
            self.signal(state.parent, id, Signal::False { restartable });
        }
    }

    fn fire_deadline(&mut self, id: StateId) {
        let Some(state) = self.states.get(id) else {
            return;
        };
        match &state.kind {
            StateKind::Timer { .. } => {
                let env = state.env.clone();
                trace!(state = ?id, "Timer fired");
                self.finish_true(id, env, true);
            }
            StateKind::Within { held, .. } => match held.clone() {
                Some(env) => self.finish_true(id, env, true),
                None => {
                    trace!(state = ?id, "Within deadline pruned partial match");
                    self.finish_false(id, true);
                }
            },
            _ => {}
        }
    }

    // =========================================================================
    // Signal propagation
    // =========================================================================

    fn signal(&mut self, parent: Option<StateId>, from: StateId, signal: Signal) {
        let Some(p) = parent else {
            self.on_root(signal);
            return;
        };
        let pattern = Arc::clone(&self.pattern);
        let Some(state) = self.states.get(p) else {
            return;
        };
        match &pattern.nodes[state.node] {
            PatternNode::Every(child) => self.on_every(p, *child, signal),
            PatternNode::Sequence(_, right) => self.on_sequence(p, from, *right, signal),
            PatternNode::Alternation(_) => self.on_alternation(p, from, signal),
            PatternNode::Conjunction(_) => self.on_conjunction(p, from, signal),
            PatternNode::Repetition {
                child,
                max,
                min,
                inner_slots,
            } => self.on_repetition(p, *child, *min, *max, inner_slots, signal),
            PatternNode::Negation(_) => self.on_negation(p, signal),
            PatternNode::Within { absence, .. } => self.on_within(p, *absence, signal),
            PatternNode::Guard { guard, .. } => self.on_guard(p, guard, signal),
            PatternNode::Filter(_) | PatternNode::Timer(_) => {}
        }
    }

    fn on_root(&mut self, signal: Signal) {
        match signal {
            Signal::True { env, quitting } => {
                self.completed.push(CompletedMatch {
                    row: env,
                    pattern: Arc::clone(&self.pattern),
                });
                if quitting {
                    self.root = None;
                    debug!("Pattern completed and finished");
                }
            }
            Signal::False { .. } => {
                self.root = None;
                debug!("Pattern can no longer match");
            }
        }
    }

    fn on_every(&mut self, p: StateId, child_node: NodeId, signal: Signal) {
        match signal {
            Signal::True { env, quitting } => {
                if quitting {
                    if let Some(StateKind::Every { child }) = self.kind_mut(p) {
                        *child = None;
                    }
                }
                let parent = self.parent(p);
                self.signal(
                    parent,
                    p,
                    Signal::True {
                        env,
                        quitting: false,
                    },
                );
                if quitting {
                    self.restart_every(p, child_node);
                }
            }
            Signal::False { restartable } => {
                if let Some(StateKind::Every { child }) = self.kind_mut(p) {
                    *child = None;
                }
                if restartable {
                    self.restart_every(p, child_node);
                } else {
                    self.finish_false(p, false);
                }
            }
        }
    }

    fn restart_every(&mut self, p: StateId, child_node: NodeId) {
        let Some(state) = self.states.get(p) else {
            return;
        };
        if !matches!(state.kind, StateKind::Every { child: None }) {
            return;
        }
        let env = state.env.clone();
        self.start_child(p, child_node, env);
    }

    fn on_sequence(&mut self, p: StateId, from: StateId, right_node: NodeId, signal: Signal) {
        let Some(StateKind::Sequence { left, .. }) = self.kind(p) else {
            return;
        };
        let from_left = *left == Some(from);

        match (from_left, signal) {
            (true, Signal::True { env, quitting }) => {
                if quitting {
                    if let Some(StateKind::Sequence { left, .. }) = self.kind_mut(p) {
                        *left = None;
                    }
                }
                if self.leaves >= self.max_partial_matches {
                    warn!(
                        limit = self.max_partial_matches,
                        "Partial match limit reached; match start refused"
                    );
                    self.fail_if_exhausted(p, true);
                    return;
                }
                let c = self.create(right_node, Some(p), env);
                if let Some(StateKind::Sequence { rights, .. }) = self.kind_mut(p) {
                    rights.push(c);
                }
                self.activate(c);
            }
            (false, Signal::True { env, quitting }) => {
                let mut done = false;
                if let Some(StateKind::Sequence { left, rights }) = self.kind_mut(p) {
                    if quitting {
                        rights.retain(|r| *r != from);
                    }
                    done = left.is_none() && rights.is_empty();
                }
                if done {
                    self.finish_true(p, env, true);
                } else {
                    let parent = self.parent(p);
                    self.signal(
                        parent,
                        p,
                        Signal::True {
                            env,
                            quitting: false,
                        },
                    );
                }
            }
            (true, Signal::False { restartable }) => {
                if let Some(StateKind::Sequence { left, .. }) = self.kind_mut(p) {
                    *left = None;
                }
                self.fail_if_exhausted(p, restartable);
            }
            (false, Signal::False { restartable }) => {
                if let Some(StateKind::Sequence { rights, .. }) = self.kind_mut(p) {
                    rights.retain(|r| *r != from);
                }
                self.fail_if_exhausted(p, restartable);
            }
        }
    }

    /// A sequence with neither a live left side nor a pending right side
    /// can no longer match.
    fn fail_if_exhausted(&mut self, p: StateId, restartable: bool) {
        if let Some(StateKind::Sequence { left: None, rights }) = self.kind(p) {
            if rights.is_empty() {
                self.finish_false(p, restartable);
            }
        }
    }

    fn on_alternation(&mut self, p: StateId, from: StateId, signal: Signal) {
        match signal {
            Signal::True { env, quitting: true } => self.finish_true(p, env, true),
            Signal::True { env, quitting: false } => {
                let parent = self.parent(p);
                self.signal(
                    parent,
                    p,
                    Signal::True {
                        env,
                        quitting: false,
                    },
                );
            }
            Signal::False { restartable } => {
                let mut exhausted = false;
                if let Some(StateKind::Alternation { children }) = self.kind_mut(p) {
                    children.retain(|c| *c != from);
                    exhausted = children.is_empty();
                }
                if exhausted {
                    self.finish_false(p, restartable);
                }
            }
        }
    }

    fn on_conjunction(&mut self, p: StateId, from: StateId, signal: Signal) {
        match signal {
            Signal::True { env, quitting } => {
                let mut complete = false;
                if let Some(StateKind::Conjunction { children }) = self.kind_mut(p) {
                    if let Some(entry) = children.iter_mut().find(|c| c.id == Some(from)) {
                        entry.env = Some(env);
                        if quitting {
                            entry.id = None;
                        }
                    }
                    complete = children.iter().all(|c| c.env.is_some());
                }
                if complete {
                    let merged = self.merged_conjunction(p);
                    self.finish_true(p, merged, true);
                }
            }
            Signal::False { restartable } => self.finish_false(p, restartable),
        }
    }

    /// Begin bindings overlaid with every operand's bindings.
    fn merged_conjunction(&self, p: StateId) -> Bindings {
        let Some(state) = self.states.get(p) else {
            return Vec::new();
        };
        let mut merged = state.env.clone();
        if let StateKind::Conjunction { children } = &state.kind {
            for env in children.iter().filter_map(|c| c.env.as_ref()) {
                for (slot, value) in env.iter().enumerate() {
                    if merged[slot].is_null() && !value.is_null() {
                        merged[slot] = value.clone();
                    }
                }
            }
        }
        merged
    }

    fn on_repetition(
        &mut self,
        p: StateId,
        child_node: NodeId,
        min: u32,
        max: Option<u32>,
        inner_slots: &[usize],
        signal: Signal,
    ) {
        let (env, quitting) = match signal {
            Signal::True { env, quitting } => (env, quitting),
            Signal::False { restartable } => {
                self.finish_false(p, restartable);
                return;
            }
        };

        let Some(StateKind::Repetition { child, count, acc }) = self.kind_mut(p) else {
            return;
        };
        for &slot in inner_slots {
            if let Value::Array(items) = &mut acc[slot] {
                items.push(env[slot].clone());
            }
        }
        *count += 1;
        if quitting {
            *child = None;
        }
        let count = *count;
        let acc = acc.clone();

        if max == Some(count) {
            self.finish_true(p, acc, true);
            return;
        }
        if count >= min {
            let parent = self.parent(p);
            self.signal(
                parent,
                p,
                Signal::True {
                    env: acc,
                    quitting: false,
                },
            );
        }
        if matches!(self.kind(p), Some(StateKind::Repetition { child: None, .. })) {
            let iteration = self.iteration_env(p, inner_slots);
            self.start_child(p, child_node, iteration);
        }
    }

    /// Bindings for the next iteration: everything accumulated so far, with
    /// the repeated tags unbound.
    fn iteration_env(&self, p: StateId, inner_slots: &[usize]) -> Bindings {
        let mut env = match self.kind(p) {
            Some(StateKind::Repetition { acc, .. }) => acc.clone(),
            _ => Vec::new(),
        };
        for &slot in inner_slots {
            if let Some(v) = env.get_mut(slot) {
                *v = Value::Null;
            }
        }
        env
    }

    fn on_negation(&mut self, p: StateId, signal: Signal) {
        match signal {
            // The negated expression occurred
            Signal::True { .. } => self.finish_false(p, true),
            // It can never occur: absence holds for good
            Signal::False { .. } => {
                if let Some(StateKind::Negation { child }) = self.kind_mut(p) {
                    *child = None;
                }
            }
        }
    }

    fn on_within(&mut self, p: StateId, absence: bool, signal: Signal) {
        match signal {
            Signal::True { env, .. } if absence => {
                if let Some(StateKind::Within { held, .. }) = self.kind_mut(p) {
                    *held = Some(env);
                }
            }
            Signal::True { env, quitting: true } => self.finish_true(p, env, true),
            Signal::True { env, quitting: false } => {
                let parent = self.parent(p);
                self.signal(
                    parent,
                    p,
                    Signal::True {
                        env,
                        quitting: false,
                    },
                );
            }
            Signal::False { restartable } => self.finish_false(p, restartable),
        }
    }

    fn on_guard(&mut self, p: StateId, guard: &BoundNode, signal: Signal) {
        match signal {
            Signal::True { env, quitting } => {
                if !self.guard_holds(guard, &env) {
                    trace!(state = ?p, "Guard pruned partial match");
                    self.finish_false(p, true);
                } else if quitting {
                    self.finish_true(p, env, true);
                } else {
                    let parent = self.parent(p);
                    self.signal(
                        parent,
                        p,
                        Signal::True {
                            env,
                            quitting: false,
                        },
                    );
                }
            }
            Signal::False { restartable } => self.finish_false(p, restartable),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn kind(&self, id: StateId) -> Option<&StateKind> {
        self.states.get(id).map(|s| &s.kind)
    }

    fn kind_mut(&mut self, id: StateId) -> Option<&mut StateKind> {
        self.states.get_mut(id).map(|s| &mut s.kind)
    }

    fn parent(&self, id: StateId) -> Option<StateId> {
        self.states.get(id).and_then(|s| s.parent)
    }

    fn predicate_holds(&mut self, predicate: &BoundNode, row: &[Value]) -> bool {
        match predicate.evaluate_predicate(row) {
            Ok(holds) => holds,
            Err(fault) => {
                warn!(error = %fault, "Pattern filter evaluation failed");
                self.faults.push(fault);
                false
            }
        }
    }

    fn guard_holds(&mut self, guard: &BoundNode, env: &[Value]) -> bool {
        match guard.evaluate_predicate(env) {
            Ok(holds) => holds,
            Err(fault) => {
                warn!(error = %fault, "Pattern guard evaluation failed");
                self.faults.push(fault);
                false
            }
        }
    }
}

impl fmt::Debug for PatternEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternEngine")
            .field("states", &self.states.len())
            .field("partial_matches", &self.leaves)
            .field("now", &self.now)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vesper_core::{ClassShape, Expr, MapEvent, PatternExpr, Type, TypeRegistry};

    const SEC: i64 = 1_000_000_000;

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        for name in ["A", "B", "C"] {
            registry.register_class(
                ClassShape::event(name)
                    .property("id", Type::Int)
                    .property("group", Type::Str),
            );
        }
        registry
    }

    fn engine(pattern: PatternExpr) -> PatternEngine {
        engine_with_limit(pattern, 10_000)
    }

    fn engine_with_limit(pattern: PatternExpr, limit: usize) -> PatternEngine {
        let compiled = CompiledPattern::compile(&pattern, &registry()).unwrap();
        let config = PatternConfig {
            max_partial_matches: limit,
        };
        PatternEngine::new(Arc::new(compiled), &config, 0)
    }

    fn ev(ty: &str, id: i64) -> EventRef {
        MapEvent::new(ty)
            .with_field("id", id)
            .with_field("group", "g")
            .into_ref()
    }

    fn id_of(m: &CompletedMatch, tag: &str) -> Option<i64> {
        match m.get(tag)? {
            Value::Event(e) => e.get("id")?.as_int(),
            _ => None,
        }
    }

    fn ids_of(m: &CompletedMatch, tag: &str) -> Vec<i64> {
        m.get(tag)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_event().and_then(|e| e.get("id")).and_then(|v| v.as_int()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ==========================================================================
    // Filters and sequences
    // ==========================================================================

    #[test]
    fn test_single_filter_matches_once() {
        let mut e = engine(PatternExpr::tagged("a", "A"));
        assert!(e.advance(&ev("B", 1)).is_empty());
        let out = e.advance(&ev("A", 2));
        assert_eq!(out.len(), 1);
        assert_eq!(id_of(&out[0], "a"), Some(2));
        assert!(e.is_finished());
        assert!(e.advance(&ev("A", 3)).is_empty());
        assert_eq!(e.state_count(), 0);
    }

    #[test]
    fn test_every_followed_by_binds_each_earlier_event() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::every(PatternExpr::tagged("e1", "A")),
            PatternExpr::tagged("e2", "B"),
        );
        let mut e = engine(pattern);
        e.advance(&ev("A", 1));
        e.advance(&ev("C", 99));
        e.advance(&ev("A", 2));
        let out = e.advance(&ev("B", 10));
        let pairs: Vec<_> = out.iter().map(|m| (id_of(m, "e1"), id_of(m, "e2"))).collect();
        assert_eq!(pairs, vec![(Some(1), Some(10)), (Some(2), Some(10))]);

        // Both pending B filters are consumed
        assert!(e.advance(&ev("B", 11)).is_empty());
        assert!(!e.is_finished());
    }

    #[test]
    fn test_followed_by_predicate_correlates_with_earlier_tag() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::every(PatternExpr::tagged("e1", "A")),
            PatternExpr::tagged("e2", "B").with_predicate(Expr::equals(
                Expr::path(["e2", "id"]),
                Expr::path(["e1", "id"]),
            )),
        );
        let mut e = engine(pattern);
        e.advance(&ev("A", 1));
        e.advance(&ev("A", 2));
        let out = e.advance(&ev("B", 2));
        assert_eq!(out.len(), 1);
        assert_eq!(id_of(&out[0], "e1"), Some(2));
        let out = e.advance(&ev("B", 1));
        assert_eq!(id_of(&out[0], "e1"), Some(1));
    }

    #[test]
    fn test_event_is_not_offered_to_filters_it_created() {
        // every a=A -> b=A: one A must not complete its own sequence
        let pattern = PatternExpr::followed_by(
            PatternExpr::every(PatternExpr::tagged("a", "A")),
            PatternExpr::tagged("b", "A"),
        );
        let mut e = engine(pattern);
        assert!(e.advance(&ev("A", 1)).is_empty());
        let out = e.advance(&ev("A", 2));
        assert_eq!(out.len(), 1);
        assert_eq!((id_of(&out[0], "a"), id_of(&out[0], "b")), (Some(1), Some(2)));
    }

    // ==========================================================================
    // Alternation, conjunction, negation
    // ==========================================================================

    #[test]
    fn test_alternation_completes_with_first_branch() {
        let mut e = engine(PatternExpr::or(vec![
            PatternExpr::tagged("a", "A"),
            PatternExpr::tagged("b", "B"),
        ]));
        let out = e.advance(&ev("B", 5));
        assert_eq!(id_of(&out[0], "b"), Some(5));
        assert_eq!(out[0].get("a"), Some(&Value::Null));
        assert!(e.is_finished());
    }

    #[test]
    fn test_conjunction_waits_for_all_operands_in_any_order() {
        let mut e = engine(PatternExpr::and(vec![
            PatternExpr::tagged("a", "A"),
            PatternExpr::tagged("b", "B"),
        ]));
        assert!(e.advance(&ev("B", 2)).is_empty());
        let out = e.advance(&ev("A", 1));
        assert_eq!((id_of(&out[0], "a"), id_of(&out[0], "b")), (Some(1), Some(2)));
    }

    #[test]
    fn test_negation_vetoes_conjunction() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::tagged("a", "A"),
            PatternExpr::and(vec![
                PatternExpr::tagged("b", "B"),
                PatternExpr::not(PatternExpr::filter("C")),
            ]),
        );
        let mut ok = engine(pattern.clone());
        ok.advance(&ev("A", 1));
        assert_eq!(ok.advance(&ev("B", 2)).len(), 1);

        let mut vetoed = engine(pattern);
        vetoed.advance(&ev("A", 1));
        vetoed.advance(&ev("C", 3));
        assert!(vetoed.is_finished());
        assert!(vetoed.advance(&ev("B", 2)).is_empty());
    }

    // ==========================================================================
    // Time
    // ==========================================================================

    #[test]
    fn test_within_prunes_late_completion() {
        let pattern = PatternExpr::every(PatternExpr::within(
            PatternExpr::followed_by(PatternExpr::tagged("a", "A"), PatternExpr::tagged("b", "B")),
            Duration::from_secs(10),
        ));
        let mut e = engine(pattern);
        e.advance(&ev("A", 1));
        assert!(e.advance_time(11 * SEC).is_empty());
        // the every restarted a fresh attempt, which has no A yet
        assert!(e.advance(&ev("B", 2)).is_empty());

        e.advance(&ev("A", 3));
        e.advance_time(15 * SEC);
        let out = e.advance(&ev("B", 4));
        assert_eq!(id_of(&out[0], "a"), Some(3));
    }

    #[test]
    fn test_absence_within_completes_at_deadline() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::tagged("a", "A"),
            PatternExpr::within(PatternExpr::not(PatternExpr::filter("B")), Duration::from_secs(5)),
        );
        let mut quiet = engine(pattern.clone());
        quiet.advance(&ev("A", 1));
        assert!(quiet.advance_time(4 * SEC).is_empty());
        let out = quiet.advance_time(5 * SEC);
        assert_eq!(out.len(), 1);
        assert_eq!(id_of(&out[0], "a"), Some(1));

        let mut noisy = engine(pattern);
        noisy.advance(&ev("A", 1));
        noisy.advance(&ev("B", 2));
        assert!(noisy.advance_time(10 * SEC).is_empty());
        assert!(noisy.is_finished());
    }

    #[test]
    fn test_timer_fires_at_deadline() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::tagged("a", "A"),
            PatternExpr::timer(Duration::from_secs(2)),
        );
        let mut e = engine(pattern);
        e.advance_time(SEC);
        e.advance(&ev("A", 1));
        assert!(e.advance_time(2 * SEC).is_empty());
        assert_eq!(e.advance_time(3 * SEC).len(), 1);
    }

    #[test]
    fn test_every_zero_timer_does_not_spin() {
        let mut e = engine(PatternExpr::every(PatternExpr::timer(Duration::ZERO)));
        assert_eq!(e.advance_time(SEC).len(), 1);
        assert_eq!(e.advance_time(2 * SEC).len(), 1);
    }

    // ==========================================================================
    // Repetition and guards
    // ==========================================================================

    #[test]
    fn test_exact_repetition_collects_sequence() {
        let mut e = engine(PatternExpr::repeat(PatternExpr::tagged("s", "A"), 3, Some(3)));
        e.advance(&ev("A", 1));
        e.advance(&ev("A", 2));
        let out = e.advance(&ev("A", 3));
        assert_eq!(out.len(), 1);
        assert_eq!(ids_of(&out[0], "s"), vec![1, 2, 3]);
        assert!(e.is_finished());
    }

    #[test]
    fn test_range_repetition_signals_from_min_to_max() {
        let mut e = engine(PatternExpr::repeat(PatternExpr::tagged("s", "A"), 2, Some(3)));
        assert!(e.advance(&ev("A", 1)).is_empty());
        let out = e.advance(&ev("A", 2));
        assert_eq!(ids_of(&out[0], "s"), vec![1, 2]);
        assert!(!e.is_finished());
        let out = e.advance(&ev("A", 3));
        assert_eq!(ids_of(&out[0], "s"), vec![1, 2, 3]);
        assert!(e.is_finished());
    }

    #[test]
    fn test_guard_prunes_failing_bindings() {
        let pattern = PatternExpr::every(PatternExpr::guarded_by(
            PatternExpr::tagged("a", "A"),
            Expr::binary(
                vesper_core::BinaryOp::Lt,
                Expr::path(["a", "id"]),
                Expr::lit(3i64),
            ),
        ));
        let mut e = engine(pattern);
        assert_eq!(e.advance(&ev("A", 1)).len(), 1);
        assert!(e.advance(&ev("A", 5)).is_empty());
        // the every restarts the pruned branch
        let out = e.advance(&ev("A", 2));
        assert_eq!(id_of(&out[0], "a"), Some(2));
        assert!(!e.is_finished());
    }

    // ==========================================================================
    // Limits and teardown
    // ==========================================================================

    #[test]
    fn test_partial_match_limit_refuses_new_starts() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::every(PatternExpr::tagged("a", "A")),
            PatternExpr::tagged("b", "B"),
        );
        let mut e = engine_with_limit(pattern, 3);
        for i in 0..10 {
            e.advance(&ev("A", i));
        }
        // starts are refused once three filters are live; the every keeps
        // its own filter
        assert_eq!(e.partial_match_count(), 4);
        assert_eq!(e.advance(&ev("B", 1)).len(), 3);
    }

    #[test]
    fn test_stop_releases_everything() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::every(PatternExpr::tagged("a", "A")),
            PatternExpr::within(PatternExpr::tagged("b", "B"), Duration::from_secs(1)),
        );
        let mut e = engine(pattern);
        e.advance(&ev("A", 1));
        e.advance(&ev("A", 2));
        assert!(e.state_count() > 0);
        e.stop();
        assert!(e.is_finished());
        assert_eq!(e.state_count(), 0);
        assert_eq!(e.partial_match_count(), 0);
        assert!(e.advance(&ev("B", 1)).is_empty());
        assert!(e.advance_time(5 * SEC).is_empty());
    }
}
