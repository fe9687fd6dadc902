//! Cycle detection over a stream of directed edges.
//!
//! Two functions cooperate on one graph per group:
//!
//! - `cycledetected(from, to)` is `true` once the entered edges contain a
//!   directed cycle,
//! - `cycleoutput(from, to)` lists the vertices lying on any cycle, or null
//!   when there is none.
//!
//! Both hand out the same [`StateKey`], so a statement selecting both folds
//! each edge into a single graph.

use super::functions::{AggregationFunctionFactory, ValidationContext};
use super::group_key::ValueKey;
use super::{AggregationAccessor, AggregationHandler, AggregationState, StateContext, StateKey};
use crate::error::{EvalResult, StatementActivationError};
use crate::resolver::BoundNode;
use std::any::Any;
use std::sync::Arc;
use vesper_core::{FxIndexMap, MethodError, Type, Value};

pub const CYCLE_DETECTED: &str = "cycledetected";
pub const CYCLE_OUTPUT: &str = "cycleoutput";

/// Multi-function plugin sharing one edge graph between its functions
#[derive(Debug, Clone)]
pub struct CycleDetectorFunctions {
    key: StateKey,
}

impl CycleDetectorFunctions {
    pub fn new() -> Self {
        Self {
            key: StateKey::new("cycle"),
        }
    }
}

impl Default for CycleDetectorFunctions {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationFunctionFactory for CycleDetectorFunctions {
    fn function_names(&self) -> &[&'static str] {
        &[CYCLE_DETECTED, CYCLE_OUTPUT]
    }

    fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<AggregationHandler, StatementActivationError> {
        ctx.expect_args(2)?;
        let from = ctx.args[0].clone();
        let to = ctx.args[1].clone();
        let from_ty = from.result_type();
        let to_ty = to.result_type();
        if !(from_ty.is_assignable_from(&to_ty) || to_ty.is_assignable_from(&from_ty)) {
            return Err(ctx.invalid(format!(
                "vertex types differ: {} and {}",
                from_ty, to_ty
            )));
        }

        let factory = move |_: &StateContext<'_>| -> Result<Box<dyn AggregationState>, MethodError> {
            Ok(Box::new(EdgeGraph::new(from.clone(), to.clone())))
        };

        let (accessor, return_type): (Arc<dyn AggregationAccessor>, Type) =
            if ctx.function.eq_ignore_ascii_case(CYCLE_DETECTED) {
                (
                    Arc::new(|state: &dyn AggregationState| {
                        graph(state).map_or(Value::Null, |g| Value::Bool(g.has_cycle()))
                    }),
                    Type::Bool,
                )
            } else {
                (
                    Arc::new(|state: &dyn AggregationState| {
                        let vertices = graph(state).map(EdgeGraph::cycle_vertices);
                        match vertices {
                            Some(v) if !v.is_empty() => Value::Array(v),
                            _ => Value::Null,
                        }
                    }),
                    Type::array_of(from_ty),
                )
            };

        Ok(AggregationHandler {
            function: ctx.function.clone(),
            state_key: self.key.clone(),
            factory: Arc::new(factory),
            accessor,
            return_type,
        })
    }
}

fn graph(state: &dyn AggregationState) -> Option<&EdgeGraph> {
    state.as_any().downcast_ref::<EdgeGraph>()
}

/// Directed multigraph; vertex order is first-seen order
struct EdgeGraph {
    from: BoundNode,
    to: BoundNode,
    /// vertex -> (successor -> edge multiplicity)
    adjacency: FxIndexMap<ValueKey, FxIndexMap<ValueKey, usize>>,
}

impl EdgeGraph {
    fn new(from: BoundNode, to: BoundNode) -> Self {
        Self {
            from,
            to,
            adjacency: FxIndexMap::default(),
        }
    }

    fn edge(&self, row: &[Value]) -> EvalResult<Option<(ValueKey, ValueKey)>> {
        let from = self.from.evaluate(row)?;
        let to = self.to.evaluate(row)?;
        if from.is_null() || to.is_null() {
            return Ok(None);
        }
        Ok(Some((ValueKey::new(from), ValueKey::new(to))))
    }

    fn add_edge(&mut self, from: ValueKey, to: ValueKey) {
        *self
            .adjacency
            .entry(from)
            .or_default()
            .entry(to.clone())
            .or_insert(0) += 1;
        self.adjacency.entry(to).or_default();
    }

    fn remove_edge(&mut self, from: &ValueKey, to: &ValueKey) {
        let Some(successors) = self.adjacency.get_mut(from) else {
            return;
        };
        if let Some(n) = successors.get_mut(to) {
            *n -= 1;
            if *n == 0 {
                successors.shift_remove(to);
            }
        }
        self.drop_if_isolated(from);
        self.drop_if_isolated(to);
    }

    fn drop_if_isolated(&mut self, vertex: &ValueKey) {
        let has_out = self.adjacency.get(vertex).is_some_and(|s| !s.is_empty());
        let has_in = self.adjacency.values().any(|s| s.contains_key(vertex));
        if !has_out && !has_in {
            self.adjacency.shift_remove(vertex);
        }
    }

    fn has_cycle(&self) -> bool {
        self.on_cycle().iter().any(|&b| b)
    }

    fn cycle_vertices(&self) -> Vec<Value> {
        self.adjacency
            .keys()
            .zip(self.on_cycle())
            .filter(|(_, on)| *on)
            .map(|(v, _)| v.value().clone())
            .collect()
    }

    /// For each vertex (by index), whether it lies on a directed cycle:
    /// members of a strongly connected component of size > 1, or vertices
    /// with a self-loop.
    fn on_cycle(&self) -> Vec<bool> {
        let n = self.adjacency.len();
        let successors: Vec<Vec<usize>> = self
            .adjacency
            .values()
            .map(|s| s.keys().filter_map(|k| self.adjacency.get_index_of(k)).collect())
            .collect();

        let mut tarjan = Tarjan {
            successors: &successors,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            result: vec![false; n],
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.run(v);
            }
        }
        tarjan.result
    }
}

/// Iterative Tarjan SCC; depth is bounded by the heap, not the call stack
struct Tarjan<'a> {
    successors: &'a [Vec<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: usize,
    result: Vec<bool>,
}

impl Tarjan<'_> {
    fn open(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.lowlink[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;
    }

    fn run(&mut self, root: usize) {
        let successors = self.successors;
        // (vertex, position of the next successor to look at)
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        self.open(root);

        while let Some(frame) = frames.last_mut() {
            let (v, pos) = *frame;
            if let Some(&w) = successors[v].get(pos) {
                frame.1 += 1;
                match self.index[w] {
                    None => {
                        self.open(w);
                        frames.push((w, 0));
                    }
                    Some(wi) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(wi);
                    }
                    Some(_) => {}
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                self.lowlink[parent] = self.lowlink[parent].min(self.lowlink[v]);
            }
            if Some(self.lowlink[v]) == self.index[v] {
                self.close_component(v);
            }
        }
    }

    fn close_component(&mut self, root: usize) {
        let mut component = Vec::new();
        while let Some(w) = self.stack.pop() {
            self.on_stack[w] = false;
            component.push(w);
            if w == root {
                break;
            }
        }
        if component.len() > 1 || self.successors[root].contains(&root) {
            for w in component {
                self.result[w] = true;
            }
        }
    }
}

impl AggregationState for EdgeGraph {
    fn enter(&mut self, row: &[Value]) -> EvalResult<()> {
        if let Some((from, to)) = self.edge(row)? {
            self.add_edge(from, to);
        }
        Ok(())
    }

    fn leave(&mut self, row: &[Value]) -> EvalResult<()> {
        if let Some((from, to)) = self.edge(row)? {
            self.remove_edge(&from, &to);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
