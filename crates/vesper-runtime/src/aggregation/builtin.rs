//! Built-in aggregation functions.
//!
//! All built-ins are incremental: `enter` folds a row in and `leave` takes it
//! back out, so the same states serve unbounded and length-windowed
//! statements.
//!
//! | Function | Result | Empty group |
//! |----------|--------|-------------|
//! | `count(*)`, `count(x)` | int, non-null values for `count(x)` | 0 |
//! | `sum(x)` | int for int input (overflow faults the row), else float | null |
//! | `avg(x)` | float | null |
//! | `min(x)`, `max(x)` | input type | null |
//! | `stddev(x)` | float, sample (n - 1) | null below two values |
//! | `first(x)`, `last(x)` | input type | null |
//!
//! Every occurrence gets its own state: `sum(price)` written twice in one
//! statement is folded twice.

use super::functions::{AggregationFunctionFactory, ValidationContext};
use super::{AggregationHandler, AggregationState, StateContext, StateKey};
use crate::error::{EvalResult, EvaluationFault, StatementActivationError};
use crate::resolver::node::compare_values;
use crate::resolver::BoundNode;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use vesper_core::{MethodError, Type, Value};

/// Factory for the built-in functions
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAggregations;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    StdDev,
    First,
    Last,
}

impl Kind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "count" => Kind::Count,
            "sum" => Kind::Sum,
            "avg" => Kind::Avg,
            "min" => Kind::Min,
            "max" => Kind::Max,
            "stddev" => Kind::StdDev,
            "first" => Kind::First,
            "last" => Kind::Last,
            _ => return None,
        })
    }
}

impl AggregationFunctionFactory for BuiltinAggregations {
    fn function_names(&self) -> &[&'static str] {
        &["count", "sum", "avg", "min", "max", "stddev", "first", "last"]
    }

    fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<AggregationHandler, StatementActivationError> {
        let kind = Kind::parse(&ctx.function)
            .ok_or_else(|| StatementActivationError::UnknownAggregation(ctx.function.clone()))?;

        let (arg, return_type) = match kind {
            Kind::Count if ctx.wildcard && ctx.args.is_empty() => (None, Type::Int),
            Kind::Count => {
                ctx.expect_args(1)?;
                (ctx.args.first().cloned(), Type::Int)
            }
            _ => {
                ctx.expect_args(1)?;
                let arg = ctx.args[0].clone();
                let ty = arg.result_type();
                let return_type = match kind {
                    Kind::Sum | Kind::Avg | Kind::StdDev => {
                        if !(ty.is_numeric() || ty.is_dynamic()) {
                            return Err(ctx.invalid(format!("expected a numeric argument, found {}", ty)));
                        }
                        match kind {
                            Kind::Sum if ty == Type::Int => Type::Int,
                            Kind::Sum if ty.is_dynamic() => Type::Unknown,
                            _ => Type::Float,
                        }
                    }
                    Kind::Min | Kind::Max => {
                        if !is_orderable(&ty) {
                            return Err(ctx.invalid(format!("values of type {} are not comparable", ty)));
                        }
                        ty
                    }
                    _ => ty,
                };
                (Some(arg), return_type)
            }
        };

        let windowed = ctx.windowed;
        let factory = move |_: &StateContext<'_>| -> Result<Box<dyn AggregationState>, MethodError> {
            Ok(Box::new(BuiltinState {
                arg: arg.clone(),
                acc: Accumulator::new(kind, windowed),
            }))
        };
        let accessor = |state: &dyn AggregationState| {
            state
                .as_any()
                .downcast_ref::<BuiltinState>()
                .map_or(Value::Null, |s| s.acc.value())
        };

        Ok(AggregationHandler {
            function: ctx.function.clone(),
            state_key: StateKey::new(ctx.function.as_str()),
            factory: Arc::new(factory),
            accessor: Arc::new(accessor),
            return_type,
        })
    }
}

fn is_orderable(ty: &Type) -> bool {
    ty.is_numeric()
        || ty.is_dynamic()
        || matches!(ty, Type::Str | Type::Timestamp | Type::Duration | Type::Bool)
}

/// State of one built-in occurrence in one group
struct BuiltinState {
    arg: Option<BoundNode>,
    acc: Accumulator,
}

impl BuiltinState {
    fn input(&self, row: &[Value]) -> EvalResult<Option<Value>> {
        match &self.arg {
            Some(node) => node.evaluate(row).map(Some),
            None => Ok(None),
        }
    }
}

impl AggregationState for BuiltinState {
    fn enter(&mut self, row: &[Value]) -> EvalResult<()> {
        let value = self.input(row)?;
        self.acc.enter(value)
    }

    fn leave(&mut self, row: &[Value]) -> EvalResult<()> {
        let value = self.input(row)?;
        self.acc.leave(value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Value wrapper with a total order, for the min/max multisets
#[derive(Debug, Clone)]
struct Ordered(Value);

impl PartialEq for Ordered {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ordered {}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (a, b) => compare_values(a, b).unwrap_or_else(|| a.type_name().cmp(b.type_name())),
        }
    }
}

/// Incremental mean and variance (Welford), with removal
#[derive(Debug, Clone, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn add(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    fn remove(&mut self, x: f64) {
        if self.count <= 1 {
            *self = Self::default();
            return;
        }
        let delta = x - self.mean;
        self.count -= 1;
        self.mean -= delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 = (self.m2 - delta * delta2).max(0.0);
    }

    fn sample_stddev(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        Some((self.m2 / (self.count - 1) as f64).sqrt())
    }
}

#[derive(Debug)]
enum Accumulator {
    Count(i64),
    Sum {
        count: u64,
        int: i64,
        float: f64,
        all_int: bool,
    },
    Avg {
        count: u64,
        total: f64,
    },
    Extreme {
        max: bool,
        values: BTreeMap<Ordered, usize>,
    },
    StdDev(Welford),
    /// Windowed first/last keep every live value in arrival order
    Window {
        last: bool,
        values: VecDeque<Value>,
    },
    First(Option<Value>),
    Last(Value),
}

impl Accumulator {
    fn new(kind: Kind, windowed: bool) -> Self {
        match kind {
            Kind::Count => Accumulator::Count(0),
            Kind::Sum => Accumulator::Sum {
                count: 0,
                int: 0,
                float: 0.0,
                all_int: true,
            },
            Kind::Avg => Accumulator::Avg {
                count: 0,
                total: 0.0,
            },
            Kind::Min | Kind::Max => Accumulator::Extreme {
                max: kind == Kind::Max,
                values: BTreeMap::new(),
            },
            Kind::StdDev => Accumulator::StdDev(Welford::default()),
            Kind::First | Kind::Last if windowed => Accumulator::Window {
                last: kind == Kind::Last,
                values: VecDeque::new(),
            },
            Kind::First => Accumulator::First(None),
            Kind::Last => Accumulator::Last(Value::Null),
        }
    }

    /// `None` input means `count(*)`: every row counts.
    fn enter(&mut self, input: Option<Value>) -> EvalResult<()> {
        match self {
            Accumulator::Count(n) => {
                if !input.as_ref().is_some_and(Value::is_null) {
                    *n += 1;
                }
            }
            Accumulator::Sum {
                count,
                int,
                float,
                all_int,
            } => match input.unwrap_or_default() {
                Value::Null => {}
                Value::Int(v) => {
                    if *all_int {
                        *int = int.checked_add(v).ok_or_else(|| EvaluationFault::InvalidOperand {
                            operator: "sum".to_string(),
                            message: format!("integer overflow adding {}", v),
                        })?;
                    }
                    *count += 1;
                    *float += v as f64;
                }
                Value::Float(v) => {
                    *count += 1;
                    *float += v;
                    *all_int = false;
                }
                other => return Err(not_numeric("sum", &other)),
            },
            Accumulator::Avg { count, total } => {
                if let Some(v) = numeric_input("avg", input)? {
                    *count += 1;
                    *total += v;
                }
            }
            Accumulator::Extreme { values, .. } => {
                if let Some(v) = input.filter(|v| !v.is_null()) {
                    *values.entry(Ordered(v)).or_insert(0) += 1;
                }
            }
            Accumulator::StdDev(w) => {
                if let Some(v) = numeric_input("stddev", input)? {
                    w.add(v);
                }
            }
            Accumulator::Window { values, .. } => values.push_back(input.unwrap_or_default()),
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(input.unwrap_or_default());
                }
            }
            Accumulator::Last(last) => *last = input.unwrap_or_default(),
        }
        Ok(())
    }

    fn leave(&mut self, input: Option<Value>) -> EvalResult<()> {
        match self {
            Accumulator::Count(n) => {
                if !input.as_ref().is_some_and(Value::is_null) {
                    *n = (*n - 1).max(0);
                }
            }
            Accumulator::Sum {
                count,
                int,
                float,
                all_int,
            } => match input.unwrap_or_default() {
                Value::Null => {}
                Value::Int(v) => {
                    *count = count.saturating_sub(1);
                    *float -= v as f64;
                    if *all_int {
                        *int = int.wrapping_sub(v);
                    }
                }
                Value::Float(v) => {
                    *count = count.saturating_sub(1);
                    *float -= v;
                }
                other => return Err(not_numeric("sum", &other)),
            },
            Accumulator::Avg { count, total } => {
                if let Some(v) = numeric_input("avg", input)? {
                    *count = count.saturating_sub(1);
                    *total -= v;
                }
            }
            Accumulator::Extreme { values, .. } => {
                if let Some(v) = input.filter(|v| !v.is_null()) {
                    let key = Ordered(v);
                    if let Some(n) = values.get_mut(&key) {
                        *n -= 1;
                        if *n == 0 {
                            values.remove(&key);
                        }
                    }
                }
            }
            Accumulator::StdDev(w) => {
                if let Some(v) = numeric_input("stddev", input)? {
                    w.remove(v);
                }
            }
            // Rows leave a length window oldest first
            Accumulator::Window { values, .. } => {
                values.pop_front();
            }
            Accumulator::First(_) | Accumulator::Last(_) => {}
        }
        Ok(())
    }

    fn value(&self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int(*n),
            Accumulator::Sum { count: 0, .. } => Value::Null,
            Accumulator::Sum {
                int, float, all_int, ..
            } => {
                if *all_int {
                    Value::Int(*int)
                } else {
                    Value::Float(*float)
                }
            }
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { count, total } => Value::Float(total / *count as f64),
            Accumulator::Extreme { max, values } => {
                let entry = if *max {
                    values.last_key_value()
                } else {
                    values.first_key_value()
                };
                entry.map_or(Value::Null, |(k, _)| k.0.clone())
            }
            Accumulator::StdDev(w) => w.sample_stddev().map_or(Value::Null, Value::Float),
            Accumulator::Window { last, values } => {
                let v = if *last { values.back() } else { values.front() };
                v.cloned().unwrap_or_default()
            }
            Accumulator::First(first) => first.clone().unwrap_or_default(),
            Accumulator::Last(last) => last.clone(),
        }
    }
}

fn numeric_input(function: &str, input: Option<Value>) -> EvalResult<Option<f64>> {
    match input.unwrap_or_default() {
        Value::Null => Ok(None),
        v => v
            .as_float()
            .filter(|_| matches!(v, Value::Int(_) | Value::Float(_)))
            .map(Some)
            .ok_or_else(|| not_numeric(function, &v)),
    }
}

fn not_numeric(function: &str, value: &Value) -> EvaluationFault {
    EvaluationFault::InvalidOperand {
        operator: function.to_string(),
        message: format!("expected a number, found {}", value.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::GroupKey;
    use crate::aggregation::StatementInstanceId;

    fn arg(ty: Type) -> BoundNode {
        BoundNode::Slot { slot: 0, ty }
    }

    fn handler(function: &str, args: Vec<BoundNode>, windowed: bool) -> AggregationHandler {
        let mut ctx = ValidationContext::new(function, args);
        ctx.windowed = windowed;
        BuiltinAggregations.validate(&ctx).unwrap()
    }

    struct Probe {
        handler: AggregationHandler,
        state: Box<dyn AggregationState>,
    }

    impl Probe {
        fn new(function: &str, ty: Type, windowed: bool) -> Self {
            let handler = handler(function, vec![arg(ty)], windowed);
            let group = GroupKey::ungrouped();
            let ctx = StateContext {
                statement: StatementInstanceId(0),
                group_key: &group,
            };
            let state = handler.factory.create(&ctx).unwrap();
            Self { handler, state }
        }

        fn enter(&mut self, v: impl Into<Value>) -> &mut Self {
            self.state.enter(&[v.into()]).unwrap();
            self
        }

        fn leave(&mut self, v: impl Into<Value>) -> &mut Self {
            self.state.leave(&[v.into()]).unwrap();
            self
        }

        fn value(&self) -> Value {
            self.handler.accessor.value(self.state.as_ref())
        }
    }

    // ==========================================================================
    // Validation
    // ==========================================================================

    #[test]
    fn test_count_star_takes_no_argument() {
        let mut ctx = ValidationContext::new("count", vec![]);
        ctx.wildcard = true;
        let h = BuiltinAggregations.validate(&ctx).unwrap();
        assert_eq!(h.return_type, Type::Int);
    }

    #[test]
    fn test_sum_of_strings_is_rejected() {
        let err = BuiltinAggregations
            .validate(&ValidationContext::new("sum", vec![arg(Type::Str)]))
            .unwrap_err();
        assert!(matches!(err, StatementActivationError::InvalidAggregation { .. }));
    }

    #[test]
    fn test_return_types_follow_input() {
        assert_eq!(handler("sum", vec![arg(Type::Int)], false).return_type, Type::Int);
        assert_eq!(handler("sum", vec![arg(Type::Float)], false).return_type, Type::Float);
        assert_eq!(handler("avg", vec![arg(Type::Int)], false).return_type, Type::Float);
        assert_eq!(handler("max", vec![arg(Type::Str)], false).return_type, Type::Str);
    }

    #[test]
    fn test_each_occurrence_has_own_key() {
        let a = handler("sum", vec![arg(Type::Int)], false);
        let b = handler("sum", vec![arg(Type::Int)], false);
        assert_ne!(a.state_key, b.state_key);
    }

    // ==========================================================================
    // Accumulation
    // ==========================================================================

    #[test]
    fn test_count_ignores_nulls() {
        let mut p = Probe::new("count", Type::Int, false);
        p.enter(1i64).enter(Value::Null).enter(3i64);
        assert_eq!(p.value(), Value::Int(2));
    }

    #[test]
    fn test_sum_enter_and_leave() {
        let mut p = Probe::new("sum", Type::Int, true);
        assert_eq!(p.value(), Value::Null);
        p.enter(10i64).enter(20i64).enter(30i64);
        assert_eq!(p.value(), Value::Int(60));
        p.leave(10i64);
        assert_eq!(p.value(), Value::Int(50));
    }

    #[test]
    fn test_int_sum_overflow_faults_and_keeps_total() {
        let mut p = Probe::new("sum", Type::Int, false);
        p.enter(i64::MAX - 1);
        let err = p.state.enter(&[Value::Int(2)]).unwrap_err();
        assert!(matches!(err, EvaluationFault::InvalidOperand { ref operator, .. } if operator == "sum"));
        assert_eq!(p.value(), Value::Int(i64::MAX - 1));
        p.enter(1i64);
        assert_eq!(p.value(), Value::Int(i64::MAX));
    }

    #[test]
    fn test_avg() {
        let mut p = Probe::new("avg", Type::Float, false);
        p.enter(10.0).enter(20.0).enter(30.0);
        assert_eq!(p.value(), Value::Float(20.0));
    }

    #[test]
    fn test_min_max_survive_removal_of_extreme() {
        let mut min = Probe::new("min", Type::Int, true);
        min.enter(5i64).enter(1i64).enter(3i64).enter(1i64);
        assert_eq!(min.value(), Value::Int(1));
        min.leave(1i64);
        assert_eq!(min.value(), Value::Int(1));
        min.leave(1i64);
        assert_eq!(min.value(), Value::Int(3));

        let mut max = Probe::new("max", Type::Int, true);
        max.enter(5i64).enter(9i64);
        max.leave(9i64);
        assert_eq!(max.value(), Value::Int(5));
    }

    #[test]
    fn test_stddev_matches_sample_formula() {
        let mut p = Probe::new("stddev", Type::Float, true);
        p.enter(2.0).enter(4.0).enter(4.0).enter(4.0);
        p.enter(5.0).enter(5.0).enter(7.0).enter(9.0);
        let Value::Float(sd) = p.value() else {
            panic!("expected float");
        };
        // sample variance 32 / 7
        assert!((sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);

        p.leave(2.0);
        let Value::Float(sd) = p.value() else {
            panic!("expected float");
        };
        let rest = [4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mean = rest.iter().sum::<f64>() / 7.0;
        let var = rest.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 6.0;
        assert!((sd - var.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_stddev_needs_two_values() {
        let mut p = Probe::new("stddev", Type::Float, false);
        p.enter(1.0);
        assert_eq!(p.value(), Value::Null);
    }

    #[test]
    fn test_first_last_unwindowed() {
        let mut first = Probe::new("first", Type::Str, false);
        let mut last = Probe::new("last", Type::Str, false);
        for s in ["a", "b", "c"] {
            first.enter(s);
            last.enter(s);
        }
        assert_eq!(first.value(), Value::str("a"));
        assert_eq!(last.value(), Value::str("c"));
    }

    #[test]
    fn test_first_follows_window() {
        let mut first = Probe::new("first", Type::Str, true);
        first.enter("a").enter("b").leave("a");
        assert_eq!(first.value(), Value::str("b"));
    }

    #[test]
    fn test_accessor_is_idempotent() {
        let mut p = Probe::new("avg", Type::Int, false);
        p.enter(1i64).enter(2i64);
        assert_eq!(p.value(), p.value());
    }
}
