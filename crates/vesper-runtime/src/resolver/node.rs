//! Bound evaluator nodes.
//!
//! Every member a chain can reach is decided at bind time and stored as one
//! of a closed set of variants carrying its invocation strategy. Evaluation
//! is a single match per node against the current row, never a name lookup.

use super::builtin::BuiltinMethod;
use crate::error::{EvalResult, EvaluationFault};
use std::cmp::Ordering;
use std::fmt;
use vesper_core::{BinaryOp, MethodInvoker, MethodSignature, PropertyGetter, StaticInvoker, Type, Value};

/// A resolved instance method
#[derive(Clone)]
pub struct BoundMethod {
    pub signature: MethodSignature,
    pub invoker: MethodInvoker,
}

/// A resolved static function
#[derive(Clone)]
pub struct BoundFunction {
    pub signature: MethodSignature,
    pub invoker: StaticInvoker,
}

/// A declared getter of a plain-class property
#[derive(Clone)]
pub struct BoundGetter {
    pub class: String,
    pub getter: PropertyGetter,
}

impl PartialEq for BoundMethod {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl PartialEq for BoundFunction {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl PartialEq for BoundGetter {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
    }
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundMethod({})", self.signature)
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundFunction({})", self.signature)
    }
}

impl fmt::Debug for BoundGetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundGetter({})", self.class)
    }
}

/// A compiled, typed expression fragment
#[derive(Debug, Clone, PartialEq)]
pub enum BoundNode {
    Literal(Value),
    /// The whole value at a row slot: a stream's event, a repeated tag's
    /// event sequence, or an aggregation result
    Slot { slot: usize, ty: Type },
    /// Every stream event of the row, as one collection
    Row { slots: Vec<usize> },
    /// A named property of the event at a stream slot
    PropertyAccess {
        slot: usize,
        property: String,
        ty: Type,
    },
    /// A property of an event, map or object produced by another node
    MemberRead {
        receiver: Box<BoundNode>,
        property: String,
        getter: Option<BoundGetter>,
        ty: Type,
    },
    Index {
        receiver: Box<BoundNode>,
        index: usize,
        ty: Type,
    },
    Builtin {
        receiver: Box<BoundNode>,
        method: BuiltinMethod,
        args: Vec<BoundNode>,
        ty: Type,
    },
    InstanceMethodCall {
        receiver: Box<BoundNode>,
        method: BoundMethod,
        args: Vec<BoundNode>,
        ty: Type,
    },
    StaticFunctionCall {
        function: BoundFunction,
        args: Vec<BoundNode>,
        ty: Type,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<BoundNode>,
        rhs: Box<BoundNode>,
        ty: Type,
    },
    Not(Box<BoundNode>),
    Neg { operand: Box<BoundNode>, ty: Type },
}

impl BoundNode {
    /// Declared result type, fixed at bind time.
    pub fn result_type(&self) -> Type {
        match self {
            BoundNode::Literal(v) => v.value_type(),
            BoundNode::Row { .. } => Type::array_of(Type::AnyEvent),
            BoundNode::Not(_) => Type::Bool,
            BoundNode::Slot { ty, .. }
            | BoundNode::PropertyAccess { ty, .. }
            | BoundNode::MemberRead { ty, .. }
            | BoundNode::Index { ty, .. }
            | BoundNode::Builtin { ty, .. }
            | BoundNode::InstanceMethodCall { ty, .. }
            | BoundNode::StaticFunctionCall { ty, .. }
            | BoundNode::Binary { ty, .. }
            | BoundNode::Neg { ty, .. } => ty.clone(),
        }
    }

    /// Evaluate against one row. Pure: no state is touched and repeated
    /// calls on the same row agree.
    pub fn evaluate(&self, row: &[Value]) -> EvalResult<Value> {
        match self {
            BoundNode::Literal(v) => Ok(v.clone()),

            BoundNode::Slot { slot, .. } => Ok(row.get(*slot).cloned().unwrap_or_default()),

            BoundNode::Row { slots } => Ok(Value::Array(
                slots
                    .iter()
                    .map(|s| row.get(*s).cloned().unwrap_or_default())
                    .collect(),
            )),

            BoundNode::PropertyAccess { slot, property, .. } => Ok(match row.get(*slot) {
                Some(Value::Event(event)) => event.get(property).unwrap_or_default(),
                _ => Value::Null,
            }),

            BoundNode::MemberRead {
                receiver,
                property,
                getter,
                ..
            } => {
                let target = receiver.evaluate(row)?;
                Ok(read_member(&target, property, getter.as_ref()))
            }

            BoundNode::Index {
                receiver, index, ..
            } => {
                let target = receiver.evaluate(row)?;
                Ok(target.get_index(*index).cloned().unwrap_or_default())
            }

            BoundNode::Builtin {
                receiver,
                method,
                args,
                ..
            } => {
                let target = receiver.evaluate(row)?;
                if target.is_null() {
                    return Ok(Value::Null);
                }
                let args = evaluate_all(args, row)?;
                method.apply(&target, &args)
            }

            BoundNode::InstanceMethodCall {
                receiver,
                method,
                args,
                ..
            } => {
                let target = receiver.evaluate(row)?;
                if target.is_null() {
                    return Ok(Value::Null);
                }
                let args = evaluate_all(args, row)?;
                (method.invoker)(&target, &args).map_err(|e| EvaluationFault::MethodFailed {
                    method: method.signature.to_string(),
                    message: e.0,
                })
            }

            BoundNode::StaticFunctionCall { function, args, .. } => {
                let args = evaluate_all(args, row)?;
                (function.invoker)(&args).map_err(|e| EvaluationFault::MethodFailed {
                    method: function.signature.to_string(),
                    message: e.0,
                })
            }

            BoundNode::Binary { op, lhs, rhs, .. } => {
                let left = lhs.evaluate(row)?;
                // Short-circuit where the left operand decides
                match (op, &left) {
                    (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                    (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let right = rhs.evaluate(row)?;
                apply_binary(*op, &left, &right)
            }

            BoundNode::Not(inner) => Ok(match inner.evaluate(row)? {
                Value::Bool(b) => Value::Bool(!b),
                _ => Value::Null,
            }),

            BoundNode::Neg { operand, .. } => match operand.evaluate(row)? {
                Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
                Value::Float(n) => Ok(Value::Float(-n)),
                Value::Null => Ok(Value::Null),
                other => Err(EvaluationFault::InvalidOperand {
                    operator: "-".to_string(),
                    message: format!("cannot negate {}", other.type_name()),
                }),
            },
        }
    }

    /// Evaluate as a filter: only an explicit `true` passes.
    pub fn evaluate_predicate(&self, row: &[Value]) -> EvalResult<bool> {
        Ok(self.evaluate(row)?.as_bool() == Some(true))
    }
}

fn evaluate_all(nodes: &[BoundNode], row: &[Value]) -> EvalResult<Vec<Value>> {
    nodes.iter().map(|n| n.evaluate(row)).collect()
}

fn read_member(target: &Value, property: &str, getter: Option<&BoundGetter>) -> Value {
    match target {
        Value::Event(event) => event.get(property).unwrap_or_default(),
        Value::Map(map) => map.get(property).cloned().unwrap_or_default(),
        Value::Object(_) => getter
            .and_then(|g| (g.getter)(target))
            .unwrap_or_default(),
        _ => Value::Null,
    }
}

fn overflow(operator: &str) -> EvaluationFault {
    EvaluationFault::InvalidOperand {
        operator: operator.to_string(),
        message: "integer overflow".to_string(),
    }
}

/// Apply a binary operator with int-to-float widening and null propagation.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
    match op {
        BinaryOp::And => Ok(match (left, right) {
            (Value::Bool(false), _) | (_, Value::Bool(false)) => Value::Bool(false),
            (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
            _ => Value::Null,
        }),
        BinaryOp::Or => Ok(match (left, right) {
            (Value::Bool(true), _) | (_, Value::Bool(true)) => Value::Bool(true),
            (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
            _ => Value::Null,
        }),
        _ if left.is_null() || right.is_null() => Ok(Value::Null),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare_values(left, right).ok_or_else(|| {
                EvaluationFault::InvalidOperand {
                    operator: op.symbol().to_string(),
                    message: format!(
                        "cannot compare {} with {}",
                        left.type_name(),
                        right.type_name()
                    ),
                }
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            arithmetic(op, left, right)
        }
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
    if op == BinaryOp::Div {
        let (a, b) = float_operands(op, left, right)?;
        if b == 0.0 {
            return Err(EvaluationFault::DivisionByZero);
        }
        return Ok(Value::Float(a / b));
    }
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            _ => a.checked_mul(*b),
        };
        return result.map(Value::Int).ok_or_else(|| overflow(op.symbol()));
    }
    let (a, b) = float_operands(op, left, right)?;
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        _ => a * b,
    }))
}

fn float_operands(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<(f64, f64)> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EvaluationFault::InvalidOperand {
            operator: op.symbol().to_string(),
            message: format!(
                "expected numbers, found {} and {}",
                left.type_name(),
                right.type_name()
            ),
        }),
    }
}

/// Equality with numeric widening; everything else compares by `PartialEq`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            left.as_float() == right.as_float()
        }
        _ => left == right,
    }
}

/// Total order over comparable values, `None` when the kinds differ.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            left.as_float()?.partial_cmp(&right.as_float()?)
        }
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vesper_core::{MapEvent, MethodError};

    fn row() -> Vec<Value> {
        vec![Value::Event(
            MapEvent::new("Trade")
                .with_field("price", 10.5)
                .with_field("volume", 4i64)
                .into_ref(),
        )]
    }

    fn prop(name: &str, ty: Type) -> BoundNode {
        BoundNode::PropertyAccess {
            slot: 0,
            property: name.to_string(),
            ty,
        }
    }

    // ==========================================================================
    // Operators
    // ==========================================================================

    #[test]
    fn test_arithmetic_widens_int_to_float() {
        assert_eq!(
            apply_binary(BinaryOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            apply_binary(BinaryOp::Mul, &Value::Int(3), &Value::Int(4)).unwrap(),
            Value::Int(12)
        );
        assert_eq!(
            apply_binary(BinaryOp::Div, &Value::Int(3), &Value::Int(2)).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn test_division_by_zero_is_a_fault() {
        assert_eq!(
            apply_binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)),
            Err(EvaluationFault::DivisionByZero)
        );
    }

    #[test]
    fn test_three_valued_logic() {
        let null = Value::Null;
        let t = Value::Bool(true);
        let f = Value::Bool(false);
        assert_eq!(apply_binary(BinaryOp::And, &null, &f).unwrap(), f);
        assert_eq!(apply_binary(BinaryOp::And, &null, &t).unwrap(), Value::Null);
        assert_eq!(apply_binary(BinaryOp::Or, &null, &t).unwrap(), t);
        assert_eq!(apply_binary(BinaryOp::Or, &null, &f).unwrap(), Value::Null);
        assert_eq!(apply_binary(BinaryOp::Gt, &null, &t).unwrap(), Value::Null);
    }

    #[test]
    fn test_mixed_numeric_equality() {
        assert!(values_equal(&Value::Int(2), &Value::Float(2.0)));
        assert!(!values_equal(&Value::str("2"), &Value::Int(2)));
    }

    // ==========================================================================
    // Nodes
    // ==========================================================================

    #[test]
    fn test_property_and_binary_evaluation() {
        let node = BoundNode::Binary {
            op: BinaryOp::Mul,
            lhs: Box::new(prop("price", Type::Float)),
            rhs: Box::new(prop("volume", Type::Int)),
            ty: Type::Float,
        };
        assert_eq!(node.evaluate(&row()).unwrap(), Value::Float(42.0));
        assert_eq!(node.evaluate(&row()).unwrap(), node.evaluate(&row()).unwrap());
    }

    #[test]
    fn test_null_receiver_short_circuits() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = called.clone();
        let node = BoundNode::InstanceMethodCall {
            receiver: Box::new(BoundNode::Slot {
                slot: 3,
                ty: Type::event("Trade"),
            }),
            method: BoundMethod {
                signature: MethodSignature {
                    declaring_type: "Trade".into(),
                    name: "touch".into(),
                    params: vec![],
                },
                invoker: Arc::new(move |_, _| {
                    seen.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(Value::Int(1))
                }),
            },
            args: vec![],
            ty: Type::Int,
        };
        assert_eq!(node.evaluate(&row()).unwrap(), Value::Null);
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_method_failure_becomes_fault() {
        let node = BoundNode::StaticFunctionCall {
            function: BoundFunction {
                signature: MethodSignature {
                    declaring_type: "Lib".into(),
                    name: "explode".into(),
                    params: vec![],
                },
                invoker: Arc::new(|_| Err(MethodError::new("boom"))),
            },
            args: vec![],
            ty: Type::Int,
        };
        match node.evaluate(&row()) {
            Err(EvaluationFault::MethodFailed { method, message }) => {
                assert_eq!(method, "Lib.explode()");
                assert_eq!(message, "boom");
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_predicate_requires_explicit_true() {
        assert!(!BoundNode::Literal(Value::Null).evaluate_predicate(&[]).unwrap());
        assert!(!BoundNode::Literal(Value::Int(1)).evaluate_predicate(&[]).unwrap());
        assert!(BoundNode::Literal(Value::Bool(true)).evaluate_predicate(&[]).unwrap());
    }
}
