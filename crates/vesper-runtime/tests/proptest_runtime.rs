//! Property-based tests for the vesper runtime.
//!
//! Covers: deterministic expression binding, group isolation of aggregation
//! state, and read-only accessors.

use std::collections::HashMap;

use proptest::prelude::*;
use vesper_core::{
    BinaryOp, ClassShape, EventRef, Expr, MapEvent, SelectItem, StatementSpec, Type, TypeRegistry,
    Value,
};
use vesper_runtime::aggregation::ValidationContext;
use vesper_runtime::{GroupKey, StatementInstanceId, StatementRuntime};

fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register_class(
        ClassShape::event("Trade")
            .property("symbol", Type::Str)
            .property("volume", Type::Int)
            .property("size", Type::Int),
    );
    registry
}

fn trade(symbol: &str, volume: i64, size: i64) -> EventRef {
    MapEvent::new("Trade")
        .with_field("symbol", symbol)
        .with_field("volume", volume)
        .with_field("size", size)
        .into_ref()
}

/// Integer arithmetic over the two int properties, with its own evaluator
#[derive(Debug, Clone)]
enum Arith {
    Volume,
    Size,
    Lit(i64),
    Op(BinaryOp, Box<Arith>, Box<Arith>),
}

impl Arith {
    fn to_expr(&self) -> Expr {
        match self {
            Arith::Volume => Expr::path(["t", "volume"]),
            Arith::Size => Expr::ident("size"),
            Arith::Lit(n) => Expr::lit(*n),
            Arith::Op(op, l, r) => Expr::binary(*op, l.to_expr(), r.to_expr()),
        }
    }

    /// `None` on overflow
    fn eval(&self, volume: i64, size: i64) -> Option<i64> {
        match self {
            Arith::Volume => Some(volume),
            Arith::Size => Some(size),
            Arith::Lit(n) => Some(*n),
            Arith::Op(op, l, r) => {
                let (a, b) = (l.eval(volume, size)?, r.eval(volume, size)?);
                match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Sub => a.checked_sub(b),
                    _ => a.checked_mul(b),
                }
            }
        }
    }
}

fn arb_arith() -> impl Strategy<Value = Arith> {
    let leaf = prop_oneof![
        Just(Arith::Volume),
        Just(Arith::Size),
        (-1_000i64..1_000).prop_map(Arith::Lit),
    ];
    leaf.prop_recursive(4, 16, 2, |inner| {
        (
            prop_oneof![Just(BinaryOp::Add), Just(BinaryOp::Sub), Just(BinaryOp::Mul)],
            inner.clone(),
            inner,
        )
            .prop_map(|(op, l, r)| Arith::Op(op, Box::new(l), Box::new(r)))
    })
}

proptest! {
    /// Binding the same expression twice yields structurally equal trees
    /// that evaluate like the reference arithmetic.
    #[test]
    fn binding_is_deterministic(
        arith in arb_arith(),
        volume in -1_000i64..1_000,
        size in -1_000i64..1_000,
    ) {
        let rt = StatementRuntime::new(registry());
        let scope = rt.stream_shapes().stream("t", "Trade").with_default_stream(0);
        let expr = arith.to_expr();

        let first = rt.bind_expression(&expr, &scope).unwrap();
        let second = rt.bind_expression(&expr, &scope).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.result_type(), Type::Int);

        let row = [Value::Event(trade("IBM", volume, size))];
        match arith.eval(volume, size) {
            Some(expected) => prop_assert_eq!(first.evaluate(&row), Ok(Value::Int(expected))),
            None => prop_assert!(first.evaluate(&row).is_err()),
        }
    }

    /// Each group's running total only ever sees its own rows.
    #[test]
    fn groups_never_see_each_other(
        trades in prop::collection::vec((0usize..4, 0i64..100), 1..40),
    ) {
        let symbols = ["IBM", "MSFT", "ORCL", "SAP"];
        let rt = StatementRuntime::new(registry());
        let spec = StatementSpec::from_stream("Trade", None)
            .select(SelectItem::expr(Expr::ident("symbol")))
            .select(SelectItem::aliased(
                Expr::func("sum", vec![Expr::ident("volume")]),
                "total",
            ))
            .group_by(Expr::ident("symbol"));
        let id = rt.create_statement(&spec).unwrap();

        let mut expected: HashMap<&str, i64> = HashMap::new();
        for (group, volume) in &trades {
            let symbol = symbols[*group];
            let running = expected.entry(symbol).or_insert(0);
            *running += volume;

            let outputs = rt.send_event(&trade(symbol, *volume, 0));
            prop_assert_eq!(outputs.len(), 1);
            let row = &outputs[0].rows[0];
            prop_assert_eq!(row.get("symbol"), Some(&Value::str(symbol)));
            prop_assert_eq!(row.get("total"), Some(&Value::Int(*running)));
        }
        prop_assert_eq!(rt.group_count(id), expected.len());
    }

    /// Reading a state any number of times never changes it.
    #[test]
    fn accessors_are_read_only(
        volumes in prop::collection::vec(-1_000i64..1_000, 1..30),
        reads in 1usize..5,
    ) {
        let rt = StatementRuntime::new(registry());
        let scope = rt.stream_shapes().stream("t", "Trade");
        let arg = rt.bind_expression(&Expr::ident("volume"), &scope).unwrap();
        let ctx = ValidationContext::new("sum", vec![arg]);
        let handler = rt.functions().validate(&ctx).unwrap();

        let statement = StatementInstanceId(1);
        let state = rt
            .obtain_aggregation_state(statement, &GroupKey::ungrouped(), &handler)
            .unwrap();
        for volume in &volumes {
            state.enter(&[Value::Event(trade("IBM", *volume, 0))]).unwrap();
        }

        let total: i64 = volumes.iter().sum();
        for _ in 0..reads {
            prop_assert_eq!(
                state.evaluate(handler.accessor.as_ref()),
                Ok(Value::Int(total))
            );
        }
    }
}
