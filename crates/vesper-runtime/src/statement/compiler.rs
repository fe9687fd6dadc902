//! Statement compilation
//!
//! Binds a [`StatementSpec`] against the type registry and the aggregation
//! function registry. The row an expression sees is laid out as:
//!
//! | Source  | Slots `0..base`                 | Slots `base..`                |
//! |---------|---------------------------------|-------------------------------|
//! | Stream  | the event (alias, default)      | one per distinct aggregation  |
//! | Pattern | one per tag, in declaration order | one per distinct aggregation |
//! | Join    | left event, right event (or null) | one per distinct aggregation |
//!
//! Aggregations are only visible to the select list; the where clause and
//! group-by expressions are bound against the source slots alone.

use super::types::{AggregateSlot, CompiledSource, CompiledStatement, JoinSide, OutputColumn};
use crate::aggregation::{AggregationFunctionRegistry, AggregationHandler, StateKey, ValidationContext};
use crate::error::{ResolutionError, StatementActivationError};
use crate::pattern::CompiledPattern;
use crate::resolver::{aggregate_text, bind_expression, BoundNode, StreamShapes};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::debug;
use vesper_core::suggest::did_you_mean;
use vesper_core::{
    Expr, JoinKind, JoinStream, Segment, SelectItem, SourceSpec, StatementSpec, Type, TypeRegistry,
    WindowSpec,
};

/// Compile a statement specification into its bound form
pub(crate) fn compile_statement(
    spec: &StatementSpec,
    registry: &TypeRegistry,
    functions: &AggregationFunctionRegistry,
) -> Result<CompiledStatement, StatementActivationError> {
    let (source, base) = compile_source(&spec.source, registry)?;
    let base_width = match &source {
        CompiledSource::Stream { .. } => 1,
        CompiledSource::Pattern(pattern) => pattern.row_width(),
        CompiledSource::Join { .. } => 2,
    };
    let windowed = matches!(source, CompiledSource::Stream { window: Some(_), .. });

    let where_clause = spec
        .where_clause
        .as_ref()
        .map(|expr| bind_boolean(expr, &base, "where clause"))
        .transpose()?;

    let group_by = spec
        .group_by
        .iter()
        .map(|expr| bind_expression(expr, &base))
        .collect::<Result<Vec<_>, _>>()?;

    // Aggregation occurrences, deduplicated by their canonical text
    let mut calls = Vec::new();
    for item in &spec.select {
        if let SelectItem::Expr { expr, .. } = item {
            collect_aggregates(expr, functions, false, &mut calls)?;
        }
    }

    let mut scope = base.clone();
    let mut aggregates: Vec<AggregateSlot> = Vec::new();
    for call in calls {
        let text = aggregate_text(&call);
        if aggregates.iter().any(|a| a.text == text) {
            continue;
        }
        let handler = validate_aggregate(&call, &base, functions, windowed)?;
        let slot = base_width + aggregates.len();
        scope = scope.with_aggregate(text.clone(), slot, handler.return_type.clone());
        aggregates.push(AggregateSlot {
            text,
            handler,
            slot,
        });
    }

    let mut seen: FxHashSet<StateKey> = FxHashSet::default();
    let distinct_states = aggregates
        .iter()
        .enumerate()
        .filter(|(_, a)| seen.insert(a.handler.state_key.clone()))
        .map(|(i, _)| i)
        .collect();

    let mut columns = Vec::new();
    if spec.select.is_empty() {
        wildcard_columns(&source, &base, &mut columns);
    }
    for item in &spec.select {
        match item {
            SelectItem::Wildcard => wildcard_columns(&source, &base, &mut columns),
            SelectItem::Expr { expr, alias } => columns.push(OutputColumn {
                name: alias.clone().unwrap_or_else(|| expr.to_string()),
                node: bind_expression(expr, &scope)?,
            }),
        }
    }

    debug!(
        statement = ?spec.name,
        aggregates = aggregates.len(),
        columns = columns.len(),
        "Compiled statement"
    );

    Ok(CompiledStatement {
        name: spec.name.clone(),
        source,
        base_width,
        aggregates,
        distinct_states,
        where_clause,
        group_by,
        columns,
    })
}

fn compile_source<'r>(
    source: &SourceSpec,
    registry: &'r TypeRegistry,
) -> Result<(CompiledSource, StreamShapes<'r>), StatementActivationError> {
    match source {
        SourceSpec::Stream {
            event_type,
            alias,
            window,
        } => {
            require_event_type(event_type, registry)?;
            let alias = alias.clone().unwrap_or_else(|| event_type.clone());
            let scope = StreamShapes::new(registry)
                .stream(alias, event_type.clone())
                .with_default_stream(0);
            let window = window.map(|WindowSpec::Length(n)| n);
            Ok((
                CompiledSource::Stream {
                    event_type: event_type.clone(),
                    window,
                },
                scope,
            ))
        }
        SourceSpec::Pattern(pattern) => {
            let compiled = CompiledPattern::compile(pattern, registry)?;
            let scope = compiled.stream_shapes(registry);
            Ok((CompiledSource::Pattern(Arc::new(compiled)), scope))
        }
        SourceSpec::Join {
            left,
            right,
            kind,
            on,
        } => {
            require_event_type(&left.event_type, registry)?;
            require_event_type(&right.event_type, registry)?;
            if left.alias == right.alias {
                return Err(ResolutionError::TypeMismatch {
                    context: "join".to_string(),
                    expected: "distinct stream aliases".to_string(),
                    found: format!("'{}' twice", left.alias),
                }
                .into());
            }
            let scope = StreamShapes::new(registry)
                .stream(left.alias.clone(), left.event_type.clone())
                .stream(right.alias.clone(), right.event_type.clone());
            let on = on
                .as_ref()
                .map(|expr| bind_boolean(expr, &scope, "join condition"))
                .transpose()?;
            Ok((
                CompiledSource::Join {
                    left: join_side(left),
                    right: join_side(right),
                    outer: *kind == JoinKind::LeftOuter,
                    on,
                },
                scope,
            ))
        }
    }
}

fn require_event_type(name: &str, registry: &TypeRegistry) -> Result<(), StatementActivationError> {
    if registry.event_type(name).is_none() {
        return Err(ResolutionError::UnknownEventType {
            name: name.to_string(),
            hint: did_you_mean(name, registry.event_type_names()),
        }
        .into());
    }
    Ok(())
}

fn join_side(stream: &JoinStream) -> JoinSide {
    JoinSide {
        event_type: stream.event_type.clone(),
        retain: stream.window.map(|WindowSpec::Length(n)| n),
    }
}

fn bind_boolean(
    expr: &Expr,
    scope: &StreamShapes<'_>,
    context: &str,
) -> Result<BoundNode, StatementActivationError> {
    let node = bind_expression(expr, scope)?;
    let ty = node.result_type();
    if !Type::Bool.is_assignable_from(&ty) {
        return Err(ResolutionError::type_mismatch(
            format!("{} '{}'", context, expr),
            &Type::Bool,
            &ty,
        )
        .into());
    }
    Ok(node)
}

/// Collect the aggregation calls of an expression, outermost first.
fn collect_aggregates(
    expr: &Expr,
    functions: &AggregationFunctionRegistry,
    nested: bool,
    out: &mut Vec<Segment>,
) -> Result<(), StatementActivationError> {
    match expr {
        Expr::Chain(segments) => {
            let mut rest = segments.as_slice();
            if let Some(root) = segments.first() {
                if root.is_call() && functions.is_aggregation(&root.name) {
                    if nested {
                        return Err(StatementActivationError::InvalidAggregation {
                            function: root.name.clone(),
                            message: "aggregation functions cannot be nested".to_string(),
                        });
                    }
                    for arg in root.args.iter().flatten() {
                        collect_aggregates(arg, functions, true, out)?;
                    }
                    out.push(root.clone());
                    rest = &segments[1..];
                }
            }
            for segment in rest {
                for arg in segment.args.iter().flatten() {
                    collect_aggregates(arg, functions, nested, out)?;
                }
            }
            Ok(())
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_aggregates(lhs, functions, nested, out)?;
            collect_aggregates(rhs, functions, nested, out)
        }
        Expr::Not(inner) | Expr::Neg(inner) => collect_aggregates(inner, functions, nested, out),
        Expr::Literal(_) | Expr::Wildcard => Ok(()),
    }
}

fn validate_aggregate(
    call: &Segment,
    base: &StreamShapes<'_>,
    functions: &AggregationFunctionRegistry,
    windowed: bool,
) -> Result<AggregationHandler, StatementActivationError> {
    let args = call.args.as_deref().unwrap_or_default();
    let wildcard = matches!(args, [Expr::Wildcard]);
    let bound = if wildcard {
        Vec::new()
    } else {
        args.iter()
            .map(|arg| bind_expression(arg, base))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut ctx = ValidationContext::new(call.name.to_ascii_lowercase(), bound);
    ctx.wildcard = wildcard;
    ctx.windowed = windowed;
    functions.validate(&ctx)
}

/// `select *`: every declared property of a stream, every tag of a
/// pattern, or every stream of a join.
fn wildcard_columns(source: &CompiledSource, base: &StreamShapes<'_>, columns: &mut Vec<OutputColumn>) {
    match source {
        CompiledSource::Stream { event_type, .. } => {
            if let Some(shape) = base.registry().event_type(event_type) {
                columns.extend(shape.properties().map(|p| OutputColumn {
                    name: p.name.clone(),
                    node: BoundNode::PropertyAccess {
                        slot: 0,
                        property: p.name.clone(),
                        ty: p.ty.clone(),
                    },
                }));
            }
        }
        CompiledSource::Pattern(_) | CompiledSource::Join { .. } => {
            columns.extend(base.streams().iter().map(|s| OutputColumn {
                name: s.alias.clone(),
                node: BoundNode::Slot {
                    slot: s.slot,
                    ty: s.slot_type(),
                },
            }));
        }
    }
}
