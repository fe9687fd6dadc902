//! Pattern compilation.
//!
//! A [`PatternExpr`] is compiled once per statement into a flat node table in
//! declaration (pre-order) order. Every tag gets a row slot; a filter's
//! predicate sees all tags plus the event under test, which sits in the
//! slot right after the last tag and doubles as the default stream.
//!
//! A tag declared under a repetition collects one event per iteration, so
//! outside that repetition it is bound to an event sequence and must be
//! read through an index or an enumeration method.

use crate::error::{ResolutionError, ResolveResult};
use crate::resolver::{bind_expression, BoundNode, StreamShapes};
use std::time::Duration;
use vesper_core::suggest::did_you_mean;
use vesper_core::{Expr, FilterSpec, PatternExpr, Type, TypeRegistry};

pub(crate) type NodeId = usize;

/// A tag and the row slot its event (or event sequence) is bound to
#[derive(Debug, Clone, PartialEq)]
pub struct TagInfo {
    pub name: String,
    pub event_type: String,
    pub slot: usize,
    /// Repetition nodes enclosing the tag's filter
    repetitions: Vec<NodeId>,
}

impl TagInfo {
    /// Whether the tag is sequence-valued when seen from outside every
    /// repetition.
    pub fn is_indexed(&self) -> bool {
        !self.repetitions.is_empty()
    }

    /// Whether the tag is sequence-valued when seen from a position
    /// enclosed by `enclosing` repetitions.
    fn indexed_from(&self, enclosing: &[NodeId]) -> bool {
        self.repetitions.iter().any(|r| !enclosing.contains(r))
    }
}

#[derive(Debug)]
pub(crate) struct FilterNode {
    pub event_type: String,
    pub slot: Option<usize>,
    pub predicate: Option<BoundNode>,
}

#[derive(Debug)]
pub(crate) enum PatternNode {
    Filter(FilterNode),
    Every(NodeId),
    Sequence(NodeId, NodeId),
    Alternation(Vec<NodeId>),
    Conjunction(Vec<NodeId>),
    Repetition {
        child: NodeId,
        min: u32,
        max: Option<u32>,
        /// Slots of tags declared inside the repeated child
        inner_slots: Vec<usize>,
    },
    Negation(NodeId),
    Within {
        child: NodeId,
        duration_ns: i64,
        /// The child is a negation: reaching the deadline unviolated
        /// completes instead of pruning
        absence: bool,
    },
    Guard {
        child: NodeId,
        guard: BoundNode,
    },
    Timer(i64),
}

/// An immutable, compiled pattern
#[derive(Debug)]
pub struct CompiledPattern {
    pub(crate) nodes: Vec<PatternNode>,
    tags: Vec<TagInfo>,
}

impl CompiledPattern {
    pub fn compile(pattern: &PatternExpr, registry: &TypeRegistry) -> ResolveResult<Self> {
        let mut tags = Vec::new();
        collect_tags(pattern, registry, &mut tags, &mut Vec::new(), &mut 0)?;

        let mut compiler = Compiler {
            registry,
            tags: &tags,
            nodes: Vec::new(),
            repetitions: Vec::new(),
        };
        compiler.compile(pattern)?;
        let nodes = compiler
            .nodes
            .into_iter()
            .map(|n| n.ok_or_else(|| ResolutionError::InvalidPattern("incomplete node".into())))
            .collect::<ResolveResult<Vec<_>>>()?;

        tracing::debug!(nodes = nodes.len(), tags = tags.len(), "Compiled pattern");
        Ok(Self { nodes, tags })
    }

    pub fn tags(&self) -> &[TagInfo] {
        &self.tags
    }

    /// Width of a completed match row: one slot per tag.
    pub fn row_width(&self) -> usize {
        self.tags.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) const ROOT: NodeId = 0;

    /// Shapes of a completed match, for binding select and where clauses.
    pub fn stream_shapes<'r>(&self, registry: &'r TypeRegistry) -> StreamShapes<'r> {
        self.tags.iter().fold(StreamShapes::new(registry), |scope, tag| {
            scope.stream_at(
                tag.name.clone(),
                tag.event_type.clone(),
                tag.slot,
                tag.is_indexed(),
            )
        })
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// First pass: assign slots to tags in declaration order. Node ids are
/// counted the same way the second pass allocates them.
fn collect_tags(
    expr: &PatternExpr,
    registry: &TypeRegistry,
    tags: &mut Vec<TagInfo>,
    repetitions: &mut Vec<NodeId>,
    next_id: &mut NodeId,
) -> ResolveResult<()> {
    let id = *next_id;
    *next_id += 1;
    match expr {
        PatternExpr::Filter(FilterSpec {
            tag, event_type, ..
        }) => {
            if registry.event_type(event_type).is_none() {
                return Err(ResolutionError::UnknownEventType {
                    name: event_type.clone(),
                    hint: did_you_mean(event_type, registry.event_type_names()),
                });
            }
            let Some(tag) = tag else {
                return Ok(());
            };
            match tags.iter().find(|t| &t.name == tag) {
                Some(existing) if &existing.event_type != event_type => {
                    return Err(ResolutionError::InvalidPattern(format!(
                        "tag '{}' is bound to both {} and {}",
                        tag, existing.event_type, event_type
                    )));
                }
                Some(_) => {}
                None => tags.push(TagInfo {
                    name: tag.clone(),
                    event_type: event_type.clone(),
                    slot: tags.len(),
                    repetitions: repetitions.clone(),
                }),
            }
        }
        PatternExpr::Every(child)
        | PatternExpr::Negation(child)
        | PatternExpr::Within(child, _)
        | PatternExpr::GuardedBy(child, _) => {
            collect_tags(child, registry, tags, repetitions, next_id)?;
        }
        PatternExpr::Sequence(left, right) => {
            collect_tags(left, registry, tags, repetitions, next_id)?;
            collect_tags(right, registry, tags, repetitions, next_id)?;
        }
        PatternExpr::Alternation(children) | PatternExpr::Conjunction(children) => {
            for child in children {
                collect_tags(child, registry, tags, repetitions, next_id)?;
            }
        }
        PatternExpr::Repetition { child, .. } => {
            repetitions.push(id);
            collect_tags(child, registry, tags, repetitions, next_id)?;
            repetitions.pop();
        }
        PatternExpr::Timer(_) => {}
    }
    Ok(())
}

struct Compiler<'a> {
    registry: &'a TypeRegistry,
    tags: &'a [TagInfo],
    nodes: Vec<Option<PatternNode>>,
    /// Repetitions enclosing the node being compiled
    repetitions: Vec<NodeId>,
}

impl Compiler<'_> {
    fn compile(&mut self, expr: &PatternExpr) -> ResolveResult<NodeId> {
        let id = self.nodes.len();
        self.nodes.push(None);
        let node = match expr {
            PatternExpr::Filter(spec) => PatternNode::Filter(self.filter(spec)?),
            PatternExpr::Every(child) => PatternNode::Every(self.compile(child)?),
            PatternExpr::Sequence(left, right) => {
                let left = self.compile(left)?;
                PatternNode::Sequence(left, self.compile(right)?)
            }
            PatternExpr::Alternation(children) => {
                PatternNode::Alternation(self.children(children, "or")?)
            }
            PatternExpr::Conjunction(children) => {
                PatternNode::Conjunction(self.children(children, "and")?)
            }
            PatternExpr::Repetition { child, min, max } => {
                if *min == 0 {
                    return Err(ResolutionError::InvalidPattern(
                        "repetition must match at least once".into(),
                    ));
                }
                if max.is_some_and(|max| max < *min) {
                    return Err(ResolutionError::InvalidPattern(format!(
                        "repetition bounds [{}:{}] are inverted",
                        min,
                        max.unwrap_or_default()
                    )));
                }
                self.repetitions.push(id);
                let child = self.compile(child)?;
                self.repetitions.pop();
                let inner_slots = self
                    .tags
                    .iter()
                    .filter(|t| t.repetitions.contains(&id))
                    .map(|t| t.slot)
                    .collect();
                PatternNode::Repetition {
                    child,
                    min: *min,
                    max: *max,
                    inner_slots,
                }
            }
            PatternExpr::Negation(child) => PatternNode::Negation(self.compile(child)?),
            PatternExpr::Within(child, duration) => {
                let absence = matches!(**child, PatternExpr::Negation(_));
                PatternNode::Within {
                    child: self.compile(child)?,
                    duration_ns: nanos(*duration),
                    absence,
                }
            }
            PatternExpr::GuardedBy(child, guard) => {
                let guard = self.guard(guard)?;
                PatternNode::Guard {
                    child: self.compile(child)?,
                    guard,
                }
            }
            PatternExpr::Timer(duration) => PatternNode::Timer(nanos(*duration)),
        };
        self.nodes[id] = Some(node);
        Ok(id)
    }

    fn children(&mut self, children: &[PatternExpr], operator: &str) -> ResolveResult<Vec<NodeId>> {
        if children.is_empty() {
            return Err(ResolutionError::InvalidPattern(format!(
                "'{}' needs at least one operand",
                operator
            )));
        }
        children.iter().map(|c| self.compile(c)).collect()
    }

    fn filter(&self, spec: &FilterSpec) -> ResolveResult<FilterNode> {
        let slot = spec
            .tag
            .as_ref()
            .and_then(|tag| self.tags.iter().find(|t| &t.name == tag))
            .map(|t| t.slot);

        let predicate = match &spec.predicate {
            Some(expr) => {
                let current = self.tags.len();
                let mut scope = StreamShapes::new(self.registry);
                for tag in self.tags {
                    if spec.tag.as_deref() == Some(tag.name.as_str()) {
                        continue;
                    }
                    scope = scope.stream_at(
                        tag.name.clone(),
                        tag.event_type.clone(),
                        tag.slot,
                        tag.indexed_from(&self.repetitions),
                    );
                }
                // The event under test; untagged filters reach it only
                // through unqualified names
                let alias = spec.tag.clone().unwrap_or_default();
                scope = scope
                    .stream_at(alias, spec.event_type.clone(), current, false)
                    .with_default_stream(current);
                Some(self.boolean(expr, &scope)?)
            }
            None => None,
        };

        Ok(FilterNode {
            event_type: spec.event_type.clone(),
            slot,
            predicate,
        })
    }

    fn guard(&self, expr: &Expr) -> ResolveResult<BoundNode> {
        let scope = self.tags.iter().fold(StreamShapes::new(self.registry), |scope, tag| {
            scope.stream_at(
                tag.name.clone(),
                tag.event_type.clone(),
                tag.slot,
                tag.indexed_from(&self.repetitions),
            )
        });
        self.boolean(expr, &scope)
    }

    fn boolean(&self, expr: &Expr, scope: &StreamShapes<'_>) -> ResolveResult<BoundNode> {
        let node = bind_expression(expr, scope)?;
        let ty = node.result_type();
        if !Type::Bool.is_assignable_from(&ty) {
            return Err(ResolutionError::type_mismatch(
                format!("pattern expression '{}'", expr),
                &Type::Bool,
                &ty,
            ));
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ClassShape;

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register_class(
                ClassShape::event("A")
                    .property("id", Type::Int)
                    .property("name", Type::Str),
            )
            .register_class(ClassShape::event("B").property("id", Type::Int));
        registry
    }

    #[test]
    fn test_tags_get_slots_in_declaration_order() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::every(PatternExpr::tagged("a", "A")),
            PatternExpr::tagged("b", "B"),
        );
        let compiled = CompiledPattern::compile(&pattern, &registry()).unwrap();
        let names: Vec<_> = compiled.tags().iter().map(|t| (t.name.as_str(), t.slot)).collect();
        assert_eq!(names, vec![("a", 0), ("b", 1)]);
        assert_eq!(compiled.node_count(), 4);
    }

    #[test]
    fn test_predicate_sees_earlier_and_own_tags() {
        let pattern = PatternExpr::followed_by(
            PatternExpr::tagged("a", "A"),
            PatternExpr::tagged("b", "B").with_predicate(Expr::equals(
                Expr::path(["b", "id"]),
                Expr::path(["a", "id"]),
            )),
        );
        assert!(CompiledPattern::compile(&pattern, &registry()).is_ok());
    }

    #[test]
    fn test_unqualified_property_resolves_against_event_under_test() {
        let pattern = PatternExpr::filter("A").with_predicate(Expr::gt(Expr::ident("id"), Expr::lit(5i64)));
        assert!(CompiledPattern::compile(&pattern, &registry()).is_ok());
    }

    #[test]
    fn test_repeated_tag_is_indexed_outside_its_repetition() {
        let pattern = PatternExpr::every(PatternExpr::repeat(PatternExpr::tagged("s", "A"), 2, Some(2)));
        let compiled = CompiledPattern::compile(&pattern, &registry()).unwrap();
        assert!(compiled.tags()[0].is_indexed());

        let guarded = PatternExpr::guarded_by(
            PatternExpr::repeat(PatternExpr::tagged("s", "A"), 2, Some(2)),
            Expr::gt(Expr::path(["s", "id"]), Expr::lit(0i64)),
        );
        let err = CompiledPattern::compile(&guarded, &registry()).unwrap_err();
        assert!(matches!(err, ResolutionError::AmbiguousIndexedProperty { .. }));
    }

    #[test]
    fn test_sibling_inside_repetition_is_single_valued() {
        let pattern = PatternExpr::repeat(
            PatternExpr::followed_by(
                PatternExpr::tagged("a", "A"),
                PatternExpr::tagged("b", "B").with_predicate(Expr::equals(
                    Expr::path(["b", "id"]),
                    Expr::path(["a", "id"]),
                )),
            ),
            2,
            None,
        );
        let compiled = CompiledPattern::compile(&pattern, &registry()).unwrap();
        assert!(matches!(
            &compiled.nodes[0],
            PatternNode::Repetition { inner_slots, .. } if inner_slots == &vec![0, 1]
        ));
    }

    #[test]
    fn test_unknown_event_type_suggests() {
        let err = CompiledPattern::compile(&PatternExpr::filter("AA"), &registry()).unwrap_err();
        assert!(matches!(err, ResolutionError::UnknownEventType { ref hint, .. } if hint.contains("'A'")));
    }

    #[test]
    fn test_invalid_shapes_are_rejected() {
        let reg = registry();
        assert!(CompiledPattern::compile(&PatternExpr::or(vec![]), &reg).is_err());
        assert!(CompiledPattern::compile(&PatternExpr::repeat(PatternExpr::filter("A"), 0, None), &reg).is_err());
        assert!(CompiledPattern::compile(&PatternExpr::repeat(PatternExpr::filter("A"), 3, Some(2)), &reg).is_err());
        let clash = PatternExpr::and(vec![PatternExpr::tagged("x", "A"), PatternExpr::tagged("x", "B")]);
        assert!(matches!(
            CompiledPattern::compile(&clash, &reg),
            Err(ResolutionError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_non_boolean_predicate_is_a_type_mismatch() {
        let pattern = PatternExpr::filter("A").with_predicate(Expr::ident("name"));
        assert!(matches!(
            CompiledPattern::compile(&pattern, &registry()),
            Err(ResolutionError::TypeMismatch { .. })
        ));
    }
}
