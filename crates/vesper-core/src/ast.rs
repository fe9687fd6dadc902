//! Abstract syntax handed to the evaluation core by the query front end.
//!
//! Expressions are chains of dotted segments (`a.b().c(x, y)`) combined with
//! a small set of operators; patterns are trees of temporal operators over
//! filtered event types; a statement ties a source (stream or pattern) to
//! its select list, where clause and group-by.

use crate::value::Value;
use std::fmt;
use std::time::Duration;

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// One dotted step of a chain: a property (`name`), a call (`name(args)`),
/// optionally followed by an index (`name[2]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub args: Option<Vec<Expr>>,
    pub index: Option<usize>,
}

impl Segment {
    pub fn property(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
            index: None,
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args: Some(args),
            index: None,
        }
    }

    pub fn is_call(&self) -> bool {
        self.args.is_some()
    }

    pub fn arity(&self) -> usize {
        self.args.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// An unresolved expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `*` passed as an argument
    Wildcard,
    /// `root.seg1.seg2(...)`; the first segment is the chain root
    Chain(Vec<Segment>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// A bare identifier: a stream alias, namespace or property name.
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Chain(vec![Segment::property(name)])
    }

    /// A dotted property path such as `s0.inside.name`.
    pub fn path<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        Expr::Chain(parts.into_iter().map(Segment::property).collect())
    }

    /// An unqualified function call such as `sum(price)`.
    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Chain(vec![Segment::call(name, args)])
    }

    /// Append a property segment.
    pub fn prop(self, name: impl Into<String>) -> Self {
        self.push_segment(Segment::property(name))
    }

    /// Append a call segment.
    pub fn call(self, name: impl Into<String>, args: Vec<Expr>) -> Self {
        self.push_segment(Segment::call(name, args))
    }

    /// Index the last segment.
    pub fn at(self, index: usize) -> Self {
        match self {
            Expr::Chain(mut segments) => {
                if let Some(last) = segments.last_mut() {
                    last.index = Some(index);
                }
                Expr::Chain(segments)
            }
            other => other,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn equals(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn gt(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Gt, lhs, rhs)
    }

    fn push_segment(self, segment: Segment) -> Self {
        match self {
            Expr::Chain(mut segments) => {
                segments.push(segment);
                Expr::Chain(segments)
            }
            // Chains can only hang off a chain root
            other => other,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(args) = &self.args {
            write!(f, "(")?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ")")?;
        }
        if let Some(index) = self.index {
            write!(f, "[{}]", index)?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Wildcard => write!(f, "*"),
            Expr::Chain(segments) => {
                for (i, seg) in segments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", seg)?;
                }
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            Expr::Not(inner) => write!(f, "not {}", inner),
            Expr::Neg(inner) => write!(f, "-{}", inner),
        }
    }
}

// ============================================================================
// PATTERNS
// ============================================================================

/// `tag=EventType(predicate)`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub tag: Option<String>,
    pub event_type: String,
    pub predicate: Option<Expr>,
}

/// A pattern expression
#[derive(Debug, Clone, PartialEq)]
pub enum PatternExpr {
    Filter(FilterSpec),
    /// `every child`
    Every(Box<PatternExpr>),
    /// `left -> right`
    Sequence(Box<PatternExpr>, Box<PatternExpr>),
    /// `a or b or ...`
    Alternation(Vec<PatternExpr>),
    /// `a and b and ...`
    Conjunction(Vec<PatternExpr>),
    /// `[min:max] child`; `max = None` is unbounded
    Repetition {
        child: Box<PatternExpr>,
        min: u32,
        max: Option<u32>,
    },
    /// `not child`
    Negation(Box<PatternExpr>),
    /// `child within duration`
    Within(Box<PatternExpr>, Duration),
    /// `child while (guard)`
    GuardedBy(Box<PatternExpr>, Expr),
    /// `timer:interval(duration)`
    Timer(Duration),
}

impl PatternExpr {
    pub fn filter(event_type: impl Into<String>) -> Self {
        PatternExpr::Filter(FilterSpec {
            tag: None,
            event_type: event_type.into(),
            predicate: None,
        })
    }

    pub fn tagged(tag: impl Into<String>, event_type: impl Into<String>) -> Self {
        PatternExpr::Filter(FilterSpec {
            tag: Some(tag.into()),
            event_type: event_type.into(),
            predicate: None,
        })
    }

    /// Attach a predicate to a filter; no-op on other nodes.
    pub fn with_predicate(self, predicate: Expr) -> Self {
        match self {
            PatternExpr::Filter(mut spec) => {
                spec.predicate = Some(predicate);
                PatternExpr::Filter(spec)
            }
            other => other,
        }
    }

    pub fn every(child: PatternExpr) -> Self {
        PatternExpr::Every(Box::new(child))
    }

    pub fn followed_by(left: PatternExpr, right: PatternExpr) -> Self {
        PatternExpr::Sequence(Box::new(left), Box::new(right))
    }

    pub fn or(children: Vec<PatternExpr>) -> Self {
        PatternExpr::Alternation(children)
    }

    pub fn and(children: Vec<PatternExpr>) -> Self {
        PatternExpr::Conjunction(children)
    }

    pub fn repeat(child: PatternExpr, min: u32, max: Option<u32>) -> Self {
        PatternExpr::Repetition {
            child: Box::new(child),
            min,
            max,
        }
    }

    pub fn not(child: PatternExpr) -> Self {
        PatternExpr::Negation(Box::new(child))
    }

    pub fn within(child: PatternExpr, duration: Duration) -> Self {
        PatternExpr::Within(Box::new(child), duration)
    }

    pub fn guarded_by(child: PatternExpr, guard: Expr) -> Self {
        PatternExpr::GuardedBy(Box::new(child), guard)
    }

    pub fn timer(duration: Duration) -> Self {
        PatternExpr::Timer(duration)
    }
}

// ============================================================================
// STATEMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Keep the last `n` events
    Length(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    /// Every left event produces at least one row; the right side is null
    /// when nothing matches
    LeftOuter,
}

/// One side of a join: an aliased stream and how many of its events are
/// retained (all of them when `window` is `None`)
#[derive(Debug, Clone, PartialEq)]
pub struct JoinStream {
    pub event_type: String,
    pub alias: String,
    pub window: Option<WindowSpec>,
}

impl JoinStream {
    pub fn new(event_type: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            alias: alias.into(),
            window: None,
        }
    }

    pub fn with_length_window(mut self, size: usize) -> Self {
        self.window = Some(WindowSpec::Length(size));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    Stream {
        event_type: String,
        alias: Option<String>,
        window: Option<WindowSpec>,
    },
    Pattern(PatternExpr),
    /// `from <left> [left outer] join <right> [on <expr>]`; a join without
    /// `on` is a cross join
    Join {
        left: JoinStream,
        right: JoinStream,
        kind: JoinKind,
        on: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

impl SelectItem {
    pub fn expr(expr: Expr) -> Self {
        SelectItem::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// A compiled-from-text statement, ready to be bound
#[derive(Debug, Clone, PartialEq)]
pub struct StatementSpec {
    pub name: Option<String>,
    pub select: Vec<SelectItem>,
    pub source: SourceSpec,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
}

impl StatementSpec {
    /// `select ... from <event_type> as <alias>`
    pub fn from_stream(event_type: impl Into<String>, alias: Option<&str>) -> Self {
        Self {
            name: None,
            select: Vec::new(),
            source: SourceSpec::Stream {
                event_type: event_type.into(),
                alias: alias.map(str::to_string),
                window: None,
            },
            where_clause: None,
            group_by: Vec::new(),
        }
    }

    /// `select ... from pattern [...]`
    pub fn from_pattern(pattern: PatternExpr) -> Self {
        Self {
            name: None,
            select: Vec::new(),
            source: SourceSpec::Pattern(pattern),
            where_clause: None,
            group_by: Vec::new(),
        }
    }

    /// `select ... from <left>, <right>`
    pub fn from_join(left: JoinStream, right: JoinStream) -> Self {
        Self {
            name: None,
            select: Vec::new(),
            source: SourceSpec::Join {
                left,
                right,
                kind: JoinKind::Inner,
                on: None,
            },
            where_clause: None,
            group_by: Vec::new(),
        }
    }

    /// `... left outer join <right> on <on>`
    pub fn from_left_outer_join(left: JoinStream, right: JoinStream, on: Expr) -> Self {
        let mut spec = Self::from_join(left, right).join_on(on);
        if let SourceSpec::Join { kind, .. } = &mut spec.source {
            *kind = JoinKind::LeftOuter;
        }
        spec
    }

    /// Join condition of an inner join; no-op for other sources.
    pub fn join_on(mut self, condition: Expr) -> Self {
        if let SourceSpec::Join { on, .. } = &mut self.source {
            *on = Some(condition);
        }
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn select(mut self, item: SelectItem) -> Self {
        self.select.push(item);
        self
    }

    pub fn filter_where(mut self, expr: Expr) -> Self {
        self.where_clause = Some(expr);
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    /// Attach a length window; no-op for pattern and join sources (join
    /// sides carry their own windows).
    pub fn with_length_window(mut self, size: usize) -> Self {
        if let SourceSpec::Stream { window, .. } = &mut self.source {
            *window = Some(WindowSpec::Length(size));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_display_matches_query_text() {
        let expr = Expr::ident("s0").call(
            "getValueAsInt",
            vec![Expr::Wildcard, Expr::lit("id")],
        );
        assert_eq!(expr.to_string(), "s0.getValueAsInt(*, 'id')");

        let chained = Expr::ident("top")
            .call("getChildOne", vec![Expr::lit("abc"), Expr::lit(10i64)])
            .call("getChildTwo", vec![Expr::lit("append")]);
        assert_eq!(
            chained.to_string(),
            "top.getChildOne('abc', 10).getChildTwo('append')"
        );
    }

    #[test]
    fn test_index_applies_to_last_segment() {
        let expr = Expr::ident("s").at(0).prop("theString");
        assert_eq!(expr.to_string(), "s[0].theString");
    }

    #[test]
    fn test_binary_display() {
        let expr = Expr::gt(Expr::path(["s0", "volume"]), Expr::lit(0i64));
        assert_eq!(expr.to_string(), "s0.volume > 0");
    }

    #[test]
    fn test_left_outer_join_builder() {
        let spec = StatementSpec::from_left_outer_join(
            JoinStream::new("Trade", "s0"),
            JoinStream::new("Quote", "s1").with_length_window(10),
            Expr::equals(Expr::path(["s0", "symbol"]), Expr::path(["s1", "symbol"])),
        )
        .with_length_window(5);
        let SourceSpec::Join { left, right, kind, on } = &spec.source else {
            panic!("expected a join source");
        };
        assert_eq!(*kind, JoinKind::LeftOuter);
        assert_eq!(left.window, None);
        assert_eq!(right.window, Some(WindowSpec::Length(10)));
        assert_eq!(on.as_ref().map(ToString::to_string).as_deref(), Some("s0.symbol = s1.symbol"));
    }

    #[test]
    fn test_predicate_only_attaches_to_filters() {
        let p = PatternExpr::tagged("e1", "A").with_predicate(Expr::lit(true));
        assert!(matches!(p, PatternExpr::Filter(FilterSpec { predicate: Some(_), .. })));
        let t = PatternExpr::timer(Duration::from_secs(1)).with_predicate(Expr::lit(true));
        assert!(matches!(t, PatternExpr::Timer(_)));
    }
}
