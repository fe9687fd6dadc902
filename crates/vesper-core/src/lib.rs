//! # Vesper Core
//!
//! Foundational types shared by the vesper continuous-query engine.
//!
//! This crate holds everything the evaluation core consumes from its
//! collaborators, without depending on how any of them work:
//!
//! - **Values**: the runtime representation of property values, events and
//!   opaque underlying objects
//! - **Types**: the static type vocabulary used at bind time
//! - **Event capability**: the [`EventBean`] trait every event representation
//!   implements, plus the map-backed [`MapEvent`]
//! - **Shapes**: declared properties, instance methods and static functions
//!   of event types and classes, collected in a [`TypeRegistry`]
//! - **AST**: expression chains, pattern expressions and statement specs as
//!   produced by the query-language front end
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vesper_core::{Expr, MapEvent, Value};
//!
//! let event = MapEvent::new("Trade").with_field("price", 10.5);
//! assert_eq!(event.get("price"), Some(Value::Float(10.5)));
//!
//! // s0.getPriceTimesVolume(2)
//! let expr = Expr::ident("s0").call("getPriceTimesVolume", vec![Expr::lit(2i64)]);
//! assert_eq!(expr.to_string(), "s0.getPriceTimesVolume(2)");
//! ```

pub mod ast;
pub mod event;
pub mod shape;
pub mod suggest;
pub mod types;
pub mod value;

pub use ast::{
    BinaryOp, Expr, FilterSpec, JoinKind, JoinStream, PatternExpr, Segment, SelectItem,
    SourceSpec, StatementSpec, WindowSpec,
};
pub use event::{EventBean, EventRef, FxIndexMap, MapEvent};
pub use shape::{
    ClassShape, FunctionDescriptor, FunctionNamespace, MethodDescriptor, MethodError,
    MethodInvoker, MethodSignature, PropertyDescriptor, PropertyGetter, StaticInvoker,
    TypeRegistry,
};
pub use types::Type;
pub use value::{ObjectRef, Value};
