//! Expression and method resolution.
//!
//! Turns dotted, chained expressions (`a.b().c(x, y)`) into [`BoundNode`]
//! trees at statement-bind time. Each chain segment is resolved against the
//! declared type of the segment before it:
//!
//! 1. a declared property of the receiver's shape,
//! 2. a built-in date-time or enumeration method,
//! 3. an instance method of the receiver's class, chosen by overload
//!    resolution,
//! 4. at the chain root only, a static function or constant of a namespace.
//!
//! Anything else fails with [`ResolutionError::NoSuchMember`].

pub mod builtin;
pub mod node;
pub mod overload;
pub mod scope;

pub use builtin::{BuiltinMethod, DateTimeMethod, EnumMethod};
pub use node::{BoundFunction, BoundGetter, BoundMethod, BoundNode};
pub use scope::{StreamBinding, StreamShapes};

use crate::error::{ResolutionError, ResolveResult};
use overload::{ArgShape, Selection};
use vesper_core::suggest::did_you_mean;
use vesper_core::{
    BinaryOp, ClassShape, Expr, FunctionNamespace, MethodSignature, Segment, Type,
};

/// Bind an expression against the streams of one row.
pub fn bind_expression(expr: &Expr, scope: &StreamShapes<'_>) -> ResolveResult<BoundNode> {
    Resolver::new(scope).resolve(expr)
}

/// Text an aggregation call is exposed under: the call as written, without
/// any trailing index.
pub fn aggregate_text(call: &Segment) -> String {
    Segment {
        index: None,
        ..call.clone()
    }
    .to_string()
}

/// An argument resolved ahead of overload selection
enum BoundArg {
    Node(BoundNode),
    Wildcard,
}

impl BoundArg {
    fn shape(&self) -> ArgShape {
        match self {
            BoundArg::Node(n) => ArgShape::Typed(n.result_type()),
            BoundArg::Wildcard => ArgShape::Wildcard,
        }
    }
}

/// Stateless resolver over one scope
pub struct Resolver<'s, 'r> {
    scope: &'s StreamShapes<'r>,
}

impl<'s, 'r> Resolver<'s, 'r> {
    pub fn new(scope: &'s StreamShapes<'r>) -> Self {
        Self { scope }
    }

    pub fn resolve(&self, expr: &Expr) -> ResolveResult<BoundNode> {
        match expr {
            Expr::Literal(v) => Ok(BoundNode::Literal(v.clone())),
            Expr::Wildcard => self.bind_wildcard(&Type::AnyEvent, None),
            Expr::Chain(segments) => self.resolve_chain(segments),
            Expr::Binary { op, lhs, rhs } => self.resolve_binary(*op, lhs, rhs),
            Expr::Not(inner) => {
                let node = self.resolve(inner)?;
                let ty = node.result_type();
                if !is_boolean(&ty) {
                    return Err(ResolutionError::type_mismatch(
                        format!("'{}'", expr),
                        &Type::Bool,
                        &ty,
                    ));
                }
                Ok(BoundNode::Not(Box::new(node)))
            }
            Expr::Neg(inner) => {
                let node = self.resolve(inner)?;
                let ty = node.result_type();
                if !is_numeric_operand(&ty) {
                    return Err(ResolutionError::type_mismatch(
                        format!("'{}'", expr),
                        &Type::Float,
                        &ty,
                    ));
                }
                Ok(BoundNode::Neg {
                    operand: Box::new(node),
                    ty: if ty == Type::Null { Type::Unknown } else { ty },
                })
            }
        }
    }

    // =========================================================================
    // Chains
    // =========================================================================

    fn resolve_chain(&self, segments: &[Segment]) -> ResolveResult<BoundNode> {
        let (mut node, origin, consumed) = self.resolve_root(segments)?;
        let mut text = render(&segments[..consumed]);
        for segment in &segments[consumed..] {
            node = self.resolve_segment(node, segment, origin, &text)?;
            text.push('.');
            text.push_str(&segment.to_string());
        }
        Ok(node)
    }

    /// Resolve the chain root. Returns the node, the stream slot the chain
    /// originates from (for `*` arguments), and how many segments it used.
    fn resolve_root(
        &self,
        segments: &[Segment],
    ) -> ResolveResult<(BoundNode, Option<usize>, usize)> {
        let Some(root) = segments.first() else {
            return Err(ResolutionError::UnknownStream {
                name: String::new(),
                hint: String::new(),
            });
        };
        let registry = self.scope.registry();

        if root.is_call() {
            if let Some((slot, ty)) = self.scope.aggregate(&aggregate_text(root)) {
                let node = BoundNode::Slot {
                    slot: *slot,
                    ty: ty.clone(),
                };
                return Ok((apply_index(node, root, &root.name)?, None, 1));
            }
            // An unqualified call is a method of the default stream's event
            if let Some(default) = self.scope.default_stream() {
                let receiver = BoundNode::Slot {
                    slot: default.slot,
                    ty: default.slot_type(),
                };
                let node = self.resolve_segment(receiver, root, Some(default.slot), &default.alias)?;
                return Ok((node, Some(default.slot), 1));
            }
            return Err(ResolutionError::NoSuchMember {
                member: root.name.clone(),
                arity: root.arity(),
                declaring_type: "statement".to_string(),
                hint: String::new(),
            });
        }

        if let Some(binding) = self.scope.find_alias(&root.name) {
            let node = BoundNode::Slot {
                slot: binding.slot,
                ty: binding.slot_type(),
            };
            return Ok((apply_index(node, root, &root.name)?, Some(binding.slot), 1));
        }

        if let Some(namespace) = registry.namespace(&root.name) {
            let Some(member) = segments.get(1) else {
                return Err(ResolutionError::NoSuchMember {
                    member: root.name.clone(),
                    arity: 0,
                    declaring_type: namespace.name.clone(),
                    hint: String::new(),
                });
            };
            let node = self.resolve_static(namespace, member)?;
            return Ok((apply_index(node, member, &root.name)?, None, 2));
        }

        if self.scope.default_stream().is_none() {
            // Joins: an unqualified property belongs to the one stream
            // declaring it
            let declaring: Vec<&StreamBinding> = self
                .scope
                .streams()
                .iter()
                .filter(|s| {
                    registry
                        .class(&s.event_type)
                        .is_some_and(|shape| shape.get_property(&root.name).is_some())
                })
                .collect();
            match declaring.as_slice() {
                [] => {}
                [binding] => {
                    let node = self.stream_property(binding, &root.name)?;
                    return Ok((apply_index(node, root, &root.name)?, Some(binding.slot), 1));
                }
                many => {
                    return Err(ResolutionError::AmbiguousProperty {
                        property: root.name.clone(),
                        streams: many.iter().map(|s| s.alias.clone()).collect(),
                    })
                }
            }
        }

        if let Some(default) = self.scope.default_stream() {
            if registry
                .class(&default.event_type)
                .is_some_and(|shape| shape.get_property(&root.name).is_some())
            {
                let node = self.stream_property(default, &root.name)?;
                return Ok((apply_index(node, root, &root.name)?, Some(default.slot), 1));
            }
            if segments.len() == 1 {
                return Err(ResolutionError::NoSuchMember {
                    member: root.name.clone(),
                    arity: 0,
                    declaring_type: default.event_type.clone(),
                    hint: did_you_mean(&root.name, self.scope.root_candidates()),
                });
            }
        }

        Err(ResolutionError::UnknownStream {
            name: root.name.clone(),
            hint: did_you_mean(&root.name, self.scope.root_candidates()),
        })
    }

    /// Unqualified property of one stream's event.
    fn stream_property(&self, binding: &StreamBinding, name: &str) -> ResolveResult<BoundNode> {
        if binding.indexed {
            return Err(ResolutionError::AmbiguousIndexedProperty {
                stream: binding.alias.clone(),
                property: name.to_string(),
            });
        }
        let property = self
            .scope
            .registry()
            .class(&binding.event_type)
            .and_then(|shape| shape.get_property(name))
            .ok_or_else(|| ResolutionError::NoSuchMember {
                member: name.to_string(),
                arity: 0,
                declaring_type: binding.event_type.clone(),
                hint: String::new(),
            })?;
        Ok(BoundNode::PropertyAccess {
            slot: binding.slot,
            property: property.name.clone(),
            ty: property.ty.clone(),
        })
    }

    fn resolve_segment(
        &self,
        receiver: BoundNode,
        segment: &Segment,
        origin: Option<usize>,
        receiver_text: &str,
    ) -> ResolveResult<BoundNode> {
        let node = if segment.is_call() {
            self.resolve_method(receiver, segment, origin, receiver_text)?
        } else {
            self.resolve_property(receiver, segment, receiver_text)?
        };
        apply_index(node, segment, receiver_text)
    }

    fn resolve_property(
        &self,
        receiver: BoundNode,
        segment: &Segment,
        receiver_text: &str,
    ) -> ResolveResult<BoundNode> {
        let ty = receiver.result_type();
        let name = &segment.name;
        match &ty {
            Type::Event(class) | Type::Object(class) => {
                let shape = self.shape_of(class, &ty, name, 0)?;
                let Some(property) = shape.get_property(name) else {
                    return Err(no_such_member(name, 0, &ty, &shape.member_names()));
                };
                if let (BoundNode::Slot { slot, .. }, Type::Event(_)) = (&receiver, &ty) {
                    return Ok(BoundNode::PropertyAccess {
                        slot: *slot,
                        property: name.clone(),
                        ty: property.ty.clone(),
                    });
                }
                Ok(BoundNode::MemberRead {
                    receiver: Box::new(receiver),
                    property: name.clone(),
                    getter: property.getter.clone().map(|getter| BoundGetter {
                        class: class.clone(),
                        getter,
                    }),
                    ty: property.ty.clone(),
                })
            }
            Type::Map(_, value_ty) => Ok(BoundNode::MemberRead {
                receiver: Box::new(receiver),
                property: name.clone(),
                getter: None,
                ty: (**value_ty).clone(),
            }),
            Type::AnyEvent | Type::Any | Type::Unknown => Ok(BoundNode::MemberRead {
                receiver: Box::new(receiver),
                property: name.clone(),
                getter: None,
                ty: Type::Unknown,
            }),
            Type::Array(element) if element.is_event() => {
                Err(ResolutionError::AmbiguousIndexedProperty {
                    stream: receiver_text.to_string(),
                    property: name.clone(),
                })
            }
            _ => Err(no_such_member(name, 0, &ty, &[])),
        }
    }

    fn resolve_method(
        &self,
        receiver: BoundNode,
        segment: &Segment,
        origin: Option<usize>,
        receiver_text: &str,
    ) -> ResolveResult<BoundNode> {
        let ty = receiver.result_type();
        let name = &segment.name;
        let args = self.bind_args(segment)?;

        if let Some(found) = builtin::lookup(&ty, name, args.len()) {
            if found.method.needs_numeric_elements() {
                let element = ty.element_type().cloned().unwrap_or(Type::Unknown);
                if !(element.is_numeric() || element.is_dynamic()) {
                    return Err(ResolutionError::type_mismatch(
                        format!("'{}.{}'", receiver_text, segment),
                        &Type::array_of(Type::Float),
                        &ty,
                    ));
                }
            }
            let mut bound = Vec::with_capacity(args.len());
            for (i, (arg, param)) in args.into_iter().zip(&found.params).enumerate() {
                let node = self.finish_arg(arg, param, origin)?;
                let arg_ty = node.result_type();
                if !param.is_assignable_from(&arg_ty) {
                    return Err(ResolutionError::type_mismatch(
                        format!("argument {} of '{}'", i + 1, name),
                        param,
                        &arg_ty,
                    ));
                }
                bound.push(node);
            }
            return Ok(BoundNode::Builtin {
                receiver: Box::new(receiver),
                method: found.method,
                args: bound,
                ty: found.return_type,
            });
        }

        let Some(class) = ty.shape_name() else {
            let names: Vec<&str> = builtin::names_for(&ty).to_vec();
            return Err(no_such_member(name, args.len(), &ty, &names));
        };
        let shape = self.shape_of(class, &ty, name, args.len())?;
        let candidates: Vec<_> = shape.methods_named(name).collect();
        let params: Vec<&[Type]> = candidates.iter().map(|m| m.params.as_slice()).collect();
        let shapes: Vec<ArgShape> = args.iter().map(BoundArg::shape).collect();

        match overload::select(&params, &shapes) {
            Selection::Unique(i) => {
                let method = candidates[i];
                let bound = self.finish_args(args, &method.params, origin)?;
                Ok(BoundNode::InstanceMethodCall {
                    receiver: Box::new(receiver),
                    method: BoundMethod {
                        signature: MethodSignature {
                            declaring_type: shape.name.clone(),
                            name: method.name.clone(),
                            params: method.params.clone(),
                        },
                        invoker: method.invoker.clone(),
                    },
                    args: bound,
                    ty: method.return_type.clone(),
                })
            }
            Selection::NoArity => {
                let mut names = shape.member_names();
                names.extend(builtin::names_for(&ty));
                Err(no_such_member(name, shapes.len(), &ty, &names))
            }
            Selection::Mismatch {
                candidate,
                argument,
            } => Err(argument_mismatch(
                &shape.name,
                name,
                &params[candidate][argument],
                &shapes[argument],
                argument,
            )),
            Selection::Ambiguous(tied) => Err(ResolutionError::AmbiguousOverload {
                member: name.clone(),
                arity: shapes.len(),
                declaring_type: shape.name.clone(),
                candidates: tied
                    .iter()
                    .map(|&i| signature(&shape.name, name, params[i]).to_string())
                    .collect(),
            }),
        }
    }

    fn resolve_static(
        &self,
        namespace: &FunctionNamespace,
        member: &Segment,
    ) -> ResolveResult<BoundNode> {
        let name = &member.name;
        if !member.is_call() {
            return match namespace.get_constant(name) {
                Some(value) => Ok(BoundNode::Literal(value.clone())),
                None => Err(ResolutionError::NoSuchMember {
                    member: name.clone(),
                    arity: 0,
                    declaring_type: namespace.name.clone(),
                    hint: did_you_mean(name, namespace.member_names()),
                }),
            };
        }

        let args = self.bind_args(member)?;
        let candidates: Vec<_> = namespace.functions_named(name).collect();
        let params: Vec<&[Type]> = candidates.iter().map(|f| f.params.as_slice()).collect();
        let shapes: Vec<ArgShape> = args.iter().map(BoundArg::shape).collect();
        let origin = self.scope.default_stream().map(|s| s.slot);

        match overload::select(&params, &shapes) {
            Selection::Unique(i) => {
                let function = candidates[i];
                let bound = self.finish_args(args, &function.params, origin)?;
                Ok(BoundNode::StaticFunctionCall {
                    function: BoundFunction {
                        signature: signature(&namespace.name, name, &function.params),
                        invoker: function.invoker.clone(),
                    },
                    args: bound,
                    ty: function.return_type.clone(),
                })
            }
            Selection::NoArity => Err(ResolutionError::NoSuchMember {
                member: name.clone(),
                arity: shapes.len(),
                declaring_type: namespace.name.clone(),
                hint: did_you_mean(name, namespace.member_names()),
            }),
            Selection::Mismatch {
                candidate,
                argument,
            } => Err(argument_mismatch(
                &namespace.name,
                name,
                &params[candidate][argument],
                &shapes[argument],
                argument,
            )),
            Selection::Ambiguous(tied) => Err(ResolutionError::AmbiguousOverload {
                member: name.clone(),
                arity: shapes.len(),
                declaring_type: namespace.name.clone(),
                candidates: tied
                    .iter()
                    .map(|&i| signature(&namespace.name, name, params[i]).to_string())
                    .collect(),
            }),
        }
    }

    fn shape_of(
        &self,
        class: &str,
        ty: &Type,
        member: &str,
        arity: usize,
    ) -> ResolveResult<&'r ClassShape> {
        self.scope
            .registry()
            .class(class)
            .map(|shape| shape.as_ref())
            .ok_or_else(|| no_such_member(member, arity, ty, &[]))
    }

    // =========================================================================
    // Arguments
    // =========================================================================

    fn bind_args(&self, segment: &Segment) -> ResolveResult<Vec<BoundArg>> {
        let Some(args) = &segment.args else {
            return Ok(Vec::new());
        };
        args.iter()
            .map(|arg| match arg {
                Expr::Wildcard => Ok(BoundArg::Wildcard),
                other => self.resolve(other).map(BoundArg::Node),
            })
            .collect()
    }

    fn finish_args(
        &self,
        args: Vec<BoundArg>,
        params: &[Type],
        origin: Option<usize>,
    ) -> ResolveResult<Vec<BoundNode>> {
        args.into_iter()
            .zip(params)
            .map(|(arg, param)| self.finish_arg(arg, param, origin))
            .collect()
    }

    fn finish_arg(
        &self,
        arg: BoundArg,
        param: &Type,
        origin: Option<usize>,
    ) -> ResolveResult<BoundNode> {
        match arg {
            BoundArg::Node(node) => Ok(node),
            BoundArg::Wildcard => self.bind_wildcard(param, origin),
        }
    }

    /// `*` passed where an event is expected binds the originating event;
    /// passed where a collection of events is expected, the whole row.
    fn bind_wildcard(&self, param: &Type, origin: Option<usize>) -> ResolveResult<BoundNode> {
        if param.element_type().is_some_and(Type::is_event) {
            return Ok(BoundNode::Row {
                slots: self.scope.stream_slots(),
            });
        }
        let binding = origin
            .and_then(|slot| self.scope.by_slot(slot))
            .or_else(|| self.scope.default_stream())
            .or_else(|| self.scope.streams().first());
        match binding {
            Some(binding) => Ok(BoundNode::Slot {
                slot: binding.slot,
                ty: binding.slot_type(),
            }),
            None => Err(ResolutionError::TypeMismatch {
                context: "'*'".to_string(),
                expected: "a stream event".to_string(),
                found: "no stream".to_string(),
            }),
        }
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn resolve_binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> ResolveResult<BoundNode> {
        let left = self.resolve(lhs)?;
        let right = self.resolve(rhs)?;
        let (lt, rt) = (left.result_type(), right.result_type());
        let context = || format!("'{} {} {}'", lhs, op.symbol(), rhs);

        let ty = match op {
            BinaryOp::And | BinaryOp::Or => {
                let bad = if !is_boolean(&lt) { &lt } else { &rt };
                if !is_boolean(&lt) || !is_boolean(&rt) {
                    return Err(ResolutionError::type_mismatch(context(), &Type::Bool, bad));
                }
                Type::Bool
            }
            BinaryOp::Eq | BinaryOp::NotEq => {
                if !(comparable(&lt, &rt) || lt == rt) {
                    return Err(ResolutionError::type_mismatch(context(), &lt, &rt));
                }
                Type::Bool
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                if !comparable(&lt, &rt) {
                    return Err(ResolutionError::type_mismatch(context(), &lt, &rt));
                }
                Type::Bool
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let bad = if !is_numeric_operand(&lt) { &lt } else { &rt };
                if !is_numeric_operand(&lt) || !is_numeric_operand(&rt) {
                    return Err(ResolutionError::type_mismatch(context(), &Type::Float, bad));
                }
                if op == BinaryOp::Div {
                    Type::Float
                } else {
                    lt.numeric_join(&rt).unwrap_or(Type::Unknown)
                }
            }
        };

        Ok(BoundNode::Binary {
            op,
            lhs: Box::new(left),
            rhs: Box::new(right),
            ty,
        })
    }
}

fn render(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn apply_index(node: BoundNode, segment: &Segment, text: &str) -> ResolveResult<BoundNode> {
    let Some(index) = segment.index else {
        return Ok(node);
    };
    let ty = match node.result_type() {
        Type::Array(element) => *element,
        Type::Any | Type::Unknown => Type::Unknown,
        other => {
            return Err(ResolutionError::TypeMismatch {
                context: format!("index on '{}'", text),
                expected: "a collection".to_string(),
                found: other.to_string(),
            })
        }
    };
    Ok(BoundNode::Index {
        receiver: Box::new(node),
        index,
        ty,
    })
}

fn signature(declaring_type: &str, name: &str, params: &[Type]) -> MethodSignature {
    MethodSignature {
        declaring_type: declaring_type.to_string(),
        name: name.to_string(),
        params: params.to_vec(),
    }
}

fn no_such_member(member: &str, arity: usize, ty: &Type, candidates: &[&str]) -> ResolutionError {
    ResolutionError::NoSuchMember {
        member: member.to_string(),
        arity,
        declaring_type: ty.shape_name().map_or_else(|| ty.to_string(), str::to_string),
        hint: did_you_mean(member, candidates.iter().copied()),
    }
}

fn argument_mismatch(
    declaring_type: &str,
    member: &str,
    param: &Type,
    arg: &ArgShape,
    position: usize,
) -> ResolutionError {
    ResolutionError::TypeMismatch {
        context: format!(
            "argument {} of '{}.{}'",
            position + 1,
            declaring_type,
            member
        ),
        expected: param.to_string(),
        found: match arg {
            ArgShape::Typed(ty) => ty.to_string(),
            ArgShape::Wildcard => "*".to_string(),
        },
    }
}

fn is_boolean(ty: &Type) -> bool {
    matches!(ty, Type::Bool | Type::Null) || ty.is_dynamic()
}

fn is_numeric_operand(ty: &Type) -> bool {
    ty.is_numeric() || ty.is_dynamic() || *ty == Type::Null
}

fn comparable(lt: &Type, rt: &Type) -> bool {
    if lt.is_dynamic() || rt.is_dynamic() || *lt == Type::Null || *rt == Type::Null {
        return true;
    }
    if lt.is_numeric() && rt.is_numeric() {
        return true;
    }
    lt == rt
        && matches!(
            lt,
            Type::Str | Type::Timestamp | Type::Duration | Type::Bool
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::{
        FunctionDescriptor, MapEvent, MethodDescriptor, MethodError, ObjectRef, TypeRegistry,
        Value,
    };

    struct Child {
        text: String,
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register_class(
                ClassShape::event("SupportBean")
                    .property("theString", Type::Str)
                    .property("intPrimitive", Type::Int)
                    .property("stamp", Type::Timestamp)
                    .property("tags", Type::array_of(Type::Int))
                    .method(MethodDescriptor::new(
                        "getValueAsInt",
                        vec![Type::AnyEvent, Type::Str],
                        Type::Int,
                        |_, args| {
                            let event = args[0].as_event().ok_or_else(|| MethodError::new("no event"))?;
                            Ok(event.get(args[1].as_str().unwrap_or_default()).unwrap_or_default())
                        },
                    ))
                    .method(MethodDescriptor::new(
                        "getChild",
                        vec![Type::Str],
                        Type::object("Child"),
                        |_, args| {
                            Ok(Value::Object(ObjectRef::new(
                                "Child",
                                Child {
                                    text: args[0].as_str().unwrap_or_default().to_string(),
                                },
                            )))
                        },
                    ))
                    .method(MethodDescriptor::new("scale", vec![Type::Int], Type::Int, |_, a| {
                        Ok(Value::Int(a[0].as_int().unwrap_or(0) * 10))
                    }))
                    .method(MethodDescriptor::new("scale", vec![Type::Float], Type::Float, |_, a| {
                        Ok(Value::Float(a[0].as_float().unwrap_or(0.0) * 0.5))
                    }))
                    .method(MethodDescriptor::new(
                        "pick",
                        vec![Type::Int, Type::Float],
                        Type::Int,
                        |_, _| Ok(Value::Int(1)),
                    ))
                    .method(MethodDescriptor::new(
                        "pick",
                        vec![Type::Float, Type::Int],
                        Type::Int,
                        |_, _| Ok(Value::Int(2)),
                    )),
            )
            .register_class(
                ClassShape::object("Child")
                    .property_with("text", Type::Str, |v| {
                        v.downcast_underlying::<Child>().map(|c| Value::str(c.text.clone()))
                    })
                    .method(MethodDescriptor::typed::<Child>(
                        "append",
                        vec![Type::Str],
                        Type::Str,
                        |child, args| {
                            Ok(Value::str(format!(
                                "{}{}",
                                child.text,
                                args[0].as_str().unwrap_or_default()
                            )))
                        },
                    )),
            )
            .register_namespace(
                FunctionNamespace::new("SupportEnum")
                    .constant("ENUM_VALUE_2", "ENUM_VALUE_2")
                    .function(FunctionDescriptor::new(
                        "getValueForEnum",
                        vec![Type::Int],
                        Type::Str,
                        |args| Ok(Value::str(format!("ENUM_VALUE_{}", args[0].as_int().unwrap_or(0) + 1))),
                    )),
            );
        registry
    }

    fn event(id: i64) -> Vec<Value> {
        vec![Value::Event(
            MapEvent::new("SupportBean")
                .with_field("theString", "E1")
                .with_field("intPrimitive", id)
                .with_field("id", id)
                .with_field("tags", vec![3i64, 4])
                .into_ref(),
        )]
    }

    fn bind(expr: &Expr) -> ResolveResult<BoundNode> {
        let registry = registry();
        let scope = StreamShapes::new(&registry).stream("s0", "SupportBean");
        bind_expression(expr, &scope)
    }

    // ==========================================================================
    // Precedence and chaining
    // ==========================================================================

    #[test]
    fn test_stream_property_becomes_property_access() {
        let node = bind(&Expr::path(["s0", "theString"])).unwrap();
        assert_eq!(
            node,
            BoundNode::PropertyAccess {
                slot: 0,
                property: "theString".into(),
                ty: Type::Str
            }
        );
        // Unqualified names fall back to the only stream
        assert_eq!(bind(&Expr::ident("theString")).unwrap(), node);
    }

    #[test]
    fn test_wildcard_and_alias_both_receive_the_event() {
        let by_alias = Expr::ident("s0").call(
            "getValueAsInt",
            vec![Expr::ident("s0"), Expr::lit("id")],
        );
        let by_star = Expr::ident("s0").call("getValueAsInt", vec![Expr::Wildcard, Expr::lit("id")]);
        let a = bind(&by_alias).unwrap();
        let b = bind(&by_star).unwrap();
        assert_eq!(a.evaluate(&event(10)).unwrap(), Value::Int(10));
        assert_eq!(b.evaluate(&event(10)).unwrap(), Value::Int(10));
    }

    #[test]
    fn test_chained_calls_resolve_against_return_types() {
        let expr = Expr::ident("s0")
            .call("getChild", vec![Expr::lit("abc")])
            .call("append", vec![Expr::lit("def")]);
        let node = bind(&expr).unwrap();
        assert_eq!(node.result_type(), Type::Str);
        assert_eq!(node.evaluate(&event(1)).unwrap(), Value::str("abcdef"));

        let prop = Expr::ident("s0").call("getChild", vec![Expr::lit("x")]).prop("text");
        assert_eq!(bind(&prop).unwrap().evaluate(&event(1)).unwrap(), Value::str("x"));
    }

    #[test]
    fn test_builtins_on_properties() {
        let count = Expr::path(["s0", "tags"]).call("countOf", vec![]);
        assert_eq!(bind(&count).unwrap().evaluate(&event(1)).unwrap(), Value::Int(2));
        let year = Expr::path(["s0", "stamp"]).call("getYear", vec![]);
        assert_eq!(bind(&year).unwrap().result_type(), Type::Int);
    }

    #[test]
    fn test_namespace_constant_and_function() {
        let constant = bind(&Expr::path(["SupportEnum", "ENUM_VALUE_2"])).unwrap();
        assert_eq!(constant, BoundNode::Literal(Value::str("ENUM_VALUE_2")));
        let call = Expr::ident("SupportEnum").call("getValueForEnum", vec![Expr::lit(0i64)]);
        assert_eq!(
            bind(&call).unwrap().evaluate(&event(1)).unwrap(),
            Value::str("ENUM_VALUE_1")
        );
    }

    // ==========================================================================
    // Overloads
    // ==========================================================================

    #[test]
    fn test_most_specific_overload() {
        let int_call = Expr::ident("s0").call("scale", vec![Expr::lit(2i64)]);
        assert_eq!(bind(&int_call).unwrap().evaluate(&event(1)).unwrap(), Value::Int(20));
        let float_call = Expr::ident("s0").call("scale", vec![Expr::lit(2.0)]);
        assert_eq!(bind(&float_call).unwrap().result_type(), Type::Float);
    }

    #[test]
    fn test_equally_specific_overloads_are_rejected() {
        let expr = Expr::ident("s0").call("pick", vec![Expr::lit(1i64), Expr::lit(1i64)]);
        match bind(&expr) {
            Err(ResolutionError::AmbiguousOverload { candidates, .. }) => {
                assert_eq!(candidates.len(), 2)
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    // ==========================================================================
    // Failures
    // ==========================================================================

    #[test]
    fn test_no_such_member_reports_member_arity_and_type() {
        let err = bind(&Expr::ident("s0").call("abc", vec![])).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::NoSuchMember {
                member: "abc".into(),
                arity: 0,
                declaring_type: "SupportBean".into(),
                hint: String::new(),
            }
        );
    }

    #[test]
    fn test_misspelled_property_suggests_closest() {
        match bind(&Expr::path(["s0", "theStrin"])).unwrap_err() {
            ResolutionError::NoSuchMember { hint, .. } => {
                assert_eq!(hint, "; did you mean 'theString'?")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_indexed_stream_requires_index_or_enumeration() {
        let registry = registry();
        let scope = StreamShapes::new(&registry).indexed_stream("s", "SupportBean");
        let err = bind_expression(&Expr::path(["s", "theString"]), &scope).unwrap_err();
        assert!(matches!(err, ResolutionError::AmbiguousIndexedProperty { .. }));

        let indexed = Expr::ident("s").at(0).prop("theString");
        assert_eq!(
            bind_expression(&indexed, &scope).unwrap().result_type(),
            Type::Str
        );
        let counted = Expr::ident("s").call("countOf", vec![]);
        assert_eq!(
            bind_expression(&counted, &scope).unwrap().result_type(),
            Type::Int
        );
    }

    #[test]
    fn test_unqualified_property_in_join_needs_one_declaring_stream() {
        let mut registry = registry();
        registry.register_class(ClassShape::event("Quote").property("bid", Type::Float));
        let scope = StreamShapes::new(&registry)
            .stream("s0", "SupportBean")
            .stream("s1", "Quote");

        assert_eq!(
            bind_expression(&Expr::ident("bid"), &scope).unwrap(),
            BoundNode::PropertyAccess {
                slot: 1,
                property: "bid".into(),
                ty: Type::Float
            }
        );

        let self_join = StreamShapes::new(&registry)
            .stream("a", "SupportBean")
            .stream("b", "SupportBean");
        assert_eq!(
            bind_expression(&Expr::ident("theString"), &self_join).unwrap_err(),
            ResolutionError::AmbiguousProperty {
                property: "theString".into(),
                streams: vec!["a".into(), "b".into()],
            }
        );
    }

    #[test]
    fn test_logical_operands_must_be_boolean() {
        let expr = Expr::binary(BinaryOp::And, Expr::path(["s0", "theString"]), Expr::lit(true));
        assert!(matches!(bind(&expr), Err(ResolutionError::TypeMismatch { .. })));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let expr = Expr::ident("s0")
            .call("getChild", vec![Expr::path(["s0", "theString"])])
            .call("append", vec![Expr::lit("!")]);
        assert_eq!(bind(&expr).unwrap(), bind(&expr).unwrap());
    }
}
