//! Declared shapes of event types, classes and function namespaces.
//!
//! A shape is the static description the resolver binds against: which
//! properties exist and with what type, which instance methods can be
//! invoked on the underlying object, and which static functions a namespace
//! offers. Every member carries its invocation strategy as a closure, so the
//! runtime never looks anything up by name once a statement is bound.

use crate::types::Type;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Failure raised from inside a user or plugin method.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        MethodError(message.into())
    }
}

/// Invokes an instance method: `(receiver, arguments) -> result`.
pub type MethodInvoker = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, MethodError> + Send + Sync>;

/// Invokes a static function: `(arguments) -> result`.
pub type StaticInvoker = Arc<dyn Fn(&[Value]) -> Result<Value, MethodError> + Send + Sync>;

/// Reads a property off a non-event object value.
pub type PropertyGetter = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Identity of a resolved method or function, used for structural comparison
/// of bound trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub declaring_type: String,
    pub name: String,
    pub params: Vec<Type>,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.declaring_type, self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

/// A declared property
#[derive(Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub ty: Type,
    /// Present for object classes; event properties are read through
    /// [`EventBean::get`](crate::EventBean::get).
    pub getter: Option<PropertyGetter>,
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .finish()
    }
}

/// A declared instance method
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<Type>,
    pub return_type: Type,
    pub invoker: MethodInvoker,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Type>,
        return_type: Type,
        invoker: impl Fn(&Value, &[Value]) -> Result<Value, MethodError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            invoker: Arc::new(invoker),
        }
    }

    /// Declare a method whose body operates on the concrete underlying type.
    ///
    /// The receiver is downcast once per call; a receiver of another type
    /// raises a [`MethodError`].
    pub fn typed<T: Any>(
        name: impl Into<String>,
        params: Vec<Type>,
        return_type: Type,
        body: impl Fn(&T, &[Value]) -> Result<Value, MethodError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let method = name.clone();
        Self::new(name, params, return_type, move |receiver, args| {
            let this = receiver.downcast_underlying::<T>().ok_or_else(|| {
                MethodError(format!(
                    "receiver of type {} cannot host method '{}'",
                    receiver.type_name(),
                    method
                ))
            })?;
            body(this, args)
        })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("return_type", &self.return_type)
            .finish()
    }
}

/// Shape of an event type or class
#[derive(Debug, Clone)]
pub struct ClassShape {
    pub name: String,
    pub is_event: bool,
    properties: FxHashMap<String, PropertyDescriptor>,
    property_order: Vec<String>,
    methods: Vec<MethodDescriptor>,
}

impl ClassShape {
    /// Shape of an event type.
    pub fn event(name: impl Into<String>) -> Self {
        Self::with_kind(name, true)
    }

    /// Shape of a plain class reached through method results or properties.
    pub fn object(name: impl Into<String>) -> Self {
        Self::with_kind(name, false)
    }

    fn with_kind(name: impl Into<String>, is_event: bool) -> Self {
        Self {
            name: name.into(),
            is_event,
            properties: FxHashMap::default(),
            property_order: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.insert_property(PropertyDescriptor {
            name: name.into(),
            ty,
            getter: None,
        });
        self
    }

    pub fn property_with(
        mut self,
        name: impl Into<String>,
        ty: Type,
        getter: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.insert_property(PropertyDescriptor {
            name: name.into(),
            ty,
            getter: Some(Arc::new(getter)),
        });
        self
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    fn insert_property(&mut self, descriptor: PropertyDescriptor) {
        if !self.properties.contains_key(&descriptor.name) {
            self.property_order.push(descriptor.name.clone());
        }
        self.properties.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.property_order
            .iter()
            .filter_map(|name| self.properties.get(name))
    }

    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodDescriptor> {
        self.methods.iter().filter(move |m| m.name == name)
    }

    /// All property and method names, for diagnostics.
    pub fn member_names(&self) -> Vec<&str> {
        self.property_order
            .iter()
            .map(String::as_str)
            .chain(self.methods.iter().map(|m| m.name.as_str()))
            .collect()
    }
}

/// A declared static function
#[derive(Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<Type>,
    pub return_type: Type,
    pub invoker: StaticInvoker,
}

impl FunctionDescriptor {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Type>,
        return_type: Type,
        invoker: impl Fn(&[Value]) -> Result<Value, MethodError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            invoker: Arc::new(invoker),
        }
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("return_type", &self.return_type)
            .finish()
    }
}

/// A namespace of static functions and constants, e.g. a helper library or
/// an enumeration type.
#[derive(Debug, Clone)]
pub struct FunctionNamespace {
    pub name: String,
    functions: Vec<FunctionDescriptor>,
    constants: FxHashMap<String, Value>,
}

impl FunctionNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            constants: FxHashMap::default(),
        }
    }

    pub fn function(mut self, function: FunctionDescriptor) -> Self {
        self.functions.push(function);
        self
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    pub fn functions_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a FunctionDescriptor> {
        self.functions.iter().filter(move |f| f.name == name)
    }

    pub fn get_constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.functions
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.constants.keys().map(String::as_str))
            .collect()
    }
}

/// Registry of every shape and namespace a statement can bind against
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    classes: FxHashMap<String, Arc<ClassShape>>,
    namespaces: FxHashMap<String, Arc<FunctionNamespace>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&mut self, shape: ClassShape) -> &mut Self {
        self.classes.insert(shape.name.clone(), Arc::new(shape));
        self
    }

    pub fn register_namespace(&mut self, namespace: FunctionNamespace) -> &mut Self {
        self.namespaces
            .insert(namespace.name.clone(), Arc::new(namespace));
        self
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassShape>> {
        self.classes.get(name)
    }

    pub fn event_type(&self, name: &str) -> Option<&Arc<ClassShape>> {
        self.classes.get(name).filter(|shape| shape.is_event)
    }

    pub fn namespace(&self, name: &str) -> Option<&Arc<FunctionNamespace>> {
        self.namespaces.get(name)
    }

    pub fn event_type_names(&self) -> Vec<&str> {
        self.classes
            .values()
            .filter(|s| s.is_event)
            .map(|s| s.name.as_str())
            .collect()
    }
}
