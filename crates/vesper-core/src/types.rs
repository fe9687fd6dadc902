//! Static type vocabulary used at bind time

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a property, method parameter or bound expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point
    Float,
    /// Boolean
    Bool,
    /// UTF-8 string
    Str,
    /// Timestamp (nanoseconds since epoch)
    Timestamp,
    /// Duration
    Duration,
    /// Null type (type of the `null` literal)
    Null,
    /// Array of elements
    Array(Box<Type>),
    /// Map from key to value
    Map(Box<Type>, Box<Type>),
    /// A specific event type
    Event(String),
    /// Any event reference; used by method parameters that receive events
    AnyEvent,
    /// A plain class declared in the type registry
    Object(String),
    /// Any type (for polymorphic parameters)
    Any,
    /// Unknown type (dynamically typed value)
    Unknown,
}

impl Type {
    pub fn event(name: impl Into<String>) -> Self {
        Type::Event(name.into())
    }

    pub fn object(name: impl Into<String>) -> Self {
        Type::Object(name.into())
    }

    pub fn array_of(inner: Type) -> Self {
        Type::Array(Box::new(inner))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Type::Event(_) | Type::AnyEvent)
    }

    /// True for types whose values can only be known at runtime.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Type::Any | Type::Unknown)
    }

    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::Array(t) => Some(t),
            _ => None,
        }
    }

    /// Name of the class or event type whose shape describes this type.
    pub fn shape_name(&self) -> Option<&str> {
        match self {
            Type::Event(name) | Type::Object(name) => Some(name),
            _ => None,
        }
    }

    /// Whether a value of type `other` may be passed where `self` is declared.
    pub fn is_assignable_from(&self, other: &Type) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Type::Any | Type::Unknown, _) | (_, Type::Unknown | Type::Null) => true,
            (Type::Float, Type::Int) => true,
            (Type::AnyEvent, Type::Event(_)) => true,
            (Type::Array(a), Type::Array(b)) => a.is_assignable_from(b),
            (Type::Map(ka, va), Type::Map(kb, vb)) => {
                ka.is_assignable_from(kb) && va.is_assignable_from(vb)
            }
            _ => false,
        }
    }

    /// Common numeric type of two operands, if both are numeric.
    pub fn numeric_join(&self, other: &Type) -> Option<Type> {
        match (self, other) {
            (Type::Int, Type::Int) => Some(Type::Int),
            (Type::Int | Type::Float, Type::Int | Type::Float) => Some(Type::Float),
            (t, u) if t.is_dynamic() || u.is_dynamic() => Some(Type::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::Timestamp => write!(f, "timestamp"),
            Type::Duration => write!(f, "duration"),
            Type::Null => write!(f, "null"),
            Type::Array(t) => write!(f, "[{}]", t),
            Type::Map(k, v) => write!(f, "{{{}: {}}}", k, v),
            Type::Event(name) => write!(f, "event {}", name),
            Type::AnyEvent => write!(f, "event"),
            Type::Object(name) => write!(f, "{}", name),
            Type::Any => write!(f, "any"),
            Type::Unknown => write!(f, "?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignability() {
        assert!(Type::Float.is_assignable_from(&Type::Int));
        assert!(!Type::Int.is_assignable_from(&Type::Float));
        assert!(Type::AnyEvent.is_assignable_from(&Type::event("Trade")));
        assert!(!Type::event("Trade").is_assignable_from(&Type::event("Quote")));
        assert!(Type::Str.is_assignable_from(&Type::Null));
        assert!(Type::array_of(Type::Float).is_assignable_from(&Type::array_of(Type::Int)));
    }

    #[test]
    fn test_numeric_join() {
        assert_eq!(Type::Int.numeric_join(&Type::Int), Some(Type::Int));
        assert_eq!(Type::Int.numeric_join(&Type::Float), Some(Type::Float));
        assert_eq!(Type::Str.numeric_join(&Type::Int), None);
    }

    #[test]
    fn test_serde_roundtrip_of_nested_type() {
        let ty = Type::array_of(Type::event("Login"));
        let json = serde_json::to_string(&ty).unwrap();
        let back: Type = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::array_of(Type::Int).to_string(), "[int]");
        assert_eq!(Type::event("Trade").to_string(), "event Trade");
    }
}
