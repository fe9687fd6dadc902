//! Built-in date-time and enumeration methods.
//!
//! These bind ahead of instance methods: a `Timestamp` receiver exposes the
//! date-time vocabulary and any collection exposes the enumeration one.

use crate::error::{EvalResult, EvaluationFault};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use vesper_core::{Type, Value};

/// Date-time methods on `Timestamp` receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeMethod {
    GetYear,
    GetMonthOfYear,
    GetDayOfMonth,
    GetHourOfDay,
    GetMinuteOfHour,
    /// 1 = Sunday through 7 = Saturday
    GetDayOfWeek,
    ToMillisec,
    Plus,
    Minus,
}

/// Enumeration methods on collection receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumMethod {
    CountOf,
    FirstOf,
    LastOf,
    Take,
    TakeLast,
    DistinctOf,
    Reverse,
    SumOf,
    Average,
    MinOf,
    MaxOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMethod {
    DateTime(DateTimeMethod),
    Enumeration(EnumMethod),
}

/// A built-in matched by name and arity, with its parameter and result types
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinMatch {
    pub method: BuiltinMethod,
    pub params: Vec<Type>,
    pub return_type: Type,
}

const DATE_TIME_NAMES: &[&str] = &[
    "getYear",
    "getMonthOfYear",
    "getDayOfMonth",
    "getHourOfDay",
    "getMinuteOfHour",
    "getDayOfWeek",
    "toMillisec",
    "plus",
    "minus",
];

const ENUM_NAMES: &[&str] = &[
    "countOf",
    "firstOf",
    "lastOf",
    "take",
    "takeLast",
    "distinctOf",
    "reverse",
    "sumOf",
    "average",
    "minOf",
    "maxOf",
];

/// Built-in names applicable to a receiver type, for diagnostics.
pub fn names_for(receiver: &Type) -> &'static [&'static str] {
    match receiver {
        Type::Timestamp => DATE_TIME_NAMES,
        Type::Array(_) => ENUM_NAMES,
        _ => &[],
    }
}

/// Whether `name` is a built-in for this receiver, at any arity.
pub fn is_builtin_name(receiver: &Type, name: &str) -> bool {
    names_for(receiver).contains(&name)
}

/// Match a built-in by receiver type, name and arity.
pub fn lookup(receiver: &Type, name: &str, arity: usize) -> Option<BuiltinMatch> {
    match receiver {
        Type::Timestamp => lookup_date_time(name, arity),
        Type::Array(element) => lookup_enumeration(element, name, arity),
        _ => None,
    }
}

fn lookup_date_time(name: &str, arity: usize) -> Option<BuiltinMatch> {
    use DateTimeMethod::*;
    let (method, params, return_type) = match (name, arity) {
        ("getYear", 0) => (GetYear, vec![], Type::Int),
        ("getMonthOfYear", 0) => (GetMonthOfYear, vec![], Type::Int),
        ("getDayOfMonth", 0) => (GetDayOfMonth, vec![], Type::Int),
        ("getHourOfDay", 0) => (GetHourOfDay, vec![], Type::Int),
        ("getMinuteOfHour", 0) => (GetMinuteOfHour, vec![], Type::Int),
        ("getDayOfWeek", 0) => (GetDayOfWeek, vec![], Type::Int),
        ("toMillisec", 0) => (ToMillisec, vec![], Type::Int),
        ("plus", 1) => (Plus, vec![Type::Duration], Type::Timestamp),
        ("minus", 1) => (Minus, vec![Type::Duration], Type::Timestamp),
        _ => return None,
    };
    Some(BuiltinMatch {
        method: BuiltinMethod::DateTime(method),
        params,
        return_type,
    })
}

fn lookup_enumeration(element: &Type, name: &str, arity: usize) -> Option<BuiltinMatch> {
    use EnumMethod::*;
    let same = Type::array_of(element.clone());
    let numeric = if element.is_numeric() || element.is_dynamic() {
        element.clone()
    } else {
        // Rejected by the resolver before this type is ever used
        Type::Unknown
    };
    let (method, params, return_type) = match (name, arity) {
        ("countOf", 0) => (CountOf, vec![], Type::Int),
        ("firstOf", 0) => (FirstOf, vec![], element.clone()),
        ("lastOf", 0) => (LastOf, vec![], element.clone()),
        ("take", 1) => (Take, vec![Type::Int], same),
        ("takeLast", 1) => (TakeLast, vec![Type::Int], same),
        ("distinctOf", 0) => (DistinctOf, vec![], same),
        ("reverse", 0) => (Reverse, vec![], same),
        ("sumOf", 0) => (SumOf, vec![], numeric),
        ("average", 0) => (Average, vec![], Type::Float),
        ("minOf", 0) => (MinOf, vec![], numeric),
        ("maxOf", 0) => (MaxOf, vec![], numeric),
        _ => return None,
    };
    Some(BuiltinMatch {
        method: BuiltinMethod::Enumeration(method),
        params,
        return_type,
    })
}

impl BuiltinMethod {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinMethod::DateTime(m) => match m {
                DateTimeMethod::GetYear => "getYear",
                DateTimeMethod::GetMonthOfYear => "getMonthOfYear",
                DateTimeMethod::GetDayOfMonth => "getDayOfMonth",
                DateTimeMethod::GetHourOfDay => "getHourOfDay",
                DateTimeMethod::GetMinuteOfHour => "getMinuteOfHour",
                DateTimeMethod::GetDayOfWeek => "getDayOfWeek",
                DateTimeMethod::ToMillisec => "toMillisec",
                DateTimeMethod::Plus => "plus",
                DateTimeMethod::Minus => "minus",
            },
            BuiltinMethod::Enumeration(m) => match m {
                EnumMethod::CountOf => "countOf",
                EnumMethod::FirstOf => "firstOf",
                EnumMethod::LastOf => "lastOf",
                EnumMethod::Take => "take",
                EnumMethod::TakeLast => "takeLast",
                EnumMethod::DistinctOf => "distinctOf",
                EnumMethod::Reverse => "reverse",
                EnumMethod::SumOf => "sumOf",
                EnumMethod::Average => "average",
                EnumMethod::MinOf => "minOf",
                EnumMethod::MaxOf => "maxOf",
            },
        }
    }

    /// Whether the result needs numeric elements.
    pub fn needs_numeric_elements(self) -> bool {
        matches!(
            self,
            BuiltinMethod::Enumeration(
                EnumMethod::SumOf | EnumMethod::Average | EnumMethod::MinOf | EnumMethod::MaxOf
            )
        )
    }

    /// Apply to an evaluated, non-null receiver.
    pub fn apply(self, receiver: &Value, args: &[Value]) -> EvalResult<Value> {
        match self {
            BuiltinMethod::DateTime(m) => match receiver {
                Value::Timestamp(ns) => apply_date_time(m, *ns, args),
                other => Err(self.invalid_receiver(other)),
            },
            BuiltinMethod::Enumeration(m) => match receiver {
                Value::Array(items) => apply_enumeration(m, items, args),
                other => Err(self.invalid_receiver(other)),
            },
        }
    }

    fn invalid_receiver(self, receiver: &Value) -> EvaluationFault {
        EvaluationFault::InvalidOperand {
            operator: self.name().to_string(),
            message: format!("unexpected receiver of type {}", receiver.type_name()),
        }
    }
}

fn apply_date_time(method: DateTimeMethod, ns: i64, args: &[Value]) -> EvalResult<Value> {
    let dt: DateTime<Utc> = DateTime::from_timestamp_nanos(ns);
    let value = match method {
        DateTimeMethod::GetYear => Value::Int(dt.year() as i64),
        DateTimeMethod::GetMonthOfYear => Value::Int(dt.month() as i64),
        DateTimeMethod::GetDayOfMonth => Value::Int(dt.day() as i64),
        DateTimeMethod::GetHourOfDay => Value::Int(dt.hour() as i64),
        DateTimeMethod::GetMinuteOfHour => Value::Int(dt.minute() as i64),
        DateTimeMethod::GetDayOfWeek => Value::Int(dt.weekday().number_from_sunday() as i64),
        DateTimeMethod::ToMillisec => Value::Int(dt.timestamp_millis()),
        DateTimeMethod::Plus | DateTimeMethod::Minus => {
            let delta = match args.first() {
                Some(Value::Duration(d)) => ChronoDuration::nanoseconds(*d as i64),
                Some(Value::Null) | None => return Ok(Value::Null),
                Some(other) => {
                    return Err(EvaluationFault::InvalidOperand {
                        operator: BuiltinMethod::DateTime(method).name().to_string(),
                        message: format!("expected duration, found {}", other.type_name()),
                    })
                }
            };
            let shifted = if method == DateTimeMethod::Plus {
                dt.checked_add_signed(delta)
            } else {
                dt.checked_sub_signed(delta)
            };
            match shifted {
                Some(t) => Value::timestamp(t),
                None => Value::Null,
            }
        }
    };
    Ok(value)
}

fn apply_enumeration(method: EnumMethod, items: &[Value], args: &[Value]) -> EvalResult<Value> {
    let count_arg = || -> usize {
        args.first()
            .and_then(Value::as_int)
            .map(|n| n.max(0) as usize)
            .unwrap_or(0)
    };
    let value = match method {
        EnumMethod::CountOf => Value::Int(items.len() as i64),
        EnumMethod::FirstOf => items.first().cloned().unwrap_or_default(),
        EnumMethod::LastOf => items.last().cloned().unwrap_or_default(),
        EnumMethod::Take => Value::Array(items.iter().take(count_arg()).cloned().collect()),
        EnumMethod::TakeLast => {
            let n = count_arg().min(items.len());
            Value::Array(items[items.len() - n..].to_vec())
        }
        EnumMethod::DistinctOf => {
            let mut distinct: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                if !distinct.contains(item) {
                    distinct.push(item.clone());
                }
            }
            Value::Array(distinct)
        }
        EnumMethod::Reverse => Value::Array(items.iter().rev().cloned().collect()),
        EnumMethod::SumOf => sum_of(items),
        EnumMethod::Average => {
            let values: Vec<f64> = items.iter().filter_map(Value::as_float).collect();
            if values.is_empty() {
                Value::Null
            } else {
                Value::Float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        EnumMethod::MinOf => extreme(items, |a, b| a < b),
        EnumMethod::MaxOf => extreme(items, |a, b| a > b),
    };
    Ok(value)
}

fn sum_of(items: &[Value]) -> Value {
    if items.iter().all(|v| matches!(v, Value::Int(_) | Value::Null)) {
        let ints: Vec<i64> = items.iter().filter_map(Value::as_int).collect();
        if ints.is_empty() {
            return Value::Null;
        }
        return Value::Int(ints.iter().fold(0i64, |acc, n| acc.wrapping_add(*n)));
    }
    let floats: Vec<f64> = items.iter().filter_map(Value::as_float).collect();
    if floats.is_empty() {
        Value::Null
    } else {
        Value::Float(floats.iter().sum())
    }
}

fn extreme(items: &[Value], better: impl Fn(f64, f64) -> bool) -> Value {
    let mut best: Option<(&Value, f64)> = None;
    for item in items {
        if let Some(x) = item.as_float() {
            match best {
                Some((_, b)) if !better(x, b) => {}
                _ => best = Some((item, x)),
            }
        }
    }
    best.map(|(v, _)| v.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Value {
        Value::timestamp(Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap())
    }

    // ==========================================================================
    // Lookup
    // ==========================================================================

    #[test]
    fn test_lookup_respects_receiver_and_arity() {
        assert!(lookup(&Type::Timestamp, "getYear", 0).is_some());
        assert!(lookup(&Type::Timestamp, "getYear", 1).is_none());
        assert!(lookup(&Type::Int, "getYear", 0).is_none());
        let m = lookup(&Type::array_of(Type::Int), "take", 1).unwrap();
        assert_eq!(m.return_type, Type::array_of(Type::Int));
        let m = lookup(&Type::array_of(Type::event("A")), "firstOf", 0).unwrap();
        assert_eq!(m.return_type, Type::event("A"));
    }

    // ==========================================================================
    // Date-time
    // ==========================================================================

    #[test]
    fn test_date_time_fields() {
        // 2024-03-15 was a Friday
        let t = ts(2024, 3, 15, 9, 41);
        let get = |m| BuiltinMethod::DateTime(m).apply(&t, &[]).unwrap();
        assert_eq!(get(DateTimeMethod::GetYear), Value::Int(2024));
        assert_eq!(get(DateTimeMethod::GetMonthOfYear), Value::Int(3));
        assert_eq!(get(DateTimeMethod::GetDayOfMonth), Value::Int(15));
        assert_eq!(get(DateTimeMethod::GetHourOfDay), Value::Int(9));
        assert_eq!(get(DateTimeMethod::GetMinuteOfHour), Value::Int(41));
        assert_eq!(get(DateTimeMethod::GetDayOfWeek), Value::Int(6));
    }

    #[test]
    fn test_plus_and_minus_duration() {
        let t = ts(2024, 1, 1, 0, 0);
        let hour = Value::duration(std::time::Duration::from_secs(3600));
        let later = BuiltinMethod::DateTime(DateTimeMethod::Plus)
            .apply(&t, std::slice::from_ref(&hour))
            .unwrap();
        assert_eq!(later, ts(2024, 1, 1, 1, 0));
        let back = BuiltinMethod::DateTime(DateTimeMethod::Minus)
            .apply(&later, &[hour])
            .unwrap();
        assert_eq!(back, t);
    }

    // ==========================================================================
    // Enumeration
    // ==========================================================================

    #[test]
    fn test_enumeration_methods() {
        let items = Value::from(vec![3i64, 1, 3, 2]);
        let apply = |m, args: &[Value]| BuiltinMethod::Enumeration(m).apply(&items, args).unwrap();
        assert_eq!(apply(EnumMethod::CountOf, &[]), Value::Int(4));
        assert_eq!(apply(EnumMethod::FirstOf, &[]), Value::Int(3));
        assert_eq!(apply(EnumMethod::LastOf, &[]), Value::Int(2));
        assert_eq!(apply(EnumMethod::Take, &[Value::Int(2)]), Value::from(vec![3i64, 1]));
        assert_eq!(apply(EnumMethod::TakeLast, &[Value::Int(9)]), items.clone());
        assert_eq!(apply(EnumMethod::DistinctOf, &[]), Value::from(vec![3i64, 1, 2]));
        assert_eq!(apply(EnumMethod::Reverse, &[]), Value::from(vec![2i64, 3, 1, 3]));
        assert_eq!(apply(EnumMethod::SumOf, &[]), Value::Int(9));
        assert_eq!(apply(EnumMethod::Average, &[]), Value::Float(2.25));
        assert_eq!(apply(EnumMethod::MinOf, &[]), Value::Int(1));
        assert_eq!(apply(EnumMethod::MaxOf, &[]), Value::Int(3));
    }

    #[test]
    fn test_empty_collection_yields_null() {
        let empty = Value::Array(vec![]);
        for m in [EnumMethod::FirstOf, EnumMethod::SumOf, EnumMethod::Average, EnumMethod::MaxOf] {
            assert_eq!(BuiltinMethod::Enumeration(m).apply(&empty, &[]).unwrap(), Value::Null);
        }
    }
}
