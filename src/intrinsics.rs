//! Built-in members for values the host does not own
//!
//! Lists, strings, and the `Range` helper answer `for` loops and member
//! access without a host bridge, using the same `GetEnumerator` /
//! `MoveNext` / `Current` protocol host enumerables follow.

use std::any::Any;

use crate::error::ErrorKind;
use crate::host::{downcast, downcast_mut, HostObject, HostRef};
use crate::value::{ListRef, Value};

type Outcome = Option<Result<Value, ErrorKind>>;

/// Enumerator over a shared list; sees elements appended during iteration
#[derive(Debug)]
pub struct ListEnumerator {
    items: ListRef,
    index: Option<usize>,
}

impl ListEnumerator {
    pub fn new(items: ListRef) -> Self {
        Self { items, index: None }
    }

    pub fn move_next(&mut self) -> bool {
        let next = self.index.map_or(0, |i| i + 1);
        let len = self.items.borrow().len();
        self.index = Some(next.min(len));
        next < len
    }

    pub fn current(&self) -> Value {
        self.index
            .and_then(|i| self.items.borrow().get(i).cloned())
            .unwrap_or(Value::Null)
    }
}

/// Integer range `[start, end)` walked by `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i32,
    pub end: i32,
    pub step: i32,
}

impl Range {
    pub fn new(start: i32, end: i32, step: i32) -> Result<Self, ErrorKind> {
        if step == 0 {
            return Err(ErrorKind::HostFailure("Range step cannot be 0".to_string()));
        }
        Ok(Self { start, end, step })
    }

    fn contains(&self, n: i32) -> bool {
        if self.step > 0 {
            n < self.end
        } else {
            n > self.end
        }
    }
}

#[derive(Debug)]
pub struct RangeEnumerator {
    range: Range,
    current: Option<i32>,
    done: bool,
}

impl RangeEnumerator {
    pub fn new(range: Range) -> Self {
        Self {
            range,
            current: None,
            done: false,
        }
    }

    pub fn move_next(&mut self) -> bool {
        if self.done {
            return false;
        }
        let next = match self.current {
            None => Some(self.range.start),
            Some(n) => n.checked_add(self.range.step),
        };
        match next {
            Some(n) if self.range.contains(n) => {
                self.current = Some(n);
                true
            }
            _ => {
                self.done = true;
                false
            }
        }
    }

    pub fn current(&self) -> Value {
        match (self.done, self.current) {
            (false, Some(n)) => Value::Int(n),
            _ => Value::Null,
        }
    }
}

macro_rules! host_object {
    ($ty:ty, $name:literal) => {
        impl HostObject for $ty {
            fn type_name(&self) -> &str {
                $name
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
    };
}

host_object!(ListEnumerator, "ListEnumerator");
host_object!(Range, "Range");
host_object!(RangeEnumerator, "RangeEnumerator");

/// Whether a host reference is one of the built-in helper objects
pub fn is_intrinsic(obj: &HostRef) -> bool {
    let obj = obj.borrow();
    let any = obj.as_any();
    any.is::<ListEnumerator>() || any.is::<Range>() || any.is::<RangeEnumerator>()
}

/// `new Range(end)`, `new Range(start, end)` or `new Range(start, end, step)`
pub fn construct(type_name: &str, args: &[Value]) -> Outcome {
    if type_name.rsplit('.').next() != Some("Range") {
        return None;
    }
    let ints: Option<Vec<i32>> = args.iter().map(Value::as_int).collect();
    let range = match ints.as_deref() {
        Some([end]) => Range::new(0, *end, 1),
        Some([start, end]) => Range::new(*start, *end, 1),
        Some([start, end, step]) => Range::new(*start, *end, *step),
        Some(_) => return Some(Err(ErrorKind::NoMatchingOverload("Range".to_string(), args.len()))),
        None => {
            return Some(Err(ErrorKind::TypeMismatch(
                "int arguments".to_string(),
                describe(args),
            )))
        }
    };
    Some(range.map(Value::host))
}

/// Call a built-in method. `None` means the receiver has no built-in members
/// and the call should go to the host bridge.
pub fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Outcome {
    match receiver {
        Value::List(items) => Some(list_method(items, method, args)),
        Value::String(s) => Some(string_method(s, method, args)),
        Value::Host(obj) if is_intrinsic(obj) => Some(helper_method(obj, method, args)),
        Value::Host(_) => None,
        other => Some(Err(ErrorKind::MemberNotFound(
            other.type_name().to_string(),
            method.to_string(),
        ))),
    }
}

/// Read a built-in field; `None` defers to the host bridge
pub fn get_field(receiver: &Value, field: &str) -> Outcome {
    let found = match (receiver, field) {
        (Value::List(items), "Count") => Some(Value::Int(items.borrow().len() as i32)),
        (Value::String(s), "Length") => Some(Value::Int(s.chars().count() as i32)),
        (Value::Host(obj), _) if is_intrinsic(obj) => helper_field(obj, field),
        (Value::Host(_), _) => return None,
        _ => None,
    };
    Some(found.ok_or_else(|| member_not_found(receiver, field)))
}

fn list_method(items: &ListRef, method: &str, args: &[Value]) -> Result<Value, ErrorKind> {
    match (method, args) {
        ("GetEnumerator", []) => Ok(Value::host(ListEnumerator::new(items.clone()))),
        ("Add", [value]) => {
            items.borrow_mut().push(value.clone());
            Ok(Value::Null)
        }
        ("Contains", [value]) => {
            let found = items
                .borrow()
                .iter()
                .any(|item| matches!(item.equals(value), Ok(Value::Bool(true))));
            Ok(Value::Bool(found))
        }
        ("RemoveAt", [Value::Int(index)]) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            match usize::try_from(*index) {
                Ok(i) if i < len => Ok(items.remove(i)),
                _ => Err(ErrorKind::IndexOutOfRange(*index, len)),
            }
        }
        ("Clear", []) => {
            items.borrow_mut().clear();
            Ok(Value::Null)
        }
        ("GetEnumerator" | "Add" | "Contains" | "RemoveAt" | "Clear", _) => {
            Err(ErrorKind::NoMatchingOverload(method.to_string(), args.len()))
        }
        _ => Err(ErrorKind::MemberNotFound("list".to_string(), method.to_string())),
    }
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, ErrorKind> {
    match (method, args) {
        ("Contains", [Value::String(needle)]) => Ok(Value::Bool(s.contains(needle.as_str()))),
        ("ToUpper", []) => Ok(Value::String(s.to_uppercase())),
        ("ToLower", []) => Ok(Value::String(s.to_lowercase())),
        ("Contains" | "ToUpper" | "ToLower", _) => {
            Err(ErrorKind::NoMatchingOverload(method.to_string(), args.len()))
        }
        _ => Err(ErrorKind::MemberNotFound("string".to_string(), method.to_string())),
    }
}

fn helper_method(obj: &HostRef, method: &str, args: &[Value]) -> Result<Value, ErrorKind> {
    if !args.is_empty() {
        return Err(ErrorKind::NoMatchingOverload(method.to_string(), args.len()));
    }
    if method == "MoveNext" {
        if let Some(mut e) = downcast_mut::<ListEnumerator>(obj) {
            return Ok(Value::Bool(e.move_next()));
        }
        if let Some(mut e) = downcast_mut::<RangeEnumerator>(obj) {
            return Ok(Value::Bool(e.move_next()));
        }
    }
    if method == "GetEnumerator" {
        if let Some(range) = downcast::<Range>(obj) {
            return Ok(Value::host(RangeEnumerator::new(*range)));
        }
    }
    let type_name = obj.borrow().type_name().to_string();
    Err(ErrorKind::MemberNotFound(type_name, method.to_string()))
}

fn helper_field(obj: &HostRef, field: &str) -> Option<Value> {
    if field == "Current" {
        if let Some(e) = downcast::<ListEnumerator>(obj) {
            return Some(e.current());
        }
        if let Some(e) = downcast::<RangeEnumerator>(obj) {
            return Some(e.current());
        }
    }
    let range = downcast::<Range>(obj)?;
    match field {
        "Start" => Some(Value::Int(range.start)),
        "End" => Some(Value::Int(range.end)),
        "Step" => Some(Value::Int(range.step)),
        _ => None,
    }
}

fn member_not_found(receiver: &Value, member: &str) -> ErrorKind {
    let type_name = match receiver {
        Value::Host(obj) => obj.borrow().type_name().to_string(),
        other => other.type_name().to_string(),
    };
    ErrorKind::MemberNotFound(type_name, member.to_string())
}

fn describe(args: &[Value]) -> String {
    args.iter()
        .map(Value::type_name)
        .collect::<Vec<_>>()
        .join(", ")
}
