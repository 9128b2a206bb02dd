//! Runtime value types for Tungsten

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::ErrorKind;
use crate::host::{HostObject, HostRef};

/// Shared, mutable list storage
pub type ListRef = Rc<RefCell<Vec<Value>>>;

type ListCell = RefCell<Vec<Value>>;

/// Runtime values in Tungsten
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Float(f32),
    String(String),
    /// Lists own their elements and are shared by reference
    List(ListRef),
    /// Object owned by the embedding host
    Host(HostRef),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn host<T: HostObject>(object: T) -> Self {
        Value::Host(Rc::new(RefCell::new(object)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Host(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view with int → float promotion
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Int(n) => Some(*n as f32),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostRef> {
        match self {
            Value::Host(obj) => Some(obj),
            _ => None,
        }
    }

    /// Literal values may be embedded in a PUSH instruction and folded
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_)
        )
    }

    // ==================== Operators ====================

    pub fn add(&self, other: &Value) -> Result<Value, ErrorKind> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => self.arithmetic(other, "+", i32::wrapping_add, |a, b| a + b),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, ErrorKind> {
        self.arithmetic(other, "-", i32::wrapping_sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, ErrorKind> {
        self.arithmetic(other, "*", i32::wrapping_mul, |a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Result<Value, ErrorKind> {
        if let (Value::Int(_), Value::Int(0)) = (self, other) {
            return Err(ErrorKind::DivisionByZero);
        }
        self.arithmetic(other, "/", i32::wrapping_div, |a, b| a / b)
    }

    pub fn less(&self, other: &Value) -> Result<Value, ErrorKind> {
        self.compare(other, |a, b| a < b, |a, b| a < b)
    }

    pub fn greater(&self, other: &Value) -> Result<Value, ErrorKind> {
        self.compare(other, |a, b| a > b, |a, b| a > b)
    }

    /// Equality: numbers compare with promotion, null compares against
    /// anything, lists and host objects compare by identity
    pub fn equals(&self, other: &Value) -> Result<Value, ErrorKind> {
        let equal = match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Host(a), Value::Host(b)) => Rc::ptr_eq(a, b),
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => x == y,
                _ => return Err(mismatch("comparable values", a, b)),
            },
        };
        Ok(Value::Bool(equal))
    }

    pub fn invert(&self) -> Result<Value, ErrorKind> {
        match self {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ErrorKind::TypeMismatch(
                "bool".to_string(),
                other.type_name().to_string(),
            )),
        }
    }

    fn arithmetic(
        &self,
        other: &Value,
        op: &str,
        int_op: fn(i32, i32) -> i32,
        float_op: fn(f32, f32) -> f32,
    ) -> Result<Value, ErrorKind> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Ok(Value::Float(float_op(x, y))),
                _ => Err(mismatch(&format!("numbers for '{}'", op), a, b)),
            },
        }
    }

    fn compare(
        &self,
        other: &Value,
        int_op: fn(i32, i32) -> bool,
        float_op: fn(f32, f32) -> bool,
    ) -> Result<Value, ErrorKind> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Bool(int_op(*a, *b))),
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Ok(Value::Bool(float_op(x, y))),
                _ => Err(mismatch("numbers", a, b)),
            },
        }
    }
}

fn mismatch(expected: &str, a: &Value, b: &Value) -> ErrorKind {
    ErrorKind::TypeMismatch(
        expected.to_string(),
        format!("{} and {}", a.type_name(), b.type_name()),
    )
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => write_list(f, items, &mut Vec::new()),
            Value::Host(obj) => match obj.try_borrow() {
                Ok(obj) => write!(f, "<{}>", obj.type_name()),
                Err(_) => write!(f, "<object>"),
            },
        }
    }
}

/// Write a list, printing `[...]` for a list nested inside itself.
/// `open` holds the lists currently being written.
fn write_list(f: &mut fmt::Formatter<'_>, items: &ListRef, open: &mut Vec<*const ListCell>) -> fmt::Result {
    let id = Rc::as_ptr(items);
    if open.contains(&id) {
        return write!(f, "[...]");
    }
    open.push(id);

    write!(f, "[")?;
    for (i, item) in items.borrow().iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match item {
            Value::String(s) => write!(f, "\"{}\"", s)?,
            Value::List(inner) => write_list(f, inner, open)?,
            other => write!(f, "{}", other)?,
        }
    }

    open.pop();
    write!(f, "]")
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

/// Structural equality, used by tests and host code. Unlike the `EQU`
/// instruction it never fails and does not promote numbers.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        structural_eq(self, other, &mut Vec::new())
    }
}

/// A pair of lists already under comparison is assumed equal, so lists that
/// contain themselves compare without recursing forever
fn structural_eq(a: &Value, b: &Value, comparing: &mut Vec<(*const ListCell, *const ListCell)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            if Rc::ptr_eq(a, b) {
                return true;
            }
            let pair = (Rc::as_ptr(a), Rc::as_ptr(b));
            if comparing.contains(&pair) {
                return true;
            }
            comparing.push(pair);
            let (xs, ys) = (a.borrow(), b.borrow());
            let equal = xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|(x, y)| structural_eq(x, y, comparing));
            comparing.pop();
            equal
        }
        (Value::Host(a), Value::Host(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic_stays_int() {
        assert_eq!(Value::Int(2).add(&Value::Int(3)), Ok(Value::Int(5)));
        assert_eq!(Value::Int(7).div(&Value::Int(2)), Ok(Value::Int(3)));
        assert_eq!(Value::Int(i32::MAX).add(&Value::Int(1)), Ok(Value::Int(i32::MIN)));
    }

    #[test]
    fn test_mixed_arithmetic_promotes() {
        assert_eq!(Value::Int(1).add(&Value::Float(0.5)), Ok(Value::Float(1.5)));
        assert_eq!(Value::Float(3.0).mul(&Value::Int(2)), Ok(Value::Float(6.0)));
        assert_eq!(Value::Int(1).less(&Value::Float(1.5)), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_string_concat_only_with_strings() {
        assert_eq!(
            Value::from("ab").add(&Value::from("cd")),
            Ok(Value::from("abcd"))
        );
        assert!(matches!(
            Value::from("ab").add(&Value::Int(1)),
            Err(ErrorKind::TypeMismatch(_, _))
        ));
        assert!(Value::from("ab").sub(&Value::from("a")).is_err());
    }

    #[test]
    fn test_integer_division_by_zero() {
        assert_eq!(Value::Int(1).div(&Value::Int(0)), Err(ErrorKind::DivisionByZero));
        assert_eq!(
            Value::Float(1.0).div(&Value::Int(0)),
            Ok(Value::Float(f32::INFINITY))
        );
    }

    #[test]
    fn test_equality_rules() {
        assert_eq!(Value::Int(2).equals(&Value::Float(2.0)), Ok(Value::Bool(true)));
        assert_eq!(Value::Null.equals(&Value::from("x")), Ok(Value::Bool(false)));
        assert!(Value::Bool(true).equals(&Value::Int(1)).is_err());

        let list = Value::list(vec![Value::Int(1)]);
        assert_eq!(list.equals(&list.clone()), Ok(Value::Bool(true)));
        assert_eq!(
            list.equals(&Value::list(vec![Value::Int(1)])),
            Ok(Value::Bool(false))
        );
    }

    #[test]
    fn test_invert_requires_bool() {
        assert_eq!(Value::Bool(true).invert(), Ok(Value::Bool(false)));
        assert!(Value::Int(0).invert().is_err());
    }

    #[test]
    fn test_display() {
        let list = Value::list(vec![Value::Int(1), Value::from("a"), Value::Null]);
        assert_eq!(list.to_string(), "[1, \"a\", null]");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_self_containing_list() {
        let xs = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &xs {
            items.borrow_mut().push(xs.clone());
        }
        assert_eq!(xs.to_string(), "[1, [...]]");
        assert_eq!(format!("{:?}", xs), "[1, [...]]");
        assert_eq!(xs, xs.clone());

        let ys = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &ys {
            items.borrow_mut().push(ys.clone());
        }
        assert_eq!(xs, ys);

        // Cleared so the reference cycles are dropped
        for v in [&xs, &ys] {
            if let Value::List(items) = v {
                items.borrow_mut().clear();
            }
        }
    }

    #[test]
    fn test_nested_list_display() {
        let inner = Value::list(vec![Value::from("a")]);
        let outer = Value::list(vec![inner.clone(), inner]);
        assert_eq!(outer.to_string(), "[[\"a\"], [\"a\"]]");
    }
}
