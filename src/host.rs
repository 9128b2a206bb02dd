//! Host bridge: how scripts reach objects owned by the embedding program
//!
//! The VM never discovers host capabilities on its own. It is handed a
//! [`HostBridge`] and asks it, by name, for types, constructors, methods and
//! fields. [`Registry`] is a ready-made bridge where the embedder declares
//! those members up front.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::ErrorKind;
use crate::value::Value;

/// An object owned by the host and visible to scripts
pub trait HostObject: Any + fmt::Debug {
    /// Name of the registered type this object belongs to
    fn type_name(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub type HostRef = Rc<RefCell<dyn HostObject>>;

/// Borrow a host reference as its concrete type
pub fn downcast<T: HostObject>(obj: &HostRef) -> Option<Ref<'_, T>> {
    Ref::filter_map(obj.borrow(), |o| o.as_any().downcast_ref::<T>()).ok()
}

pub fn downcast_mut<T: HostObject>(obj: &HostRef) -> Option<RefMut<'_, T>> {
    RefMut::filter_map(obj.borrow_mut(), |o| o.as_any_mut().downcast_mut::<T>()).ok()
}

/// Opaque handle to a resolved host type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle(pub usize);

/// Target of a member access
#[derive(Debug, Clone, Copy)]
pub enum Receiver<'a> {
    Static(TypeHandle),
    Instance(&'a HostRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostError {
    TypeNotFound(String),
    MemberNotFound(String, String),
    NoMatchingOverload(String, usize),
    Failed(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ErrorKind::from(self.clone()))
    }
}

impl std::error::Error for HostError {}

impl From<HostError> for ErrorKind {
    fn from(err: HostError) -> Self {
        match err {
            HostError::TypeNotFound(name) => ErrorKind::TypeNotFound(name),
            HostError::MemberNotFound(ty, member) => ErrorKind::MemberNotFound(ty, member),
            HostError::NoMatchingOverload(member, argc) => ErrorKind::NoMatchingOverload(member, argc),
            HostError::Failed(msg) => ErrorKind::HostFailure(msg),
        }
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Capabilities the embedding environment supplies to the VM
pub trait HostBridge {
    /// Resolve a simple (`Vector3`) or qualified (`Engine.Vector3`) type name
    fn resolve_type(&mut self, name: &str) -> Option<TypeHandle>;

    fn construct(&mut self, ty: TypeHandle, args: &[Value]) -> HostResult<Value>;

    fn invoke(&mut self, receiver: Receiver<'_>, method: &str, args: &[Value]) -> HostResult<Value>;

    fn get_field(&mut self, receiver: Receiver<'_>, field: &str) -> HostResult<Value>;

    fn set_field(&mut self, receiver: Receiver<'_>, field: &str, value: Value) -> HostResult<()>;
}

/// A bridge with no host types at all
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBridge;

impl HostBridge for NullBridge {
    fn resolve_type(&mut self, _name: &str) -> Option<TypeHandle> {
        None
    }

    fn construct(&mut self, ty: TypeHandle, _args: &[Value]) -> HostResult<Value> {
        Err(HostError::TypeNotFound(format!("#{}", ty.0)))
    }

    fn invoke(&mut self, receiver: Receiver<'_>, method: &str, _args: &[Value]) -> HostResult<Value> {
        Err(HostError::MemberNotFound(receiver_name(receiver), method.to_string()))
    }

    fn get_field(&mut self, receiver: Receiver<'_>, field: &str) -> HostResult<Value> {
        Err(HostError::MemberNotFound(receiver_name(receiver), field.to_string()))
    }

    fn set_field(&mut self, receiver: Receiver<'_>, field: &str, _value: Value) -> HostResult<()> {
        Err(HostError::MemberNotFound(receiver_name(receiver), field.to_string()))
    }
}

fn receiver_name(receiver: Receiver<'_>) -> String {
    match receiver {
        Receiver::Static(ty) => format!("#{}", ty.0),
        Receiver::Instance(obj) => obj.borrow().type_name().to_string(),
    }
}

// ==================== Registry ====================

/// Parameter types used to pick between overloads with the same arity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Float,
    /// Int or float
    Number,
    String,
    List,
    Object,
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ParamType::Any, _) => true,
            (ParamType::Bool, Value::Bool(_)) => true,
            (ParamType::Int, Value::Int(_)) => true,
            (ParamType::Float, Value::Float(_)) => true,
            (ParamType::Number, Value::Int(_) | Value::Float(_)) => true,
            (ParamType::String, Value::String(_)) => true,
            (ParamType::List, Value::List(_)) => true,
            (ParamType::Object, Value::Host(_)) => true,
            _ => false,
        }
    }
}

pub type StaticFn = Rc<dyn Fn(&[Value]) -> HostResult<Value>>;
pub type MethodFn = Rc<dyn Fn(&HostRef, &[Value]) -> HostResult<Value>>;
pub type GetterFn = Rc<dyn Fn(&HostRef) -> HostResult<Value>>;
pub type SetterFn = Rc<dyn Fn(&HostRef, Value) -> HostResult<()>>;

struct Overload<F> {
    params: Vec<ParamType>,
    func: F,
}

/// Pick an overload by argument count, then by runtime argument types
fn select<'o, F>(overloads: &'o [Overload<F>], member: &str, args: &[Value]) -> HostResult<&'o F> {
    let by_count: Vec<&Overload<F>> = overloads
        .iter()
        .filter(|o| o.params.len() == args.len())
        .collect();

    match by_count.as_slice() {
        [] => Err(HostError::NoMatchingOverload(member.to_string(), args.len())),
        [only] => Ok(&only.func),
        many => many
            .iter()
            .find(|o| o.params.iter().zip(args).all(|(p, a)| p.accepts(a)))
            .map(|o| &o.func)
            .ok_or_else(|| HostError::NoMatchingOverload(member.to_string(), args.len())),
    }
}

struct InstanceField {
    get: GetterFn,
    set: Option<SetterFn>,
}

#[derive(Default)]
struct TypeDef {
    name: String,
    constructors: Vec<Overload<StaticFn>>,
    statics: HashMap<String, Vec<Overload<StaticFn>>>,
    methods: HashMap<String, Vec<Overload<MethodFn>>>,
    static_fields: HashMap<String, Value>,
    fields: HashMap<String, InstanceField>,
}

/// A [`HostBridge`] backed by types declared up front
#[derive(Default)]
pub struct Registry {
    types: Vec<TypeDef>,
    by_name: HashMap<String, TypeHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a type (or reopen an existing one) and add members to it
    pub fn define(&mut self, name: &str) -> TypeBuilder<'_> {
        let handle = match self.by_name.get(name) {
            Some(&handle) => handle,
            None => {
                let handle = TypeHandle(self.types.len());
                self.types.push(TypeDef {
                    name: name.to_string(),
                    ..TypeDef::default()
                });
                self.by_name.insert(name.to_string(), handle);
                handle
            }
        };
        TypeBuilder {
            def: &mut self.types[handle.0],
        }
    }

    pub fn type_name(&self, ty: TypeHandle) -> Option<&str> {
        self.types.get(ty.0).map(|t| t.name.as_str())
    }

    fn def(&self, ty: TypeHandle) -> HostResult<&TypeDef> {
        self.types
            .get(ty.0)
            .ok_or_else(|| HostError::TypeNotFound(format!("#{}", ty.0)))
    }

    fn instance_def(&self, obj: &HostRef) -> HostResult<&TypeDef> {
        let name = obj.borrow().type_name().to_string();
        let handle = self
            .lookup(&name)
            .ok_or(HostError::TypeNotFound(name))?;
        self.def(handle)
    }

    /// Qualified names match exactly. A simple name also finds a qualified
    /// type (`Vector3` finds `Engine.Vector3`) unless several types share it.
    fn lookup(&self, name: &str) -> Option<TypeHandle> {
        if let Some(&handle) = self.by_name.get(name) {
            return Some(handle);
        }
        if name.contains('.') {
            return None;
        }

        let mut matches = self
            .types
            .iter()
            .enumerate()
            .filter(|(_, def)| def.name.rsplit('.').next() == Some(name))
            .map(|(index, _)| TypeHandle(index));
        match (matches.next(), matches.next()) {
            (Some(handle), None) => Some(handle),
            _ => None,
        }
    }
}

impl HostBridge for Registry {
    fn resolve_type(&mut self, name: &str) -> Option<TypeHandle> {
        self.lookup(name)
    }

    fn construct(&mut self, ty: TypeHandle, args: &[Value]) -> HostResult<Value> {
        let def = self.def(ty)?;
        let ctor = select(&def.constructors, &def.name, args)?;
        ctor(args)
    }

    fn invoke(&mut self, receiver: Receiver<'_>, method: &str, args: &[Value]) -> HostResult<Value> {
        match receiver {
            Receiver::Static(ty) => {
                let def = self.def(ty)?;
                let overloads = def
                    .statics
                    .get(method)
                    .ok_or_else(|| HostError::MemberNotFound(def.name.clone(), method.to_string()))?;
                let func = select(overloads, method, args)?;
                func(args)
            }
            Receiver::Instance(obj) => {
                let def = self.instance_def(obj)?;
                let overloads = def
                    .methods
                    .get(method)
                    .ok_or_else(|| HostError::MemberNotFound(def.name.clone(), method.to_string()))?;
                let func = select(overloads, method, args)?;
                func(obj, args)
            }
        }
    }

    fn get_field(&mut self, receiver: Receiver<'_>, field: &str) -> HostResult<Value> {
        match receiver {
            Receiver::Static(ty) => {
                let def = self.def(ty)?;
                def.static_fields
                    .get(field)
                    .cloned()
                    .ok_or_else(|| HostError::MemberNotFound(def.name.clone(), field.to_string()))
            }
            Receiver::Instance(obj) => {
                let def = self.instance_def(obj)?;
                let entry = def
                    .fields
                    .get(field)
                    .ok_or_else(|| HostError::MemberNotFound(def.name.clone(), field.to_string()))?;
                (entry.get)(obj)
            }
        }
    }

    fn set_field(&mut self, receiver: Receiver<'_>, field: &str, value: Value) -> HostResult<()> {
        match receiver {
            Receiver::Static(ty) => {
                let def = self
                    .types
                    .get_mut(ty.0)
                    .ok_or_else(|| HostError::TypeNotFound(format!("#{}", ty.0)))?;
                match def.static_fields.get_mut(field) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(HostError::MemberNotFound(def.name.clone(), field.to_string())),
                }
            }
            Receiver::Instance(obj) => {
                let def = self.instance_def(obj)?;
                let setter = def
                    .fields
                    .get(field)
                    .and_then(|f| f.set.as_ref())
                    .ok_or_else(|| HostError::MemberNotFound(def.name.clone(), field.to_string()))?;
                setter(obj, value)
            }
        }
    }
}

/// Adds members to a registered type
pub struct TypeBuilder<'r> {
    def: &'r mut TypeDef,
}

impl TypeBuilder<'_> {
    pub fn constructor<F>(&mut self, params: &[ParamType], func: F) -> &mut Self
    where
        F: Fn(&[Value]) -> HostResult<Value> + 'static,
    {
        self.def.constructors.push(Overload {
            params: params.to_vec(),
            func: Rc::new(func),
        });
        self
    }

    pub fn static_method<F>(&mut self, name: &str, params: &[ParamType], func: F) -> &mut Self
    where
        F: Fn(&[Value]) -> HostResult<Value> + 'static,
    {
        self.def
            .statics
            .entry(name.to_string())
            .or_default()
            .push(Overload {
                params: params.to_vec(),
                func: Rc::new(func),
            });
        self
    }

    pub fn method<F>(&mut self, name: &str, params: &[ParamType], func: F) -> &mut Self
    where
        F: Fn(&HostRef, &[Value]) -> HostResult<Value> + 'static,
    {
        self.def
            .methods
            .entry(name.to_string())
            .or_default()
            .push(Overload {
                params: params.to_vec(),
                func: Rc::new(func),
            });
        self
    }

    pub fn static_field(&mut self, name: &str, value: Value) -> &mut Self {
        self.def.static_fields.insert(name.to_string(), value);
        self
    }

    /// A read-only instance field or property
    pub fn getter<G>(&mut self, name: &str, get: G) -> &mut Self
    where
        G: Fn(&HostRef) -> HostResult<Value> + 'static,
    {
        self.def.fields.insert(
            name.to_string(),
            InstanceField {
                get: Rc::new(get),
                set: None,
            },
        );
        self
    }

    pub fn field<G, S>(&mut self, name: &str, get: G, set: S) -> &mut Self
    where
        G: Fn(&HostRef) -> HostResult<Value> + 'static,
        S: Fn(&HostRef, Value) -> HostResult<()> + 'static,
    {
        self.def.fields.insert(
            name.to_string(),
            InstanceField {
                get: Rc::new(get),
                set: Some(Rc::new(set)),
            },
        );
        self
    }
}
