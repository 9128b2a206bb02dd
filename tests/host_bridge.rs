//! Integration tests for scripts calling into host types

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use tungsten::host::{downcast, downcast_mut};
use tungsten::{ErrorKind, HostError, HostObject, ParamType, Registry, Script, Value};

#[derive(Debug)]
struct Vector2 {
    x: f32,
    y: f32,
}

impl HostObject for Vector2 {
    fn type_name(&self) -> &str {
        "Engine.Vector2"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A host collection scripts can walk with `for`
#[derive(Debug)]
struct Inventory {
    items: Vec<i32>,
}

impl HostObject for Inventory {
    fn type_name(&self) -> &str {
        "Inventory"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
struct InventoryCursor {
    items: Vec<i32>,
    index: Option<usize>,
}

impl HostObject for InventoryCursor {
    fn type_name(&self) -> &str {
        "InventoryCursor"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn number(value: &Value) -> Result<f32, HostError> {
    value
        .as_float()
        .ok_or_else(|| HostError::Failed(format!("expected a number, got {}", value.type_name())))
}

fn registry(log: Rc<Cell<i32>>) -> Registry {
    let mut registry = Registry::new();

    registry
        .define("Engine.Vector2")
        .constructor(&[], |_| Ok(Value::host(Vector2 { x: 0.0, y: 0.0 })))
        .constructor(&[ParamType::Number, ParamType::Number], |args| {
            Ok(Value::host(Vector2 {
                x: number(&args[0])?,
                y: number(&args[1])?,
            }))
        })
        .static_field("Unit", Value::Float(1.0))
        .static_method("Dot", &[ParamType::Object, ParamType::Object], |args| {
            let (Some(a), Some(b)) = (args[0].as_host(), args[1].as_host()) else {
                return Err(HostError::Failed("Dot needs two vectors".into()));
            };
            let (Some(a), Some(b)) = (downcast::<Vector2>(a), downcast::<Vector2>(b)) else {
                return Err(HostError::Failed("Dot needs two vectors".into()));
            };
            Ok(Value::Float(a.x * b.x + a.y * b.y))
        })
        .field(
            "x",
            |this| Ok(Value::Float(downcast::<Vector2>(this).map_or(0.0, |v| v.x))),
            |this, value| {
                let x = number(&value)?;
                if let Some(mut v) = downcast_mut::<Vector2>(this) {
                    v.x = x;
                }
                Ok(())
            },
        )
        .getter("y", |this| Ok(Value::Float(downcast::<Vector2>(this).map_or(0.0, |v| v.y))))
        .method("Scale", &[ParamType::Number], |this, args| {
            let k = number(&args[0])?;
            if let Some(mut v) = downcast_mut::<Vector2>(this) {
                v.x *= k;
                v.y *= k;
            }
            Ok(Value::Null)
        });

    registry
        .define("Inventory")
        .constructor(&[ParamType::List], |args| {
            let items = args[0]
                .as_list()
                .map(|list| list.borrow().iter().filter_map(Value::as_int).collect())
                .unwrap_or_default();
            Ok(Value::host(Inventory { items }))
        })
        .method("GetEnumerator", &[], |this, _| {
            let items = downcast::<Inventory>(this)
                .map(|inv| inv.items.clone())
                .unwrap_or_default();
            Ok(Value::host(InventoryCursor { items, index: None }))
        });

    registry
        .define("InventoryCursor")
        .method("MoveNext", &[], |this, _| {
            let mut cursor = downcast_mut::<InventoryCursor>(this)
                .ok_or_else(|| HostError::Failed("not a cursor".into()))?;
            let next = cursor.index.map_or(0, |i| i + 1);
            cursor.index = Some(next);
            Ok(Value::Bool(next < cursor.items.len()))
        })
        .getter("Current", |this| {
            let cursor = downcast::<InventoryCursor>(this)
                .ok_or_else(|| HostError::Failed("not a cursor".into()))?;
            Ok(cursor
                .index
                .and_then(|i| cursor.items.get(i))
                .map_or(Value::Null, |n| Value::Int(*n)))
        });

    registry
        .define("Debug")
        .static_method("Log", &[ParamType::Int], move |args| {
            log.set(log.get() + args[0].as_int().unwrap_or(0));
            Ok(Value::Null)
        })
        .static_method("Log", &[ParamType::String], |_| Ok(Value::from("string")))
        .static_method("Log", &[ParamType::Int, ParamType::Int], |_| Ok(Value::from("pair")));

    registry
}

fn script(source: &str) -> Script {
    match Script::new(source, Box::new(registry(Rc::new(Cell::new(0))))) {
        Ok(script) => script,
        Err(diagnostics) => panic!("script rejected:\n{}", diagnostics.render()),
    }
}

#[test]
fn test_for_over_host_enumerable() {
    let mut script = script(
        r#"
        func main() {
            var total = 0;
            for n in new Inventory([10, 20, 30]) {
                total += n;
            }
            return total;
        }
    "#,
    );
    assert_eq!(script.call("main", &[]).unwrap(), Value::Int(60));
}

#[test]
fn test_instance_fields_and_methods() {
    let mut script = script(
        r#"
        func main() {
            var v = new Vector2(3, 4);
            v:Scale(2);
            v:x += 1;
            return v:x + v:y;
        }
    "#,
    );
    assert_eq!(script.call("main", &[]).unwrap(), Value::Float(15.0));
}

#[test]
fn test_qualified_type_names() {
    let mut script = script(
        r#"
        func main() {
            var a = new Engine.Vector2(1, 2);
            var b = new Vector2(3, 4);
            return Vector2:Dot(a, b) + Engine.Vector2:Unit;
        }
    "#,
    );
    assert_eq!(script.call("main", &[]).unwrap(), Value::Float(12.0));
}

#[test]
fn test_wrong_namespace_is_not_resolved() {
    let mut script = script("func main() { return new Physics.Vector2(1, 2); }");
    let err = script.call("main", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeNotFound("Physics.Vector2".to_string()));
}

#[test]
fn test_static_fields_are_writable() {
    let mut script = script(
        r#"
        func bump() {
            Vector2:Unit = Vector2:Unit * 2;
            return Vector2:Unit;
        }
    "#,
    );
    assert_eq!(script.call("bump", &[]).unwrap(), Value::Float(2.0));
    assert_eq!(script.call("bump", &[]).unwrap(), Value::Float(4.0));
}

#[test]
fn test_overloads_by_count_and_type() {
    let mut script = script(
        r#"
        func one(x) { return Debug:Log(x); }
        func two() { return Debug:Log(1, 2); }
    "#,
    );
    assert_eq!(script.call("one", &[Value::from("hi")]).unwrap(), Value::from("string"));
    assert_eq!(script.call("one", &[Value::Int(3)]).unwrap(), Value::Null);
    assert_eq!(script.call("two", &[]).unwrap(), Value::from("pair"));

    let err = script.call("one", &[Value::Bool(true)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoMatchingOverload("Log".to_string(), 1));
}

#[test]
fn test_host_side_effects() {
    let log = Rc::new(Cell::new(0));
    let mut script = Script::new(
        r#"
        func update(dt) { Debug:Log(dt); }
    "#,
        Box::new(registry(log.clone())),
    )
    .unwrap();

    for dt in 1..=4 {
        script.call("update", &[Value::Int(dt)]).unwrap();
    }
    assert_eq!(log.get(), 10);
}

#[test]
fn test_host_objects_passed_in_and_out() {
    let mut script = script(
        r#"
        var last = null;
        func keep(v) { last = v; v:x = 42; }
    "#,
    );
    let vector = Value::host(Vector2 { x: 1.0, y: 2.0 });
    script.call("keep", &[vector.clone()]).unwrap();

    let host = vector.as_host().unwrap();
    assert_eq!(downcast::<Vector2>(host).unwrap().x, 42.0);
    assert_eq!(script.global("last"), Some(&vector));
}

#[test]
fn test_missing_members_and_types() {
    let mut script = script(
        r#"
        func unknown_type() { return new Quaternion(); }
        func unknown_method() { var v = new Vector2(); return v:Normalize(); }
        func readonly_field() { var v = new Vector2(); v:y = 1; }
        func failing_host() { return new Vector2("a", 1); }
    "#,
    );

    let err = script.call("unknown_type", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeNotFound("Quaternion".to_string()));

    let err = script.call("unknown_method", &[]).unwrap_err();
    assert_eq!(
        err.kind,
        ErrorKind::MemberNotFound("Engine.Vector2".to_string(), "Normalize".to_string())
    );

    let err = script.call("readonly_field", &[]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::MemberNotFound(_, _)));

    let err = script.call("failing_host", &[]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::HostFailure(_)));

    // Only the latest failure is kept
    assert_eq!(script.diagnostics().error_count(), 1);
    assert_eq!(script.diagnostics().last_runtime_error(), Some(&err));
}

#[test]
fn test_lifecycle_hooks() {
    let mut script = script(
        r#"
        var ticks = 0;
        var position = null;

        func awake() { position = new Vector2(); }
        func update(dt) {
            ticks += 1;
            position:x += dt;
        }
        func report() { return position:x; }
    "#,
    );

    assert!(script.call_if_present("start", &[]).is_none());
    script.call("awake", &[]).unwrap();
    for _ in 0..3 {
        script.call("update", &[Value::Float(0.5)]).unwrap();
    }
    assert_eq!(script.global("ticks"), Some(&Value::Int(3)));
    assert_eq!(script.call("report", &[]).unwrap(), Value::Float(1.5));
}
