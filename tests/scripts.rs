//! Integration tests for compiling and running whole scripts without a host

use tungsten::{compile, run, ErrorClass, ErrorKind, Value};

fn run_main(source: &str) -> Value {
    run(source, "main", &[]).expect("execution failed")
}

#[test]
fn test_precedence() {
    assert_eq!(run_main("func main() { return 1 + 2 * 3; }"), Value::Int(7));
    assert_eq!(run_main("func main() { return (1 + 2) * 3; }"), Value::Int(9));
    assert_eq!(run_main("func main() { return 10 - 4 - 3; }"), Value::Int(3));
}

#[test]
fn test_mixed_arithmetic_promotes_to_float() {
    assert_eq!(run_main("func main() { return 1 + 0.5; }"), Value::Float(1.5));
    assert_eq!(run_main("func main() { return 7 / 2; }"), Value::Int(3));
    assert_eq!(run_main("func main() { return 7 / 2.0; }"), Value::Float(3.5));
}

#[test]
fn test_string_concatenation() {
    let result = run_main(r#"func main() { var name = "world"; return "hello " + name; }"#);
    assert_eq!(result, Value::String("hello world".to_string()));
}

#[test]
fn test_shadowing_in_nested_blocks() {
    let result = run_main(
        r#"
        func main() {
            var x = 5;
            {
                var x = 10;
                x = x + 1;
            }
            return x;
        }
    "#,
    );
    assert_eq!(result, Value::Int(5));
}

#[test]
fn test_for_over_list_literal() {
    let result = run_main(
        r#"
        func main() {
            var sum = 0;
            for n in [10, 20, 30] {
                sum += n;
            }
            return sum;
        }
    "#,
    );
    assert_eq!(result, Value::Int(60));
}

#[test]
fn test_while_with_break_and_continue() {
    let result = run_main(
        r#"
        func main() {
            var i = 0;
            var odd = 0;
            while true {
                i += 1;
                if i > 9 { break; }
                if i == 2 || i == 4 || i == 6 || i == 8 { continue; }
                odd += i;
            }
            return odd;
        }
    "#,
    );
    assert_eq!(result, Value::Int(25));
}

#[test]
fn test_for_with_break_and_continue() {
    let result = run_main(
        r#"
        func main() {
            var total = 0;
            for x in [1, 2, 3, 4, 5, 6] {
                var doubled = x * 2;
                if x == 2 { continue; }
                {
                    var stop = x == 5;
                    if stop { break; }
                }
                total += doubled;
            }

            var pairs = 0;
            for i in new Range(3) {
                for j in new Range(3) {
                    if j > i { break; }
                    pairs += 1;
                }
            }

            var after = 100;
            return total + after + pairs * 1000;
        }
    "#,
    );
    assert_eq!(result, Value::Int(6116));
}

#[test]
fn test_else_if_chain() {
    let source = r#"
        func grade(score) {
            if score >= 90 { return "A"; }
            else if score >= 80 { return "B"; }
            else { return "C"; }
        }
    "#;
    assert_eq!(run(source, "grade", &[Value::Int(95)]).unwrap(), Value::from("A"));
    assert_eq!(run(source, "grade", &[Value::Int(85)]).unwrap(), Value::from("B"));
    assert_eq!(run(source, "grade", &[Value::Int(10)]).unwrap(), Value::from("C"));
}

#[test]
fn test_recursion_with_arguments() {
    let source = r#"
        func fact(n) {
            if n <= 1 { return 1; }
            return n * fact(n - 1);
        }
    "#;
    assert_eq!(run(source, "fact", &[Value::Int(10)]).unwrap(), Value::Int(3628800));
}

#[test]
fn test_global_initializers_run_before_call() {
    let result = run_main(
        r#"
        var base = 40;
        var bonus = base / 20;
        func main() { return base + bonus; }
    "#,
    );
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_list_aliases_share_elements() {
    let result = run_main(
        r#"
        func main() {
            var a = [1, 2, 3];
            var b = a;
            b[0] = 100;
            a:Add(4);
            return a[0] + b:Count;
        }
    "#,
    );
    assert_eq!(result, Value::Int(104));
}

#[test]
fn test_list_containing_itself_prints() {
    let result = run_main("func main() { var xs = [1, 2]; xs:Add(xs); return xs; }");
    assert_eq!(result.to_string(), "[1, 2, [...]]");
    assert_eq!(result, result.clone());
}

#[test]
fn test_stepped_ranges() {
    let result = run_main(
        r#"
        func main() {
            var up = 0;
            for i in new Range(0, 10, 3) { up += i; }
            var down = 0;
            for i in new Range(3, 0, -1) { down = down * 10 + i; }
            return up * 1000 + down;
        }
    "#,
    );
    assert_eq!(result, Value::Int(18321));
}

#[test]
fn test_undefined_function() {
    let err = run("func main() { return missing(1); }", "main", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UndefinedFunction("missing".to_string()));
    assert_eq!(err.line(), Some(1));
    assert!(err.source_line.is_some());
}

#[test]
fn test_wrong_arity_from_host() {
    let err = run("func add(a, b) { return a + b; }", "add", &[Value::Int(1)]).unwrap_err();
    assert_eq!(
        err.kind,
        ErrorKind::WrongArity {
            name: "add".to_string(),
            expected: 2,
            got: 1,
        }
    );
}

#[test]
fn test_runtime_type_error() {
    let err = run(r#"func main() { var s = "a"; return 1 - s; }"#, "main", &[]).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Runtime);
    assert!(matches!(err.kind, ErrorKind::TypeMismatch(_, _)));
}

#[test]
fn test_compile_errors_are_collected() {
    let diagnostics = compile(
        r#"
        func a() { var = 1; }
        func b() { return 2 }
        func c() { return 3; }
    "#,
    )
    .unwrap_err();
    assert_eq!(diagnostics.error_count(), 2);
    assert!(diagnostics.errors().iter().all(|e| e.class() == ErrorClass::Syntax));
    assert!(diagnostics.render().contains("^"));
}

#[test]
fn test_constant_fold_error_is_reported_at_compile_time() {
    let diagnostics = compile("func main() { return 1 / 0; }").unwrap_err();
    assert_eq!(diagnostics.errors()[0].class(), ErrorClass::ConstantFold);
}

#[test]
fn test_compiled_program_lists_functions() {
    let program = compile(
        r#"
        var speed = 3;
        func start() {}
        func update(dt) { return speed * dt; }
    "#,
    )
    .unwrap();
    assert_eq!(program.function_names(), vec!["start", "update"]);
    assert_eq!(program.global_names(), &["speed".to_string()]);
    assert!(program.disassemble().contains("RETURN"));
}
