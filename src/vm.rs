//! Stack-based virtual machine for Tungsten
//!
//! One value stack is shared by every call. A call frame only remembers
//! where its locals start and where to resume the caller; arguments are
//! collected between a `PREPCALL` mark and the call instruction, and become
//! the callee's first local slots in place.

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, log_enabled, trace, Level};

use crate::bytecode::{Instruction, OpCode, ProgramInfo, REGGLOBAL};
use crate::error::{ErrorKind, Result, TungstenError};
use crate::host::{HostBridge, NullBridge, Receiver, TypeHandle};
use crate::intrinsics;
use crate::token::Span;
use crate::value::Value;

/// Maximum stack size
const STACK_MAX: usize = 4096;

/// Maximum call depth
const FRAMES_MAX: usize = 256;

/// Resource limits for one interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub max_stack: usize,
    pub max_call_depth: usize,
    /// Abort a run after this many instructions
    pub step_limit: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack: STACK_MAX,
            max_call_depth: FRAMES_MAX,
            step_limit: None,
        }
    }
}

/// A suspended caller
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    /// The caller's frame base
    base: usize,
    return_address: usize,
}

/// What the dispatch loop does after one instruction
enum Flow {
    Next,
    Jump(usize),
    Halt(Value),
}

/// The virtual machine
pub struct Interpreter {
    /// Value stack
    stack: Vec<Value>,

    /// Stack index of local slot 0 in the running function
    frame_base: usize,

    /// Open argument windows, innermost last
    arg_marks: Vec<usize>,

    frames: Vec<CallFrame>,

    bridge: Box<dyn HostBridge>,

    /// Host types resolved so far, by the name the script used
    type_cache: HashMap<String, TypeHandle>,

    config: VmConfig,
}

impl Interpreter {
    pub fn new(bridge: Box<dyn HostBridge>) -> Self {
        Self::with_config(bridge, VmConfig::default())
    }

    pub fn with_config(bridge: Box<dyn HostBridge>, config: VmConfig) -> Self {
        Self {
            stack: Vec::with_capacity(config.max_stack.min(STACK_MAX)),
            frame_base: 0,
            arg_marks: Vec::new(),
            frames: Vec::with_capacity(config.max_call_depth.min(FRAMES_MAX)),
            bridge,
            type_cache: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn bridge_mut(&mut self) -> &mut dyn HostBridge {
        self.bridge.as_mut()
    }

    /// Run the global initializers, if the program has any
    pub fn initialize(&mut self, program: &mut ProgramInfo) -> Result<()> {
        if program.function(REGGLOBAL).is_some() {
            self.run(program, REGGLOBAL, &[])?;
        }
        Ok(())
    }

    /// Call a script function by name and return its result
    pub fn run(&mut self, program: &mut ProgramInfo, name: &str, args: &[Value]) -> Result<Value> {
        let func = program
            .function(name)
            .ok_or_else(|| TungstenError::from(ErrorKind::UndefinedFunction(name.to_string())))?;
        if func.arity != args.len() {
            return Err(ErrorKind::WrongArity {
                name: name.to_string(),
                expected: func.arity,
                got: args.len(),
            }
            .into());
        }

        debug!("calling '{}' with {} argument(s)", name, args.len());
        self.reset();
        self.stack.extend_from_slice(args);

        let code = Rc::clone(&program.code);
        let result = self.execute(&code, program, func.address);
        self.reset();
        result
    }

    /// Run a standalone instruction sequence on a fresh interpreter with no
    /// host. Used to fold constant expressions at compile time.
    ///
    /// The interpreter is sized to the sequence: no calls, at most one stack
    /// slot and one step per instruction.
    pub fn evaluate(code: Vec<Instruction>) -> Result<Value> {
        let config = VmConfig {
            max_stack: code.len(),
            max_call_depth: 0,
            step_limit: Some(code.len() as u64),
        };
        let mut program = ProgramInfo::from_code(code);
        let mut vm = Interpreter::with_config(Box::new(NullBridge), config);
        let code = Rc::clone(&program.code);
        vm.execute(&code, &mut program, 0)
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.arg_marks.clear();
        self.frames.clear();
        self.frame_base = 0;
    }

    fn execute(&mut self, code: &[Instruction], program: &mut ProgramInfo, entry: usize) -> Result<Value> {
        let mut ip = entry;
        let mut steps: u64 = 0;

        loop {
            let instr = code.get(ip).ok_or_else(|| {
                TungstenError::from(ErrorKind::InvalidProgram(format!(
                    "instruction pointer {} out of range",
                    ip
                )))
            })?;

            steps += 1;
            let outcome = match self.config.step_limit {
                Some(limit) if steps > limit => Err(ErrorKind::StepLimitExceeded(limit)),
                _ => self.step(instr, ip, program),
            };

            if log_enabled!(Level::Trace) {
                trace!("{:04} {:<28} {:?}", ip, instr.to_string(), self.stack);
            }

            match outcome {
                Ok(Flow::Next) => ip += 1,
                Ok(Flow::Jump(target)) => ip = target,
                Ok(Flow::Halt(value)) => return Ok(value),
                Err(kind) => {
                    self.reset();
                    return Err(TungstenError::new(kind, Some(Span::new(instr.line, 0))));
                }
            }
        }
    }

    fn step(&mut self, instr: &Instruction, ip: usize, program: &mut ProgramInfo) -> std::result::Result<Flow, ErrorKind> {
        match instr.op {
            OpCode::Push => {
                let value = instr
                    .literal()
                    .cloned()
                    .ok_or_else(|| ErrorKind::InvalidProgram("PUSH without a literal".to_string()))?;
                self.push(value)?;
            }

            OpCode::Pop => {
                let n = instr.count();
                let len = self.available(n)?;
                self.stack.truncate(len - n);
            }

            OpCode::Dup => {
                let n = instr.count();
                let len = self.available(n)?;
                self.stack.extend_from_within(len - n..);
                self.check_stack()?;
            }

            // Variables
            OpCode::PushLocal => {
                let value = self
                    .stack
                    .get(self.frame_base + instr.count())
                    .cloned()
                    .ok_or_else(|| ErrorKind::InvalidProgram(format!("bad local slot {}", instr.count())))?;
                self.push(value)?;
            }

            OpCode::SetLocal => {
                let value = self.peek()?.clone();
                let slot = self.frame_base + instr.count();
                match self.stack.get_mut(slot) {
                    Some(local) => *local = value,
                    None => {
                        return Err(ErrorKind::InvalidProgram(format!("bad local slot {}", instr.count())))
                    }
                }
            }

            OpCode::PushGlobal => {
                let value = program
                    .global(instr.name())
                    .cloned()
                    .ok_or_else(|| ErrorKind::UndefinedGlobal(instr.name().to_string()))?;
                self.push(value)?;
            }

            OpCode::SetGlobal => {
                let value = self.peek()?.clone();
                program.set_global(instr.name(), value);
            }

            // Arrays
            OpCode::CrtArr => {
                let start = self.pop_mark()?;
                let items = self.stack.split_off(start);
                self.push(Value::list(items))?;
            }

            OpCode::PushArr => {
                let index = self.pop()?;
                let target = self.pop()?;
                let element = element_at(&target, &index)?;
                self.push(element)?;
            }

            OpCode::SetArr | OpCode::SetArrCached => {
                let value = self.pop()?;
                let index = self.pop()?;
                let target = self.pop()?;
                store_element(&target, &index, value.clone())?;
                self.push(value)?;
            }

            // Arithmetic and comparison
            OpCode::Add => self.binary(Value::add)?,
            OpCode::Sub => self.binary(Value::sub)?,
            OpCode::Mult => self.binary(Value::mul)?,
            OpCode::Div => self.binary(Value::div)?,
            OpCode::Lss => self.binary(Value::less)?,
            OpCode::Grt => self.binary(Value::greater)?,
            OpCode::Equ => self.binary(Value::equals)?,

            OpCode::Inv => {
                let value = self.pop()?.invert()?;
                self.push(value)?;
            }

            // Control flow
            OpCode::Jmp => return Ok(Flow::Jump(instr.count())),

            OpCode::Jfz | OpCode::Jnz => {
                let cond = self.pop()?;
                let cond = cond
                    .as_bool()
                    .ok_or_else(|| ErrorKind::NonBooleanCondition(cond.type_name().to_string()))?;
                if cond == (instr.op == OpCode::Jnz) {
                    return Ok(Flow::Jump(instr.count()));
                }
            }

            // Functions
            OpCode::PrepCall => self.arg_marks.push(self.stack.len()),

            OpCode::Call => {
                let name = instr.name();
                let func = program
                    .function(name)
                    .ok_or_else(|| ErrorKind::UndefinedFunction(name.to_string()))?;
                let start = self.pop_mark()?;
                let argc = self.stack.len() - start;
                if argc != func.arity {
                    return Err(ErrorKind::WrongArity {
                        name: name.to_string(),
                        expected: func.arity,
                        got: argc,
                    });
                }
                if self.frames.len() >= self.config.max_call_depth {
                    return Err(ErrorKind::StackOverflow);
                }
                self.frames.push(CallFrame {
                    base: self.frame_base,
                    return_address: ip + 1,
                });
                self.frame_base = start;
                return Ok(Flow::Jump(func.address));
            }

            OpCode::Return => {
                let result = self.pop()?;
                match self.frames.pop() {
                    None => return Ok(Flow::Halt(result)),
                    Some(frame) => {
                        self.stack.truncate(self.frame_base);
                        self.frame_base = frame.base;
                        self.push(result)?;
                        return Ok(Flow::Jump(frame.return_address));
                    }
                }
            }

            // Host interop
            OpCode::ExtCtor => {
                let args = self.take_args()?;
                let value = self.construct(instr.name(), &args)?;
                self.push(value)?;
            }

            OpCode::ExtStaticCall => {
                let args = self.take_args()?;
                let (ty, method) = split_member(instr.name())?;
                let handle = self.resolve(ty)?;
                let value = self.bridge.invoke(Receiver::Static(handle), method, &args)?;
                self.push(value)?;
            }

            OpCode::ExtInstCall => {
                let args = self.take_args()?;
                let receiver = self.pop()?;
                let value = match intrinsics::call_method(&receiver, instr.name(), &args) {
                    Some(result) => result?,
                    None => self.host_call(&receiver, instr.name(), &args)?,
                };
                self.push(value)?;
            }

            OpCode::PushInstField => {
                let receiver = self.pop()?;
                let value = match intrinsics::get_field(&receiver, instr.name()) {
                    Some(result) => result?,
                    None => match &receiver {
                        Value::Host(obj) => self.bridge.get_field(Receiver::Instance(obj), instr.name())?,
                        other => return Err(member_not_found(other, instr.name())),
                    },
                };
                self.push(value)?;
            }

            OpCode::SetInstField => {
                let value = self.pop()?;
                let receiver = self.pop()?;
                match &receiver {
                    Value::Host(obj) if !intrinsics::is_intrinsic(obj) => {
                        self.bridge
                            .set_field(Receiver::Instance(obj), instr.name(), value.clone())?;
                    }
                    // Built-in members are read-only
                    other => return Err(member_not_found(other, instr.name())),
                }
                self.push(value)?;
            }

            OpCode::PushStaticField => {
                let (ty, field) = split_member(instr.name())?;
                let handle = self.resolve(ty)?;
                let value = self.bridge.get_field(Receiver::Static(handle), field)?;
                self.push(value)?;
            }

            OpCode::SetStaticField => {
                let value = self.peek()?.clone();
                let (ty, field) = split_member(instr.name())?;
                let handle = self.resolve(ty)?;
                self.bridge.set_field(Receiver::Static(handle), field, value)?;
            }
        }

        Ok(Flow::Next)
    }

    // ==================== Host ====================

    /// Resolve a host type, caching the handle under the name used
    fn resolve(&mut self, name: &str) -> std::result::Result<TypeHandle, ErrorKind> {
        if let Some(&handle) = self.type_cache.get(name) {
            return Ok(handle);
        }
        let handle = self
            .bridge
            .resolve_type(name)
            .ok_or_else(|| ErrorKind::TypeNotFound(name.to_string()))?;
        trace!("resolved host type '{}' to #{}", name, handle.0);
        self.type_cache.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// Host types win; `Range` is served when the host has no such type
    fn construct(&mut self, name: &str, args: &[Value]) -> std::result::Result<Value, ErrorKind> {
        match self.resolve(name) {
            Ok(handle) => Ok(self.bridge.construct(handle, args)?),
            Err(not_found) => match intrinsics::construct(name, args) {
                Some(result) => result,
                None => Err(not_found),
            },
        }
    }

    fn host_call(&mut self, receiver: &Value, method: &str, args: &[Value]) -> std::result::Result<Value, ErrorKind> {
        match receiver {
            Value::Host(obj) => Ok(self.bridge.invoke(Receiver::Instance(obj), method, args)?),
            other => Err(member_not_found(other, method)),
        }
    }

    // ==================== Helpers ====================

    fn push(&mut self, value: Value) -> std::result::Result<(), ErrorKind> {
        self.stack.push(value);
        self.check_stack()
    }

    fn pop(&mut self) -> std::result::Result<Value, ErrorKind> {
        self.stack
            .pop()
            .ok_or_else(|| ErrorKind::InvalidProgram("stack underflow".to_string()))
    }

    fn peek(&self) -> std::result::Result<&Value, ErrorKind> {
        self.stack
            .last()
            .ok_or_else(|| ErrorKind::InvalidProgram("stack underflow".to_string()))
    }

    /// Stack length, after checking at least `n` values are present
    fn available(&self, n: usize) -> std::result::Result<usize, ErrorKind> {
        let len = self.stack.len();
        if len < n {
            return Err(ErrorKind::InvalidProgram("stack underflow".to_string()));
        }
        Ok(len)
    }

    fn check_stack(&self) -> std::result::Result<(), ErrorKind> {
        if self.stack.len() > self.config.max_stack {
            return Err(ErrorKind::StackOverflow);
        }
        Ok(())
    }

    fn binary(&mut self, op: fn(&Value, &Value) -> std::result::Result<Value, ErrorKind>) -> std::result::Result<(), ErrorKind> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = op(&a, &b)?;
        self.push(result)
    }

    fn pop_mark(&mut self) -> std::result::Result<usize, ErrorKind> {
        match self.arg_marks.pop() {
            Some(mark) if mark <= self.stack.len() => Ok(mark),
            _ => Err(ErrorKind::InvalidProgram("call without PREPCALL".to_string())),
        }
    }

    /// Pop the innermost argument window
    fn take_args(&mut self) -> std::result::Result<Vec<Value>, ErrorKind> {
        let start = self.pop_mark()?;
        Ok(self.stack.split_off(start))
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(Box::new(NullBridge))
    }
}

/// `Type.member` or `Ns.Type.member` into the type and member parts
fn split_member(operand: &str) -> std::result::Result<(&str, &str), ErrorKind> {
    operand
        .rsplit_once('.')
        .ok_or_else(|| ErrorKind::InvalidProgram(format!("malformed static member '{}'", operand)))
}

fn index_of(index: &Value, len: usize) -> std::result::Result<usize, ErrorKind> {
    let n = index
        .as_int()
        .ok_or_else(|| ErrorKind::TypeMismatch("int index".to_string(), index.type_name().to_string()))?;
    usize::try_from(n)
        .ok()
        .filter(|&i| i < len)
        .ok_or(ErrorKind::IndexOutOfRange(n, len))
}

fn element_at(target: &Value, index: &Value) -> std::result::Result<Value, ErrorKind> {
    match target {
        Value::List(items) => {
            let items = items.borrow();
            let i = index_of(index, items.len())?;
            Ok(items[i].clone())
        }
        Value::String(s) => {
            let len = s.chars().count();
            let i = index_of(index, len)?;
            Ok(s.chars().nth(i).map(|c| Value::String(c.to_string())).unwrap_or(Value::Null))
        }
        other => Err(ErrorKind::TypeMismatch(
            "list or string".to_string(),
            other.type_name().to_string(),
        )),
    }
}

fn store_element(target: &Value, index: &Value, value: Value) -> std::result::Result<(), ErrorKind> {
    match target {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = index_of(index, items.len())?;
            items[i] = value;
            Ok(())
        }
        other => Err(ErrorKind::TypeMismatch(
            "list".to_string(),
            other.type_name().to_string(),
        )),
    }
}

fn member_not_found(receiver: &Value, member: &str) -> ErrorKind {
    ErrorKind::MemberNotFound(receiver.type_name().to_string(), member.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Operand;
    use crate::compiler::Compiler;
    use crate::error::ErrorClass;

    fn program(source: &str) -> ProgramInfo {
        match Compiler::compile(source) {
            Ok(program) => program,
            Err(diagnostics) => panic!("compile failed:\n{}", diagnostics.render()),
        }
    }

    fn call(source: &str, name: &str, args: &[Value]) -> Result<Value> {
        let mut program = program(source);
        let mut vm = Interpreter::default();
        vm.initialize(&mut program)?;
        vm.run(&mut program, name, args)
    }

    fn run_main(source: &str) -> Value {
        call(source, "main", &[]).unwrap()
    }

    #[test]
    fn test_evaluate_raw_code() {
        let code = vec![
            Instruction::push(Value::Int(1), 1),
            Instruction::push(Value::Int(2), 1),
            Instruction::simple(OpCode::Add, 1),
            Instruction::simple(OpCode::Return, 1),
        ];
        assert_eq!(Interpreter::evaluate(code).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_evaluate_reports_line() {
        let code = vec![
            Instruction::push(Value::Int(1), 4),
            Instruction::push(Value::Int(0), 4),
            Instruction::simple(OpCode::Div, 4),
            Instruction::simple(OpCode::Return, 4),
        ];
        let err = Interpreter::evaluate(code).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
        assert_eq!(err.span, Some(Span::new(4, 0)));
    }

    #[test]
    fn test_vm_arithmetic() {
        assert_eq!(
            call("func f(a, b) { return a * b + a / b; }", "f", &[Value::Int(7), Value::Int(2)]).unwrap(),
            Value::Int(17)
        );
        assert_eq!(
            call("func f(a) { return a + 0.5; }", "f", &[Value::Int(1)]).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn test_vm_recursion() {
        let source = r#"
            func fib(n) {
                if n < 2 { return n; }
                return fib(n - 1) + fib(n - 2);
            }
        "#;
        assert_eq!(call(source, "fib", &[Value::Int(15)]).unwrap(), Value::Int(610));
    }

    #[test]
    fn test_vm_nested_calls_keep_locals() {
        let source = r#"
            func add(a, b) { var t = a + b; return t; }
            func main() {
                var x = 1;
                var y = add(x, add(2, 3));
                return x + y;
            }
        "#;
        assert_eq!(run_main(source), Value::Int(7));
    }

    #[test]
    fn test_vm_globals() {
        let source = r#"
            var counter = 10;
            var empty;
            func bump() { counter += 1; return counter; }
            func main() { bump(); bump(); return empty == null && counter == 12; }
        "#;
        assert_eq!(run_main(source), Value::Bool(true));
    }

    #[test]
    fn test_vm_globals_persist_between_runs() {
        let mut program = program("var n = 0; func tick() { n += 1; return n; }");
        let mut vm = Interpreter::default();
        vm.initialize(&mut program).unwrap();
        vm.run(&mut program, "tick", &[]).unwrap();
        assert_eq!(vm.run(&mut program, "tick", &[]).unwrap(), Value::Int(2));
        assert_eq!(program.global("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_vm_undefined_global() {
        let err = call("func main() { return missing; }", "main", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedGlobal("missing".into()));
        assert_eq!(err.line(), Some(1));
    }

    #[test]
    fn test_vm_undefined_function() {
        let err = call("func main() {\n  return nope(1);\n}", "main", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedFunction("nope".into()));
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.class(), ErrorClass::Runtime);
    }

    #[test]
    fn test_vm_arity_checks() {
        let source = "func f(a) { return a; } func main() { return f(1, 2); }";
        assert!(matches!(
            call(source, "main", &[]).unwrap_err().kind,
            ErrorKind::WrongArity { expected: 1, got: 2, .. }
        ));
        assert!(matches!(
            call(source, "f", &[]).unwrap_err().kind,
            ErrorKind::WrongArity { expected: 1, got: 0, .. }
        ));
    }

    #[test]
    fn test_vm_condition_must_be_bool() {
        let err = call("func f(x) { if x { return 1; } return 0; }", "f", &[Value::Int(1)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NonBooleanCondition("int".into()));
    }

    #[test]
    fn test_vm_step_limit() {
        let mut program = program("func spin() { while true { } return 0; }");
        let config = VmConfig {
            step_limit: Some(500),
            ..VmConfig::default()
        };
        let mut vm = Interpreter::with_config(Box::new(NullBridge), config);
        let err = vm.run(&mut program, "spin", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepLimitExceeded(500));
    }

    #[test]
    fn test_vm_call_depth() {
        let err = call("func down(n) { return down(n + 1); }", "down", &[Value::Int(0)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn test_vm_recovers_after_error() {
        let mut program = program("func div(a, b) { return a / b; }");
        let mut vm = Interpreter::default();
        assert!(vm.run(&mut program, "div", &[Value::Int(1), Value::Int(0)]).is_err());
        assert_eq!(
            vm.run(&mut program, "div", &[Value::Int(9), Value::Int(3)]).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn test_vm_lists_are_shared() {
        let source = r#"
            func fill(xs) { xs[0] = 5; xs:Add(6); }
            func main() {
                var xs = [1];
                fill(xs);
                return xs[0] + xs[1] + xs:Count;
            }
        "#;
        assert_eq!(run_main(source), Value::Int(13));
    }

    #[test]
    fn test_vm_index_errors() {
        let err = call("func main() { var xs = [1, 2]; return xs[2]; }", "main", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfRange(2, 2));
        assert_eq!(
            call("func main() { return \"abc\"[1]; }", "main", &[]).unwrap(),
            Value::from("b")
        );
    }

    #[test]
    fn test_vm_unknown_host_type() {
        let err = call("func main() { return new Missing(); }", "main", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeNotFound("Missing".into()));
    }

    #[test]
    fn test_vm_range_without_host() {
        let source = r#"
            func main() {
                var total = 0;
                for i in new Range(1, 5) { total += i; }
                return total;
            }
        "#;
        assert_eq!(run_main(source), Value::Int(10));
    }

    #[test]
    fn test_evaluate_is_bounded_by_its_code() {
        let code = vec![
            Instruction::push(Value::Int(1), 1),
            Instruction::new(OpCode::Jmp, Operand::Address(0), 1),
        ];
        let err = Interpreter::evaluate(code).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepLimitExceeded(2));
    }

    #[test]
    fn test_vm_malformed_code_is_an_error() {
        let code = vec![Instruction::new(OpCode::Pop, Operand::Count(1), 1)];
        assert!(matches!(
            Interpreter::evaluate(code).unwrap_err().kind,
            ErrorKind::InvalidProgram(_)
        ));
    }
}
