//! Bytecode instructions and the compiled program artifact

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::diagnostics::Diagnostics;
use crate::value::Value;

/// Name of the synthetic function that runs global initializers
pub const REGGLOBAL: &str = "__regglobal";

/// Placeholder operand of a jump that has not been patched yet
pub const UNPATCHED: usize = usize::MAX;

/// Opcodes for the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    // Stack
    Push,   // Push the literal operand
    Pop,    // Discard `count` values
    Dup,    // Duplicate the top `count` values

    // Variables
    PushLocal,  // Slot relative to the frame base
    SetLocal,
    PushGlobal, // Named global
    SetGlobal,

    // Arrays
    CrtArr,       // Collect the argument window into a list
    PushArr,      // array, index -> element
    SetArr,       // array, index, value -> value
    SetArrCached, // Store for compound assignment over a duplicated array/index pair

    // Arithmetic and comparison
    Add,
    Sub,
    Mult,
    Div,
    Lss,
    Grt,
    Equ,
    Inv,

    // Control flow
    Jmp,
    Jfz, // Pop a bool, jump when false
    Jnz, // Pop a bool, jump when true

    // Functions
    PrepCall, // Mark the start of an argument window
    Call,     // Call the named script function
    Return,

    // Host interop
    ExtCtor,
    ExtStaticCall,
    ExtInstCall,
    PushInstField,
    SetInstField,
    PushStaticField,
    SetStaticField,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Push => "PUSH",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::PushLocal => "PUSHLOCAL",
            OpCode::SetLocal => "SETLOCAL",
            OpCode::PushGlobal => "PUSHGLOBAL",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::CrtArr => "CRTARR",
            OpCode::PushArr => "PUSHARR",
            OpCode::SetArr => "SETARR",
            OpCode::SetArrCached => "SETARR_CACHED",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mult => "MULT",
            OpCode::Div => "DIV",
            OpCode::Lss => "LSS",
            OpCode::Grt => "GRT",
            OpCode::Equ => "EQU",
            OpCode::Inv => "INV",
            OpCode::Jmp => "JMP",
            OpCode::Jfz => "JFZ",
            OpCode::Jnz => "JNZ",
            OpCode::PrepCall => "PREPCALL",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::ExtCtor => "EXT_CTOR",
            OpCode::ExtStaticCall => "EXT_STATIC_CALL",
            OpCode::ExtInstCall => "EXT_INST_CALL",
            OpCode::PushInstField => "PUSH_INST_FIELD",
            OpCode::SetInstField => "SET_INST_FIELD",
            OpCode::PushStaticField => "PUSH_STATIC_FIELD",
            OpCode::SetStaticField => "SET_STATIC_FIELD",
        }
    }

    /// Binary operators eligible for constant folding
    pub fn is_foldable(self) -> bool {
        matches!(
            self,
            OpCode::Add | OpCode::Sub | OpCode::Mult | OpCode::Div | OpCode::Lss | OpCode::Grt | OpCode::Equ
        )
    }

    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jmp | OpCode::Jfz | OpCode::Jnz)
    }

    /// The store that replaces a read when the read turns out to be an
    /// assignment target
    pub fn setter(self) -> Option<OpCode> {
        match self {
            OpCode::PushLocal => Some(OpCode::SetLocal),
            OpCode::PushGlobal => Some(OpCode::SetGlobal),
            OpCode::PushArr => Some(OpCode::SetArr),
            OpCode::PushInstField => Some(OpCode::SetInstField),
            OpCode::PushStaticField => Some(OpCode::SetStaticField),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Literal(Value),
    Name(String),
    Address(usize),
    Slot(usize),
    Count(usize),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Literal(Value::String(s)) => write!(f, "{:?}", s),
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Name(name) => write!(f, "'{}'", name),
            Operand::Address(addr) if *addr == UNPATCHED => write!(f, "-> ????"),
            Operand::Address(addr) => write!(f, "-> {:04}", addr),
            Operand::Slot(slot) => write!(f, "#{}", slot),
            Operand::Count(n) => write!(f, "{}", n),
        }
    }
}

/// One VM instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub operand: Operand,
    /// Source line, for runtime error reports
    pub line: usize,
}

impl Instruction {
    pub fn new(op: OpCode, operand: Operand, line: usize) -> Self {
        Self { op, operand, line }
    }

    pub fn simple(op: OpCode, line: usize) -> Self {
        Self::new(op, Operand::None, line)
    }

    pub fn push(value: Value, line: usize) -> Self {
        Self::new(OpCode::Push, Operand::Literal(value), line)
    }

    /// The value of a literal push, if this is one
    pub fn literal(&self) -> Option<&Value> {
        match (&self.op, &self.operand) {
            (OpCode::Push, Operand::Literal(value)) => Some(value),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match &self.operand {
            Operand::Name(name) => name,
            _ => "",
        }
    }

    pub fn count(&self) -> usize {
        match self.operand {
            Operand::Count(n) | Operand::Slot(n) | Operand::Address(n) => n,
            _ => 0,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.op.mnemonic()),
            _ => write!(f, "{} {}", self.op.mnemonic(), self.operand),
        }
    }
}

/// Entry point of a compiled function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncInfo {
    pub arity: usize,
    pub address: usize,
}

/// The compiled program: code, function table and global store
#[derive(Debug, Clone)]
pub struct ProgramInfo {
    pub(crate) code: Rc<[Instruction]>,
    pub(crate) functions: HashMap<String, FuncInfo>,
    pub(crate) global_names: Vec<String>,
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) diagnostics: Diagnostics,
}

impl ProgramInfo {
    /// A bare program around raw code, with no functions or globals
    pub(crate) fn from_code(code: Vec<Instruction>) -> Self {
        Self {
            code: code.into(),
            functions: HashMap::new(),
            global_names: Vec::new(),
            globals: HashMap::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn function(&self, name: &str) -> Option<FuncInfo> {
        self.functions.get(name).copied()
    }

    /// User-visible function names, sorted by entry address
    pub fn function_names(&self) -> Vec<&str> {
        let mut funcs: Vec<(&str, usize)> = self
            .functions
            .iter()
            .filter(|(name, _)| name.as_str() != REGGLOBAL)
            .map(|(name, info)| (name.as_str(), info.address))
            .collect();
        funcs.sort_by_key(|&(_, address)| address);
        funcs.into_iter().map(|(name, _)| name).collect()
    }

    /// Global names in declaration order
    pub fn global_names(&self) -> &[String] {
        &self.global_names
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        if !self.globals.contains_key(name) && !self.global_names.iter().any(|n| n == name) {
            self.global_names.push(name.to_string());
        }
        self.globals.insert(name.to_string(), value);
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Disassemble for debugging
    pub fn disassemble(&self) -> String {
        let mut entries: Vec<(usize, &str)> = self
            .functions
            .iter()
            .map(|(name, info)| (info.address, name.as_str()))
            .collect();
        entries.sort();

        let mut result = String::new();
        for (offset, instr) in self.code.iter().enumerate() {
            for (_, name) in entries.iter().filter(|(addr, _)| *addr == offset) {
                let arity = self.functions[*name].arity;
                result.push_str(&format!("== {} ({}) ==\n", name, arity));
            }
            result.push_str(&format!("{:04} {:4} {}\n", offset, instr.line, instr));
        }
        result
    }
}

impl fmt::Display for ProgramInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_display() {
        assert_eq!(Instruction::push(Value::Int(7), 1).to_string(), "PUSH 7");
        assert_eq!(Instruction::push(Value::from("hi"), 1).to_string(), "PUSH \"hi\"");
        assert_eq!(
            Instruction::new(OpCode::Jfz, Operand::Address(12), 1).to_string(),
            "JFZ -> 0012"
        );
        assert_eq!(
            Instruction::new(OpCode::ExtInstCall, Operand::Name("MoveNext".into()), 1).to_string(),
            "EXT_INST_CALL 'MoveNext'"
        );
        assert_eq!(Instruction::simple(OpCode::SetArrCached, 1).to_string(), "SETARR_CACHED");
    }

    #[test]
    fn test_setter_pairs() {
        assert_eq!(OpCode::PushLocal.setter(), Some(OpCode::SetLocal));
        assert_eq!(OpCode::PushArr.setter(), Some(OpCode::SetArr));
        assert_eq!(OpCode::Push.setter(), None);
    }

    #[test]
    fn test_disassemble_marks_functions() {
        let mut functions = HashMap::new();
        functions.insert("main".to_string(), FuncInfo { arity: 0, address: 0 });
        let mut program = ProgramInfo::from_code(vec![
            Instruction::push(Value::Int(7), 1),
            Instruction::simple(OpCode::Return, 1),
        ]);
        program.functions = functions;
        let text = program.disassemble();
        assert!(text.starts_with("== main (0) ==\n0000    1 PUSH 7\n"));
        assert!(text.contains("0001    1 RETURN"));
    }
}
