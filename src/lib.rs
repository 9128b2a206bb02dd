//! Tungsten - a small embeddable scripting language
//!
//! Source is compiled in a single pass to flat bytecode and executed on a
//! stack-based VM. Scripts reach objects owned by the embedding program
//! through a [`HostBridge`].

pub mod token;
pub mod lexer;
pub mod diagnostics;
pub mod error;
pub mod value;
pub mod host;
pub mod intrinsics;
pub mod bytecode;
pub mod compiler;
pub mod vm;
pub mod script;

pub use bytecode::ProgramInfo;
pub use compiler::Compiler;
pub use diagnostics::Diagnostics;
pub use error::{ErrorClass, ErrorKind, Result, TungstenError};
pub use host::{HostBridge, HostError, HostObject, NullBridge, ParamType, Receiver, Registry, TypeHandle};
pub use lexer::Lexer;
pub use script::Script;
pub use value::Value;
pub use vm::{Interpreter, VmConfig};

/// Compile source into a program artifact
pub fn compile(source: &str) -> std::result::Result<ProgramInfo, Diagnostics> {
    Compiler::compile(source)
}

/// Convenience function to compile a script and call one of its functions
/// without a host
pub fn run(source: &str, name: &str, args: &[Value]) -> Result<Value> {
    let mut program = compile(source).map_err(|diagnostics| {
        diagnostics.errors().first().cloned().unwrap_or_else(|| {
            TungstenError::from(ErrorKind::InvalidProgram("compilation failed".to_string()))
        })
    })?;

    let mut vm = Interpreter::default();
    vm.initialize(&mut program)
        .and_then(|_| vm.run(&mut program, name, args))
        .map_err(|e| e.with_source(source))
}

/// Version of the Tungsten language
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
