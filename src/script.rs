//! A compiled script bound to its interpreter
//!
//! The host builds a [`Script`] once per source text, which compiles it and
//! runs the global initializers, then calls lifecycle functions (`awake`,
//! `start`, `update`, ...) by name as often as it likes. Globals persist
//! between calls.

use log::debug;

use crate::bytecode::ProgramInfo;
use crate::compiler::Compiler;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TungstenError};
use crate::host::HostBridge;
use crate::value::Value;
use crate::vm::{Interpreter, VmConfig};

pub struct Script {
    program: ProgramInfo,
    vm: Interpreter,
}

impl Script {
    /// Compile `source` and run its global initializers
    pub fn new(source: &str, bridge: Box<dyn HostBridge>) -> std::result::Result<Self, Diagnostics> {
        Self::with_config(source, bridge, VmConfig::default())
    }

    pub fn with_config(
        source: &str,
        bridge: Box<dyn HostBridge>,
        config: VmConfig,
    ) -> std::result::Result<Self, Diagnostics> {
        let program = Compiler::compile(source)?;
        let mut script = Self {
            program,
            vm: Interpreter::with_config(bridge, config),
        };

        if let Err(err) = script.vm.initialize(&mut script.program) {
            script.record(err);
            return Err(script.program.diagnostics().clone());
        }

        debug!(
            "script ready: {} function(s), {} global(s)",
            script.program.function_names().len(),
            script.program.global_names().len()
        );
        Ok(script)
    }

    /// Call a script function. A failure is logged once and replaces the
    /// previous runtime error in the program's diagnostics.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        match self.vm.run(&mut self.program, name, args) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.record(err)),
        }
    }

    /// Call a lifecycle hook only if the script defines it
    pub fn call_if_present(&mut self, name: &str, args: &[Value]) -> Option<Result<Value>> {
        if self.has_function(name) {
            Some(self.call(name, args))
        } else {
            None
        }
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.program.function_names().contains(&name)
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.program.global(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.program.set_global(name, value);
    }

    pub fn program(&self) -> &ProgramInfo {
        &self.program
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.program.diagnostics()
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.vm
    }

    /// Attach the source line and keep the failure as the latest runtime error
    fn record(&mut self, err: TungstenError) -> TungstenError {
        self.program.diagnostics_mut().raise_runtime_error(err)
    }
}
