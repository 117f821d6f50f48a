//! Runtime call trampolines.
//!
//! A JIT runtime routes calls to methods that were never compiled through a
//! small per-method stub which pushes a method descriptor and jumps to one
//! generic trampoline. Stepping into such a call would land in the
//! runtime's compiler. The resolver lets the engine see through the stub:
//! recognise it, ask the runtime to compile the method (through an injected
//! call), then decide on the compiled code.

use std::fmt;

use tracing::trace;

use crate::arch::{Architecture, MemoryAccess};
use crate::error::Result;
use crate::types::Address;

/// Per-runtime trampoline knowledge.
pub trait TrampolineResolver: Send + Sync + fmt::Debug
{
    /// Runtime name, for logging.
    fn name(&self) -> &str;

    /// If `call_target` is a trampoline stub, the method descriptor it
    /// passes to the runtime.
    fn get_trampoline(
        &self,
        memory: &dyn MemoryAccess,
        arch: &dyn Architecture,
        call_target: Address,
    ) -> Result<Option<Address>>;

    /// Runtime function that compiles a method descriptor and returns the
    /// code address. `None` when descriptors already are code addresses.
    fn compile_method_function(&self) -> Option<Address>;

    /// Runtime function used for `RuntimeInvoke`
    /// (`invoke(method, object, params) -> (result, exception)`).
    fn runtime_invoke_function(&self) -> Option<Address>;
}

/// Resolver for runtimes with a single generic trampoline.
#[derive(Debug, Clone)]
pub struct JitTrampolineResolver
{
    name: String,
    generic_trampoline: Address,
    compile_method: Option<Address>,
    runtime_invoke: Option<Address>,
}

impl JitTrampolineResolver
{
    /// Resolver for stubs that jump to `generic_trampoline`.
    pub fn new(name: impl Into<String>, generic_trampoline: Address) -> Self
    {
        Self {
            name: name.into(),
            generic_trampoline,
            compile_method: None,
            runtime_invoke: None,
        }
    }

    /// Set the runtime's compile function.
    #[must_use]
    pub fn with_compile_method(mut self, function: Address) -> Self
    {
        self.compile_method = Some(function);
        self
    }

    /// Set the runtime's invoke function.
    #[must_use]
    pub fn with_runtime_invoke(mut self, function: Address) -> Self
    {
        self.runtime_invoke = Some(function);
        self
    }
}

impl TrampolineResolver for JitTrampolineResolver
{
    fn name(&self) -> &str
    {
        &self.name
    }

    fn get_trampoline(
        &self,
        memory: &dyn MemoryAccess,
        arch: &dyn Architecture,
        call_target: Address,
    ) -> Result<Option<Address>>
    {
        let method = arch.get_trampoline(memory, call_target, self.generic_trampoline)?;
        if let Some(method) = method {
            trace!(runtime = %self.name, %call_target, %method, "call goes through trampoline");
        }
        Ok(method)
    }

    fn compile_method_function(&self) -> Option<Address>
    {
        self.compile_method
    }

    fn runtime_invoke_function(&self) -> Option<Address>
    {
        self.runtime_invoke
    }
}
