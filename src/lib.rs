//! # Lapis Virtual Machine
//!
//! The execution core of the Lapis scripting language: a register-based
//! bytecode virtual machine for an object-oriented language with classes,
//! methods, delegates and closures, cooperative coroutines, interfaces and
//! exceptions.
//!
//! ## Features
//!
//! - **Register-Based Execution**: a uniform addressing-mode scheme over a
//!   per-context data stack whose top slots form the register window
//! - **Handle System**: every runtime value lives behind a
//!   reference-counted handle from a bucket-allocating pool, with weak
//!   references and a mark-and-sweep collector for reference cycles
//! - **Cooperative Coroutines**: contexts spawned, resumed and yielded
//!   deterministically, one running at a time
//! - **Native Types**: an abstract trait for host-implemented classes with
//!   argument marshaling and GC integration
//! - **Exception Handling**: faulting instructions route through
//!   user-installed handlers that may clear the error and resume
//! - **Linker & Peephole Optimizer**: stub synthesis for inherited and
//!   delegated methods, literal creation, register save/restore insertion,
//!   inheritance by code relocation and eight local rewrite passes
//!
//! ## Architecture
//!
//! - **Vm** ([`execution_engine`]): state, lifecycle and the host call
//!   surface
//! - **HandlePool** ([`handle_pool`]): allocation and reference counting
//! - **ExecutionContext** ([`execution_context`]): pc, call stack, data
//!   stack, register window
//! - **Interpreter** ([`interpreter`]): the fetch/decode/dispatch loop
//! - **ProgramImage** ([`program`]): code, data, type and function
//!   segments plus the CStr pool
//! - **Linker** ([`linker`]): from compiled functions to the executable
//!   image
//!
//! ## Example
//!
//! ```rust,no_run
//! use lapis_vm::{ProgramImage, Vm, VmConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let image = ProgramImage::new();
//! let mut vm = Vm::new(VmConfig::default(), image);
//! vm.init_vm()?;
//! vm.call_func(0)?;
//! let result = vm.return_register();
//! println!("returned: {:?}", vm.int_value(result));
//! vm.term_vm()?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// Payload construction for objects, arrays, delegates and factories.
pub mod allocators;
/// VM error types and result handling.
pub mod error;
/// Per-fiber execution state and the register window.
pub mod execution_context;
/// The VM: state, lifecycle and host call surface.
pub mod execution_engine;
/// Exception generation, user handlers and recorded error state.
pub mod exception_handling;
/// Mark-and-sweep collection of reference cycles.
pub mod garbage_collector;
/// The universal reference-counted value container.
pub mod handle;
/// Bucket allocation and reference counting of handles.
pub mod handle_pool;
/// Structural instruction decode and re-encode.
pub mod instruction;
/// The fetch/decode/dispatch loop.
pub mod interpreter;
/// Linking and peephole optimization of compiled functions.
pub mod linker;
/// The host-implemented class interface.
pub mod native_type;
/// Opcode definitions and the instruction info table.
pub mod op_code;
/// The loaded program image and its segments.
pub mod program;

pub use error::{VmError, VmResult};
pub use execution_context::{
    ExecutionContext, StackFrame, GLOBAL_REGISTER, NUM_REGISTERS, RETURN_REGISTER,
    RETURN_TO_NATIVE, THIS_REGISTER,
};
pub use execution_engine::{
    ExceptionCallback, GcEvent, GcEventCallback, HandlerKind, LogGarbageMode, Vm, VmConfig,
};
pub use handle::{
    Handle, HandleFlags, HandleRef, Payload, TypeFamily, FIRST_USER_TYPE, TYPE_ARRAY,
    TYPE_DELEGATE, TYPE_FLOAT, TYPE_INT, TYPE_NULL, TYPE_STRING, TYPE_THREAD,
};
pub use handle_pool::HandlePool;
pub use instruction::{OpcodeInfo, OperandInfo};
pub use linker::{ClassDef, CodeBlock, FuncDef, Literal, LiteralValue, Module, OptimizeReport};
pub use native_type::{NativeRegistry, NativeType};
pub use op_code::{InstrInfo, OpCode, OperandKind};
pub use program::{CStrPool, DataValue, FuncInfo, MethodInfo, ProgramImage, TypeInfo};
