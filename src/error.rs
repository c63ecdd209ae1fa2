//! Error types for the Lapis VM crate.
//!
//! Every failure the machine can produce — interpreter exceptions, host API
//! misuse and linker diagnostics — is a variant of [`VmError`]. Each
//! machine-level exception kind also carries a stable numeric code so hosts
//! can store and compare the error reported by the exception-state API.

use thiserror::Error;

/// VM execution and linking errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// Operand types do not match the operation.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// A handle of an unsupported type reached an operation.
    #[error("Unsupported type: {type_id} in {operation}")]
    UnsupportedType { type_id: i32, operation: String },

    /// Dereference of the null handle.
    #[error("Null reference in {operation}")]
    NullReference { operation: String },

    /// Integer or float division by zero.
    #[error("Division by zero in {operation}")]
    DivisionByZero { operation: String },

    /// Data or call stack exhausted.
    #[error("Stack overflow: pointer {pointer}, limit {limit}")]
    StackOverflow { pointer: i64, limit: usize },

    /// An operand value is out of range for its instruction.
    #[error("Invalid operand: {reason}")]
    InvalidOperand { reason: String },

    /// Branch or call to an address outside the code segment.
    #[error("Invalid code address: {address}")]
    InvalidCodeAddress { address: i32 },

    /// An instruction word that is not a defined opcode.
    #[error("Illegal instruction: word {word:#010x}")]
    IllegalInstruction { word: i32 },

    /// A `throw` executed by script code; the thrown handle is kept in the
    /// machine's exception state.
    #[error("Software exception")]
    SoftwareException,

    /// Raised before each instruction while tracing is enabled.
    #[error("Trace exception")]
    TraceException,

    /// A `brk` instruction.
    #[error("Break exception")]
    BreakException,

    /// Ends all execution of the current host call without invoking
    /// handlers.
    #[error("Abort exception")]
    AbortException,

    /// A payload allocation failed (native object construction).
    #[error("Allocation failed for type {type_id}")]
    AllocationFailed { type_id: i32 },

    /// A call went to a handle that is not a function or delegate.
    #[error("Call to non-function: type {type_id}")]
    CallToNonFunction { type_id: i32 },

    /// A native type rejected a call (unknown member, missing copy
    /// constructor).
    #[error("Unsupported native call: type {type_id}, member {member}")]
    UnsupportedNativeCall { type_id: i32, member: i32 },

    /// The mark phase of the collector failed; the collection is aborted.
    #[error("Mark handle error: {reason}")]
    MarkHandleError { reason: String },

    /// A native type returned a non-zero result code.
    #[error("Native error code {code}")]
    Native { code: i32 },

    /// The runtime is executing bytecode; the requested operation cannot
    /// run concurrently with the interpreter.
    #[error("Runtime locked")]
    RuntimeLocked,

    /// The runtime is shutting down and no longer accepts calls.
    #[error("Runtime blocked")]
    RuntimeBlocked,

    /// A function index outside the function segment.
    #[error("Invalid function index: {index}")]
    InvalidFunctionIndex { index: i32 },

    /// A member index outside a v-table.
    #[error("Invalid member index: {index} for type {type_id}")]
    InvalidMemberIndex { index: i32, type_id: i32 },

    /// A handle whose type cannot be used where it was passed.
    #[error("Invalid handle type: {type_id}")]
    InvalidHandleType { type_id: i32 },

    /// No native type with this name is registered.
    #[error("Undefined native type: {name}")]
    UndefinedType { name: String },

    /// Linker: a strict function has no body and no link target.
    #[error("No function body: {decl}")]
    NoFunctionBody { decl: String },

    /// Linker: an inherited interface method was never implemented.
    #[error("Interface not complete: {decl}")]
    InterfaceNotComplete { decl: String },

    /// Linker: relocation could not find the matching derived function.
    #[error("Relocation failed: {reason}")]
    RelocationFailed { reason: String },

    /// The instruction info table failed its self check.
    #[error("Instruction table corrupt: {reason}")]
    InstructionTableCorrupt { reason: String },
}

impl VmError {
    /// Stable numeric code of a machine-level exception, as reported by the
    /// exception-state API. Host-API and linker errors share code 0.
    pub fn code(&self) -> i32 {
        match self {
            VmError::TypeMismatch { .. } => 1,
            VmError::UnsupportedType { .. } => 2,
            VmError::NullReference { .. } => 3,
            VmError::DivisionByZero { .. } => 4,
            VmError::StackOverflow { .. } => 5,
            VmError::InvalidOperand { .. } => 6,
            VmError::InvalidCodeAddress { .. } => 7,
            VmError::IllegalInstruction { .. } => 8,
            VmError::SoftwareException => 9,
            VmError::TraceException => 10,
            VmError::BreakException => 11,
            VmError::AbortException => 12,
            VmError::AllocationFailed { .. } => 13,
            VmError::CallToNonFunction { .. } => 14,
            VmError::UnsupportedNativeCall { .. } => 15,
            VmError::MarkHandleError { .. } => 16,
            VmError::Native { code } => *code,
            _ => 0,
        }
    }

    /// True for error kinds the interpreter routes through the installed
    /// exception handlers (everything except aborts).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VmError::AbortException)
    }

    /// Creates a type mismatch error with context.
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        VmError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an unsupported type error with context.
    pub fn unsupported_type(type_id: i32, operation: impl Into<String>) -> Self {
        VmError::UnsupportedType {
            type_id,
            operation: operation.into(),
        }
    }

    /// Creates a null reference error with context.
    pub fn null_reference(operation: impl Into<String>) -> Self {
        VmError::NullReference {
            operation: operation.into(),
        }
    }

    /// Creates a division by zero error with context.
    pub fn division_by_zero(operation: impl Into<String>) -> Self {
        VmError::DivisionByZero {
            operation: operation.into(),
        }
    }

    /// Creates an invalid operand error with context.
    pub fn invalid_operand(reason: impl Into<String>) -> Self {
        VmError::InvalidOperand {
            reason: reason.into(),
        }
    }
}

/// Result type used throughout the VM.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(VmError::division_by_zero("div").code(), 4);
        assert_eq!(VmError::SoftwareException.code(), 9);
        assert_eq!(VmError::AbortException.code(), 12);
        assert_eq!(VmError::Native { code: 77 }.code(), 77);
        assert_eq!(
            VmError::NoFunctionBody {
                decl: "fn f()".into()
            }
            .code(),
            0
        );
    }

    #[test]
    fn test_abort_is_not_recoverable() {
        assert!(!VmError::AbortException.is_recoverable());
        assert!(VmError::BreakException.is_recoverable());
        assert!(VmError::division_by_zero("mod").is_recoverable());
    }
}
