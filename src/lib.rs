//! On-target firmware testing through the GDB machine interface.
//!
//! A [`TargetSession`] drives a debugger attached to a Cortex-M target. Tests use it to call
//! firmware functions with host values, read and write target memory, and intercept firmware
//! functions: a host callback runs whenever the target reaches the function and may inspect the
//! arguments, replace them or make the function return a chosen value without executing it.
//! The firmware itself is never modified.
//!

/// Where arguments and return values live, per the target's procedure call standard.
pub mod calling_convention;

/// Session settings read from JSON.
pub mod config;

/// The error type shared by every operation.
pub mod error;

/// Evaluation of expressions, function calls and conversion of values.
pub mod evaluate;

/// Breakpoints a test waits for.
pub mod halt_point;

/// Callbacks run when the target reaches a function.
pub mod intercept;

/// Memory models providing the trampoline and scratch memory for calls.
pub mod memory;

/// The debugger's machine interface.
pub mod mi;

/// Defines a struct containing information about the registers
pub mod registers;

/// Resolution of symbols, types and function signatures.
pub mod symbols;

/// The session with the target and its lifecycle.
pub mod target;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use evaluate::{StructValue, TargetPtr, Value};
pub use halt_point::{HaltPointId, HaltPointInfo};
pub use intercept::{InterceptContext, InterceptHandler, InterceptId, InterceptInfo, InterceptState};
pub use memory::MemoryModel;
pub use symbols::{FunctionSignature, SymbolInfo, TypeDescriptor};
pub use target::{TargetSession, TargetState};
