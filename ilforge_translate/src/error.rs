//! Translation failure taxonomy.
//!
//! Every variant aborts the current method's compilation; there is no
//! partial or recoverable state. Malformed input, internal-consistency
//! violations, and resolution failures are deliberately treated alike.

use thiserror::Error;

use ilforge_cil::error::CilError;
use ilforge_cil::token::Token;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Cil(#[from] CilError),

    #[error("illegal instruction {opcode:#04x} at offset {offset:#x}")]
    IllegalInstruction { opcode: u8, offset: u32 },

    #[error("virtual slot for method {method} not found in vtable of type {parent}")]
    VirtualSlotNotFound { method: Token, parent: Token },

    #[error("value of width {size} exceeds the machine word and cannot be register-resident")]
    UnsupportedStructWidth { size: u32 },

    #[error("argument {index} of call to {method} is incompatible with the declared parameter")]
    SignatureMismatch { method: Token, index: usize },

    #[error("this-handling policy disagrees with the callee's has-this flag for {method}")]
    ThisPolicyMismatch { method: Token },

    #[error("no temporary register available")]
    RegisterExhausted,

    #[error("temporary stack area exhausted (requested {requested} bytes)")]
    StackBufferExhausted { requested: u32 },

    #[error("evaluation stack underflow at offset {offset:#x}")]
    EvalStackUnderflow { offset: u32 },

    #[error("missing runtime helper: {0}")]
    MissingHelper(&'static str),

    #[error("internal consistency check failed: {0}")]
    Internal(&'static str),
}
