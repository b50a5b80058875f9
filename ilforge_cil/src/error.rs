//! Errors for the CIL data model.

use thiserror::Error;

use crate::token::Token;
use crate::types::ElementType;

#[derive(Debug, Clone, Error)]
pub enum CilError {
    #[error("instruction stream truncated at offset {offset:#x}")]
    TruncatedStream { offset: usize },

    #[error("unknown opcode {byte:#04x} at offset {offset:#x}")]
    UnknownOpcode { byte: u8, offset: usize },

    #[error("unknown extended opcode 0xfe {byte:#04x} at offset {offset:#x}")]
    UnknownExtOpcode { byte: u8, offset: usize },

    #[error("unresolved token {0}")]
    UnresolvedToken(Token),

    #[error("no layout for type {0:?}")]
    UnsizedType(ElementType),
}
