//! Method signatures.

use crate::types::{ElementKind, ElementType};

/// Declared calling convention: who pops the outgoing argument area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// The caller reverts the stack after the call returns.
    CallerCleans,
    /// The callee pops its own arguments before returning.
    CalleeCleans,
}

/// A method's signature as read from metadata.
#[derive(Debug, Clone)]
pub struct MethodSignature {
    pub params: Vec<ElementType>,
    pub ret: ElementType,
    pub has_this: bool,
    pub call_conv: CallConv,
}

impl MethodSignature {
    pub fn static_fn(params: Vec<ElementType>, ret: ElementType) -> Self {
        Self {
            params,
            ret,
            has_this: false,
            call_conv: CallConv::CallerCleans,
        }
    }

    pub fn instance_fn(params: Vec<ElementType>, ret: ElementType) -> Self {
        Self {
            params,
            ret,
            has_this: true,
            call_conv: CallConv::CallerCleans,
        }
    }

    pub fn returns_value(&self) -> bool {
        !(self.ret.pointer_level == 0 && self.ret.kind == ElementKind::Void)
    }

    /// Number of declared parameters, not counting `this`.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}
