//! CIL type descriptors.
//!
//! `ElementType` is an immutable value type compared structurally: an
//! element kind, a pointer level, by-ref/pinned flags, and an optional
//! class token for named types.

use crate::token::Token;

/// Element kind of a CIL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Void,
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    IntPtr,
    UIntPtr,
    /// `object`.
    Object,
    /// `string`.
    String,
    /// A reference type named by `class`.
    Class,
    /// A value type named by `class`.
    ValueType,
    /// Single-dimensional zero-based array; `class` names the element type's
    /// defining row when it is a named type.
    SzArray,
}

/// How a value of a given type is widened when loaded into a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadWiden {
    /// Sign-extended load.
    Sign,
    /// Zero-extended load.
    Zero,
}

/// A CIL type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementType {
    pub kind: ElementKind,
    /// Number of unmanaged-pointer indirections applied to `kind`.
    pub pointer_level: u8,
    pub by_ref: bool,
    pub pinned: bool,
    pub class: Option<Token>,
}

impl ElementType {
    pub const fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            pointer_level: 0,
            by_ref: false,
            pinned: false,
            class: None,
        }
    }

    pub const fn class(token: Token) -> Self {
        Self {
            kind: ElementKind::Class,
            pointer_level: 0,
            by_ref: false,
            pinned: false,
            class: Some(token),
        }
    }

    pub const fn value_type(token: Token) -> Self {
        Self {
            kind: ElementKind::ValueType,
            pointer_level: 0,
            by_ref: false,
            pinned: false,
            class: Some(token),
        }
    }

    /// One more level of unmanaged indirection.
    pub fn pointer_to(mut self) -> Self {
        self.pointer_level += 1;
        self
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer_level > 0 || self.by_ref
    }

    /// Object references: `object`, `string`, classes, and arrays, but not
    /// pointers to them.
    pub fn is_object_like(&self) -> bool {
        if self.is_pointer() {
            return false;
        }
        matches!(
            self.kind,
            ElementKind::Object | ElementKind::String | ElementKind::Class | ElementKind::SzArray
        )
    }

    /// True when the type itself is an object reference, or a pointer whose
    /// eventual pointee is one. Stores through such types carry
    /// reference-count traffic.
    pub fn carries_reference(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::Object | ElementKind::String | ElementKind::Class | ElementKind::SzArray
        )
    }

    pub fn is_value_type(&self) -> bool {
        !self.is_pointer() && self.kind == ElementKind::ValueType
    }

    pub fn is_void(&self) -> bool {
        !self.is_pointer() && self.kind == ElementKind::Void
    }

    /// Load widening policy. Signed integers sign-extend; unsigned
    /// integers, pointers, char, bool, and object references zero-extend.
    /// Anything else (floats, raw value types) has no register load policy
    /// and the caller must treat the classification failure as fatal.
    pub fn load_widen(&self) -> Option<LoadWiden> {
        if self.is_pointer() {
            return Some(LoadWiden::Zero);
        }
        match self.kind {
            ElementKind::I1 | ElementKind::I2 | ElementKind::I4 | ElementKind::I8
            | ElementKind::IntPtr => Some(LoadWiden::Sign),
            ElementKind::Bool
            | ElementKind::Char
            | ElementKind::U1
            | ElementKind::U2
            | ElementKind::U4
            | ElementKind::U8
            | ElementKind::UIntPtr
            | ElementKind::Object
            | ElementKind::String
            | ElementKind::Class
            | ElementKind::SzArray => Some(LoadWiden::Zero),
            _ => None,
        }
    }

    /// Size in bytes for types whose size does not depend on a layout
    /// query. `word` is the target machine word size. Value types return
    /// `None`; their size comes from the type resolver.
    pub fn fixed_size(&self, word: u32) -> Option<u32> {
        if self.is_pointer() {
            return Some(word);
        }
        match self.kind {
            ElementKind::Void => Some(0),
            ElementKind::Bool | ElementKind::I1 | ElementKind::U1 => Some(1),
            ElementKind::Char | ElementKind::I2 | ElementKind::U2 => Some(2),
            ElementKind::I4 | ElementKind::U4 | ElementKind::R4 => Some(4),
            ElementKind::I8 | ElementKind::U8 | ElementKind::R8 => Some(8),
            ElementKind::IntPtr
            | ElementKind::UIntPtr
            | ElementKind::Object
            | ElementKind::String
            | ElementKind::Class
            | ElementKind::SzArray => Some(word),
            ElementKind::ValueType => None,
        }
    }
}
