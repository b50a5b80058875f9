//! Evaluation-stack entities.
//!
//! A `StackEntity` describes where one logical CIL stack slot currently
//! lives: still symbolic (a constant, a local index, a token), or already
//! materialized into a register or spill buffer. The evaluator mutates
//! entities in place as it materializes them.

use ilforge_cil::token::Token;
use ilforge_cil::types::{ElementKind, ElementType};

use crate::holder::TempSlot;

/// Where the entity's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// A literal; the payload holds it.
    Const,
    /// Value of a local variable (payload: index).
    Local,
    /// Address of a local variable.
    LocalAddress,
    /// Value of an argument (payload: index).
    Argument,
    /// Address of an argument.
    ArgumentAddress,
    /// Value in a register (slot required).
    Register,
    /// A register holding the value's address (slot required).
    RegisterAddress,
    /// Value spilled into a temp stack buffer (slot required).
    TempStackSlot,
    /// Address of a temp stack buffer (slot required).
    TempStackAddress,
    /// A temp stack buffer whose content is a pointer to the value
    /// (slot required).
    TempStackPointer,
    /// Address of token-addressed data (payload: token). String-table
    /// tokens materialize through the new-string runtime helper.
    TokenAddress,
    /// Address of a method's entry point (payload: token).
    MethodAddress,
    /// Value stored at a fixed symbol address (payload: token).
    FixedAddress,
    /// The fixed symbol address itself (payload: token).
    FixedAddressAddress,
}

impl Place {
    /// Register and temp-stack entities own a live temporary slot;
    /// symbolic entities never do.
    pub fn requires_slot(self) -> bool {
        matches!(
            self,
            Place::Register
                | Place::RegisterAddress
                | Place::TempStackSlot
                | Place::TempStackAddress
                | Place::TempStackPointer
        )
    }
}

/// Constant or reference payload of a symbolic entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    Int32(i32),
    Int64(i64),
    /// Local or argument index.
    Index(u16),
    Token(Token),
}

impl Payload {
    pub fn int32(self) -> Option<i32> {
        match self {
            Payload::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn index(self) -> Option<u16> {
        match self {
            Payload::Index(i) => Some(i),
            _ => None,
        }
    }

    pub fn token(self) -> Option<Token> {
        match self {
            Payload::Token(t) => Some(t),
            _ => None,
        }
    }
}

/// One evaluation-stack element.
#[derive(Debug)]
pub struct StackEntity {
    pub place: Place,
    pub ty: ElementType,
    pub payload: Payload,
    pub slot: Option<TempSlot>,
    /// Values returned from calls carry a caller-owned reference count;
    /// popping such an object entity must emit a decrement.
    pub returned_from_call: bool,
}

impl StackEntity {
    pub fn constant(ty: ElementType, value: i32) -> Self {
        Self {
            place: Place::Const,
            ty,
            payload: Payload::Int32(value),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn constant64(ty: ElementType, value: i64) -> Self {
        Self {
            place: Place::Const,
            ty,
            payload: Payload::Int64(value),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn null() -> Self {
        Self::constant(ElementType::new(ElementKind::Object), 0)
    }

    pub fn local(index: u16, ty: ElementType) -> Self {
        Self {
            place: Place::Local,
            ty,
            payload: Payload::Index(index),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn local_address(index: u16, ty: ElementType) -> Self {
        Self {
            place: Place::LocalAddress,
            ty,
            payload: Payload::Index(index),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn argument(index: u16, ty: ElementType) -> Self {
        Self {
            place: Place::Argument,
            ty,
            payload: Payload::Index(index),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn argument_address(index: u16, ty: ElementType) -> Self {
        Self {
            place: Place::ArgumentAddress,
            ty,
            payload: Payload::Index(index),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn register(slot: TempSlot, ty: ElementType) -> Self {
        Self {
            place: Place::Register,
            ty,
            payload: Payload::None,
            slot: Some(slot),
            returned_from_call: false,
        }
    }

    pub fn register_address(slot: TempSlot, ty: ElementType) -> Self {
        Self {
            place: Place::RegisterAddress,
            ty,
            payload: Payload::None,
            slot: Some(slot),
            returned_from_call: false,
        }
    }

    pub fn temp_stack(slot: TempSlot, ty: ElementType) -> Self {
        Self {
            place: Place::TempStackSlot,
            ty,
            payload: Payload::None,
            slot: Some(slot),
            returned_from_call: false,
        }
    }

    pub fn temp_stack_address(slot: TempSlot, ty: ElementType) -> Self {
        Self {
            place: Place::TempStackAddress,
            ty,
            payload: Payload::None,
            slot: Some(slot),
            returned_from_call: false,
        }
    }

    pub fn temp_stack_pointer(slot: TempSlot, ty: ElementType) -> Self {
        Self {
            place: Place::TempStackPointer,
            ty,
            payload: Payload::None,
            slot: Some(slot),
            returned_from_call: false,
        }
    }

    pub fn token_address(token: Token, ty: ElementType) -> Self {
        Self {
            place: Place::TokenAddress,
            ty,
            payload: Payload::Token(token),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn method_address(token: Token) -> Self {
        Self {
            place: Place::MethodAddress,
            ty: ElementType::new(ElementKind::IntPtr),
            payload: Payload::Token(token),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn fixed_address(token: Token, ty: ElementType) -> Self {
        Self {
            place: Place::FixedAddress,
            ty,
            payload: Payload::Token(token),
            slot: None,
            returned_from_call: false,
        }
    }

    pub fn fixed_address_address(token: Token, ty: ElementType) -> Self {
        Self {
            place: Place::FixedAddressAddress,
            ty,
            payload: Payload::Token(token),
            slot: None,
            returned_from_call: false,
        }
    }

    /// Whether the entity currently upholds the slot-ownership invariant.
    pub fn slot_invariant_holds(&self) -> bool {
        self.place.requires_slot() == self.slot.is_some()
    }

    /// A view of the same stack element for a second block continuation:
    /// same place, type, and payload, but any slot is aliased rather than
    /// owned.
    pub fn fork_view(&self) -> StackEntity {
        StackEntity {
            place: self.place,
            ty: self.ty.clone(),
            payload: self.payload,
            slot: self.slot.as_ref().map(|s| s.alias()),
            returned_from_call: false,
        }
    }

    /// A re-readable description of this entity's storage location, used
    /// when a store must first fetch the destination's old value. Only
    /// meaningful for writable places.
    pub fn reread(&self) -> StackEntity {
        StackEntity {
            place: self.place,
            ty: self.ty.clone(),
            payload: self.payload,
            slot: self.slot.as_ref().map(|s| s.alias()),
            returned_from_call: false,
        }
    }
}
