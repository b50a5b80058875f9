//! Collaborator traits: type layout and metadata access.
//!
//! The translation core never reads metadata tables itself. Everything it
//! needs — type sizes, flattened vtables, signatures, well-known runtime
//! helpers — comes through these traits. Implementations memoize across a
//! whole program and must be internally synchronized when shared between
//! compilation threads.

use crate::error::CilError;
use crate::signature::MethodSignature;
use crate::token::Token;
use crate::types::ElementType;

/// One slot of a flattened virtual table.
///
/// `method` is the implementation occupying the slot; `original` is the
/// method-def that introduced the slot. Virtual-call sites search by
/// original identity so overrides resolve to the derived implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtableSlot {
    pub method: Token,
    pub original: Token,
}

/// Type-layout queries.
pub trait TypeResolver {
    /// Full size in bytes of a type, including value types.
    fn type_size(&self, ty: &ElementType) -> Result<u32, CilError>;

    /// Follow a type-ref (or type-spec) to its defining row.
    fn resolve_type_ref(&self, token: Token) -> Result<Token, CilError>;

    /// The flattened vtable of a type: inherited slots first, then newly
    /// introduced ones, interface slots merged in.
    fn vtable(&self, type_token: Token) -> Result<Vec<VtableSlot>, CilError>;

    fn is_interface(&self, type_token: Token) -> Result<bool, CilError>;

    /// Runtime type id assigned to a type (used by allocation and
    /// instance-check helpers).
    fn rtti_id(&self, type_token: Token) -> Result<u32, CilError>;

    /// Heap size of one instance of a reference type, header included.
    fn instance_size(&self, type_token: Token) -> Result<u32, CilError>;
}

/// Well-known runtime helper routines the emitted code calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownMethod {
    MemCpy,
    MemSet,
    NewObject,
    NewArray,
    NewString,
    IncRef,
    DecRef,
    InstanceCheck,
    /// Maps (vtable, interface id) to the interface section's offset
    /// within the concrete vtable.
    InterfaceOffset,
    /// Pops and executes the innermost pending cleanup handler.
    PopExecCleanup,
    /// Raises the exception object passed to it.
    Raise,
}

/// Metadata and signature access.
pub trait MetadataSource {
    fn method_signature(&self, token: Token) -> Result<MethodSignature, CilError>;

    /// Follow a member-ref to the method-def it names.
    fn resolve_member_ref(&self, token: Token) -> Result<Token, CilError>;

    /// The type that declares a method.
    fn declaring_type(&self, method: Token) -> Result<Token, CilError>;

    /// Declared type of a (static) field.
    fn field_type(&self, field: Token) -> Result<ElementType, CilError>;

    /// Token of a well-known runtime helper, if the framework provides it.
    fn well_known(&self, method: WellKnownMethod) -> Option<Token>;

    /// Framework/runtime methods receive raw object references without
    /// reference-count adjustment.
    fn is_framework_method(&self, token: Token) -> bool;
}
