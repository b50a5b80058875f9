//! In-memory resolver fixtures for tests.
//!
//! `TestWorld` implements both collaborator traits over hand-registered
//! tokens, in the role a real metadata cache plays for the outer driver.
//! The workspace's unit and integration tests build their type
//! hierarchies and signatures through it.

use std::collections::{HashMap, HashSet};

use ilforge_cil::error::CilError;
use ilforge_cil::resolver::{MetadataSource, TypeResolver, VtableSlot, WellKnownMethod};
use ilforge_cil::signature::MethodSignature;
use ilforge_cil::token::{table, Token};
use ilforge_cil::types::ElementType;

/// Registered reference type.
pub struct TypeInfo {
    pub rtti: u32,
    pub instance_size: u32,
    pub vtable: Vec<VtableSlot>,
    pub interface: bool,
}

/// A hand-rolled metadata universe.
pub struct TestWorld {
    pub word: u32,
    types: HashMap<Token, TypeInfo>,
    type_refs: HashMap<Token, Token>,
    value_sizes: HashMap<Token, u32>,
    signatures: HashMap<Token, MethodSignature>,
    member_refs: HashMap<Token, Token>,
    declaring: HashMap<Token, Token>,
    fields: HashMap<Token, ElementType>,
    helpers: HashMap<WellKnownMethod, Token>,
    framework: HashSet<Token>,
}

impl TestWorld {
    /// A world with every well-known runtime helper registered as a
    /// framework method in a reserved method-def range.
    pub fn new() -> Self {
        let mut world = Self {
            word: 4,
            types: HashMap::new(),
            type_refs: HashMap::new(),
            value_sizes: HashMap::new(),
            signatures: HashMap::new(),
            member_refs: HashMap::new(),
            declaring: HashMap::new(),
            fields: HashMap::new(),
            helpers: HashMap::new(),
            framework: HashSet::new(),
        };
        let helpers = [
            (WellKnownMethod::MemCpy, 0xF01),
            (WellKnownMethod::MemSet, 0xF02),
            (WellKnownMethod::NewObject, 0xF03),
            (WellKnownMethod::NewArray, 0xF04),
            (WellKnownMethod::NewString, 0xF05),
            (WellKnownMethod::IncRef, 0xF06),
            (WellKnownMethod::DecRef, 0xF07),
            (WellKnownMethod::InstanceCheck, 0xF08),
            (WellKnownMethod::InterfaceOffset, 0xF09),
            (WellKnownMethod::PopExecCleanup, 0xF0A),
            (WellKnownMethod::Raise, 0xF0B),
        ];
        for (kind, row) in helpers {
            let token = Token::new(table::METHOD_DEF, row);
            world.helpers.insert(kind, token);
            world.framework.insert(token);
        }
        world
    }

    pub fn helper_token(&self, kind: WellKnownMethod) -> Token {
        self.helpers[&kind]
    }

    pub fn define_type(
        &mut self,
        row: u32,
        rtti: u32,
        instance_size: u32,
        vtable: Vec<VtableSlot>,
    ) -> Token {
        let token = Token::new(table::TYPE_DEF, row);
        self.types.insert(
            token,
            TypeInfo { rtti, instance_size, vtable, interface: false },
        );
        token
    }

    pub fn define_interface(&mut self, row: u32, rtti: u32, vtable: Vec<VtableSlot>) -> Token {
        let token = Token::new(table::TYPE_DEF, row);
        self.types.insert(
            token,
            TypeInfo { rtti, instance_size: 0, vtable, interface: true },
        );
        token
    }

    pub fn define_value_type(&mut self, row: u32, size: u32) -> Token {
        let token = Token::new(table::TYPE_DEF, row);
        self.value_sizes.insert(token, size);
        token
    }

    pub fn define_method(
        &mut self,
        row: u32,
        signature: MethodSignature,
        declaring: Option<Token>,
    ) -> Token {
        let token = Token::new(table::METHOD_DEF, row);
        self.signatures.insert(token, signature);
        if let Some(parent) = declaring {
            self.declaring.insert(token, parent);
        }
        token
    }

    pub fn define_member_ref(&mut self, row: u32, target: Token) -> Token {
        let token = Token::new(table::MEMBER_REF, row);
        self.member_refs.insert(token, target);
        token
    }

    pub fn define_type_ref(&mut self, row: u32, target: Token) -> Token {
        let token = Token::new(table::TYPE_REF, row);
        self.type_refs.insert(token, target);
        token
    }

    pub fn define_field(&mut self, row: u32, ty: ElementType) -> Token {
        let token = Token::new(table::FIELD, row);
        self.fields.insert(token, ty);
        token
    }

    pub fn mark_framework(&mut self, token: Token) {
        self.framework.insert(token);
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolver for TestWorld {
    fn type_size(&self, ty: &ElementType) -> Result<u32, CilError> {
        if let Some(size) = ty.fixed_size(self.word) {
            return Ok(size);
        }
        let token = ty.class.ok_or_else(|| CilError::UnsizedType(ty.clone()))?;
        self.value_sizes
            .get(&token)
            .copied()
            .ok_or_else(|| CilError::UnsizedType(ty.clone()))
    }

    fn resolve_type_ref(&self, token: Token) -> Result<Token, CilError> {
        if token.table() == table::TYPE_DEF {
            return Ok(token);
        }
        self.type_refs
            .get(&token)
            .copied()
            .ok_or(CilError::UnresolvedToken(token))
    }

    fn vtable(&self, type_token: Token) -> Result<Vec<VtableSlot>, CilError> {
        self.types
            .get(&type_token)
            .map(|t| t.vtable.clone())
            .ok_or(CilError::UnresolvedToken(type_token))
    }

    fn is_interface(&self, type_token: Token) -> Result<bool, CilError> {
        self.types
            .get(&type_token)
            .map(|t| t.interface)
            .ok_or(CilError::UnresolvedToken(type_token))
    }

    fn rtti_id(&self, type_token: Token) -> Result<u32, CilError> {
        self.types
            .get(&type_token)
            .map(|t| t.rtti)
            .ok_or(CilError::UnresolvedToken(type_token))
    }

    fn instance_size(&self, type_token: Token) -> Result<u32, CilError> {
        self.types
            .get(&type_token)
            .map(|t| t.instance_size)
            .ok_or(CilError::UnresolvedToken(type_token))
    }
}

impl MetadataSource for TestWorld {
    fn method_signature(&self, token: Token) -> Result<MethodSignature, CilError> {
        self.signatures
            .get(&token)
            .cloned()
            .ok_or(CilError::UnresolvedToken(token))
    }

    fn resolve_member_ref(&self, token: Token) -> Result<Token, CilError> {
        self.member_refs
            .get(&token)
            .copied()
            .ok_or(CilError::UnresolvedToken(token))
    }

    fn declaring_type(&self, method: Token) -> Result<Token, CilError> {
        self.declaring
            .get(&method)
            .copied()
            .ok_or(CilError::UnresolvedToken(method))
    }

    fn field_type(&self, field: Token) -> Result<ElementType, CilError> {
        self.fields
            .get(&field)
            .cloned()
            .ok_or(CilError::UnresolvedToken(field))
    }

    fn well_known(&self, method: WellKnownMethod) -> Option<Token> {
        self.helpers.get(&method).copied()
    }

    fn is_framework_method(&self, token: Token) -> bool {
        self.framework.contains(&token)
    }
}
