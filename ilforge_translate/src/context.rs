//! Compilation context: options, frame layout, and the collaborator
//! handles threaded through every emission call.
//!
//! There is no ambient global state; everything the evaluator, engine,
//! and calling-convention emitter touch flows through [`EmitContext`].

use serde::Deserialize;

use ilforge_cil::body::MethodBody;
use ilforge_cil::resolver::{MetadataSource, TypeResolver, WellKnownMethod};
use ilforge_cil::signature::MethodSignature;
use ilforge_cil::token::Token;
use ilforge_cil::types::ElementType;
use ilforge_target::{token_symbol, Backend, FrameSlot};

use crate::error::TranslateError;
use crate::holder::TempPool;

/// Per-compilation options. An outer driver typically deserializes this
/// from its project configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Emit structured exception-handling support (runtime cleanup stack,
    /// raise helper). When off, `leave` calls synthesized cleanup symbols
    /// directly and `throw` degrades to an unreachable terminator.
    pub exceptions: bool,
    /// Apartment (module scope) id used for cross-module symbol naming.
    pub apartment: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            exceptions: true,
            apartment: 0,
        }
    }
}

/// One local or argument in the frame: its type, size, and byte offset
/// within its area.
#[derive(Debug, Clone)]
pub struct LayoutSlot {
    pub ty: ElementType,
    pub offset: i32,
    pub size: u32,
}

/// Byte layout of the current method's locals and arguments.
///
/// Offsets are area-relative; the backend maps areas onto its frame
/// convention. Arguments include `this` (slot 0) when the signature has
/// it, and the hidden return-buffer pointer when the return type is
/// wider than a word.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    pub args: Vec<LayoutSlot>,
    pub locals: Vec<LayoutSlot>,
    /// Index of the hidden return-buffer argument, when present.
    pub ret_buffer_arg: Option<u16>,
}

impl FrameLayout {
    pub fn compute(
        signature: &MethodSignature,
        body: &MethodBody,
        types: &dyn TypeResolver,
        this_type: Option<&ElementType>,
        word: u32,
    ) -> Result<Self, TranslateError> {
        let mut layout = FrameLayout::default();
        let mut arg_tys: Vec<ElementType> = Vec::new();

        if signature.has_this {
            let this = this_type
                .cloned()
                .unwrap_or_else(|| ElementType::new(ilforge_cil::types::ElementKind::Object));
            arg_tys.push(this);
        }
        let ret_size = types.type_size(&signature.ret)?;
        if ret_size > word && !signature.ret.is_object_like() {
            layout.ret_buffer_arg = Some(arg_tys.len() as u16);
            arg_tys.push(ElementType::new(ilforge_cil::types::ElementKind::IntPtr));
        }
        arg_tys.extend(signature.params.iter().cloned());

        let mut offset = 0i32;
        for ty in arg_tys {
            let size = types.type_size(&ty)?;
            let slot = Self::place(&mut offset, size, word);
            layout.args.push(LayoutSlot { ty, offset: slot, size });
        }

        let mut offset = 0i32;
        for ty in &body.locals {
            let size = types.type_size(ty)?;
            let slot = Self::place(&mut offset, size, word);
            layout.locals.push(LayoutSlot {
                ty: ty.clone(),
                offset: slot,
                size,
            });
        }
        Ok(layout)
    }

    /// Word-align the cursor, reserve `size` bytes, return the position.
    fn place(cursor: &mut i32, size: u32, word: u32) -> i32 {
        let word = word as i32;
        let aligned = (*cursor + word - 1) & !(word - 1);
        let rounded = (size.max(1) as i32 + word - 1) & !(word - 1);
        *cursor = aligned + rounded;
        aligned
    }

    pub fn local(&self, index: u16) -> Result<&LayoutSlot, TranslateError> {
        self.locals
            .get(index as usize)
            .ok_or(TranslateError::Internal("local index out of range"))
    }

    pub fn arg(&self, index: u16) -> Result<&LayoutSlot, TranslateError> {
        self.args
            .get(index as usize)
            .ok_or(TranslateError::Internal("argument index out of range"))
    }

    pub fn local_slot(&self, index: u16) -> Result<FrameSlot, TranslateError> {
        Ok(FrameSlot::Local(self.local(index)?.offset))
    }

    pub fn arg_slot(&self, index: u16) -> Result<FrameSlot, TranslateError> {
        Ok(FrameSlot::Arg(self.arg(index)?.offset))
    }
}

/// Everything one method compilation emits through.
pub struct EmitContext<'a, B: Backend> {
    pub backend: &'a mut B,
    pub types: &'a dyn TypeResolver,
    pub meta: &'a dyn MetadataSource,
    pub options: &'a CompileOptions,
    pub pool: TempPool,
    pub layout: FrameLayout,
    /// Token of the method being compiled.
    pub method: Token,
    /// Signature of the method being compiled.
    pub signature: MethodSignature,
}

impl<'a, B: Backend> EmitContext<'a, B> {
    pub fn word(&self) -> u32 {
        self.backend.word_size()
    }

    /// Size of a type on this target.
    pub fn size_of(&self, ty: &ElementType) -> Result<u32, TranslateError> {
        Ok(self.types.type_size(ty)?)
    }

    /// Symbol for a token in this compilation's apartment.
    pub fn symbol(&self, token: Token) -> String {
        token_symbol(self.options.apartment, token)
    }

    /// Token of a required runtime helper.
    pub fn helper(&self, helper: WellKnownMethod, name: &'static str) -> Result<Token, TranslateError> {
        self.meta
            .well_known(helper)
            .ok_or(TranslateError::MissingHelper(name))
    }
}
