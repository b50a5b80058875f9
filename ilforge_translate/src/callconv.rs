//! Calling-convention emission.
//!
//! Marshals arguments right-to-left, places `this` per the requested
//! policy, dispatches virtual and interface calls through the flattened
//! vtable, and adjusts the outgoing stack after caller-cleans calls.

use tracing::debug;

use ilforge_cil::resolver::WellKnownMethod;
use ilforge_cil::signature::CallConv;
use ilforge_cil::token::Token;
use ilforge_cil::types::ElementType;
use ilforge_target::{Backend, Extend, FrameSlot, Reg};

use crate::engine::Engine;
use crate::entity::{Payload, Place, StackEntity};
use crate::error::TranslateError;
use crate::holder::AllocPolicy;

/// Where the instance receiver sits relative to the pushed parameters at
/// a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThisPolicy {
    /// Static callee: no receiver.
    None,
    /// The receiver was pushed onto the evaluation stack before the
    /// parameters (ordinary `call`/`callvirt`).
    BelowParams,
    /// The receiver is supplied by the translation itself and goes on
    /// top of the outgoing arguments.
    AboveParams,
    /// Like `AboveParams`, but a reference to the receiver is restored
    /// onto the evaluation stack after the call (`newobj` keeps the
    /// fresh object visible past the constructor).
    AboveParamsDup,
}

impl<'a, B: Backend> Engine<'a, B> {
    /// Emit a call to `token`.
    ///
    /// `this_entity` carries the receiver for the `AboveParams*`
    /// policies; `constrained` is the `.constrained` call-site marker.
    pub(crate) fn emit_call(
        &mut self,
        offset: u32,
        token: Token,
        policy: ThisPolicy,
        is_virtual: bool,
        constrained: Option<Token>,
        this_entity: Option<StackEntity>,
    ) -> Result<(), TranslateError> {
        let method = self.resolve_method(token)?;
        let sig = self.ctx.meta.method_signature(method)?;
        let word = self.ctx.word();
        let framework = self.ctx.meta.is_framework_method(method);

        if (policy == ThisPolicy::None) == sig.has_this {
            return Err(TranslateError::ThisPolicyMismatch { method });
        }

        debug!(%method, ?policy, is_virtual, "emit call");

        // Caller-side scratch for a return value wider than a word: the
        // callee writes the result through the hidden leading address
        // argument instead of the return register.
        let ret_size = self.ctx.size_of(&sig.ret)?;
        let wide_return = ret_size > word && !sig.ret.is_object_like();
        let ret_scratch = if wide_return {
            Some(self.ctx.pool.allocate(AllocPolicy::StackOnly, ret_size)?)
        } else {
            None
        };

        let mut pushed: u32 = 0;

        // Declared parameters, right-to-left.
        for index in (0..sig.params.len()).rev() {
            let declared = sig.params[index].clone();
            let entity = self.pop(offset)?;
            if !args_compatible(&entity, &declared, self)? {
                return Err(TranslateError::SignatureMismatch { method, index });
            }
            pushed += self.push_one_arg(entity, &declared, framework)?;
        }

        // Hidden return-buffer address, above the declared parameters.
        if let Some(scratch) = &ret_scratch {
            let (buf_off, _) = scratch
                .buffer()
                .ok_or(TranslateError::Internal("stack-only allocation yielded a register"))?;
            let addr_slot = self.alloc_register()?;
            let addr_reg = addr_slot
                .register()
                .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
            self.ctx.backend.load_slot_addr(addr_reg, FrameSlot::Temp(buf_off));
            self.ctx.backend.push_arg32(addr_reg);
            pushed += word;
            drop(addr_slot);
        }

        // Receiver, per policy.
        let mut receiver: Option<StackEntity> = match policy {
            ThisPolicy::None => None,
            ThisPolicy::BelowParams => {
                let mut this = self.pop(offset)?;
                self.evaluate(&mut this, 0, false)?;
                Some(this)
            }
            ThisPolicy::AboveParams | ThisPolicy::AboveParamsDup => {
                let mut this = this_entity
                    .ok_or(TranslateError::Internal("above-params call without a receiver"))?;
                self.evaluate(&mut this, 0, false)?;
                Some(this)
            }
        };
        if let Some(this) = &receiver {
            let reg = self.entity_reg(this)?;
            self.ctx.backend.push_arg32(reg);
            pushed += word;
        }

        // Dispatch.
        if is_virtual {
            let this = receiver
                .as_ref()
                .ok_or(TranslateError::Internal("virtual call without a receiver"))?;
            let this_reg = self.entity_reg(this)?;
            self.emit_virtual_dispatch(method, this_reg, constrained)?;
        } else {
            let sym = self.ctx.symbol(method);
            self.ctx.backend.call_symbol(&sym);
        }

        if sig.call_conv != CallConv::CalleeCleans {
            self.ctx.backend.revert_stack(pushed);
        }

        // Result.
        if sig.returns_value() {
            if let Some(scratch) = ret_scratch {
                self.push(StackEntity::temp_stack(scratch, sig.ret.clone()));
            } else {
                let slot = self.alloc_register()?;
                let reg = slot
                    .register()
                    .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
                self.ctx.backend.take_return32(reg);
                let mut result = StackEntity::register(slot, sig.ret.clone());
                result.returned_from_call = true;
                self.push(result);
            }
        }

        // Receiver disposal: the Dup policy restores the receiver onto
        // the evaluation stack so the caller keeps a usable reference.
        match policy {
            ThisPolicy::AboveParamsDup => {
                if let Some(this) = receiver.take() {
                    self.push(this);
                }
            }
            _ => {
                if let Some(this) = receiver.take() {
                    self.release_entity(this)?;
                }
            }
        }
        Ok(())
    }

    /// Push one declared parameter. Wide non-reference values are copied
    /// into the outgoing area through the memcpy helper; wide constants
    /// split into word-sized pushes; reference arguments are
    /// reference-count-incremented unless the callee is a framework
    /// method that takes raw references.
    fn push_one_arg(
        &mut self,
        entity: StackEntity,
        declared: &ElementType,
        framework: bool,
    ) -> Result<u32, TranslateError> {
        let word = self.ctx.word();
        let size = self.ctx.size_of(&entity.ty)?;

        if size > word && !entity.ty.is_object_like() {
            if let Payload::Int64(v) = entity.payload {
                // Multi-word constant: high word first so the low word
                // lands at the lower address.
                let hi_slot = self.alloc_register()?;
                let hi = hi_slot
                    .register()
                    .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
                self.ctx.backend.load_const32(hi, (v >> 32) as i32);
                self.ctx.backend.push_arg32(hi);
                drop(hi_slot);
                let lo_slot = self.alloc_register()?;
                let lo = lo_slot
                    .register()
                    .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
                self.ctx.backend.load_const32(lo, v as i32);
                self.ctx.backend.push_arg32(lo);
                drop(lo_slot);
                return Ok(2 * word);
            }

            // Struct by value: reserve outgoing space, memcpy into it.
            let aligned = (size + word - 1) & !(word - 1);
            self.ctx.backend.adjust_stack(aligned);
            let dst_slot = self.alloc_register()?;
            let dst_reg = dst_slot
                .register()
                .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
            self.ctx.backend.stack_top_addr(dst_reg);

            let mut src = entity;
            self.evaluate(&mut src, 0, true)?;
            let src_reg = self.entity_reg(&src)?;

            let size_slot = self.alloc_register()?;
            let size_reg = size_slot
                .register()
                .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
            self.ctx.backend.load_const32(size_reg, size as i32);

            self.helper_call(WellKnownMethod::MemCpy, "memcpy", &[dst_reg, src_reg, size_reg])?;

            drop(size_slot);
            drop(dst_slot);
            self.release_entity(src)?;
            return Ok(aligned);
        }

        let mut entity = entity;
        self.evaluate(&mut entity, 0, false)?;
        let reg = self.entity_reg(&entity)?;
        self.ctx.backend.push_arg32(reg);
        if (declared.carries_reference() || entity.ty.is_object_like()) && !framework {
            self.helper_call(WellKnownMethod::IncRef, "inc-ref", &[reg])?;
        }
        self.release_entity(entity)?;
        Ok(word)
    }

    /// Load the callee's entry from the receiver's vtable and call it
    /// indirectly. With a `.constrained` marker the constrained type's
    /// own vtable is used; interface parents first resolve the interface
    /// section's offset through the runtime helper.
    fn emit_virtual_dispatch(
        &mut self,
        method: Token,
        this_reg: Reg,
        constrained: Option<Token>,
    ) -> Result<(), TranslateError> {
        let word = self.ctx.word();
        let parent = match constrained {
            Some(token) => self.ctx.types.resolve_type_ref(token)?,
            None => self.ctx.meta.declaring_type(method)?,
        };

        let vt_slot = self.alloc_register()?;
        let vt = vt_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        // The vtable pointer is the object's first word.
        self.ctx.backend.load_memory(vt, this_reg, 0, word, Extend::Zero);

        if constrained.is_none() && self.ctx.types.is_interface(parent)? {
            // Interface dispatch: the helper maps (vtable, interface id)
            // to the interface section's offset within the concrete
            // vtable; add it before indexing.
            let id = self.ctx.types.rtti_id(parent)?;
            let id_slot = self.alloc_register()?;
            let id_reg = id_slot
                .register()
                .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
            self.ctx.backend.load_const32(id_reg, id as i32);
            self.helper_call(WellKnownMethod::InterfaceOffset, "interface-offset", &[vt, id_reg])?;
            drop(id_slot);
            let off_slot = self.alloc_register()?;
            let off_reg = off_slot
                .register()
                .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
            self.ctx.backend.take_return32(off_reg);
            self.ctx.backend.add32(vt, off_reg);
            drop(off_slot);
        }

        // Locate the slot by the identity of the method that introduced
        // it, so overrides resolve to the derived implementation.
        let slots = self.ctx.types.vtable(parent)?;
        let index = slots
            .iter()
            .position(|s| s.original == method || s.method == method)
            .ok_or(TranslateError::VirtualSlotNotFound { method, parent })?;

        self.ctx
            .backend
            .load_memory(vt, vt, (index as u32 * word) as i32, word, Extend::Zero);
        self.ctx.backend.call_indirect(vt);
        drop(vt_slot);
        Ok(())
    }

    /// `newobj`: allocate through the runtime, then invoke the
    /// constructor with the fresh object above the arguments, keeping a
    /// reference on the evaluation stack afterwards.
    pub(crate) fn emit_newobj(&mut self, offset: u32, token: Token) -> Result<(), TranslateError> {
        let ctor = self.resolve_method(token)?;
        let parent = self.ctx.meta.declaring_type(ctor)?;
        let rtti = self.ctx.types.rtti_id(parent)?;
        let instance_size = self.ctx.types.instance_size(parent)?;

        let id_slot = self.alloc_register()?;
        let id_reg = id_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.load_const32(id_reg, rtti as i32);
        let size_slot = self.alloc_register()?;
        let size_reg = size_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.load_const32(size_reg, instance_size as i32);
        self.helper_call(WellKnownMethod::NewObject, "new-object", &[id_reg, size_reg])?;
        drop(size_slot);
        drop(id_slot);

        let obj_slot = self.alloc_register()?;
        let obj_reg = obj_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.take_return32(obj_reg);
        let mut this = StackEntity::register(obj_slot, ElementType::class(parent));
        this.returned_from_call = true;

        self.emit_call(offset, token, ThisPolicy::AboveParamsDup, false, None, Some(this))
    }

    /// Call a well-known runtime helper with already-evaluated register
    /// arguments (left-to-right order; pushed right-to-left). Helpers
    /// are framework methods and receive raw references.
    pub(crate) fn helper_call(
        &mut self,
        helper: WellKnownMethod,
        name: &'static str,
        args: &[Reg],
    ) -> Result<(), TranslateError> {
        let token = self.ctx.helper(helper, name)?;
        for reg in args.iter().rev() {
            self.ctx.backend.push_arg32(*reg);
        }
        let sym = self.ctx.symbol(token);
        self.ctx.backend.call_symbol(&sym);
        self.ctx
            .backend
            .revert_stack(args.len() as u32 * self.ctx.word());
        Ok(())
    }
}

/// The permissive call-site compatibility net. The upstream verifier
/// already validated the CIL; this only rejects pairings no verified
/// stream can produce.
fn args_compatible<B: Backend>(
    actual: &StackEntity,
    declared: &ElementType,
    engine: &Engine<'_, B>,
) -> Result<bool, TranslateError> {
    if actual.place == Place::Const {
        return Ok(true);
    }
    if declared.is_pointer() {
        return Ok(true);
    }
    if actual.ty.is_object_like() && declared.is_value_type() {
        // Boxing: an object may stand in for a value type.
        return Ok(true);
    }
    if actual.ty.is_object_like() && declared.is_object_like() {
        return Ok(true);
    }
    if !actual.ty.is_object_like() && !declared.is_object_like() {
        return Ok(true);
    }
    let actual_size = engine.ctx.size_of(&actual.ty)?;
    let declared_size = engine.ctx.size_of(declared)?;
    Ok(actual_size == declared_size)
}
