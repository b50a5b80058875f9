//! Register/stack evaluator.
//!
//! `evaluate` converts any stack entity, in place, into a register
//! holding either its value or its address. `store_var` writes one
//! entity's value into another's location, routing reference-typed
//! stores through the single reference-retarget helper so the
//! decrement-old / store / increment-new ordering lives in one place.

use tracing::warn;

use ilforge_cil::resolver::WellKnownMethod;
use ilforge_cil::token::table;
use ilforge_cil::types::{ElementType, LoadWiden};
use ilforge_target::{Backend, Extend, FrameSlot, Reg};

use crate::entity::{Payload, Place, StackEntity};
use crate::engine::Engine;
use crate::error::TranslateError;
use crate::holder::TempSlot;

impl<'a, B: Backend> Engine<'a, B> {
    /// Materialize `entity` into a register, applying `offset` as a byte
    /// displacement. With `want_address` the register receives the
    /// value's address instead of the value and the entity becomes a
    /// `RegisterAddress`.
    pub fn evaluate(
        &mut self,
        entity: &mut StackEntity,
        offset: i32,
        want_address: bool,
    ) -> Result<(), TranslateError> {
        match entity.place {
            Place::Register => {
                if want_address {
                    return Err(TranslateError::Internal(
                        "cannot take the address of a register value",
                    ));
                }
                if offset != 0 {
                    let reg = self.entity_reg(entity)?;
                    self.ctx.backend.add_imm(reg, offset);
                }
            }

            Place::RegisterAddress => {
                let reg = self.entity_reg(entity)?;
                if want_address {
                    if offset != 0 {
                        self.ctx.backend.add_imm(reg, offset);
                    }
                } else {
                    let (size, widen) = self.value_load_shape(&entity.ty)?;
                    self.ctx.backend.load_memory(reg, reg, offset, size, widen);
                    entity.place = Place::Register;
                }
            }

            Place::Local | Place::LocalAddress | Place::Argument | Place::ArgumentAddress => {
                self.evaluate_frame_entity(entity, offset, want_address)?;
            }

            Place::Const => {
                if want_address {
                    return Err(TranslateError::Internal(
                        "cannot take the address of a constant",
                    ));
                }
                let slot = self.alloc_register()?;
                let reg = slot_register(&slot)?;
                match entity.payload {
                    Payload::Int64(v) => {
                        self.ctx.backend.load_const64(reg, v.wrapping_add(offset as i64))
                    }
                    Payload::Int32(v) => {
                        self.ctx.backend.load_const32(reg, v.wrapping_add(offset))
                    }
                    _ => {
                        return Err(TranslateError::Internal("constant entity without payload"))
                    }
                }
                entity.place = Place::Register;
                entity.payload = Payload::None;
                entity.slot = Some(slot);
            }

            Place::TempStackSlot => self.evaluate_temp_slot(entity, offset, want_address)?,
            Place::TempStackAddress => {
                if want_address {
                    return Err(TranslateError::Internal(
                        "cannot take the address of a buffer address",
                    ));
                }
                let (buf_off, _) = entity
                    .slot
                    .as_ref()
                    .and_then(|s| s.buffer())
                    .ok_or(TranslateError::Internal("temp-stack entity without buffer"))?;
                let slot = self.alloc_register()?;
                let reg = slot_register(&slot)?;
                self.ctx
                    .backend
                    .load_slot_addr(reg, FrameSlot::Temp(buf_off + offset));
                // The buffer must stay reserved while its address is live.
                if let Some(old) = entity.slot.take() {
                    self.deferred.push(old);
                }
                entity.place = Place::Register;
                entity.slot = Some(slot);
            }
            Place::TempStackPointer => self.evaluate_temp_pointer(entity, offset, want_address)?,

            Place::TokenAddress => self.evaluate_token_address(entity, offset, want_address)?,

            Place::MethodAddress => {
                if want_address {
                    return Err(TranslateError::Internal(
                        "cannot take the address of a method address",
                    ));
                }
                let token = entity
                    .payload
                    .token()
                    .ok_or(TranslateError::Internal("method-address entity without token"))?;
                let slot = self.alloc_register()?;
                let reg = slot_register(&slot)?;
                match self.resolve_method(token) {
                    Ok(method) => {
                        let sym = self.ctx.symbol(method);
                        self.ctx.backend.load_symbol_addr(reg, &sym);
                    }
                    Err(_) => {
                        warn!(%token, "call target unresolved, loading null method address");
                        self.ctx.backend.load_const32(reg, 0);
                    }
                }
                entity.place = Place::Register;
                entity.payload = Payload::None;
                entity.slot = Some(slot);
            }

            Place::FixedAddress | Place::FixedAddressAddress => {
                let token = entity
                    .payload
                    .token()
                    .ok_or(TranslateError::Internal("fixed-address entity without token"))?;
                let slot = self.alloc_register()?;
                let reg = slot_register(&slot)?;
                let sym = self.ctx.symbol(token);
                self.ctx.backend.load_symbol_addr(reg, &sym);
                let value_is_address = entity.place == Place::FixedAddressAddress;
                entity.payload = Payload::None;
                entity.slot = Some(slot);
                if value_is_address || want_address {
                    if offset != 0 {
                        self.ctx.backend.add_imm(reg, offset);
                    }
                    entity.place = if want_address && !value_is_address {
                        Place::RegisterAddress
                    } else {
                        Place::Register
                    };
                } else {
                    let (size, widen) = self.value_load_shape(&entity.ty)?;
                    self.ctx.backend.load_memory(reg, reg, offset, size, widen);
                    entity.place = Place::Register;
                }
            }
        }
        Ok(())
    }

    /// Locals and arguments: frame-relative loads and address
    /// computations from the method's layout table.
    fn evaluate_frame_entity(
        &mut self,
        entity: &mut StackEntity,
        offset: i32,
        want_address: bool,
    ) -> Result<(), TranslateError> {
        let index = entity
            .payload
            .index()
            .ok_or(TranslateError::Internal("frame entity without index"))?;
        let (slot_offset, is_arg) = match entity.place {
            Place::Local | Place::LocalAddress => (self.ctx.layout.local(index)?.offset, false),
            _ => (self.ctx.layout.arg(index)?.offset, true),
        };
        let frame_slot = |extra: i32| {
            if is_arg {
                FrameSlot::Arg(slot_offset + extra)
            } else {
                FrameSlot::Local(slot_offset + extra)
            }
        };
        let value_is_address =
            matches!(entity.place, Place::LocalAddress | Place::ArgumentAddress);

        let reg_slot = self.alloc_register()?;
        let reg = slot_register(&reg_slot)?;

        if value_is_address || want_address {
            self.ctx.backend.load_slot_addr(reg, frame_slot(offset));
            entity.place = if want_address && !value_is_address {
                Place::RegisterAddress
            } else {
                Place::Register
            };
        } else {
            let (size, widen) = self.value_load_shape(&entity.ty)?;
            self.ctx.backend.load_slot(reg, frame_slot(offset), size, widen);
            entity.place = Place::Register;
        }
        entity.payload = Payload::None;
        entity.slot = Some(reg_slot);
        Ok(())
    }

    fn evaluate_temp_slot(
        &mut self,
        entity: &mut StackEntity,
        offset: i32,
        want_address: bool,
    ) -> Result<(), TranslateError> {
        let (buf_off, _) = entity
            .slot
            .as_ref()
            .and_then(|s| s.buffer())
            .ok_or(TranslateError::Internal("temp-stack entity without buffer"))?;
        let reg_slot = self.alloc_register()?;
        let reg = slot_register(&reg_slot)?;
        if want_address {
            self.ctx
                .backend
                .load_slot_addr(reg, FrameSlot::Temp(buf_off + offset));
            // The address is only valid while the buffer stays reserved.
            if let Some(old) = entity.slot.take() {
                self.deferred.push(old);
            }
            entity.place = Place::RegisterAddress;
        } else {
            let (size, widen) = self.value_load_shape(&entity.ty)?;
            self.ctx
                .backend
                .load_slot(reg, FrameSlot::Temp(buf_off + offset), size, widen);
            entity.place = Place::Register;
        }
        entity.slot = Some(reg_slot);
        Ok(())
    }

    fn evaluate_temp_pointer(
        &mut self,
        entity: &mut StackEntity,
        offset: i32,
        want_address: bool,
    ) -> Result<(), TranslateError> {
        let (buf_off, _) = entity
            .slot
            .as_ref()
            .and_then(|s| s.buffer())
            .ok_or(TranslateError::Internal("temp-stack entity without buffer"))?;
        let word = self.ctx.word();
        let reg_slot = self.alloc_register()?;
        let reg = slot_register(&reg_slot)?;
        self.ctx
            .backend
            .load_slot(reg, FrameSlot::Temp(buf_off), word, Extend::Zero);
        if want_address {
            if offset != 0 {
                self.ctx.backend.add_imm(reg, offset);
            }
            entity.place = Place::RegisterAddress;
        } else {
            let (size, widen) = self.value_load_shape(&entity.ty)?;
            self.ctx.backend.load_memory(reg, reg, offset, size, widen);
            entity.place = Place::Register;
        }
        entity.slot = Some(reg_slot);
        Ok(())
    }

    /// Token-addressed data. String-table tokens construct a string
    /// instance through the runtime helper and re-evaluate the result;
    /// anything else is a relocatable symbol address.
    fn evaluate_token_address(
        &mut self,
        entity: &mut StackEntity,
        offset: i32,
        want_address: bool,
    ) -> Result<(), TranslateError> {
        if want_address {
            return Err(TranslateError::Internal(
                "cannot take the address of a token address",
            ));
        }
        let token = entity
            .payload
            .token()
            .ok_or(TranslateError::Internal("token-address entity without token"))?;
        if token.table() == table::USER_STRING {
            // New string instance from the literal's data.
            let data_slot = self.alloc_register()?;
            let data_reg = slot_register(&data_slot)?;
            let sym = self.ctx.symbol(token);
            self.ctx.backend.load_symbol_addr(data_reg, &sym);
            self.helper_call(WellKnownMethod::NewString, "new-string", &[data_reg])?;
            drop(data_slot);
            let result_slot = self.alloc_register()?;
            let result_reg = slot_register(&result_slot)?;
            self.ctx.backend.take_return32(result_reg);
            entity.place = Place::Register;
            entity.payload = Payload::None;
            entity.slot = Some(result_slot);
            entity.returned_from_call = true;
            if offset != 0 {
                self.ctx.backend.add_imm(result_reg, offset);
            }
        } else {
            let slot = self.alloc_register()?;
            let reg = slot_register(&slot)?;
            let sym = self.ctx.symbol(token);
            self.ctx.backend.load_symbol_addr(reg, &sym);
            if offset != 0 {
                self.ctx.backend.add_imm(reg, offset);
            }
            entity.place = Place::Register;
            entity.payload = Payload::None;
            entity.slot = Some(slot);
        }
        Ok(())
    }

    /// Size and widening for a register value load. Values wider than the
    /// machine word cannot be register-resident; classification failures
    /// are internal-consistency errors.
    fn value_load_shape(&self, ty: &ElementType) -> Result<(u32, Extend), TranslateError> {
        let word = self.ctx.word();
        let size = self.ctx.size_of(ty)?;
        if size > word && !ty.is_object_like() {
            return Err(TranslateError::UnsupportedStructWidth { size });
        }
        let widen = match ty.load_widen() {
            Some(LoadWiden::Sign) => Extend::Sign,
            Some(LoadWiden::Zero) => Extend::Zero,
            None => {
                return Err(TranslateError::Internal(
                    "type has no register load classification",
                ))
            }
        };
        Ok((size.min(word), widen))
    }

    // -- Stores --

    /// Store `src` into `dst`'s location. `operand_size` overrides the
    /// destination type's size when non-zero. Reference-typed transfers
    /// go through [`Engine::emit_ref_retarget`]; payloads wider than a
    /// word degrade to a memcpy-helper call.
    pub fn store_var(
        &mut self,
        src: StackEntity,
        dst: &mut StackEntity,
        operand_size: u32,
    ) -> Result<(), TranslateError> {
        let word = self.ctx.word();
        let dst_size = if operand_size != 0 {
            operand_size
        } else {
            self.ctx.size_of(&dst.ty)?
        };

        if dst.ty.carries_reference() || src.ty.carries_reference() {
            return self.emit_ref_retarget(src, dst);
        }

        if dst_size > word {
            return self.store_wide(src, dst, dst_size);
        }

        let mut src = src;
        self.evaluate(&mut src, 0, false)?;
        let src_reg = self.entity_reg(&src)?;
        self.store_into(dst, src_reg, dst_size)?;
        self.release_entity(src)
    }

    /// The one place reference-count traffic around stores is emitted:
    /// decrement the destination's old value, store the new value, then
    /// increment it. The ordering is load-bearing for the runtime's
    /// object model and must not be reordered.
    pub(crate) fn emit_ref_retarget(
        &mut self,
        src: StackEntity,
        dst: &mut StackEntity,
    ) -> Result<(), TranslateError> {
        let word = self.ctx.word();

        let mut old = self.reread_for_old_value(dst)?;
        self.evaluate(&mut old, 0, false)?;
        let old_reg = self.entity_reg(&old)?;
        self.helper_call(WellKnownMethod::DecRef, "dec-ref", &[old_reg])?;
        drop(old);

        let mut src = src;
        self.evaluate(&mut src, 0, false)?;
        let src_reg = self.entity_reg(&src)?;
        self.store_into(dst, src_reg, word)?;

        self.helper_call(WellKnownMethod::IncRef, "inc-ref", &[src_reg])?;
        self.release_entity(src)
    }

    /// Wide non-reference payloads: three-argument memcpy-helper call
    /// (destination address, source address, size).
    fn store_wide(
        &mut self,
        src: StackEntity,
        dst: &mut StackEntity,
        size: u32,
    ) -> Result<(), TranslateError> {
        // A wide constant has no address; stage it in a spill buffer
        // first.
        let src = if src.place == Place::Const {
            self.spill_wide_const(src, size)?
        } else {
            src
        };

        let mut dst_addr = dst.reread();
        self.evaluate(&mut dst_addr, 0, true)?;
        let dst_reg = self.entity_reg(&dst_addr)?;

        let mut src = src;
        self.evaluate(&mut src, 0, true)?;
        let src_reg = self.entity_reg(&src)?;

        let size_slot = self.alloc_register()?;
        let size_reg = slot_register(&size_slot)?;
        self.ctx.backend.load_const32(size_reg, size as i32);

        self.helper_call(WellKnownMethod::MemCpy, "memcpy", &[dst_reg, src_reg, size_reg])?;

        drop(size_slot);
        self.release_entity(dst_addr)?;
        self.release_entity(src)
    }

    /// Re-readable view of a store destination's current value. A
    /// register-resident address must be copied first: evaluating an
    /// alias of the same register would load through it in place and
    /// destroy the address the store still needs.
    fn reread_for_old_value(
        &mut self,
        dst: &StackEntity,
    ) -> Result<StackEntity, TranslateError> {
        if dst.place == Place::RegisterAddress {
            let addr = self.entity_reg(dst)?;
            let slot = self.alloc_register()?;
            let reg = slot_register(&slot)?;
            self.ctx.backend.move_reg(reg, addr);
            return Ok(StackEntity::register_address(slot, dst.ty.clone()));
        }
        Ok(dst.reread())
    }

    /// Materialize a wide integer constant into a spill buffer so it
    /// becomes addressable.
    fn spill_wide_const(
        &mut self,
        entity: StackEntity,
        size: u32,
    ) -> Result<StackEntity, TranslateError> {
        let value = match entity.payload {
            Payload::Int64(v) => v,
            Payload::Int32(v) => v as i64,
            _ => return Err(TranslateError::Internal("constant entity without payload")),
        };
        let word = self.ctx.word();
        let buf = self
            .ctx
            .pool
            .allocate(crate::holder::AllocPolicy::StackOnly, size.max(2 * word))?;
        let (buf_off, _) = buf
            .buffer()
            .ok_or(TranslateError::Internal("stack-only allocation yielded a register"))?;

        if word >= 8 {
            let slot = self.alloc_register()?;
            let reg = slot_register(&slot)?;
            self.ctx.backend.load_const64(reg, value);
            self.ctx.backend.store_slot(FrameSlot::Temp(buf_off), reg, 8);
        } else {
            let lo_slot = self.alloc_register()?;
            let lo = slot_register(&lo_slot)?;
            self.ctx.backend.load_const32(lo, value as i32);
            self.ctx.backend.store_slot(FrameSlot::Temp(buf_off), lo, word);
            drop(lo_slot);
            let hi_slot = self.alloc_register()?;
            let hi = slot_register(&hi_slot)?;
            self.ctx.backend.load_const32(hi, (value >> 32) as i32);
            self.ctx
                .backend
                .store_slot(FrameSlot::Temp(buf_off + word as i32), hi, word);
        }
        Ok(StackEntity::temp_stack(buf, entity.ty.clone()))
    }

    /// Emit the raw store of a register into a destination's location.
    pub(crate) fn store_into(
        &mut self,
        dst: &mut StackEntity,
        src_reg: Reg,
        size: u32,
    ) -> Result<(), TranslateError> {
        match dst.place {
            Place::Local => {
                let index = dst
                    .payload
                    .index()
                    .ok_or(TranslateError::Internal("frame entity without index"))?;
                let offset = self.ctx.layout.local(index)?.offset;
                self.ctx.backend.store_slot(FrameSlot::Local(offset), src_reg, size);
            }
            Place::Argument => {
                let index = dst
                    .payload
                    .index()
                    .ok_or(TranslateError::Internal("frame entity without index"))?;
                let offset = self.ctx.layout.arg(index)?.offset;
                self.ctx.backend.store_slot(FrameSlot::Arg(offset), src_reg, size);
            }
            Place::TempStackSlot => {
                let (buf_off, _) = dst
                    .slot
                    .as_ref()
                    .and_then(|s| s.buffer())
                    .ok_or(TranslateError::Internal("temp-stack entity without buffer"))?;
                self.ctx.backend.store_slot(FrameSlot::Temp(buf_off), src_reg, size);
            }
            Place::LocalAddress | Place::ArgumentAddress | Place::FixedAddress => {
                let mut addr = dst.reread();
                self.evaluate(&mut addr, 0, true)?;
                let addr_reg = self.entity_reg(&addr)?;
                self.ctx.backend.store_memory(addr_reg, 0, src_reg, size);
                self.release_entity(addr)?;
            }
            Place::RegisterAddress => {
                let addr_reg = self.entity_reg(dst)?;
                self.ctx.backend.store_memory(addr_reg, 0, src_reg, size);
            }
            _ => {
                return Err(TranslateError::Internal(
                    "store destination is not a writable location",
                ))
            }
        }
        Ok(())
    }

    /// Destroy an entity popped off the evaluation stack. Object values
    /// that came back from a call carry a caller-owned reference that
    /// must be released.
    pub(crate) fn release_entity(&mut self, entity: StackEntity) -> Result<(), TranslateError> {
        if entity.returned_from_call && entity.ty.is_object_like() {
            let mut entity = entity;
            self.evaluate(&mut entity, 0, false)?;
            let reg = self.entity_reg(&entity)?;
            self.helper_call(WellKnownMethod::DecRef, "dec-ref", &[reg])?;
        }
        Ok(())
    }
}

/// Register behind a freshly allocated register slot.
fn slot_register(slot: &TempSlot) -> Result<Reg, TranslateError> {
    slot.register()
        .ok_or(TranslateError::Internal("register allocation yielded a buffer"))
}
