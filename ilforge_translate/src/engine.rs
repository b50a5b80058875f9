//! The per-opcode translation engine.
//!
//! Translation is a state machine over one method body: instructions are
//! consumed at the current block's cursor, each mapping to zero or more
//! backend operations. Every branch target and exception-region entry is
//! registered as a block boundary before translation begins, so reaching
//! another block's interior always terminates the current block instead
//! of duplicating code.

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace};

use ilforge_cil::body::MethodBody;
use ilforge_cil::error::CilError;
use ilforge_cil::inst::{decode, ConvTarget, Decoded, IndirectKind, Inst};
use ilforge_cil::resolver::{MetadataSource, TypeResolver};
use ilforge_cil::signature::MethodSignature;
use ilforge_cil::token::Token;
use ilforge_cil::types::{ElementKind, ElementType};
use ilforge_target::{Backend, Cond, Extend, Reg};

use crate::block::{BlockCond, MethodBlock, PendingBlock, Terminator};
use crate::callconv::ThisPolicy;
use crate::context::{CompileOptions, EmitContext, FrameLayout};
use crate::entity::StackEntity;
use crate::error::TranslateError;
use crate::holder::{AllocPolicy, TempPool, TempSlot};

/// Summary of one translated block.
#[derive(Debug, Clone, Copy)]
pub struct BlockSummary {
    pub start: u32,
    pub terminator: Terminator,
}

/// The basic-block graph produced by a method translation.
#[derive(Debug, Clone, Default)]
pub struct MethodGraph {
    pub blocks: Vec<BlockSummary>,
}

impl MethodGraph {
    pub fn block(&self, start: u32) -> Option<&BlockSummary> {
        self.blocks.iter().find(|b| b.start == start)
    }
}

/// Signed/unsigned flavor of a synthesized comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpKind {
    Eq,
    Lt,
    LtUn,
    Gt,
    GtUn,
}

/// Translation engine for one method body.
pub struct Engine<'a, B: Backend> {
    pub ctx: EmitContext<'a, B>,
    pub(crate) body: &'a MethodBody,
    pub(crate) current: MethodBlock,
    pub(crate) pending: VecDeque<PendingBlock>,
    pub(crate) boundaries: BTreeSet<u32>,
    pub(crate) queued: BTreeSet<u32>,
    pub(crate) graph: MethodGraph,
    /// Slots kept alive until the current block completes (addresses of
    /// spill buffers that must survive past their owning entity).
    pub(crate) deferred: Vec<TempSlot>,
    pending_constrained: Option<Token>,
}

/// Translate one method body against a backend. Convenience wrapper over
/// [`Engine`].
#[allow(clippy::too_many_arguments)]
pub fn translate_method<'a, B: Backend>(
    backend: &'a mut B,
    types: &'a dyn TypeResolver,
    meta: &'a dyn MetadataSource,
    options: &'a CompileOptions,
    method: Token,
    signature: &MethodSignature,
    this_type: Option<ElementType>,
    body: &'a MethodBody,
) -> Result<MethodGraph, TranslateError> {
    let engine = Engine::new(backend, types, meta, options, method, signature, this_type, body)?;
    engine.translate()
}

impl<'a, B: Backend> Engine<'a, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: &'a mut B,
        types: &'a dyn TypeResolver,
        meta: &'a dyn MetadataSource,
        options: &'a CompileOptions,
        method: Token,
        signature: &MethodSignature,
        this_type: Option<ElementType>,
        body: &'a MethodBody,
    ) -> Result<Self, TranslateError> {
        let word = backend.word_size();
        let layout = FrameLayout::compute(signature, body, types, this_type.as_ref(), word)?;
        let pool = TempPool::new(&backend.temp_registers(), word);
        let exc_reg = backend.exception_register();

        let ctx = EmitContext {
            backend,
            types,
            meta,
            options,
            pool,
            layout,
            method,
            signature: signature.clone(),
        };

        let mut engine = Self {
            ctx,
            body,
            current: MethodBlock::new(0),
            pending: VecDeque::new(),
            boundaries: BTreeSet::new(),
            queued: BTreeSet::new(),
            graph: MethodGraph::default(),
            deferred: Vec::new(),
            pending_constrained: None,
        };
        engine.queued.insert(0);
        engine.scan_boundaries()?;
        engine.queue_handler_blocks(exc_reg);
        Ok(engine)
    }

    /// Pre-scan the byte stream and register every offset another block
    /// starts at: branch targets, fallthrough points after conditional
    /// branches, and exception-region entries.
    fn scan_boundaries(&mut self) -> Result<(), TranslateError> {
        let bytes = &self.body.bytes;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let d = decode_at(bytes, offset)?;
            if let Some(target) = d.inst.branch_target() {
                self.boundaries.insert(target);
            }
            if d.inst.is_conditional_branch() {
                self.boundaries.insert(offset as u32 + d.len);
            }
            offset += d.len as usize;
        }
        // Region starts and ends are boundaries too, so every block sits
        // in a fixed set of protected regions.
        for clause in &self.body.clauses {
            self.boundaries.insert(clause.try_offset);
            self.boundaries.insert(clause.try_end());
            self.boundaries.insert(clause.handler_offset);
            self.boundaries.insert(clause.handler_end());
            if let ilforge_cil::body::ClauseKind::Filter(f) = clause.kind {
                self.boundaries.insert(f);
            }
        }
        self.boundaries.remove(&self.body.len());
        Ok(())
    }

    /// Queue every exception-handler entry as a root block. Catch and
    /// filter handlers begin with the in-flight exception object on the
    /// evaluation stack, delivered in the backend's exception register.
    fn queue_handler_blocks(&mut self, exc_reg: Reg) {
        let body = self.body;
        for clause in &body.clauses {
            let stack = if clause.kind.takes_exception() {
                let ty = match clause.kind {
                    ilforge_cil::body::ClauseKind::Catch(token) => ElementType::class(token),
                    _ => ElementType::new(ElementKind::Object),
                };
                vec![StackEntity::register(self.ctx.pool.pinned(exc_reg), ty)]
            } else {
                Vec::new()
            };
            if self.queued.insert(clause.handler_offset) {
                self.pending.push_back(PendingBlock {
                    start: clause.handler_offset,
                    stack,
                });
            }
            if let ilforge_cil::body::ClauseKind::Filter(f) = clause.kind {
                if self.queued.insert(f) {
                    let stack =
                        vec![StackEntity::register(self.ctx.pool.pinned(exc_reg), ElementType::new(ElementKind::Object))];
                    self.pending.push_back(PendingBlock { start: f, stack });
                }
            }
        }
    }

    /// Run translation to completion and return the block graph.
    pub fn translate(mut self) -> Result<MethodGraph, TranslateError> {
        loop {
            debug!(start = self.current.start, "compile block");
            self.ctx.backend.bind_block(self.current.start);
            self.current.regions = self.active_regions(self.current.start);
            while !self.step()? {}

            let terminator = self
                .current
                .terminator
                .ok_or(TranslateError::Internal("block completed without terminator"))?;
            self.graph.blocks.push(BlockSummary {
                start: self.current.start,
                terminator,
            });
            self.deferred.clear();

            match self.pending.pop_front() {
                Some(p) => {
                    self.current = MethodBlock::with_stack(p.start, p.stack);
                }
                None => break,
            }
        }
        Ok(self.graph)
    }

    /// Translate one instruction. Returns `true` when the current block
    /// is terminated and control must continue with the next block.
    pub fn step(&mut self) -> Result<bool, TranslateError> {
        let offset = self.current.cursor;

        // Merge case: about to compile into another block's interior.
        if offset != self.current.start && self.boundaries.contains(&offset) {
            debug!(offset, "merge into existing block boundary");
            self.ctx.backend.jump(offset);
            self.current.terminator = Some(Terminator::Jump { target: offset });
            let stack = std::mem::take(&mut self.current.stack);
            self.enqueue(offset, stack);
            return Ok(true);
        }

        if offset >= self.body.len() {
            return Err(TranslateError::Internal(
                "instruction stream ended without a block terminator",
            ));
        }

        let d = decode_at(&self.body.bytes, offset as usize)?;
        trace!(offset, op = d.inst.mnemonic(), "translate");
        self.current.cursor = offset + d.len;

        if self.pending_constrained.is_some() && !matches!(d.inst, Inst::CallVirt(_)) {
            return Err(TranslateError::Internal(
                "constrained. prefix must immediately precede callvirt",
            ));
        }

        self.dispatch(d.inst, offset)?;
        Ok(self.current.is_terminated())
    }

    fn dispatch(&mut self, inst: Inst, offset: u32) -> Result<(), TranslateError> {
        match inst {
            Inst::Nop => {}

            Inst::LdArg(i) => self.op_ldarg(i)?,
            Inst::LdArgA(i) => self.op_ldarga(i)?,
            Inst::StArg(i) => self.op_starg(offset, i)?,
            Inst::LdLoc(i) => self.op_ldloc(i)?,
            Inst::LdLocA(i) => self.op_ldloca(i)?,
            Inst::StLoc(i) => self.op_stloc(offset, i)?,

            Inst::LdcI4(v) => self.push(StackEntity::constant(ElementType::new(ElementKind::I4), v)),
            Inst::LdcI8(v) => {
                self.push(StackEntity::constant64(ElementType::new(ElementKind::I8), v))
            }
            Inst::LdNull => self.push(StackEntity::null()),
            Inst::LdStr(token) => self.push(StackEntity::token_address(
                token,
                ElementType::new(ElementKind::String),
            )),
            Inst::LdFtn(token) => self.push(StackEntity::method_address(token)),

            Inst::Dup => self.op_dup(offset)?,
            Inst::Pop => {
                let e = self.pop(offset)?;
                self.release_entity(e)?;
            }

            Inst::Add => self.binary(offset, |b: &mut B, d, s| b.add32(d, s))?,
            Inst::Sub => self.binary(offset, |b: &mut B, d, s| b.sub32(d, s))?,
            Inst::Mul => self.binary(offset, |b: &mut B, d, s| b.mul32(d, s))?,
            Inst::Div => self.binary(offset, |b: &mut B, d, s| b.div32(d, s))?,
            Inst::DivUn => self.binary(offset, |b: &mut B, d, s| b.udiv32(d, s))?,
            Inst::Rem => self.binary(offset, |b: &mut B, d, s| b.rem32(d, s))?,
            Inst::RemUn => self.binary(offset, |b: &mut B, d, s| b.urem32(d, s))?,
            Inst::And => self.binary(offset, |b: &mut B, d, s| b.and32(d, s))?,
            Inst::Or => self.binary(offset, |b: &mut B, d, s| b.or32(d, s))?,
            Inst::Xor => self.binary(offset, |b: &mut B, d, s| b.xor32(d, s))?,
            Inst::Shl => self.binary(offset, |b: &mut B, d, s| b.shl32(d, s))?,
            Inst::Shr => self.binary(offset, |b: &mut B, d, s| b.sar32(d, s))?,
            Inst::ShrUn => self.binary(offset, |b: &mut B, d, s| b.shr32(d, s))?,
            Inst::Neg => self.unary(offset, |b: &mut B, r| b.neg32(r))?,
            Inst::Not => self.unary(offset, |b: &mut B, r| b.not32(r))?,

            Inst::Ceq => self.compare(offset, CmpKind::Eq)?,
            Inst::Cgt => self.compare(offset, CmpKind::Gt)?,
            Inst::CgtUn => self.compare(offset, CmpKind::GtUn)?,
            Inst::Clt => self.compare(offset, CmpKind::Lt)?,
            Inst::CltUn => self.compare(offset, CmpKind::LtUn)?,

            Inst::Conv(target) => self.op_conv(offset, target)?,

            Inst::LdInd(kind) => self.op_ldind(offset, kind)?,
            Inst::StInd(kind) => self.op_stind(offset, kind)?,

            Inst::Br(t) => self.op_br(t)?,
            Inst::BrFalse(t) => self.cond_branch(offset, BlockCond::Zero, t)?,
            Inst::BrTrue(t) => self.cond_branch(offset, BlockCond::NonZero, t)?,

            // Comparison branches are not translated directly: each
            // expands into its compare followed by the matching
            // conditional branch at the same logical position.
            Inst::Beq(t) => self.compare_branch(offset, CmpKind::Eq, BlockCond::NonZero, t)?,
            Inst::BneUn(t) => self.compare_branch(offset, CmpKind::Eq, BlockCond::Zero, t)?,
            Inst::Blt(t) => self.compare_branch(offset, CmpKind::Lt, BlockCond::NonZero, t)?,
            Inst::Bge(t) => self.compare_branch(offset, CmpKind::Lt, BlockCond::Zero, t)?,
            Inst::Bgt(t) => self.compare_branch(offset, CmpKind::Gt, BlockCond::NonZero, t)?,
            Inst::Ble(t) => self.compare_branch(offset, CmpKind::Gt, BlockCond::Zero, t)?,
            Inst::BltUn(t) => self.compare_branch(offset, CmpKind::LtUn, BlockCond::NonZero, t)?,
            Inst::BgeUn(t) => self.compare_branch(offset, CmpKind::LtUn, BlockCond::Zero, t)?,
            Inst::BgtUn(t) => self.compare_branch(offset, CmpKind::GtUn, BlockCond::NonZero, t)?,
            Inst::BleUn(t) => self.compare_branch(offset, CmpKind::GtUn, BlockCond::Zero, t)?,

            Inst::Call(token) => {
                let policy = self.receiver_policy(token)?;
                self.emit_call(offset, token, policy, false, None, None)?;
            }
            Inst::CallVirt(token) => {
                let constrained = self.pending_constrained.take();
                self.emit_call(offset, token, ThisPolicy::BelowParams, true, constrained, None)?;
            }
            Inst::NewObj(token) => self.emit_newobj(offset, token)?,
            Inst::NewArr(token) => self.op_newarr(offset, token)?,
            Inst::IsInst(token) => self.op_isinst(offset, token)?,
            Inst::InitObj(token) => self.op_initobj(offset, token)?,
            Inst::Ret => self.op_ret(offset)?,

            Inst::LdSFld(token) => {
                let ty = self.ctx.meta.field_type(token)?;
                self.push(StackEntity::fixed_address(token, ty));
            }
            Inst::LdSFldA(token) => {
                let ty = self.ctx.meta.field_type(token)?;
                self.push(StackEntity::fixed_address_address(token, ty));
            }
            Inst::StSFld(token) => {
                let ty = self.ctx.meta.field_type(token)?;
                let src = self.pop(offset)?;
                let mut dst = StackEntity::fixed_address(token, ty);
                self.store_var(src, &mut dst, 0)?;
            }

            Inst::Leave(t) => self.op_leave(offset, t)?,
            Inst::EndFinally => self.op_endfinally(offset)?,
            Inst::Throw => self.op_throw(offset)?,

            Inst::Constrained(token) => {
                self.pending_constrained = Some(token);
            }
        }
        Ok(())
    }

    // -- Evaluation-stack plumbing --

    pub(crate) fn push(&mut self, entity: StackEntity) {
        debug_assert!(entity.slot_invariant_holds());
        self.current.stack.push(entity);
    }

    pub(crate) fn pop(&mut self, offset: u32) -> Result<StackEntity, TranslateError> {
        self.current
            .stack
            .pop()
            .ok_or(TranslateError::EvalStackUnderflow { offset })
    }

    // -- Locals and arguments --

    /// CIL argument indices count `this` but not the hidden return
    /// buffer; layout indices count both.
    fn layout_arg_index(&self, cil_index: u16) -> u16 {
        match self.ctx.layout.ret_buffer_arg {
            Some(rb) if cil_index >= rb => cil_index + 1,
            _ => cil_index,
        }
    }

    fn op_ldarg(&mut self, index: u16) -> Result<(), TranslateError> {
        let li = self.layout_arg_index(index);
        let ty = self.ctx.layout.arg(li)?.ty.clone();
        self.push(StackEntity::argument(li, ty));
        Ok(())
    }

    fn op_ldarga(&mut self, index: u16) -> Result<(), TranslateError> {
        let li = self.layout_arg_index(index);
        let ty = self.ctx.layout.arg(li)?.ty.clone();
        self.push(StackEntity::argument_address(li, ty));
        Ok(())
    }

    fn op_starg(&mut self, offset: u32, index: u16) -> Result<(), TranslateError> {
        let li = self.layout_arg_index(index);
        let ty = self.ctx.layout.arg(li)?.ty.clone();
        let src = self.pop(offset)?;
        let mut dst = StackEntity::argument(li, ty);
        self.store_var(src, &mut dst, 0)
    }

    fn op_ldloc(&mut self, index: u16) -> Result<(), TranslateError> {
        let ty = self.ctx.layout.local(index)?.ty.clone();
        self.push(StackEntity::local(index, ty));
        Ok(())
    }

    fn op_ldloca(&mut self, index: u16) -> Result<(), TranslateError> {
        let ty = self.ctx.layout.local(index)?.ty.clone();
        self.push(StackEntity::local_address(index, ty));
        Ok(())
    }

    fn op_stloc(&mut self, offset: u32, index: u16) -> Result<(), TranslateError> {
        let ty = self.ctx.layout.local(index)?.ty.clone();
        let src = self.pop(offset)?;
        let mut dst = StackEntity::local(index, ty);
        self.store_var(src, &mut dst, 0)
    }

    // -- Indirect access --

    fn op_ldind(&mut self, offset: u32, kind: IndirectKind) -> Result<(), TranslateError> {
        let mut addr = self.pop(offset)?;
        // Materialize the pointer value, then load through it.
        self.evaluate(&mut addr, 0, false)?;
        addr.place = crate::entity::Place::RegisterAddress;
        addr.ty = ElementType::new(kind.element_kind());
        self.evaluate(&mut addr, 0, false)?;
        self.push(addr);
        Ok(())
    }

    fn op_stind(&mut self, offset: u32, kind: IndirectKind) -> Result<(), TranslateError> {
        let src = self.pop(offset)?;
        let mut addr = self.pop(offset)?;
        self.evaluate(&mut addr, 0, false)?;
        addr.place = crate::entity::Place::RegisterAddress;
        addr.ty = ElementType::new(kind.element_kind());
        let size = self.ctx.size_of(&addr.ty)?;
        self.store_var(src, &mut addr, size)
    }

    // -- Runtime-helper object opcodes --

    fn op_newarr(&mut self, offset: u32, token: Token) -> Result<(), TranslateError> {
        let elem = self.ctx.types.resolve_type_ref(token)?;
        let rtti = self.ctx.types.rtti_id(elem)?;
        let mut count = self.pop(offset)?;
        self.evaluate(&mut count, 0, false)?;
        let count_reg = self.entity_reg(&count)?;

        let id_slot = self.alloc_register()?;
        let id_reg = id_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.load_const32(id_reg, rtti as i32);
        self.helper_call(
            ilforge_cil::resolver::WellKnownMethod::NewArray,
            "new-array",
            &[id_reg, count_reg],
        )?;
        drop(id_slot);
        self.release_entity(count)?;

        let slot = self.alloc_register()?;
        let reg = slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.take_return32(reg);
        let mut array = StackEntity::register(slot, {
            let mut ty = ElementType::new(ElementKind::SzArray);
            ty.class = Some(elem);
            ty
        });
        array.returned_from_call = true;
        self.push(array);
        Ok(())
    }

    fn op_isinst(&mut self, offset: u32, token: Token) -> Result<(), TranslateError> {
        let checked = self.ctx.types.resolve_type_ref(token)?;
        let rtti = self.ctx.types.rtti_id(checked)?;
        let mut obj = self.pop(offset)?;
        self.evaluate(&mut obj, 0, false)?;
        let obj_reg = self.entity_reg(&obj)?;

        let id_slot = self.alloc_register()?;
        let id_reg = id_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.load_const32(id_reg, rtti as i32);
        self.helper_call(
            ilforge_cil::resolver::WellKnownMethod::InstanceCheck,
            "instance-check",
            &[obj_reg, id_reg],
        )?;
        drop(id_slot);

        // The helper returns the same reference (or null); the caller's
        // temporary reference transfers to the result.
        let transferred = obj.returned_from_call;
        obj.returned_from_call = false;
        self.release_entity(obj)?;

        let slot = self.alloc_register()?;
        let reg = slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.take_return32(reg);
        let mut result = StackEntity::register(slot, ElementType::class(checked));
        result.returned_from_call = transferred;
        self.push(result);
        Ok(())
    }

    fn op_initobj(&mut self, offset: u32, token: Token) -> Result<(), TranslateError> {
        let tydef = self.ctx.types.resolve_type_ref(token)?;
        let size = self.ctx.size_of(&ElementType::value_type(tydef))?;
        let mut addr = self.pop(offset)?;
        self.evaluate(&mut addr, 0, false)?;
        let addr_reg = self.entity_reg(&addr)?;

        let zero_slot = self.alloc_register()?;
        let zero_reg = zero_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.load_const32(zero_reg, 0);
        let size_slot = self.alloc_register()?;
        let size_reg = size_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.load_const32(size_reg, size as i32);
        self.helper_call(
            ilforge_cil::resolver::WellKnownMethod::MemSet,
            "memset",
            &[addr_reg, zero_reg, size_reg],
        )?;
        drop(size_slot);
        drop(zero_slot);
        self.release_entity(addr)?;
        Ok(())
    }

    // -- Arithmetic and comparison --

    fn binary(
        &mut self,
        offset: u32,
        op: impl FnOnce(&mut B, Reg, Reg),
    ) -> Result<(), TranslateError> {
        let mut b = self.pop(offset)?;
        let mut a = self.pop(offset)?;
        self.evaluate(&mut a, 0, false)?;
        self.evaluate(&mut b, 0, false)?;
        let ra = self.entity_reg(&a)?;
        let rb = self.entity_reg(&b)?;
        op(&mut *self.ctx.backend, ra, rb);
        self.push(a);
        self.release_entity(b)
    }

    fn unary(&mut self, offset: u32, op: impl FnOnce(&mut B, Reg)) -> Result<(), TranslateError> {
        let mut a = self.pop(offset)?;
        self.evaluate(&mut a, 0, false)?;
        let ra = self.entity_reg(&a)?;
        op(&mut *self.ctx.backend, ra);
        self.push(a);
        Ok(())
    }

    fn compare(&mut self, offset: u32, kind: CmpKind) -> Result<(), TranslateError> {
        let mut b = self.pop(offset)?;
        let mut a = self.pop(offset)?;
        self.evaluate(&mut a, 0, false)?;
        self.evaluate(&mut b, 0, false)?;
        let ra = self.entity_reg(&a)?;
        let rb = self.entity_reg(&b)?;
        match kind {
            CmpKind::Eq => self.ctx.backend.ceq32(ra, ra, rb),
            CmpKind::Lt => self.ctx.backend.clt32(ra, ra, rb),
            CmpKind::LtUn => self.ctx.backend.cltu32(ra, ra, rb),
            CmpKind::Gt => self.ctx.backend.cgt32(ra, ra, rb),
            CmpKind::GtUn => self.ctx.backend.cgtu32(ra, ra, rb),
        }
        let mut result = a;
        result.ty = ElementType::new(ElementKind::I4);
        self.push(result);
        self.release_entity(b)
    }

    fn op_conv(&mut self, offset: u32, target: ConvTarget) -> Result<(), TranslateError> {
        let mut e = self.pop(offset)?;
        self.evaluate(&mut e, 0, false)?;
        let reg = self.entity_reg(&e)?;
        let word = self.ctx.word();
        let width = target.width(word).min(word);
        let extend = if target.is_signed() { Extend::Sign } else { Extend::Zero };
        self.ctx.backend.conv32(reg, width, extend);
        e.ty = ElementType::new(match target {
            ConvTarget::I1 => ElementKind::I1,
            ConvTarget::U1 => ElementKind::U1,
            ConvTarget::I2 => ElementKind::I2,
            ConvTarget::U2 => ElementKind::U2,
            ConvTarget::I4 => ElementKind::I4,
            ConvTarget::U4 => ElementKind::U4,
            ConvTarget::I8 => ElementKind::I8,
            ConvTarget::U8 => ElementKind::U8,
            ConvTarget::I => ElementKind::IntPtr,
            ConvTarget::U => ElementKind::UIntPtr,
        });
        self.push(e);
        Ok(())
    }

    fn op_dup(&mut self, offset: u32) -> Result<(), TranslateError> {
        let mut top = self.pop(offset)?;
        self.evaluate(&mut top, 0, false)?;
        let src = self.entity_reg(&top)?;
        let copy_slot = self.alloc_register()?;
        let dst = copy_slot
            .register()
            .ok_or(TranslateError::Internal("register allocation yielded a buffer"))?;
        self.ctx.backend.move_reg(dst, src);
        let copy = StackEntity::register(copy_slot, top.ty.clone());
        self.push(top);
        self.push(copy);
        Ok(())
    }

    // -- Control flow --

    fn op_br(&mut self, target: u32) -> Result<(), TranslateError> {
        self.ctx.backend.jump(target);
        self.current.terminator = Some(Terminator::Jump { target });
        let stack = std::mem::take(&mut self.current.stack);
        self.enqueue(target, stack);
        Ok(())
    }

    fn cond_branch(
        &mut self,
        offset: u32,
        cond: BlockCond,
        taken: u32,
    ) -> Result<(), TranslateError> {
        let fallthrough = self.current.cursor;
        let mut c = self.pop(offset)?;
        self.evaluate(&mut c, 0, false)?;
        let reg = self.entity_reg(&c)?;
        let bc = match cond {
            BlockCond::Zero => Cond::Zero,
            BlockCond::NonZero => Cond::NonZero,
        };
        self.ctx.backend.jump_cond(bc, reg, taken);
        self.release_entity(c)?;
        self.ctx.backend.jump(fallthrough);
        self.current.terminator = Some(Terminator::Branch { cond, taken, fallthrough });

        // Two continuations share the entry snapshot. The last-compiled
        // side keeps ownership of any live slots; the other sees alias
        // views of the same locations.
        let stack = std::mem::take(&mut self.current.stack);
        if self.queued.contains(&taken) {
            self.enqueue(fallthrough, stack);
        } else {
            let views = stack.iter().map(|e| e.fork_view()).collect();
            self.enqueue(fallthrough, views);
            self.enqueue(taken, stack);
        }
        Ok(())
    }

    fn compare_branch(
        &mut self,
        offset: u32,
        cmp: CmpKind,
        cond: BlockCond,
        target: u32,
    ) -> Result<(), TranslateError> {
        self.compare(offset, cmp)?;
        self.cond_branch(offset, cond, target)
    }

    pub(crate) fn enqueue(&mut self, start: u32, stack: Vec<StackEntity>) {
        if self.queued.insert(start) {
            self.pending.push_back(PendingBlock { start, stack });
        }
        // Already queued or compiled: the snapshot is dropped here and
        // any owned slots return to the pool.
    }

    // -- Returns --

    fn op_ret(&mut self, offset: u32) -> Result<(), TranslateError> {
        self.run_pending_cleanups(offset)?;

        if self.ctx.signature.returns_value() {
            let ret_ty = self.ctx.signature.ret.clone();
            let ret_size = self.ctx.size_of(&ret_ty)?;
            let word = self.ctx.word();
            let mut value = self.pop(offset)?;

            if ret_size > word && !ret_ty.is_object_like() {
                // Large struct return: copy into the caller-provided
                // buffer whose address arrived as a hidden argument.
                let rb = self
                    .ctx
                    .layout
                    .ret_buffer_arg
                    .ok_or(TranslateError::Internal("wide return without hidden buffer argument"))?;
                let mut dst = StackEntity::argument(rb, ElementType::new(ElementKind::IntPtr));
                self.evaluate(&mut dst, 0, false)?;
                let dst_reg = self.entity_reg(&dst)?;
                self.evaluate(&mut value, 0, true)?;
                let src_reg = self.entity_reg(&value)?;
                let size_slot = self.alloc_register()?;
                let size_reg = size_slot.register().ok_or(TranslateError::RegisterExhausted)?;
                self.ctx.backend.load_const32(size_reg, ret_size as i32);
                self.helper_call(
                    ilforge_cil::resolver::WellKnownMethod::MemCpy,
                    "memcpy",
                    &[dst_reg, src_reg, size_reg],
                )?;
                drop(size_slot);
                self.release_entity(dst)?;
                self.release_entity(value)?;
            } else {
                self.evaluate(&mut value, 0, false)?;
                let reg = self.entity_reg(&value)?;
                self.ctx.backend.assign_return32(reg);
                self.release_entity(value)?;
            }
        }

        self.ctx.backend.emit_return();
        self.current.terminator = Some(Terminator::Return);
        Ok(())
    }

    /// `call` receiver policy from the callee's signature: instance
    /// methods have their receiver below the pushed parameters.
    fn receiver_policy(&self, token: Token) -> Result<ThisPolicy, TranslateError> {
        let method = self.resolve_method(token)?;
        let sig = self.ctx.meta.method_signature(method)?;
        Ok(if sig.has_this { ThisPolicy::BelowParams } else { ThisPolicy::None })
    }

    pub(crate) fn resolve_method(&self, token: Token) -> Result<Token, TranslateError> {
        if token.table() == ilforge_cil::token::table::MEMBER_REF {
            Ok(self.ctx.meta.resolve_member_ref(token)?)
        } else {
            Ok(token)
        }
    }

    // -- Shared low-level helpers --

    pub(crate) fn entity_reg(&self, e: &StackEntity) -> Result<Reg, TranslateError> {
        e.slot
            .as_ref()
            .and_then(|s| s.register())
            .ok_or(TranslateError::Internal("entity is not register-resident"))
    }

    pub(crate) fn alloc_register(&mut self) -> Result<TempSlot, TranslateError> {
        self.ctx.pool.allocate(AllocPolicy::RegisterOnly, self.ctx.word())
    }
}

/// Decode one instruction; opcodes this translator does not support are
/// an illegal-instruction failure for the whole method.
fn decode_at(bytes: &[u8], offset: usize) -> Result<Decoded, TranslateError> {
    decode(bytes, offset).map_err(|e| match e {
        CilError::UnknownOpcode { byte, offset } | CilError::UnknownExtOpcode { byte, offset } => {
            TranslateError::IllegalInstruction { opcode: byte, offset: offset as u32 }
        }
        other => TranslateError::Cil(other),
    })
}
