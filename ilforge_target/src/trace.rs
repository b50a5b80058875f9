//! Recording reference backend.
//!
//! `TraceBackend` implements [`Backend`] by appending one [`TraceOp`] per
//! logical operation. Every test in the workspace drives it and asserts
//! on the recorded stream; it also doubles as a poor man's disassembler
//! when debugging a translation.

use crate::backend::{Backend, Cond, Extend, FrameSlot, Reg};

/// One recorded logical operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceOp {
    LoadConst32 { dst: Reg, value: i32 },
    LoadConst64 { dst: Reg, value: i64 },
    LoadSymbolAddr { dst: Reg, symbol: String },
    LoadSlot { dst: Reg, slot: FrameSlot, size: u32, extend: Extend },
    LoadSlotAddr { dst: Reg, slot: FrameSlot },
    StoreSlot { slot: FrameSlot, src: Reg, size: u32 },
    LoadMemory { dst: Reg, addr: Reg, offset: i32, size: u32, extend: Extend },
    StoreMemory { addr: Reg, offset: i32, src: Reg, size: u32 },
    MoveReg { dst: Reg, src: Reg },
    AddImm { dst: Reg, value: i32 },
    Add32 { dst: Reg, src: Reg },
    Sub32 { dst: Reg, src: Reg },
    Mul32 { dst: Reg, src: Reg },
    Div32 { dst: Reg, src: Reg },
    UDiv32 { dst: Reg, src: Reg },
    Rem32 { dst: Reg, src: Reg },
    URem32 { dst: Reg, src: Reg },
    And32 { dst: Reg, src: Reg },
    Or32 { dst: Reg, src: Reg },
    Xor32 { dst: Reg, src: Reg },
    Shl32 { dst: Reg, src: Reg },
    Sar32 { dst: Reg, src: Reg },
    Shr32 { dst: Reg, src: Reg },
    Neg32 { reg: Reg },
    Not32 { reg: Reg },
    Ceq32 { dst: Reg, a: Reg, b: Reg },
    Clt32 { dst: Reg, a: Reg, b: Reg },
    Cltu32 { dst: Reg, a: Reg, b: Reg },
    Cgt32 { dst: Reg, a: Reg, b: Reg },
    Cgtu32 { dst: Reg, a: Reg, b: Reg },
    Conv32 { reg: Reg, width: u32, extend: Extend },
    BindBlock { offset: u32 },
    Jump { target: u32 },
    JumpCond { cond: Cond, reg: Reg, target: u32 },
    CallSymbol { symbol: String },
    CallIndirect { target: Reg },
    TakeReturn32 { dst: Reg },
    Return,
    RestoreFrame,
    PushArg32 { src: Reg },
    AdjustStack { bytes: u32 },
    StackTopAddr { dst: Reg },
    RevertStack { bytes: u32 },
    AssignReturn32 { src: Reg },
}

/// A backend that records every operation it is asked to emit.
pub struct TraceBackend {
    word: u32,
    ops: Vec<TraceOp>,
    arg_bytes: u32,
}

impl TraceBackend {
    /// 32-bit target with a six-register temporary file.
    pub fn new() -> Self {
        Self::with_word_size(4)
    }

    pub fn with_word_size(word: u32) -> Self {
        Self {
            word,
            ops: Vec::new(),
            arg_bytes: 0,
        }
    }

    /// Everything emitted so far.
    pub fn ops(&self) -> &[TraceOp] {
        &self.ops
    }

    /// Symbols called via `call_symbol`, in emission order.
    pub fn called_symbols(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                TraceOp::CallSymbol { symbol } => Some(symbol.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Recorded jump/branch targets, in emission order.
    pub fn jump_targets(&self) -> Vec<(Option<Cond>, u32)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                TraceOp::Jump { target } => Some((None, *target)),
                TraceOp::JumpCond { cond, target, .. } => Some((Some(*cond), *target)),
                _ => None,
            })
            .collect()
    }

    /// Offsets announced via `bind_block`, in emission order.
    pub fn bound_blocks(&self) -> Vec<u32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                TraceOp::BindBlock { offset } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    fn push(&mut self, op: TraceOp) {
        self.ops.push(op);
    }
}

impl Default for TraceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for TraceBackend {
    fn word_size(&self) -> u32 {
        self.word
    }

    fn temp_registers(&self) -> Vec<Reg> {
        (0..6).map(Reg).collect()
    }

    fn exception_register(&self) -> Reg {
        Reg(14)
    }

    fn load_const32(&mut self, dst: Reg, value: i32) {
        self.push(TraceOp::LoadConst32 { dst, value });
    }

    fn load_const64(&mut self, dst: Reg, value: i64) {
        self.push(TraceOp::LoadConst64 { dst, value });
    }

    fn load_symbol_addr(&mut self, dst: Reg, symbol: &str) {
        self.push(TraceOp::LoadSymbolAddr {
            dst,
            symbol: symbol.to_string(),
        });
    }

    fn load_slot(&mut self, dst: Reg, slot: FrameSlot, size: u32, extend: Extend) {
        self.push(TraceOp::LoadSlot { dst, slot, size, extend });
    }

    fn load_slot_addr(&mut self, dst: Reg, slot: FrameSlot) {
        self.push(TraceOp::LoadSlotAddr { dst, slot });
    }

    fn store_slot(&mut self, slot: FrameSlot, src: Reg, size: u32) {
        self.push(TraceOp::StoreSlot { slot, src, size });
    }

    fn load_memory(&mut self, dst: Reg, addr: Reg, offset: i32, size: u32, extend: Extend) {
        self.push(TraceOp::LoadMemory { dst, addr, offset, size, extend });
    }

    fn store_memory(&mut self, addr: Reg, offset: i32, src: Reg, size: u32) {
        self.push(TraceOp::StoreMemory { addr, offset, src, size });
    }

    fn move_reg(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::MoveReg { dst, src });
    }

    fn add_imm(&mut self, dst: Reg, value: i32) {
        self.push(TraceOp::AddImm { dst, value });
    }

    fn add32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Add32 { dst, src });
    }

    fn sub32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Sub32 { dst, src });
    }

    fn mul32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Mul32 { dst, src });
    }

    fn div32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Div32 { dst, src });
    }

    fn udiv32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::UDiv32 { dst, src });
    }

    fn rem32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Rem32 { dst, src });
    }

    fn urem32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::URem32 { dst, src });
    }

    fn and32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::And32 { dst, src });
    }

    fn or32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Or32 { dst, src });
    }

    fn xor32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Xor32 { dst, src });
    }

    fn shl32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Shl32 { dst, src });
    }

    fn sar32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Sar32 { dst, src });
    }

    fn shr32(&mut self, dst: Reg, src: Reg) {
        self.push(TraceOp::Shr32 { dst, src });
    }

    fn neg32(&mut self, reg: Reg) {
        self.push(TraceOp::Neg32 { reg });
    }

    fn not32(&mut self, reg: Reg) {
        self.push(TraceOp::Not32 { reg });
    }

    fn ceq32(&mut self, dst: Reg, a: Reg, b: Reg) {
        self.push(TraceOp::Ceq32 { dst, a, b });
    }

    fn clt32(&mut self, dst: Reg, a: Reg, b: Reg) {
        self.push(TraceOp::Clt32 { dst, a, b });
    }

    fn cltu32(&mut self, dst: Reg, a: Reg, b: Reg) {
        self.push(TraceOp::Cltu32 { dst, a, b });
    }

    fn cgt32(&mut self, dst: Reg, a: Reg, b: Reg) {
        self.push(TraceOp::Cgt32 { dst, a, b });
    }

    fn cgtu32(&mut self, dst: Reg, a: Reg, b: Reg) {
        self.push(TraceOp::Cgtu32 { dst, a, b });
    }

    fn conv32(&mut self, reg: Reg, width: u32, extend: Extend) {
        self.push(TraceOp::Conv32 { reg, width, extend });
    }

    fn bind_block(&mut self, offset: u32) {
        self.push(TraceOp::BindBlock { offset });
    }

    fn jump(&mut self, target: u32) {
        self.push(TraceOp::Jump { target });
    }

    fn jump_cond(&mut self, cond: Cond, reg: Reg, target: u32) {
        self.push(TraceOp::JumpCond { cond, reg, target });
    }

    fn call_symbol(&mut self, symbol: &str) {
        self.push(TraceOp::CallSymbol {
            symbol: symbol.to_string(),
        });
    }

    fn call_indirect(&mut self, target: Reg) {
        self.push(TraceOp::CallIndirect { target });
    }

    fn take_return32(&mut self, dst: Reg) {
        self.push(TraceOp::TakeReturn32 { dst });
    }

    fn emit_return(&mut self) {
        self.push(TraceOp::Return);
    }

    fn restore_frame(&mut self) {
        self.push(TraceOp::RestoreFrame);
    }

    fn push_arg32(&mut self, src: Reg) {
        self.arg_bytes += self.word;
        self.push(TraceOp::PushArg32 { src });
    }

    fn adjust_stack(&mut self, bytes: u32) {
        self.arg_bytes += bytes;
        self.push(TraceOp::AdjustStack { bytes });
    }

    fn stack_top_addr(&mut self, dst: Reg) {
        self.push(TraceOp::StackTopAddr { dst });
    }

    fn revert_stack(&mut self, bytes: u32) {
        self.arg_bytes = self.arg_bytes.saturating_sub(bytes);
        self.push(TraceOp::RevertStack { bytes });
    }

    fn stack_size(&self) -> u32 {
        self.arg_bytes
    }

    fn assign_return32(&mut self, src: Reg) {
        self.push(TraceOp::AssignReturn32 { src });
    }
}
