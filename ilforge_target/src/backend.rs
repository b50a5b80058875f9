//! Backend trait for target-specific code emission.

/// A physical register, encoded as the target's register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

/// Condition tag for conditional control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Transfer when the register holds zero.
    Zero,
    /// Transfer when the register holds non-zero.
    NonZero,
}

/// Widening policy for sub-word loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Sign,
    Zero,
}

/// A position in the current method's stack frame, by byte offset within
/// the respective area. The translation core computes offsets from the
/// method's locals/arguments layout; the backend maps areas to its frame
/// convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlot {
    Local(i32),
    Arg(i32),
    /// Spill area for temporary stack buffers.
    Temp(i32),
}

/// Target-specific code emission.
///
/// Every method emits zero or more native instructions for one logical
/// operation. Register-to-register arithmetic is two-address:
/// `dst := dst op src`. Branch targets are byte offsets into the method
/// body being translated; the backend binds them to machine labels as
/// blocks are announced via [`Backend::bind_block`].
pub trait Backend {
    /// Machine word size in bytes.
    fn word_size(&self) -> u32;

    /// Registers available to the temporary-slot pool, in preference
    /// order.
    fn temp_registers(&self) -> Vec<Reg>;

    /// Register in which the runtime delivers the in-flight exception
    /// object at a handler entry. Not part of the temporary pool.
    fn exception_register(&self) -> Reg;

    // -- Constants and addresses --
    fn load_const32(&mut self, dst: Reg, value: i32);
    fn load_const64(&mut self, dst: Reg, value: i64);
    /// Load a relocatable symbol address.
    fn load_symbol_addr(&mut self, dst: Reg, symbol: &str);

    // -- Frame access --
    fn load_slot(&mut self, dst: Reg, slot: FrameSlot, size: u32, extend: Extend);
    fn load_slot_addr(&mut self, dst: Reg, slot: FrameSlot);
    fn store_slot(&mut self, slot: FrameSlot, src: Reg, size: u32);

    // -- Memory access --
    fn load_memory(&mut self, dst: Reg, addr: Reg, offset: i32, size: u32, extend: Extend);
    fn store_memory(&mut self, addr: Reg, offset: i32, src: Reg, size: u32);

    // -- Register operations --
    fn move_reg(&mut self, dst: Reg, src: Reg);
    fn add_imm(&mut self, dst: Reg, value: i32);
    fn add32(&mut self, dst: Reg, src: Reg);
    fn sub32(&mut self, dst: Reg, src: Reg);
    fn mul32(&mut self, dst: Reg, src: Reg);
    fn div32(&mut self, dst: Reg, src: Reg);
    fn udiv32(&mut self, dst: Reg, src: Reg);
    fn rem32(&mut self, dst: Reg, src: Reg);
    fn urem32(&mut self, dst: Reg, src: Reg);
    fn and32(&mut self, dst: Reg, src: Reg);
    fn or32(&mut self, dst: Reg, src: Reg);
    fn xor32(&mut self, dst: Reg, src: Reg);
    fn shl32(&mut self, dst: Reg, src: Reg);
    /// Arithmetic (sign-propagating) right shift.
    fn sar32(&mut self, dst: Reg, src: Reg);
    /// Logical right shift.
    fn shr32(&mut self, dst: Reg, src: Reg);
    fn neg32(&mut self, reg: Reg);
    fn not32(&mut self, reg: Reg);

    // -- Comparisons: dst := (a op b) as 0/1 --
    fn ceq32(&mut self, dst: Reg, a: Reg, b: Reg);
    fn clt32(&mut self, dst: Reg, a: Reg, b: Reg);
    fn cltu32(&mut self, dst: Reg, a: Reg, b: Reg);
    fn cgt32(&mut self, dst: Reg, a: Reg, b: Reg);
    fn cgtu32(&mut self, dst: Reg, a: Reg, b: Reg);

    /// Normalize a register to `width` bytes with the given widening.
    fn conv32(&mut self, reg: Reg, width: u32, extend: Extend);

    // -- Control transfer --
    /// Announce that the block starting at `offset` begins here.
    fn bind_block(&mut self, offset: u32);
    fn jump(&mut self, target: u32);
    fn jump_cond(&mut self, cond: Cond, reg: Reg, target: u32);
    fn call_symbol(&mut self, symbol: &str);
    fn call_indirect(&mut self, target: Reg);
    /// Capture the callee's word-sized return value.
    fn take_return32(&mut self, dst: Reg);
    fn emit_return(&mut self);
    /// Restore the caller's frame pointer (leaving an exception handler).
    fn restore_frame(&mut self);

    // -- Outgoing arguments --
    fn push_arg32(&mut self, src: Reg);
    /// Grow the outgoing argument area by `bytes` without pushing a value.
    fn adjust_stack(&mut self, bytes: u32);
    /// Materialize the current top of the outgoing argument area.
    fn stack_top_addr(&mut self, dst: Reg);
    fn revert_stack(&mut self, bytes: u32);
    /// Bytes currently occupied by the outgoing argument area.
    fn stack_size(&self) -> u32;

    // -- Returns --
    /// Stage a word-sized value in the return slot.
    fn assign_return32(&mut self, src: Reg);
}
