//! CIL instruction decoding.
//!
//! The decoder produces fully normalized instructions: the contiguous
//! short encodings (`ldloc.0`..`ldloc.3`), the `.s` 8-bit forms, and the
//! `0xFE`-prefixed 16-bit forms all decode to a single variant carrying an
//! explicit index, and branch targets are resolved to absolute byte
//! offsets within the method body.

use crate::error::CilError;
use crate::token::Token;

/// Integer conversion target of a `conv.*` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvTarget {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
}

impl ConvTarget {
    /// Width in bytes on a target with the given word size.
    pub fn width(self, word: u32) -> u32 {
        match self {
            ConvTarget::I1 | ConvTarget::U1 => 1,
            ConvTarget::I2 | ConvTarget::U2 => 2,
            ConvTarget::I4 | ConvTarget::U4 => 4,
            ConvTarget::I8 | ConvTarget::U8 => 8,
            ConvTarget::I | ConvTarget::U => word,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ConvTarget::I1 | ConvTarget::I2 | ConvTarget::I4 | ConvTarget::I8 | ConvTarget::I
        )
    }
}

/// Element accessed by an indirect load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I,
    Ref,
}

impl IndirectKind {
    /// Element kind accessed through the pointer.
    pub fn element_kind(self) -> crate::types::ElementKind {
        use crate::types::ElementKind;
        match self {
            IndirectKind::I1 => ElementKind::I1,
            IndirectKind::U1 => ElementKind::U1,
            IndirectKind::I2 => ElementKind::I2,
            IndirectKind::U2 => ElementKind::U2,
            IndirectKind::I4 => ElementKind::I4,
            IndirectKind::U4 => ElementKind::U4,
            IndirectKind::I => ElementKind::IntPtr,
            IndirectKind::Ref => ElementKind::Object,
        }
    }
}

/// A decoded CIL instruction.
///
/// Branch operands are absolute byte offsets into the method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    Nop,

    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),

    LdcI4(i32),
    LdcI8(i64),
    LdNull,
    LdStr(Token),
    LdFtn(Token),

    Dup,
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,

    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,

    Conv(ConvTarget),

    LdInd(IndirectKind),
    StInd(IndirectKind),

    Br(u32),
    BrFalse(u32),
    BrTrue(u32),
    Beq(u32),
    Bge(u32),
    Bgt(u32),
    Ble(u32),
    Blt(u32),
    BneUn(u32),
    BgeUn(u32),
    BgtUn(u32),
    BleUn(u32),
    BltUn(u32),

    Call(Token),
    CallVirt(Token),
    NewObj(Token),
    NewArr(Token),
    IsInst(Token),
    InitObj(Token),
    Ret,

    LdSFld(Token),
    LdSFldA(Token),
    StSFld(Token),

    Leave(u32),
    EndFinally,
    Throw,

    /// `constrained.` call-site prefix; must be followed by `callvirt`.
    Constrained(Token),
}

impl Inst {
    /// Branch target, if this instruction transfers control to a fixed
    /// offset. Used by the block-boundary pre-scan.
    pub fn branch_target(&self) -> Option<u32> {
        match *self {
            Inst::Br(t)
            | Inst::BrFalse(t)
            | Inst::BrTrue(t)
            | Inst::Beq(t)
            | Inst::Bge(t)
            | Inst::Bgt(t)
            | Inst::Ble(t)
            | Inst::Blt(t)
            | Inst::BneUn(t)
            | Inst::BgeUn(t)
            | Inst::BgtUn(t)
            | Inst::BleUn(t)
            | Inst::BltUn(t)
            | Inst::Leave(t) => Some(t),
            _ => None,
        }
    }

    /// Whether this instruction falls through to the next offset when it
    /// branches (conditional) or never returns to it (unconditional).
    pub fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            Inst::BrFalse(_)
                | Inst::BrTrue(_)
                | Inst::Beq(_)
                | Inst::Bge(_)
                | Inst::Bgt(_)
                | Inst::Ble(_)
                | Inst::Blt(_)
                | Inst::BneUn(_)
                | Inst::BgeUn(_)
                | Inst::BgtUn(_)
                | Inst::BleUn(_)
                | Inst::BltUn(_)
        )
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Inst::Nop => "nop",
            Inst::LdArg(_) => "ldarg",
            Inst::LdArgA(_) => "ldarga",
            Inst::StArg(_) => "starg",
            Inst::LdLoc(_) => "ldloc",
            Inst::LdLocA(_) => "ldloca",
            Inst::StLoc(_) => "stloc",
            Inst::LdcI4(_) => "ldc.i4",
            Inst::LdcI8(_) => "ldc.i8",
            Inst::LdNull => "ldnull",
            Inst::LdStr(_) => "ldstr",
            Inst::LdFtn(_) => "ldftn",
            Inst::Dup => "dup",
            Inst::Pop => "pop",
            Inst::Add => "add",
            Inst::Sub => "sub",
            Inst::Mul => "mul",
            Inst::Div => "div",
            Inst::DivUn => "div.un",
            Inst::Rem => "rem",
            Inst::RemUn => "rem.un",
            Inst::And => "and",
            Inst::Or => "or",
            Inst::Xor => "xor",
            Inst::Shl => "shl",
            Inst::Shr => "shr",
            Inst::ShrUn => "shr.un",
            Inst::Neg => "neg",
            Inst::Not => "not",
            Inst::Ceq => "ceq",
            Inst::Cgt => "cgt",
            Inst::CgtUn => "cgt.un",
            Inst::Clt => "clt",
            Inst::CltUn => "clt.un",
            Inst::Conv(_) => "conv",
            Inst::LdInd(_) => "ldind",
            Inst::StInd(_) => "stind",
            Inst::Br(_) => "br",
            Inst::BrFalse(_) => "brfalse",
            Inst::BrTrue(_) => "brtrue",
            Inst::Beq(_) => "beq",
            Inst::Bge(_) => "bge",
            Inst::Bgt(_) => "bgt",
            Inst::Ble(_) => "ble",
            Inst::Blt(_) => "blt",
            Inst::BneUn(_) => "bne.un",
            Inst::BgeUn(_) => "bge.un",
            Inst::BgtUn(_) => "bgt.un",
            Inst::BleUn(_) => "ble.un",
            Inst::BltUn(_) => "blt.un",
            Inst::Call(_) => "call",
            Inst::CallVirt(_) => "callvirt",
            Inst::NewObj(_) => "newobj",
            Inst::NewArr(_) => "newarr",
            Inst::IsInst(_) => "isinst",
            Inst::InitObj(_) => "initobj",
            Inst::Ret => "ret",
            Inst::LdSFld(_) => "ldsfld",
            Inst::LdSFldA(_) => "ldsflda",
            Inst::StSFld(_) => "stsfld",
            Inst::Leave(_) => "leave",
            Inst::EndFinally => "endfinally",
            Inst::Throw => "throw",
            Inst::Constrained(_) => "constrained.",
        }
    }
}

/// A decoded instruction plus its encoded length in bytes.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub inst: Inst,
    pub len: u32,
}

fn read_u8(bytes: &[u8], at: usize) -> Result<u8, CilError> {
    bytes
        .get(at)
        .copied()
        .ok_or(CilError::TruncatedStream { offset: at })
}

fn read_i8(bytes: &[u8], at: usize) -> Result<i8, CilError> {
    Ok(read_u8(bytes, at)? as i8)
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, CilError> {
    let b = bytes
        .get(at..at + 2)
        .ok_or(CilError::TruncatedStream { offset: at })?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_i32(bytes: &[u8], at: usize) -> Result<i32, CilError> {
    let b = bytes
        .get(at..at + 4)
        .ok_or(CilError::TruncatedStream { offset: at })?;
    Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_i64(bytes: &[u8], at: usize) -> Result<i64, CilError> {
    let b = bytes
        .get(at..at + 8)
        .ok_or(CilError::TruncatedStream { offset: at })?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    Ok(i64::from_le_bytes(buf))
}

fn read_token(bytes: &[u8], at: usize) -> Result<Token, CilError> {
    Ok(Token::from_raw(read_i32(bytes, at)? as u32))
}

/// Absolute branch target from a relative displacement. `end` is the
/// offset just past the branch instruction, which CIL displacements are
/// relative to.
fn abs_target(end: usize, rel: i32) -> u32 {
    (end as i64 + rel as i64) as u32
}

/// Decode one instruction at `offset`.
pub fn decode(bytes: &[u8], offset: usize) -> Result<Decoded, CilError> {
    let op = read_u8(bytes, offset)?;
    let operand = offset + 1;

    // Short branch helper: 1 opcode byte + 1 displacement byte.
    let short = |rel: i8| abs_target(offset + 2, rel as i32);
    // Long branch helper: 1 opcode byte + 4 displacement bytes.
    let long = |rel: i32| abs_target(offset + 5, rel);

    let (inst, len) = match op {
        0x00 => (Inst::Nop, 1),

        0x02..=0x05 => (Inst::LdArg((op - 0x02) as u16), 1),
        0x06..=0x09 => (Inst::LdLoc((op - 0x06) as u16), 1),
        0x0A..=0x0D => (Inst::StLoc((op - 0x0A) as u16), 1),
        0x0E => (Inst::LdArg(read_u8(bytes, operand)? as u16), 2),
        0x0F => (Inst::LdArgA(read_u8(bytes, operand)? as u16), 2),
        0x10 => (Inst::StArg(read_u8(bytes, operand)? as u16), 2),
        0x11 => (Inst::LdLoc(read_u8(bytes, operand)? as u16), 2),
        0x12 => (Inst::LdLocA(read_u8(bytes, operand)? as u16), 2),
        0x13 => (Inst::StLoc(read_u8(bytes, operand)? as u16), 2),

        0x14 => (Inst::LdNull, 1),
        0x15 => (Inst::LdcI4(-1), 1),
        0x16..=0x1E => (Inst::LdcI4((op - 0x16) as i32), 1),
        0x1F => (Inst::LdcI4(read_i8(bytes, operand)? as i32), 2),
        0x20 => (Inst::LdcI4(read_i32(bytes, operand)?), 5),
        0x21 => (Inst::LdcI8(read_i64(bytes, operand)?), 9),

        0x25 => (Inst::Dup, 1),
        0x26 => (Inst::Pop, 1),

        0x28 => (Inst::Call(read_token(bytes, operand)?), 5),
        0x2A => (Inst::Ret, 1),

        0x2B => (Inst::Br(short(read_i8(bytes, operand)?)), 2),
        0x2C => (Inst::BrFalse(short(read_i8(bytes, operand)?)), 2),
        0x2D => (Inst::BrTrue(short(read_i8(bytes, operand)?)), 2),
        0x2E => (Inst::Beq(short(read_i8(bytes, operand)?)), 2),
        0x2F => (Inst::Bge(short(read_i8(bytes, operand)?)), 2),
        0x30 => (Inst::Bgt(short(read_i8(bytes, operand)?)), 2),
        0x31 => (Inst::Ble(short(read_i8(bytes, operand)?)), 2),
        0x32 => (Inst::Blt(short(read_i8(bytes, operand)?)), 2),
        0x33 => (Inst::BneUn(short(read_i8(bytes, operand)?)), 2),
        0x34 => (Inst::BgeUn(short(read_i8(bytes, operand)?)), 2),
        0x35 => (Inst::BgtUn(short(read_i8(bytes, operand)?)), 2),
        0x36 => (Inst::BleUn(short(read_i8(bytes, operand)?)), 2),
        0x37 => (Inst::BltUn(short(read_i8(bytes, operand)?)), 2),

        0x38 => (Inst::Br(long(read_i32(bytes, operand)?)), 5),
        0x39 => (Inst::BrFalse(long(read_i32(bytes, operand)?)), 5),
        0x3A => (Inst::BrTrue(long(read_i32(bytes, operand)?)), 5),
        0x3B => (Inst::Beq(long(read_i32(bytes, operand)?)), 5),
        0x3C => (Inst::Bge(long(read_i32(bytes, operand)?)), 5),
        0x3D => (Inst::Bgt(long(read_i32(bytes, operand)?)), 5),
        0x3E => (Inst::Ble(long(read_i32(bytes, operand)?)), 5),
        0x3F => (Inst::Blt(long(read_i32(bytes, operand)?)), 5),
        0x40 => (Inst::BneUn(long(read_i32(bytes, operand)?)), 5),
        0x41 => (Inst::BgeUn(long(read_i32(bytes, operand)?)), 5),
        0x42 => (Inst::BgtUn(long(read_i32(bytes, operand)?)), 5),
        0x43 => (Inst::BleUn(long(read_i32(bytes, operand)?)), 5),
        0x44 => (Inst::BltUn(long(read_i32(bytes, operand)?)), 5),

        0x46 => (Inst::LdInd(IndirectKind::I1), 1),
        0x47 => (Inst::LdInd(IndirectKind::U1), 1),
        0x48 => (Inst::LdInd(IndirectKind::I2), 1),
        0x49 => (Inst::LdInd(IndirectKind::U2), 1),
        0x4A => (Inst::LdInd(IndirectKind::I4), 1),
        0x4B => (Inst::LdInd(IndirectKind::U4), 1),
        0x4D => (Inst::LdInd(IndirectKind::I), 1),
        0x50 => (Inst::LdInd(IndirectKind::Ref), 1),

        0x51 => (Inst::StInd(IndirectKind::Ref), 1),
        0x52 => (Inst::StInd(IndirectKind::I1), 1),
        0x53 => (Inst::StInd(IndirectKind::I2), 1),
        0x54 => (Inst::StInd(IndirectKind::I4), 1),
        0xDF => (Inst::StInd(IndirectKind::I), 1),

        0x58 => (Inst::Add, 1),
        0x59 => (Inst::Sub, 1),
        0x5A => (Inst::Mul, 1),
        0x5B => (Inst::Div, 1),
        0x5C => (Inst::DivUn, 1),
        0x5D => (Inst::Rem, 1),
        0x5E => (Inst::RemUn, 1),
        0x5F => (Inst::And, 1),
        0x60 => (Inst::Or, 1),
        0x61 => (Inst::Xor, 1),
        0x62 => (Inst::Shl, 1),
        0x63 => (Inst::Shr, 1),
        0x64 => (Inst::ShrUn, 1),
        0x65 => (Inst::Neg, 1),
        0x66 => (Inst::Not, 1),

        0x67 => (Inst::Conv(ConvTarget::I1), 1),
        0x68 => (Inst::Conv(ConvTarget::I2), 1),
        0x69 => (Inst::Conv(ConvTarget::I4), 1),
        0x6A => (Inst::Conv(ConvTarget::I8), 1),
        0x6D => (Inst::Conv(ConvTarget::U4), 1),
        0x6E => (Inst::Conv(ConvTarget::U8), 1),
        0xD1 => (Inst::Conv(ConvTarget::U2), 1),
        0xD2 => (Inst::Conv(ConvTarget::U1), 1),
        0xD3 => (Inst::Conv(ConvTarget::I), 1),
        0xE0 => (Inst::Conv(ConvTarget::U), 1),

        0x6F => (Inst::CallVirt(read_token(bytes, operand)?), 5),
        0x72 => (Inst::LdStr(read_token(bytes, operand)?), 5),
        0x73 => (Inst::NewObj(read_token(bytes, operand)?), 5),

        0x75 => (Inst::IsInst(read_token(bytes, operand)?), 5),

        0x7A => (Inst::Throw, 1),

        0x7E => (Inst::LdSFld(read_token(bytes, operand)?), 5),
        0x7F => (Inst::LdSFldA(read_token(bytes, operand)?), 5),
        0x80 => (Inst::StSFld(read_token(bytes, operand)?), 5),

        0x8D => (Inst::NewArr(read_token(bytes, operand)?), 5),

        0xDC => (Inst::EndFinally, 1),
        0xDD => (Inst::Leave(long(read_i32(bytes, operand)?)), 5),
        0xDE => (Inst::Leave(short(read_i8(bytes, operand)?)), 2),

        0xFE => {
            let ext = read_u8(bytes, operand)?;
            let operand = offset + 2;
            match ext {
                0x01 => (Inst::Ceq, 2),
                0x02 => (Inst::Cgt, 2),
                0x03 => (Inst::CgtUn, 2),
                0x04 => (Inst::Clt, 2),
                0x05 => (Inst::CltUn, 2),
                0x06 => (Inst::LdFtn(read_token(bytes, operand)?), 6),
                0x09 => (Inst::LdArg(read_u16(bytes, operand)?), 4),
                0x0A => (Inst::LdArgA(read_u16(bytes, operand)?), 4),
                0x0B => (Inst::StArg(read_u16(bytes, operand)?), 4),
                0x0C => (Inst::LdLoc(read_u16(bytes, operand)?), 4),
                0x0D => (Inst::LdLocA(read_u16(bytes, operand)?), 4),
                0x0E => (Inst::StLoc(read_u16(bytes, operand)?), 4),
                0x15 => (Inst::InitObj(read_token(bytes, operand)?), 6),
                0x16 => (Inst::Constrained(read_token(bytes, operand)?), 6),
                _ => {
                    return Err(CilError::UnknownExtOpcode { byte: ext, offset });
                }
            }
        }

        _ => {
            return Err(CilError::UnknownOpcode { byte: op, offset });
        }
    };

    Ok(Decoded { inst, len })
}
