//! Tests for symbol naming and the trace backend.

use ilforge_cil::token::{table, Token};

use crate::backend::{Backend, Cond, Extend, FrameSlot, Reg};
use crate::symbol::{cleanup_symbol, token_symbol};
use crate::trace::{TraceBackend, TraceOp};

#[test]
fn symbol_names_are_deterministic() {
    let m = Token::new(table::METHOD_DEF, 42);
    assert_eq!(token_symbol(3, m), "ap3_tk0600002a");
    assert_eq!(token_symbol(3, m), token_symbol(3, m));
    // Different apartment, different symbol.
    assert_ne!(token_symbol(3, m), token_symbol(4, m));

    let s = Token::new(table::USER_STRING, 0x11);
    assert_eq!(token_symbol(0, s), "ap0_tk70000011");

    assert_eq!(cleanup_symbol(1, m, 0x20), "ap1_tk0600002a_fin20");
}

#[test]
fn trace_backend_records_in_order() {
    let mut b = TraceBackend::new();
    b.load_const32(Reg(0), 7);
    b.add32(Reg(0), Reg(1));
    b.jump_cond(Cond::NonZero, Reg(0), 0x10);
    b.emit_return();

    assert_eq!(
        b.ops(),
        &[
            TraceOp::LoadConst32 { dst: Reg(0), value: 7 },
            TraceOp::Add32 { dst: Reg(0), src: Reg(1) },
            TraceOp::JumpCond { cond: Cond::NonZero, reg: Reg(0), target: 0x10 },
            TraceOp::Return,
        ]
    );
    assert_eq!(b.jump_targets(), vec![(Some(Cond::NonZero), 0x10)]);
}

#[test]
fn trace_backend_tracks_outgoing_args() {
    let mut b = TraceBackend::new();
    assert_eq!(b.stack_size(), 0);
    b.push_arg32(Reg(2));
    b.push_arg32(Reg(3));
    assert_eq!(b.stack_size(), 8);
    b.adjust_stack(16);
    assert_eq!(b.stack_size(), 24);
    b.revert_stack(24);
    assert_eq!(b.stack_size(), 0);
}

#[test]
fn trace_backend_frame_ops_carry_slots() {
    let mut b = TraceBackend::new();
    b.load_slot(Reg(1), FrameSlot::Arg(4), 4, Extend::Sign);
    b.store_slot(FrameSlot::Local(0), Reg(1), 4);
    assert_eq!(
        b.ops(),
        &[
            TraceOp::LoadSlot { dst: Reg(1), slot: FrameSlot::Arg(4), size: 4, extend: Extend::Sign },
            TraceOp::StoreSlot { slot: FrameSlot::Local(0), src: Reg(1), size: 4 },
        ]
    );
}
