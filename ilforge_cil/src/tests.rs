//! Tests for the instruction decoder and type descriptors.

use crate::inst::{decode, ConvTarget, Inst};
use crate::token::{table, Token};
use crate::types::{ElementKind, ElementType, LoadWiden};

#[test]
fn decode_short_forms_normalize() {
    // ldarg.0 ldarg.1 ldloc.2 stloc.3
    let bytes = [0x02, 0x03, 0x08, 0x0D];
    let d0 = decode(&bytes, 0).unwrap();
    let d1 = decode(&bytes, 1).unwrap();
    let d2 = decode(&bytes, 2).unwrap();
    let d3 = decode(&bytes, 3).unwrap();
    assert_eq!(d0.inst, Inst::LdArg(0));
    assert_eq!(d1.inst, Inst::LdArg(1));
    assert_eq!(d2.inst, Inst::LdLoc(2));
    assert_eq!(d3.inst, Inst::StLoc(3));
    assert!([d0, d1, d2, d3].iter().all(|d| d.len == 1));
}

#[test]
fn decode_s_and_long_forms_agree() {
    // ldloc.s 17
    let short = decode(&[0x11, 17], 0).unwrap();
    assert_eq!(short.inst, Inst::LdLoc(17));
    assert_eq!(short.len, 2);

    // 0xFE-prefixed ldloc with a 16-bit index
    let long = decode(&[0xFE, 0x0C, 17, 0x00], 0).unwrap();
    assert_eq!(long.inst, Inst::LdLoc(17));
    assert_eq!(long.len, 4);
}

#[test]
fn decode_ldc_payloads() {
    assert_eq!(decode(&[0x15], 0).unwrap().inst, Inst::LdcI4(-1));
    assert_eq!(decode(&[0x1A], 0).unwrap().inst, Inst::LdcI4(4));
    assert_eq!(decode(&[0x1F, 0xF0], 0).unwrap().inst, Inst::LdcI4(-16));
    assert_eq!(
        decode(&[0x20, 0x78, 0x56, 0x34, 0x12], 0).unwrap().inst,
        Inst::LdcI4(0x12345678)
    );
    assert_eq!(
        decode(&[0x21, 1, 0, 0, 0, 0, 0, 0, 0x80], 0).unwrap().inst,
        Inst::LdcI8(i64::MIN + 1)
    );
}

#[test]
fn decode_branch_targets_are_absolute() {
    // offset 0: br.s +2  → target = 0 + 2 + 2 = 4
    let fwd = decode(&[0x2B, 0x02], 0).unwrap();
    assert_eq!(fwd.inst, Inst::Br(4));

    // offset 4: blt.s -6 → target = 4 + 2 - 6 = 0
    let bytes = [0x00, 0x00, 0x00, 0x00, 0x32, 0xFA];
    let back = decode(&bytes, 4).unwrap();
    assert_eq!(back.inst, Inst::Blt(0));
    assert_eq!(back.inst.branch_target(), Some(0));
    assert!(back.inst.is_conditional_branch());

    // long form: offset 0: br +1 → target = 0 + 5 + 1 = 6
    let long = decode(&[0x38, 0x01, 0x00, 0x00, 0x00], 0).unwrap();
    assert_eq!(long.inst, Inst::Br(6));
}

#[test]
fn decode_extended_opcodes() {
    assert_eq!(decode(&[0xFE, 0x01], 0).unwrap().inst, Inst::Ceq);
    assert_eq!(decode(&[0xFE, 0x05], 0).unwrap().inst, Inst::CltUn);

    let d = decode(&[0xFE, 0x06, 0x01, 0x00, 0x00, 0x06], 0).unwrap();
    assert_eq!(d.inst, Inst::LdFtn(Token::new(table::METHOD_DEF, 1)));
    assert_eq!(d.len, 6);
}

#[test]
fn decode_rejects_unknown_opcodes() {
    assert!(decode(&[0xC2], 0).is_err());
    assert!(decode(&[0xFE, 0x7F], 0).is_err());
    // Truncated operand.
    assert!(decode(&[0x20, 0x01], 0).is_err());
}

#[test]
fn conv_target_widths() {
    assert_eq!(ConvTarget::I1.width(4), 1);
    assert_eq!(ConvTarget::U8.width(4), 8);
    assert_eq!(ConvTarget::I.width(4), 4);
    assert_eq!(ConvTarget::U.width(8), 8);
    assert!(ConvTarget::I2.is_signed());
    assert!(!ConvTarget::U2.is_signed());
}

#[test]
fn token_split() {
    let t = Token::new(table::MEMBER_REF, 0x123456);
    assert_eq!(t.table(), table::MEMBER_REF);
    assert_eq!(t.index(), 0x123456);
    assert_eq!(t.raw(), 0x0A123456);
    assert!(!t.is_null());
    assert!(Token::from_raw(0).is_null());
}

#[test]
fn load_widen_classification() {
    let i2 = ElementType::new(ElementKind::I2);
    let u2 = ElementType::new(ElementKind::U2);
    let obj = ElementType::new(ElementKind::Object);
    let ptr = ElementType::new(ElementKind::I4).pointer_to();
    let r4 = ElementType::new(ElementKind::R4);

    assert_eq!(i2.load_widen(), Some(LoadWiden::Sign));
    assert_eq!(u2.load_widen(), Some(LoadWiden::Zero));
    assert_eq!(obj.load_widen(), Some(LoadWiden::Zero));
    assert_eq!(ptr.load_widen(), Some(LoadWiden::Zero));
    assert_eq!(r4.load_widen(), None);
}

#[test]
fn object_classification() {
    let obj = ElementType::new(ElementKind::String);
    assert!(obj.is_object_like());
    assert!(obj.carries_reference());

    let ptr_to_obj = ElementType::new(ElementKind::Object).pointer_to();
    assert!(!ptr_to_obj.is_object_like());
    assert!(ptr_to_obj.carries_reference());

    let vt = ElementType::value_type(Token::new(table::TYPE_DEF, 7));
    assert!(vt.is_value_type());
    assert_eq!(vt.fixed_size(4), None);
}
