//! Tests for the temp-slot pool, frame layout, and the evaluator.

use ilforge_cil::body::MethodBody;
use ilforge_cil::signature::MethodSignature;
use ilforge_cil::token::{table, Token};
use ilforge_cil::types::{ElementKind, ElementType};
use ilforge_target::{token_symbol, Reg, TraceBackend, TraceOp};

use crate::context::{CompileOptions, FrameLayout};
use crate::engine::Engine;
use crate::entity::{Place, StackEntity};
use crate::error::TranslateError;
use crate::holder::{AllocPolicy, TempPool};
use crate::testkit::TestWorld;

fn i4() -> ElementType {
    ElementType::new(ElementKind::I4)
}

fn void() -> ElementType {
    ElementType::new(ElementKind::Void)
}

fn void_sig() -> MethodSignature {
    MethodSignature::static_fn(vec![], void())
}

// -- Temp pool --

#[test]
fn pool_register_only_fails_when_empty() {
    let pool = TempPool::new(&[Reg(0), Reg(1)], 4);
    let a = pool.allocate(AllocPolicy::RegisterOnly, 4).unwrap();
    let b = pool.allocate(AllocPolicy::RegisterOnly, 4).unwrap();
    assert_eq!(a.register(), Some(Reg(0)));
    assert_eq!(b.register(), Some(Reg(1)));
    assert!(matches!(
        pool.allocate(AllocPolicy::RegisterOnly, 4),
        Err(TranslateError::RegisterExhausted)
    ));

    // Preferred-register falls back to a spill buffer instead.
    let c = pool.allocate(AllocPolicy::PreferredRegister, 4).unwrap();
    assert!(c.register().is_none());
    assert!(c.buffer().is_some());

    drop(a);
    let again = pool.allocate(AllocPolicy::RegisterOnly, 4).unwrap();
    assert_eq!(again.register(), Some(Reg(0)));

    drop(again);
    drop(b);
    drop(c);
    assert_eq!(pool.allocations(), pool.releases());
    assert_eq!(pool.free_registers(), 2);
}

#[test]
fn pool_buffers_align_and_reuse() {
    let pool = TempPool::new(&[], 4);
    let a = pool.allocate(AllocPolicy::StackOnly, 12).unwrap();
    assert_eq!(a.buffer(), Some((0, 12)));
    let b = pool.allocate(AllocPolicy::StackOnly, 4).unwrap();
    assert_eq!(b.buffer(), Some((12, 4)));
    assert_eq!(pool.spill_high_water(), 16);

    drop(a);
    // Exact-size reuse of the released range.
    let c = pool.allocate(AllocPolicy::StackOnly, 12).unwrap();
    assert_eq!(c.buffer(), Some((0, 12)));
    assert_eq!(pool.spill_high_water(), 16);

    drop(b);
    drop(c);
    assert_eq!(pool.allocations(), pool.releases());
}

#[test]
fn pool_aliases_and_pinned_never_release() {
    let pool = TempPool::new(&[Reg(0)], 4);
    let owner = pool.allocate(AllocPolicy::RegisterOnly, 4).unwrap();
    let view = owner.alias();
    assert_eq!(view.register(), Some(Reg(0)));
    assert!(!view.is_owned());
    drop(view);
    // The register is still taken: the alias did not release it.
    assert_eq!(pool.free_registers(), 0);

    let pinned = pool.pinned(Reg(14));
    assert_eq!(pinned.register(), Some(Reg(14)));
    drop(pinned);

    drop(owner);
    assert_eq!(pool.free_registers(), 1);
    assert_eq!(pool.allocations(), 1);
    assert_eq!(pool.releases(), 1);
}

// -- Frame layout --

#[test]
fn layout_places_args_and_locals_word_aligned() {
    let world = TestWorld::new();
    let sig = MethodSignature::static_fn(
        vec![i4(), ElementType::new(ElementKind::I8), ElementType::new(ElementKind::I2)],
        i4(),
    );
    let body = MethodBody::new(
        vec![0x2A],
        vec![ElementType::new(ElementKind::I2), i4()],
    );
    let layout = FrameLayout::compute(&sig, &body, &world, None, 4).unwrap();

    assert_eq!(layout.ret_buffer_arg, None);
    let arg_offsets: Vec<i32> = layout.args.iter().map(|a| a.offset).collect();
    assert_eq!(arg_offsets, vec![0, 4, 12]);
    let local_offsets: Vec<i32> = layout.locals.iter().map(|l| l.offset).collect();
    assert_eq!(local_offsets, vec![0, 4]);
}

#[test]
fn layout_inserts_hidden_return_buffer_argument() {
    let mut world = TestWorld::new();
    let big = world.define_value_type(0x30, 12);
    let sig = MethodSignature::static_fn(vec![i4()], ElementType::value_type(big));
    let body = MethodBody::new(vec![0x2A], vec![]);
    let layout = FrameLayout::compute(&sig, &body, &world, None, 4).unwrap();

    // Hidden buffer pointer first, declared parameter after it.
    assert_eq!(layout.ret_buffer_arg, Some(0));
    assert_eq!(layout.args.len(), 2);
    assert_eq!(layout.args[0].offset, 0);
    assert_eq!(layout.args[1].offset, 4);
}

#[test]
fn layout_counts_this_before_params() {
    let world = TestWorld::new();
    let sig = MethodSignature::instance_fn(vec![i4()], void());
    let body = MethodBody::new(vec![0x2A], vec![]);
    let layout = FrameLayout::compute(&sig, &body, &world, None, 4).unwrap();

    assert_eq!(layout.args.len(), 2);
    assert!(layout.args[0].ty.is_object_like());
    assert_eq!(layout.args[1].offset, 4);
}

// -- Entities --

#[test]
fn entity_slot_invariant() {
    let pool = TempPool::new(&[Reg(0)], 4);
    let sym = StackEntity::constant(i4(), 3);
    assert!(sym.slot_invariant_holds());
    let local = StackEntity::local(0, i4());
    assert!(local.slot_invariant_holds());

    let slot = pool.allocate(AllocPolicy::RegisterOnly, 4).unwrap();
    let reg = StackEntity::register(slot, i4());
    assert!(reg.slot_invariant_holds());
    assert_eq!(reg.place, Place::Register);

    let view = reg.fork_view();
    assert!(view.slot_invariant_holds());
    assert!(!view.slot.as_ref().unwrap().is_owned());
}

// -- Evaluator --

fn simple_engine<'a>(
    backend: &'a mut TraceBackend,
    world: &'a TestWorld,
    options: &'a CompileOptions,
    sig: &'a MethodSignature,
    body: &'a MethodBody,
) -> Engine<'a, TraceBackend> {
    Engine::new(
        backend,
        world,
        world,
        options,
        Token::new(table::METHOD_DEF, 1),
        sig,
        None,
        body,
    )
    .unwrap()
}

#[test]
fn const_evaluation_applies_offset_delta() {
    let world = TestWorld::new();
    let options = CompileOptions::default();
    let sig = void_sig();
    let body = MethodBody::new(vec![0x2A], vec![]);
    let mut backend = TraceBackend::new();
    {
        let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
        let mut a = StackEntity::constant(i4(), 100);
        let mut b = StackEntity::constant(i4(), 100);
        engine.evaluate(&mut a, 0, false).unwrap();
        engine.evaluate(&mut b, 12, false).unwrap();
    }
    let consts: Vec<i32> = backend
        .ops()
        .iter()
        .filter_map(|op| match op {
            TraceOp::LoadConst32 { value, .. } => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(consts, vec![100, 112]);
}

#[test]
fn eval_stack_roundtrip_balances_the_pool() {
    let world = TestWorld::new();
    let options = CompileOptions::default();
    let sig = MethodSignature::static_fn(vec![i4()], void());
    let body = MethodBody::new(vec![0x2A], vec![i4()]);
    let mut backend = TraceBackend::new();
    let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
    let pool = engine.ctx.pool.clone();

    let mut arg = StackEntity::argument(0, i4());
    let mut local = StackEntity::local(0, i4());
    let mut konst = StackEntity::constant(i4(), 9);
    engine.evaluate(&mut arg, 0, false).unwrap();
    engine.evaluate(&mut local, 0, true).unwrap();
    engine.evaluate(&mut konst, 0, false).unwrap();
    assert!(pool.allocations() >= 3);

    drop(arg);
    drop(local);
    drop(konst);
    drop(engine);
    assert_eq!(pool.allocations(), pool.releases());
    assert_eq!(pool.free_registers(), 6);
}

#[test]
fn temp_stack_pointer_evaluates_through_the_buffer() {
    let world = TestWorld::new();
    let options = CompileOptions::default();
    let sig = void_sig();
    let body = MethodBody::new(vec![0x2A], vec![]);
    let mut backend = TraceBackend::new();
    {
        let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
        let buf = engine.ctx.pool.allocate(AllocPolicy::StackOnly, 4).unwrap();
        let mut e = StackEntity::temp_stack_pointer(buf, i4());
        engine.evaluate(&mut e, 0, false).unwrap();
        assert_eq!(e.place, Place::Register);
    }
    // Pointer fetched from the spill slot, then dereferenced.
    assert!(matches!(backend.ops()[0], TraceOp::LoadSlot { .. }));
    assert!(matches!(backend.ops()[1], TraceOp::LoadMemory { .. }));
}

// -- store_var reference discipline --

#[test]
fn ref_store_decrements_old_then_increments_new() {
    let mut world = TestWorld::new();
    let class = world.define_type(0x10, 7, 8, vec![]);
    let options = CompileOptions::default();
    let sig = void_sig();
    let body = MethodBody::new(vec![0x2A], vec![ElementType::class(class)]);
    let dec_sym = token_symbol(0, world.helper_token(ilforge_cil::resolver::WellKnownMethod::DecRef));
    let inc_sym = token_symbol(0, world.helper_token(ilforge_cil::resolver::WellKnownMethod::IncRef));

    let mut backend = TraceBackend::new();
    {
        let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
        let src = StackEntity::null();
        let mut dst = StackEntity::local(0, ElementType::class(class));
        engine.store_var(src, &mut dst, 0).unwrap();
    }

    let calls = backend.called_symbols();
    assert_eq!(calls, vec![dec_sym.as_str(), inc_sym.as_str()]);

    // The store itself sits between the two reference-count calls.
    let dec_at = backend
        .ops()
        .iter()
        .position(|op| matches!(op, TraceOp::CallSymbol { symbol } if *symbol == dec_sym))
        .unwrap();
    let store_at = backend
        .ops()
        .iter()
        .position(|op| matches!(op, TraceOp::StoreSlot { .. }))
        .unwrap();
    let inc_at = backend
        .ops()
        .iter()
        .position(|op| matches!(op, TraceOp::CallSymbol { symbol } if *symbol == inc_sym))
        .unwrap();
    assert!(dec_at < store_at && store_at < inc_at);
}

#[test]
fn ref_store_of_a_value_into_itself_still_adjusts_counts() {
    let mut world = TestWorld::new();
    let class = world.define_type(0x10, 7, 8, vec![]);
    let options = CompileOptions::default();
    let sig = void_sig();
    let body = MethodBody::new(vec![0x2A], vec![ElementType::class(class)]);

    let mut backend = TraceBackend::new();
    {
        let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
        let src = StackEntity::local(0, ElementType::class(class));
        let mut dst = StackEntity::local(0, ElementType::class(class));
        engine.store_var(src, &mut dst, 0).unwrap();
    }

    // Exactly one decrement and one increment, in that order, even
    // though the net effect is neutral.
    let calls = backend.called_symbols();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].ends_with(&format!("tk{:08x}", 0x0600_0F07u32)));
    assert!(calls[1].ends_with(&format!("tk{:08x}", 0x0600_0F06u32)));
}

#[test]
fn wide_store_degrades_to_memcpy_helper() {
    let mut world = TestWorld::new();
    let big = world.define_value_type(0x30, 12);
    let options = CompileOptions::default();
    let sig = void_sig();
    let big_ty = ElementType::value_type(big);
    let body = MethodBody::new(vec![0x2A], vec![big_ty.clone(), big_ty.clone()]);
    let memcpy_sym =
        token_symbol(0, world.helper_token(ilforge_cil::resolver::WellKnownMethod::MemCpy));

    let mut backend = TraceBackend::new();
    {
        let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
        let src = StackEntity::local(1, big_ty.clone());
        let mut dst = StackEntity::local(0, big_ty.clone());
        engine.store_var(src, &mut dst, 0).unwrap();
    }

    assert_eq!(backend.called_symbols(), vec![memcpy_sym.as_str()]);
    // Three word-sized helper arguments: destination, source, size.
    let pushes = backend
        .ops()
        .iter()
        .filter(|op| matches!(op, TraceOp::PushArg32 { .. }))
        .count();
    assert_eq!(pushes, 3);
    // The size constant is the full payload width.
    assert!(backend
        .ops()
        .iter()
        .any(|op| matches!(op, TraceOp::LoadConst32 { value: 12, .. })));
}

#[test]
fn wide_value_load_is_a_hard_error() {
    let mut world = TestWorld::new();
    let big = world.define_value_type(0x30, 12);
    let options = CompileOptions::default();
    let sig = void_sig();
    let big_ty = ElementType::value_type(big);
    let body = MethodBody::new(vec![0x2A], vec![big_ty.clone()]);

    let mut backend = TraceBackend::new();
    let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
    let mut e = StackEntity::local(0, big_ty);
    let err = engine.evaluate(&mut e, 0, false).unwrap_err();
    assert!(matches!(err, TranslateError::UnsupportedStructWidth { size: 12 }));
}

#[test]
fn wide_constant_store_spills_before_the_copy() {
    let world = TestWorld::new();
    let options = CompileOptions::default();
    let sig = void_sig();
    let i8_ty = ElementType::new(ElementKind::I8);
    let body = MethodBody::new(vec![0x2A], vec![i8_ty.clone()]);

    let mut backend = TraceBackend::new();
    {
        let mut engine = simple_engine(&mut backend, &world, &options, &sig, &body);
        let src = StackEntity::constant64(i8_ty.clone(), 0x1_0000_0002);
        let mut dst = StackEntity::local(0, i8_ty);
        engine.store_var(src, &mut dst, 0).unwrap();
    }

    // Both constant halves land in the spill buffer before the copy.
    let halves: Vec<i32> = backend
        .ops()
        .iter()
        .filter_map(|op| match op {
            TraceOp::LoadConst32 { value, .. } => Some(*value),
            _ => None,
        })
        .collect();
    assert!(halves.contains(&2));
    assert!(halves.contains(&1));
    let spill_stores = backend
        .ops()
        .iter()
        .filter(|op| matches!(op, TraceOp::StoreSlot { slot: ilforge_target::FrameSlot::Temp(_), .. }))
        .count();
    assert_eq!(spill_stores, 2);
    // The copy itself is the memcpy helper.
    assert_eq!(backend.called_symbols().len(), 1);
}
