use crate::ir::{CastKind, Module, ModuleBuilder, Ty};

#[cfg(test)]
use crate::analysis::{CallGraphSccs, FunctionSummary};
#[cfg(test)]
use crate::ir::{Attr, AttrKindTag, BinOpKind, IcmpPred, Opcode};
#[cfg(test)]
use crate::lattice::{AbstractState, BitSetState, BooleanState, ChangeStatus, SignedRange};
#[cfg(test)]
use crate::reader::parse_module;

#[cfg(test)]
fn ensure_test_logger() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let guard =
            slog_scope::set_global_logger(slog::Logger::root(slog::Discard, slog::o!()));
        // Tests run concurrently; the discard logger must outlive them all.
        std::mem::forget(guard);
    });
}

#[cfg(test)]
fn run_engine(m: &mut Module) -> bool {
    ensure_test_logger();
    crate::callgraph::run_on_module(m)
}

/// Two functions: `@f` returns a constant, `@g` forwards it, `@h` calls `@g` and returns the
/// result through a zero-extension.
pub fn constant_chain_module() -> Module {
    let mut b = ModuleBuilder::new();

    let f = b.begin_function("f", Ty::Int(32), vec![]);
    let c42 = b.const_int(32, 42);
    b.ret(Some(c42));
    b.end_function();

    let g = b.begin_function("g", Ty::Int(32), vec![Ty::Int(32)]);
    let call = b.call(f, vec![]);
    b.ret(Some(call));
    b.end_function();

    b.begin_function("h", Ty::Int(64), vec![]);
    let one = b.const_int(32, 1);
    let r = b.call(g, vec![one]);
    let wide = b.cast(CastKind::ZExt, r, Ty::Int(64));
    b.ret(Some(wide));
    b.end_function();

    b.finish()
}

/// A function that offsets a pointer argument annotated with pointer facts.
pub fn pointer_offset_text() -> &'static str {
    "define i8* @h(i8* dereferenceable(16) nonnull %p) {\n\
     entry:\n\
     \x20 %q = gep i8* %p, i64 4\n\
     \x20 ret i8* %q\n\
     }\n"
}

/// A function allocating, touching, and freeing 32 heap bytes.
pub fn malloc_free_text() -> &'static str {
    "declare i8* @malloc(i64)\n\
     declare void @free(i8*)\n\
     define void @k() {\n\
     entry:\n\
     \x20 %m = call i8* @malloc(i64 32)\n\
     \x20 store i8 0, i8* %m\n\
     \x20 call void @free(i8* %m)\n\
     \x20 ret void\n\
     }\n"
}

/// An internal comparator whose callers only pass small constants.
pub fn bounded_compare_text() -> &'static str {
    "define internal i1 @cmp(i32 %x) {\n\
     entry:\n\
     \x20 %c = icmp ult i32 %x, i32 10\n\
     \x20 ret i1 %c\n\
     }\n\
     define i32 @driver() {\n\
     entry:\n\
     \x20 %a = call i1 @cmp(i32 3)\n\
     \x20 %b = call i1 @cmp(i32 5)\n\
     \x20 %aw = zext i1 %a to i32\n\
     \x20 %bw = zext i1 %b to i32\n\
     \x20 %s = add i32 %aw, i32 %bw\n\
     \x20 ret i32 %s\n\
     }\n"
}

pub fn self_recursion_text() -> &'static str {
    "define void @rec() {\n\
     entry:\n\
     \x20 call void @rec()\n\
     \x20 ret void\n\
     }\n"
}

pub fn infinite_loop_text() -> &'static str {
    "define void @inf() {\n\
     entry:\n\
     \x20 br label %loop\n\
     loop:\n\
     \x20 br label %loop\n\
     }\n"
}

pub fn bounded_loop_text() -> &'static str {
    "define void @bounded(i1 %c) {\n\
     entry:\n\
     \x20 br label %loop\n\
     loop: !max_trip_count(8)\n\
     \x20 condbr i1 %c, label %loop, label %exit\n\
     exit:\n\
     \x20 ret void\n\
     }\n"
}

// ---- lattice ---------------------------------------------------------------

#[test]
fn boolean_state_moves_one_way() {
    let mut s = BooleanState::default();
    assert!(s.assumed());
    assert!(!s.known());
    assert!(!s.is_at_fixpoint());

    assert_eq!(s.intersect_assumed(true), ChangeStatus::Unchanged);
    assert_eq!(s.intersect_assumed(false), ChangeStatus::Changed);
    assert!(!s.assumed());
    assert!(s.is_at_fixpoint());
    assert!(!s.is_valid());
}

#[test]
fn boolean_state_known_pulls_assumed() {
    let mut s = BooleanState::default();
    assert_eq!(s.set_known(), ChangeStatus::Changed);
    assert!(s.assumed() && s.known());
    assert!(s.is_at_fixpoint());
    // Freezing at the current assumed value is a no-op now.
    assert_eq!(s.indicate_optimistic_fixpoint(), ChangeStatus::Unchanged);
}

#[test]
fn bit_set_state_keeps_known_bits() {
    let mut s = BitSetState::new(0b111);
    s.add_known_bits(0b001);
    assert_eq!(s.remove_assumed_bits(0b011), ChangeStatus::Changed);
    // The known bit survives removal.
    assert!(s.is_assumed(0b001));
    assert!(!s.is_assumed(0b010));
    assert!(s.is_assumed(0b100));
}

#[test]
fn signed_range_arithmetic() {
    let a = SignedRange::new(1, 3);
    let b = SignedRange::new(10, 20);
    assert_eq!(a.add(&b), SignedRange::new(11, 23));
    assert_eq!(b.sub(&a), SignedRange::new(7, 19));
    assert_eq!(a.mul(&b), SignedRange::new(10, 60));
    assert!(SignedRange::full().contains_range(&a));
    assert!(a.union(&b).contains_range(&b));
    assert!(a.intersect(&b).is_empty());
}

#[test]
fn signed_range_comparisons() {
    let small = SignedRange::new(0, 5);
    let ten = SignedRange::constant(10);
    assert_eq!(
        SignedRange::cmp_always(IcmpPred::Ult, &small, &ten),
        Some(true)
    );
    assert_eq!(
        SignedRange::cmp_always(IcmpPred::Ugt, &small, &ten),
        Some(false)
    );
    assert_eq!(
        SignedRange::cmp_always(IcmpPred::Eq, &small, &ten),
        Some(false)
    );
    // Overlap leaves the comparison undecided.
    assert_eq!(
        SignedRange::cmp_always(IcmpPred::Ult, &small, &SignedRange::new(3, 4)),
        None
    );
    // Unsigned predicates on possibly-negative ranges stay undecided.
    assert_eq!(
        SignedRange::cmp_always(IcmpPred::Ult, &SignedRange::new(-1, 5), &ten),
        None
    );
}

// ---- containers ------------------------------------------------------------

#[test]
fn insertion_ordered_set_deduplicates() {
    let mut s = crate::containers::InsertionOrderedSet::new();
    assert!(s.insert(3));
    assert!(s.insert(1));
    assert!(!s.insert(3));
    assert!(s.insert(2));
    assert_eq!(s.into_vec(), vec![3, 1, 2]);
}

// ---- structural analyses ---------------------------------------------------

#[test]
fn dominators_on_a_diamond() {
    let mut b = ModuleBuilder::new();
    let f = b.begin_function("d", Ty::Void, vec![Ty::Int(1)]);
    let cond = b.arg(f, 0);
    let entry = crate::ir::Block(0);
    let left = b.begin_block("left");
    let right = b.begin_block("right");
    let join = b.begin_block("join");
    b.switch_to_block(entry);
    b.cond_br(cond, left, right);
    b.switch_to_block(left);
    b.br(join);
    b.switch_to_block(right);
    b.br(join);
    b.switch_to_block(join);
    b.ret(None);
    b.end_function();
    let m = b.finish();

    let summary = FunctionSummary::compute(&m, f);
    assert!(summary.dominates_block(entry, left));
    assert!(summary.dominates_block(entry, join));
    assert!(!summary.dominates_block(left, join));
    assert!(!summary.has_cycle());
}

#[test]
fn cycles_and_trip_bounds() {
    ensure_test_logger();
    let m = parse_module(bounded_loop_text());
    let f = m.func_by_name("bounded").unwrap();
    let summary = FunctionSummary::compute(&m, f);
    assert!(summary.has_cycle());
    assert!(summary.all_cycles_bounded(&m));

    let m = parse_module(infinite_loop_text());
    let f = m.func_by_name("inf").unwrap();
    let summary = FunctionSummary::compute(&m, f);
    assert!(summary.has_cycle());
    assert!(!summary.all_cycles_bounded(&m));
}

#[test]
fn call_graph_sccs_spot_recursion() {
    ensure_test_logger();
    let m = parse_module(self_recursion_text());
    let sccs = CallGraphSccs::compute(&m);
    assert!(sccs.in_cycle(m.func_by_name("rec").unwrap()));

    let m = constant_chain_module();
    let sccs = CallGraphSccs::compute(&m);
    for f in m.funcs() {
        assert!(!sccs.in_cycle(f));
    }
}

// ---- reader / printer ------------------------------------------------------

#[test]
fn reader_round_trips() {
    for text in [
        pointer_offset_text(),
        malloc_free_text(),
        bounded_compare_text(),
        self_recursion_text(),
        bounded_loop_text(),
    ] {
        let m1 = parse_module(text);
        let printed1 = format!("{}", m1);
        let m2 = parse_module(&printed1);
        let printed2 = format!("{}", m2);
        assert_eq!(printed1, printed2);
    }
}

// ---- end-to-end ------------------------------------------------------------

#[test]
fn constant_chain_folds_and_annotates() {
    let mut m = constant_chain_module();
    assert!(run_engine(&mut m));

    let f = m.func_by_name("f").unwrap();
    for attr in [Attr::WillReturn, Attr::NoUnwind, Attr::ReadNone] {
        assert!(
            m.func(f).fn_attrs.iter().any(|a| *a == attr),
            "@f missing {:?}",
            attr
        );
    }
    let g = m.func_by_name("g").unwrap();
    assert!(m.func(g).fn_attrs.iter().any(|a| *a == Attr::WillReturn));

    // The result of `call @g` in @h has been folded to the constant.
    let h = m.func_by_name("h").unwrap();
    let zext_operand = m
        .insts_of_func(h)
        .find_map(|v| match m.expect_inst(v).op {
            Opcode::Cast(CastKind::ZExt) => Some(m.expect_inst(v).operands[0]),
            _ => None,
        })
        .expect("zext survives");
    assert_eq!(m.is_int_const(zext_operand), Some(42));
}

#[test]
fn pointer_facts_flow_to_the_return() {
    let mut m = parse_module(pointer_offset_text());
    run_engine(&mut m);

    let h = m.func_by_name("h").unwrap();
    assert!(m.func(h).ret_attrs.has(AttrKindTag::NonNull));
    match m.func(h).ret_attrs.get(AttrKindTag::Dereferenceable) {
        Some(Attr::Dereferenceable(n)) => assert_eq!(n, 12),
        other => panic!("expected dereferenceable(12) on the return, got {:?}", other),
    }
}

#[test]
fn heap_allocation_moves_to_the_stack() {
    let mut m = parse_module(malloc_free_text());
    assert!(run_engine(&mut m));

    let k = m.func_by_name("k").unwrap();
    let mut saw_alloca = false;
    for v in m.insts_of_func(k) {
        let inst = m.expect_inst(v);
        match &inst.op {
            Opcode::Alloca { allocated } => {
                saw_alloca = true;
                assert_eq!(allocated.size_in_bytes(), 32);
            }
            op if op.is_call_like() => {
                let callee = m.callee_of(v).map(|f| m.func(f).name.clone());
                panic!("allocation call survived: {:?}", callee);
            }
            _ => {}
        }
    }
    assert!(saw_alloca, "no stack slot was introduced");
}

#[test]
fn ranges_decide_the_comparison() {
    let mut m = parse_module(bounded_compare_text());
    assert!(run_engine(&mut m));

    // The comparator now returns the constant.
    let cmp = m.func_by_name("cmp").unwrap();
    let ret_operand = m
        .insts_of_func(cmp)
        .find_map(|v| {
            let inst = m.expect_inst(v);
            match inst.op {
                Opcode::Ret if !inst.operands.is_empty() => Some(inst.operands[0]),
                _ => None,
            }
        })
        .expect("cmp keeps its return");
    assert_eq!(m.is_int_const(ret_operand), Some(1));

    // And both call results in the driver folded to true.
    let driver = m.func_by_name("driver").unwrap();
    for v in m.insts_of_func(driver) {
        if let Opcode::Cast(CastKind::ZExt) = m.expect_inst(v).op {
            let operand = m.expect_inst(v).operands[0];
            assert_eq!(m.is_int_const(operand), Some(1));
        }
    }
}

#[test]
fn self_recursion_never_returns() {
    let mut m = parse_module(self_recursion_text());
    assert!(run_engine(&mut m));

    let rec = m.func_by_name("rec").unwrap();
    assert!(m.func(rec).fn_attrs.has(AttrKindTag::NoReturn));
    // The trailing `ret` is unreachable and got cut.
    assert!(m
        .insts_of_func(rec)
        .all(|v| !matches!(m.expect_inst(v).op, Opcode::Ret)));
    let entry = m.entry_block(rec).unwrap();
    let last = m.insts_of(entry).last().unwrap();
    assert!(matches!(m.expect_inst(last).op, Opcode::Unreachable));
}

#[test]
fn unbounded_loops_block_willreturn_only() {
    let mut m = parse_module(infinite_loop_text());
    run_engine(&mut m);

    let inf = m.func_by_name("inf").unwrap();
    assert!(!m.func(inf).fn_attrs.has(AttrKindTag::WillReturn));
    assert!(m.func(inf).fn_attrs.has(AttrKindTag::NoUnwind));
}

#[test]
fn bounded_loops_still_willreturn() {
    let mut m = parse_module(bounded_loop_text());
    run_engine(&mut m);

    let f = m.func_by_name("bounded").unwrap();
    assert!(m.func(f).fn_attrs.has(AttrKindTag::WillReturn));
}

#[test]
fn rerunning_reaches_a_stable_module() {
    // The first run rewrites the IR after its facts settled, so a second run may legitimately
    // learn more (the freed-then-deleted call no longer blocks `nofree`). From then on the output
    // must stop moving.
    let mut m = parse_module(malloc_free_text());
    run_engine(&mut m);
    run_engine(&mut m);
    let second = format!("{}", m);
    run_engine(&mut m);
    let third = format!("{}", m);
    assert_eq!(second, third);
}

#[test]
fn live_code_survives() {
    // Both branches of an undecidable condition stay, as does everything they use.
    let text = "define i32 @pick(i1 %c, i32 %x, i32 %y) {\n\
                entry:\n\
                \x20 condbr i1 %c, label %a, label %b\n\
                a:\n\
                \x20 %xa = add i32 %x, i32 1\n\
                \x20 ret i32 %xa\n\
                b:\n\
                \x20 %yb = add i32 %y, i32 2\n\
                \x20 ret i32 %yb\n\
                }\n";
    let mut m = parse_module(text);
    run_engine(&mut m);

    let f = m.func_by_name("pick").unwrap();
    assert_eq!(m.blocks_of(f).count(), 3);
    let adds = m
        .insts_of_func(f)
        .filter(|&v| matches!(m.expect_inst(v).op, Opcode::BinOp(BinOpKind::Add)))
        .count();
    assert_eq!(adds, 2);
}

#[test]
fn dead_branch_is_pruned() {
    // A constant condition settles the branch; the untaken side goes away.
    let text = "define i32 @taken() {\n\
                entry:\n\
                \x20 condbr i1 1, label %a, label %b\n\
                a:\n\
                \x20 ret i32 7\n\
                b:\n\
                \x20 ret i32 8\n\
                }\n";
    let mut m = parse_module(text);
    assert!(run_engine(&mut m));

    let f = m.func_by_name("taken").unwrap();
    let names: Vec<String> = m.blocks_of(f).map(|b| m.block(b).name.clone()).collect();
    assert!(names.contains(&"a".to_owned()));
    assert!(!names.contains(&"b".to_owned()));
}

#[test]
fn readonly_argument_is_deduced() {
    let text = "define internal i32 @peek(i32* %p) {\n\
                entry:\n\
                \x20 %v = load i32, i32* %p\n\
                \x20 ret i32 %v\n\
                }\n\
                define i32 @use(i32* %q) {\n\
                entry:\n\
                \x20 %r = call i32 @peek(i32* %q)\n\
                \x20 ret i32 %r\n\
                }\n";
    let mut m = parse_module(text);
    run_engine(&mut m);

    let peek = m.func_by_name("peek").unwrap();
    assert!(m.func(peek).arg_attrs[0].has(AttrKindTag::ReadOnly));
    assert!(m.func(peek).arg_attrs[0].has(AttrKindTag::NoCapture));
    assert!(m.func(peek).fn_attrs.has(AttrKindTag::ReadOnly));
}

#[test]
fn argument_alignment_from_call_sites() {
    // The zero-offset pointer adjustment keeps the argument out of privatization's reach while
    // preserving the alignment of the underlying slot.
    let text = "define internal void @sink(i64* %p) {\n\
                entry:\n\
                \x20 store i64 0, i64* %p\n\
                \x20 ret void\n\
                }\n\
                define void @caller() {\n\
                entry:\n\
                \x20 %slot = alloca i64\n\
                \x20 %adj = gep i64* %slot, i64 0\n\
                \x20 call void @sink(i64* %adj)\n\
                \x20 ret void\n\
                }\n";
    let mut m = parse_module(text);
    run_engine(&mut m);

    let sink = m.func_by_name("sink").unwrap();
    match m.func(sink).arg_attrs[0].get(AttrKindTag::Align) {
        Some(Attr::Align(n)) => assert!(n >= 8, "expected at least 8-byte alignment, got {}", n),
        other => panic!("expected an align attribute, got {:?}", other),
    }
}

#[test]
fn alloca_backed_argument_is_privatized() {
    let text = "define internal void @store0(i64* %p) {\n\
                entry:\n\
                \x20 store i64 7, i64* %p\n\
                \x20 ret void\n\
                }\n\
                define void @caller() {\n\
                entry:\n\
                \x20 %slot = alloca i64\n\
                \x20 call void @store0(i64* %slot)\n\
                \x20 ret void\n\
                }\n";
    let mut m = parse_module(text);
    assert!(run_engine(&mut m));

    // The pointer argument was split into its (single) field; the rebuilt stack slot lives in the
    // callee now.
    let store0 = m.func_by_name("store0").unwrap();
    assert_eq!(m.func(store0).ty.params, vec![Ty::Int(64)]);
    let has_scratch = m
        .insts_of_func(store0)
        .any(|v| matches!(m.expect_inst(v).op, Opcode::Alloca { .. }));
    assert!(has_scratch, "expected a rebuilt stack slot in the callee");
}
