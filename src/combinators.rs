//! Reusable deduction steps shared by the attribute catalogue.
//!
//! Most attributes deduce the same few shapes of fact: "whatever holds for every returned value
//! holds for the return", "whatever every call site passes holds for the argument", "the call-site
//! mirror holds whatever the callee position holds", and "a use that provably executes whenever
//! the context does may tighten the fact". These are factored out here; attributes compose them
//! and fold the results into their own lattice state.

use crate::analysis::{branch_sides, must_be_executed_context};
use crate::engine::{AttrKind, FixpointEngine, DepClass, Simplified};
use crate::ir::{Module, Opcode, UseRef, Val, ValueKind};
use crate::position::Position;

/// The position at which facts about `v` live: arguments and call results have dedicated
/// positions, everything else floats.
pub fn value_position(m: &Module, v: Val) -> Position {
    match &m.val(v).kind {
        ValueKind::Argument { func, index } => Position::Argument(*func, *index),
        ValueKind::Inst(inst) if inst.op.is_call_like() => Position::CallSiteReturned(v),
        _ => Position::Float(v),
    }
}

/// Leaves of the returned-value traversal for `f`, as positions, or `None` when a returned call
/// could not be resolved. Registers dependences via the returned-values record.
pub fn returned_value_positions(
    a: &mut FixpointEngine,
    f: crate::ir::Func,
    dep: DepClass,
) -> Option<Vec<(Val, Position)>> {
    let id = a.get_or_create(AttrKind::ReturnedValues, Position::Returned(f), dep);
    let values = match a.record(id) {
        Some(crate::engine::AbstractAttribute::ReturnedValues(rv)) if rv.is_complete() => {
            rv.returned_values()
        }
        _ => return None,
    };
    let m = a.module();
    Some(
        values
            .into_iter()
            .map(|v| (v, value_position(m, v)))
            .collect(),
    )
}

/// Clamp a boolean fact for a function-return position by the same fact at every returned value.
/// `None` means the returned values could not be enumerated and the state must pessimize.
pub fn bool_from_returned_values(
    a: &mut FixpointEngine,
    kind: AttrKind,
    f: crate::ir::Func,
) -> Option<bool> {
    let positions = returned_value_positions(a, f, DepClass::Required)?;
    let mut all = true;
    for (v, pos) in positions {
        if a.module().is_constant(v) && !a.module().is_null_const(v) {
            // Non-null constants satisfy every boolean pointer fact we track here.
            continue;
        }
        all &= a.is_assumed(kind, pos, DepClass::Required);
    }
    Some(all)
}

/// Clamp a boolean fact for an argument position by the same fact at the corresponding call-site
/// argument of every enumerable call site. `None` when the call sites cannot all be enumerated.
pub fn bool_from_call_site_args(
    a: &mut FixpointEngine,
    kind: AttrKind,
    f: crate::ir::Func,
    arg_index: usize,
) -> Option<bool> {
    let mut all = true;
    let complete = a.check_for_all_call_sites(f, |a, call| {
        if arg_index >= a.module().call_args(call).len() {
            // No operand maps to this argument at this site.
            return false;
        }
        all &= a.is_assumed(
            kind,
            Position::CallSiteArgument(call, arg_index),
            DepClass::Required,
        );
        true
    });
    complete.then_some(all)
}

/// Copy a boolean fact for a call-site position from the callee-side position. `None` when the
/// callee is not a direct function.
pub fn bool_from_callee(a: &mut FixpointEngine, kind: AttrKind, pos: Position) -> Option<(bool, bool)> {
    let m = a.module();
    let callee = pos.callee_func(m)?;
    let callee_pos = match pos {
        Position::CallSite(_) => Position::Function(callee),
        Position::CallSiteReturned(_) => Position::Returned(callee),
        Position::CallSiteArgument(_, i) => {
            if i >= m.func(callee).ty.params.len() {
                return None;
            }
            Position::Argument(callee, i)
        }
        _ => return None,
    };
    let assumed = a.is_assumed(kind, callee_pos, DepClass::Required);
    let known = a.is_known(kind, callee_pos, DepClass::Required);
    Some((assumed, known))
}

/// A use of the tracked value that executes under the position's context.
pub enum ExecutedUse {
    /// Executes whenever the context instruction does.
    Always(UseRef),
    /// The context ends in a two-way branch; the first set executes on one side, the second on the
    /// other. A fact established by *both* sides holds.
    OnBothBranches(Vec<UseRef>, Vec<UseRef>),
}

/// Uses of the value associated with `pos` that lie in the must-be-executed context of its context
/// instruction.
pub fn must_be_executed_uses(a: &mut FixpointEngine, pos: Position) -> Vec<ExecutedUse> {
    let m = a.module();
    let value = match pos.associated_value(m) {
        Some(v) => v,
        None => return vec![],
    };
    let ctx = match pos.context_inst(m) {
        Some(c) => c,
        None => return vec![],
    };
    let func = match m.parent_func(ctx) {
        Some(f) => f,
        None => return vec![],
    };
    let summary = a.summary_of(func);
    let m = a.module();

    let range = must_be_executed_context(m, &summary, ctx);
    let in_range = |inst: Val| range.contains(&inst);
    let mut out: Vec<ExecutedUse> = m
        .val(value)
        .uses
        .iter()
        .filter(|u| in_range(u.user))
        .map(|&u| ExecutedUse::Always(u))
        .collect();

    // Conjoin across a final two-way branch: facts established on both sides hold after it.
    if let Some(&last) = range.last() {
        if let Some(term) = m.terminator_of(m.expect_inst(last).block) {
            if let Some((then_b, else_b)) = branch_sides(m, &summary, term) {
                let side_uses = |entry: crate::ir::Block| -> Vec<UseRef> {
                    let side_range = match m.insts_of(entry).next() {
                        Some(first) => must_be_executed_context(m, &summary, first),
                        None => vec![],
                    };
                    m.val(value)
                        .uses
                        .iter()
                        .filter(|u| side_range.contains(&u.user))
                        .copied()
                        .collect()
                };
                let then_uses = side_uses(then_b);
                let else_uses = side_uses(else_b);
                if !then_uses.is_empty() && !else_uses.is_empty() {
                    out.push(ExecutedUse::OnBothBranches(then_uses, else_uses));
                }
            }
        }
    }
    out
}

/// Whether `use_ref` dereferences the used pointer: a load through it, a store through it, or an
/// argument to a callee that declares the parameter dereferenceable. Returns the accessed byte
/// count when it does.
pub fn deref_bytes_of_use(m: &Module, use_ref: UseRef) -> Option<u64> {
    let inst = m.inst(use_ref.user)?;
    match &inst.op {
        Opcode::Load { .. } if use_ref.index == 0 => {
            Some(m.ty_of(use_ref.user).size_in_bytes().max(1))
        }
        Opcode::Store { .. } if use_ref.index == 1 => {
            Some(m.ty_of(inst.operands[0]).size_in_bytes().max(1))
        }
        Opcode::Call | Opcode::Invoke { .. } if use_ref.index > 0 => {
            let callee = m.callee_of(use_ref.user)?;
            let arg_index = use_ref.index - 1;
            m.func(callee)
                .arg_attrs
                .get(arg_index)
                .and_then(|attrs| attrs.deref_bytes())
                .and_then(|(n, or_null)| (!or_null).then_some(n))
        }
        _ => None,
    }
}

/// The simplified constant behind `v`, as a structural stand-in, if the value-simplify analysis
/// has one (or `v` already is one).
pub fn simplified_value(a: &mut FixpointEngine, v: Val, dep: DepClass) -> Option<crate::attrs_value::SimpVal> {
    if a.module().is_constant(v) {
        return Some(crate::attrs_value::SimpVal::of(a.module(), v));
    }
    let pos = value_position(a.module(), v);
    match a.simplified(pos, dep) {
        Simplified::To(sv) if sv.is_constant() => Some(sv),
        _ => None,
    }
}

/// The simplified integer constant behind `v`, if any.
pub fn simplified_int_constant(a: &mut FixpointEngine, v: Val, dep: DepClass) -> Option<i128> {
    match simplified_value(a, v, dep) {
        Some(crate::attrs_value::SimpVal::Int(_, c)) => Some(c),
        _ => None,
    }
}

/// Whether `v` simplifies to the null pointer.
pub fn simplified_is_null(a: &mut FixpointEngine, v: Val, dep: DepClass) -> bool {
    matches!(
        simplified_value(a, v, dep),
        Some(crate::attrs_value::SimpVal::Null(_))
    )
}

/// Whether `v` simplifies to an undefined value.
pub fn simplified_is_undef(a: &mut FixpointEngine, v: Val, dep: DepClass) -> bool {
    matches!(
        simplified_value(a, v, dep),
        Some(crate::attrs_value::SimpVal::Undef(_))
    )
}

/// Peel pointer-identity-preserving operations (bitcasts and constant-offset geps) off `v`,
/// accumulating the constant byte offset. Stops at a non-constant offset or a non-peelable value.
pub fn strip_pointer_casts(m: &Module, mut v: Val) -> (Val, i128) {
    let mut offset: i128 = 0;
    let mut steps = 0;
    while steps < 64 {
        steps += 1;
        let inst = match m.inst(v) {
            Some(i) => i,
            None => break,
        };
        match &inst.op {
            Opcode::Cast(kind) if kind.preserves_pointer_identity() => {
                v = inst.operands[0];
            }
            Opcode::Gep => match m.is_int_const(inst.operands[1]) {
                Some(c) => {
                    offset += c;
                    v = inst.operands[0];
                }
                None => break,
            },
            _ => break,
        }
    }
    (v, offset)
}

/// A cheap may-alias check between two pointer values: strips casts and offsets, then reports
/// "must not alias" only for pairs whose bases are distinct fresh objects.
pub fn may_alias(m: &Module, a: Val, b: Val) -> bool {
    let (base_a, _) = strip_pointer_casts(m, a);
    let (base_b, _) = strip_pointer_casts(m, b);
    if base_a == base_b {
        return true;
    }
    let is_fresh = |v: Val| {
        m.is_null_const(v)
            || matches!(
                m.inst(v).map(|i| &i.op),
                Some(Opcode::Alloca { .. })
            )
    };
    !(is_fresh(base_a) || is_fresh(base_b))
}
