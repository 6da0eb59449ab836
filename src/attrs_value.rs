//! Value facts: which values a function returns, constant simplification, and integer ranges.

use crate::attrs_liveness::ExplorationState;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::combinators::{returned_value_positions, value_position};
use crate::engine::{AttrKind, FixpointEngine, Deduce, DepClass, Simplified};
use crate::ir::{Attr, AttrKindTag, CastKind, Module, Opcode, Ty, UseRef, Val, ValueKind};
use crate::lattice::{AbstractState, ChangeStatus, RangeState, SignedRange};
use crate::position::Position;

/// A structural stand-in for a simplified value, independent of arena identity so that repeated
/// updates comparing "did the simplification change" do not churn on freshly minted constants.
#[derive(Clone, PartialEq, Debug)]
pub enum SimpVal {
    Int(u32, i128),
    /// A null pointer; carries the pointee type.
    Null(Ty),
    Undef(Ty),
    Existing(Val),
}

impl SimpVal {
    pub fn of(m: &Module, v: Val) -> SimpVal {
        match &m.val(v).kind {
            ValueKind::ConstInt(c) => match m.ty_of(v) {
                Ty::Int(bits) => SimpVal::Int(*bits, *c),
                _ => SimpVal::Existing(v),
            },
            ValueKind::ConstNull => match m.ty_of(v).pointee() {
                Some(p) => SimpVal::Null(p.clone()),
                None => SimpVal::Existing(v),
            },
            ValueKind::Undef => SimpVal::Undef(m.ty_of(v).clone()),
            _ => SimpVal::Existing(v),
        }
    }

    pub fn is_constant(&self) -> bool {
        !matches!(self, SimpVal::Existing(_))
    }

    pub fn materialize(&self, m: &mut Module) -> Val {
        match self {
            SimpVal::Int(bits, v) => m.const_int(*bits, *v),
            SimpVal::Null(pointee) => m.const_null(pointee.clone()),
            SimpVal::Undef(ty) => m.undef(ty.clone()),
            SimpVal::Existing(v) => *v,
        }
    }
}

// ---- returned values -------------------------------------------------------

/// Maps each value a function can return to the return instructions producing it, tracking call
/// sites whose returned values could not be resolved.
pub struct ReturnedValuesAttr {
    pub pos: Position,
    explore: ExplorationState,
    returned: UnorderedMap<Val, UnorderedSet<Val>>,
    unresolved: UnorderedSet<Val>,
}

impl ReturnedValuesAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            explore: ExplorationState::default(),
            returned: Default::default(),
            unresolved: Default::default(),
        }
    }

    pub fn returned_values(&self) -> Vec<Val> {
        self.returned.keys().copied().collect()
    }

    pub fn has_unresolved_calls(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// Whether the returned-value set can be trusted as exhaustive: every returned call resolved
    /// and the traversal was never cut short.
    pub fn is_complete(&self) -> bool {
        !self.explore.is_pessimized() && self.unresolved.is_empty()
    }

    pub fn unique_returned(&self) -> Option<Val> {
        if self.is_complete() && self.returned.len() == 1 {
            self.returned.keys().next().copied()
        } else {
            None
        }
    }

    /// Traverse from one returned operand to its leaves: through selects, phis, casts, and calls
    /// whose returned values are themselves resolved.
    fn gather_leaves(&mut self, a: &mut FixpointEngine, ret: Val, operand: Val) -> ChangeStatus {
        let mut changed = ChangeStatus::Unchanged;
        let mut visited: UnorderedSet<Val> = Default::default();
        let mut stack = vec![operand];
        while let Some(v) = stack.pop() {
            if !visited.insert(v) {
                continue;
            }
            let inst_op = a.module().inst(v).map(|i| i.op.clone());
            match inst_op {
                Some(Opcode::Select) => {
                    let inst = a.module().expect_inst(v);
                    stack.push(inst.operands[1]);
                    stack.push(inst.operands[2]);
                }
                Some(Opcode::Phi { .. }) => {
                    stack.extend(a.module().expect_inst(v).operands.iter().copied());
                }
                Some(Opcode::Cast(CastKind::Bitcast)) => {
                    stack.push(a.module().expect_inst(v).operands[0]);
                }
                Some(Opcode::Call) | Some(Opcode::Invoke { .. }) => {
                    match a.module().callee_of(v) {
                        Some(callee) if !a.module().func(callee).is_declaration() => {
                            let id = a.get_or_create(
                                AttrKind::ReturnedValues,
                                Position::Returned(callee),
                                DepClass::Required,
                            );
                            let callee_info = match a.record(id) {
                                Some(crate::engine::AbstractAttribute::ReturnedValues(rv)) => {
                                    if rv.is_complete() {
                                        Some(rv.returned_values())
                                    } else {
                                        None
                                    }
                                }
                                _ => None,
                            };
                            match callee_info {
                                Some(values) => {
                                    // Substitute callee arguments with this call's operands.
                                    for leaf in values {
                                        match a.module().val(leaf).kind {
                                            ValueKind::Argument { func, index }
                                                if func == callee =>
                                            {
                                                let mapped = a.module().call_args(v)[index];
                                                stack.push(mapped);
                                            }
                                            _ if a.module().is_constant(leaf) => {
                                                stack.push(leaf);
                                            }
                                            _ => {
                                                if self.unresolved.insert(v) {
                                                    changed = ChangeStatus::Changed;
                                                }
                                            }
                                        }
                                    }
                                }
                                None => {
                                    if self.unresolved.insert(v) {
                                        changed = ChangeStatus::Changed;
                                    }
                                }
                            }
                        }
                        _ => {
                            if self.unresolved.insert(v) {
                                changed = ChangeStatus::Changed;
                            }
                        }
                    }
                }
                _ => {
                    let entry = self.returned.entry(v).or_insert_with(Default::default);
                    if entry.insert(ret) {
                        changed = ChangeStatus::Changed;
                    }
                }
            }
        }
        changed
    }
}

impl Deduce for ReturnedValuesAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        &self.explore
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        &mut self.explore
    }

    fn initialize(&mut self, a: &mut FixpointEngine) {
        let f = match self.pos {
            Position::Returned(f) => f,
            _ => {
                self.explore.indicate_pessimistic_fixpoint();
                return;
            }
        };
        let m = a.module();
        for (i, attrs) in m.func(f).arg_attrs.iter().enumerate() {
            if attrs.has(AttrKindTag::Returned) {
                let arg = m.func(f).args[i];
                self.returned.entry(arg).or_insert_with(Default::default);
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let f = match self.pos {
            Position::Returned(f) => f,
            _ => return ChangeStatus::Unchanged,
        };
        let mut changed = ChangeStatus::Unchanged;
        let rets: Vec<(Val, Val)> = a
            .module()
            .insts_of_func(f)
            .filter_map(|v| {
                let inst = a.module().expect_inst(v);
                match inst.op {
                    Opcode::Ret if !inst.operands.is_empty() => Some((v, inst.operands[0])),
                    _ => None,
                }
            })
            .collect();
        for (ret, operand) in rets {
            if a.is_assumed_dead_inst(ret) {
                continue;
            }
            changed |= self.gather_leaves(a, ret, operand);
        }
        changed
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        let f = match self.pos {
            Position::Returned(f) => f,
            _ => return ChangeStatus::Unchanged,
        };
        let unique = match self.unique_returned() {
            Some(v) => v,
            None => return ChangeStatus::Unchanged,
        };
        match a.module().val(unique).kind.clone() {
            ValueKind::Argument { func, index } if func == f => {
                a.manifest_attrs(Position::Argument(f, index), vec![Attr::Returned])
            }
            _ if a.module().is_constant(unique) => {
                // Every visible call produces exactly this constant.
                let mut changed = ChangeStatus::Unchanged;
                let calls: Vec<Val> = {
                    let fref = a.module_mut().func_ref(f);
                    let m = a.module();
                    m.val(fref)
                        .uses
                        .iter()
                        .filter(|u| u.index == 0 && m.is_call_like(u.user))
                        .map(|u| u.user)
                        .collect()
                };
                for call in calls {
                    if a.module().val(call).deleted || a.module().val(call).uses.is_empty() {
                        continue;
                    }
                    a.changes.value_replacements.push((call, unique));
                    changed = ChangeStatus::Changed;
                }
                changed
            }
            _ => ChangeStatus::Unchanged,
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        format!(
            "returns<{} values, {} unresolved>",
            self.returned.len(),
            self.unresolved.len()
        )
    }
}

// ---- value simplification --------------------------------------------------

/// Whether the value at the position can be replaced by something simpler, and by what.
pub struct ValueSimplifyAttr {
    pub pos: Position,
    simp: Simplified,
    fixed: bool,
}

impl ValueSimplifyAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            simp: Simplified::NotYet,
            fixed: false,
        }
    }

    pub fn result(&self) -> Simplified {
        self.simp.clone()
    }

    /// Fold a candidate simplification into the current one. Disagreement collapses to `Cannot`;
    /// undef is a wildcard that defers to anything concrete.
    fn combine(current: &Simplified, candidate: SimpVal) -> Simplified {
        match current {
            Simplified::Cannot => Simplified::Cannot,
            Simplified::NotYet => Simplified::To(candidate),
            Simplified::To(existing) => {
                if *existing == candidate {
                    Simplified::To(existing.clone())
                } else if matches!(existing, SimpVal::Undef(_)) {
                    Simplified::To(candidate)
                } else if matches!(candidate, SimpVal::Undef(_)) {
                    Simplified::To(existing.clone())
                } else {
                    Simplified::Cannot
                }
            }
        }
    }

    /// The simplified form of an operand value as seen from a use site.
    fn simplified_operand(a: &mut FixpointEngine, v: Val) -> Simplified {
        if a.module().is_constant(v) {
            return Simplified::To(SimpVal::of(a.module(), v));
        }
        let pos = value_position(a.module(), v);
        a.simplified(pos, DepClass::Required)
    }

    fn update_argument(&self, a: &mut FixpointEngine, f: crate::ir::Func, i: usize) -> Simplified {
        let mut acc = self.simp.clone();
        let complete = a.check_for_all_call_sites(f, |a, call| {
            if i >= a.module().call_args(call).len() {
                return false;
            }
            let operand = a.module().call_args(call)[i];
            match Self::simplified_operand(a, operand) {
                Simplified::To(sv) if sv.is_constant() => {
                    acc = Self::combine(&acc, sv);
                    !matches!(acc, Simplified::Cannot)
                }
                Simplified::NotYet => true,
                _ => false,
            }
        });
        if complete {
            acc
        } else {
            Simplified::Cannot
        }
    }

    fn update_returned(&self, a: &mut FixpointEngine, f: crate::ir::Func) -> Simplified {
        let mut acc = self.simp.clone();
        let positions = match returned_value_positions(a, f, DepClass::Required) {
            Some(p) => p,
            None => return Simplified::Cannot,
        };
        if positions.is_empty() {
            return acc;
        }
        for (v, _) in positions {
            match Self::simplified_operand(a, v) {
                Simplified::To(sv) => {
                    acc = Self::combine(&acc, sv);
                }
                Simplified::NotYet => {}
                Simplified::Cannot => return Simplified::Cannot,
            }
            if matches!(acc, Simplified::Cannot) {
                return acc;
            }
        }
        acc
    }

    fn update_floating(&self, a: &mut FixpointEngine, v: Val) -> Simplified {
        let inst_op = a.module().inst(v).map(|i| i.op.clone());
        match inst_op {
            Some(Opcode::Cast(CastKind::Bitcast)) => {
                let src = a.module().expect_inst(v).operands[0];
                Self::simplified_operand(a, src)
            }
            Some(Opcode::Select) => {
                let (cond, t, e) = {
                    let inst = a.module().expect_inst(v);
                    (inst.operands[0], inst.operands[1], inst.operands[2])
                };
                match Self::simplified_operand(a, cond) {
                    Simplified::To(SimpVal::Int(_, c)) => {
                        let chosen = if c != 0 { t } else { e };
                        Self::simplified_operand(a, chosen)
                    }
                    Simplified::NotYet => Simplified::NotYet,
                    _ => Simplified::Cannot,
                }
            }
            Some(Opcode::Phi { .. }) => {
                let operands = a.module().expect_inst(v).operands.clone();
                let mut acc = Simplified::NotYet;
                for operand in operands {
                    match Self::simplified_operand(a, operand) {
                        Simplified::To(sv) => acc = Self::combine(&acc, sv),
                        Simplified::NotYet => {}
                        Simplified::Cannot => return Simplified::Cannot,
                    }
                    if matches!(acc, Simplified::Cannot) {
                        return acc;
                    }
                }
                acc
            }
            _ => {
                // Integer values settle through their deduced range.
                match a.module().ty_of(v) {
                    Ty::Int(bits) => {
                        let bits = *bits;
                        let rs = a.range_state(self.pos, DepClass::Required);
                        let r = rs.assumed();
                        if r.is_empty() {
                            Simplified::NotYet
                        } else if let (
                            crate::lattice::Bound::Finite(lo),
                            crate::lattice::Bound::Finite(hi),
                        ) = (r.lo, r.hi)
                        {
                            if lo == hi {
                                Simplified::To(SimpVal::Int(bits, lo))
                            } else {
                                Simplified::Cannot
                            }
                        } else {
                            Simplified::Cannot
                        }
                    }
                    _ => Simplified::Cannot,
                }
            }
        }
    }
}

impl AbstractState for ValueSimplifyAttr {
    fn is_valid(&self) -> bool {
        !matches!(self.simp, Simplified::Cannot)
    }

    fn is_at_fixpoint(&self) -> bool {
        self.fixed || matches!(self.simp, Simplified::Cannot)
    }

    fn indicate_optimistic_fixpoint(&mut self) -> ChangeStatus {
        self.fixed = true;
        ChangeStatus::Unchanged
    }

    fn indicate_pessimistic_fixpoint(&mut self) -> ChangeStatus {
        self.fixed = true;
        if matches!(self.simp, Simplified::Cannot) {
            ChangeStatus::Unchanged
        } else {
            self.simp = Simplified::Cannot;
            ChangeStatus::Changed
        }
    }
}

impl Deduce for ValueSimplifyAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        self
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        self
    }

    fn initialize(&mut self, a: &mut FixpointEngine) {
        let m = a.module();
        if let Some(v) = self.pos.associated_value(m) {
            if m.is_constant(v) {
                self.simp = Simplified::To(SimpVal::of(m, v));
                self.fixed = true;
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.simp.clone();
        let next = match self.pos {
            Position::Argument(f, i) => self.update_argument(a, f, i),
            Position::Returned(f) => self.update_returned(a, f),
            Position::CallSiteReturned(c) => match a.module().callee_of(c) {
                Some(callee) if !a.module().func(callee).is_declaration() => {
                    match a.simplified(Position::Returned(callee), DepClass::Required) {
                        Simplified::To(sv) if sv.is_constant() => {
                            Self::combine(&self.simp, sv)
                        }
                        Simplified::NotYet => self.simp.clone(),
                        _ => Simplified::Cannot,
                    }
                }
                _ => Simplified::Cannot,
            },
            Position::CallSiteArgument(c, i) => {
                let operand = a.module().call_args(c)[i];
                match Self::simplified_operand(a, operand) {
                    Simplified::To(sv) => Self::combine(&self.simp, sv),
                    Simplified::NotYet => self.simp.clone(),
                    Simplified::Cannot => Simplified::Cannot,
                }
            }
            Position::Float(v) => self.update_floating(a, v),
            _ => Simplified::Cannot,
        };
        self.simp = next;
        if before == self.simp {
            ChangeStatus::Unchanged
        } else {
            ChangeStatus::Changed
        }
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        let sv = match &self.simp {
            Simplified::To(sv) if sv.is_constant() => sv.clone(),
            _ => return ChangeStatus::Unchanged,
        };
        match self.pos {
            Position::Float(_) | Position::CallSiteReturned(_) | Position::Argument(_, _) => {
                let v = self
                    .pos
                    .associated_value(a.module())
                    .expect("value position");
                if a.module().is_constant(v) || a.module().val(v).uses.is_empty() {
                    return ChangeStatus::Unchanged;
                }
                let replacement = sv.materialize(a.module_mut());
                a.changes.value_replacements.push((v, replacement));
                ChangeStatus::Changed
            }
            Position::Returned(f) => {
                // Rewrite the return sites themselves to the settled constant.
                let mut changed = ChangeStatus::Unchanged;
                let rets: Vec<Val> = a
                    .module()
                    .insts_of_func(f)
                    .filter(|&v| {
                        let inst = a.module().expect_inst(v);
                        matches!(inst.op, Opcode::Ret) && !inst.operands.is_empty()
                    })
                    .collect();
                for ret in rets {
                    let operand = a.module().expect_inst(ret).operands[0];
                    if a.module().is_constant(operand) {
                        continue;
                    }
                    let replacement = sv.materialize(a.module_mut());
                    a.changes
                        .use_replacements
                        .push((UseRef { user: ret, index: 0 }, replacement));
                    changed = ChangeStatus::Changed;
                }
                changed
            }
            _ => ChangeStatus::Unchanged,
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        match &self.simp {
            Simplified::NotYet => "simplify<pending>".to_owned(),
            Simplified::Cannot => "simplify<none>".to_owned(),
            Simplified::To(sv) => format!("simplify<{:?}>", sv),
        }
    }
}

// ---- value range -----------------------------------------------------------

/// The signed range an integer value can take.
pub struct ValueRangeAttr {
    pub pos: Position,
    pub state: RangeState,
}

impl ValueRangeAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: RangeState::new(SignedRange::full()),
        }
    }

    fn width_of(m: &Module, pos: &Position) -> Option<u32> {
        match pos {
            // Return positions name no single value; their width is the return type's.
            Position::Returned(f) => match &*m.func(*f).ty.ret {
                Ty::Int(bits) => Some(*bits),
                _ => None,
            },
            _ => {
                let v = pos.associated_value(m)?;
                match m.ty_of(v) {
                    Ty::Int(bits) => Some(*bits),
                    _ => None,
                }
            }
        }
    }

    /// The assumed range of an operand value, from its record or the constant itself.
    fn range_of(a: &mut FixpointEngine, v: Val) -> SignedRange {
        if let Some(c) = a.module().is_int_const(v) {
            return SignedRange::constant(c);
        }
        match a.module().ty_of(v) {
            Ty::Int(_) => {
                let pos = value_position(a.module(), v);
                a.range_state(pos, DepClass::Required).assumed()
            }
            _ => SignedRange::full(),
        }
    }

    fn float_range(&self, a: &mut FixpointEngine, v: Val, width: u32) -> SignedRange {
        let widest = SignedRange::of_width(width);
        let inst_op = a.module().inst(v).map(|i| i.op.clone());
        match inst_op {
            Some(Opcode::BinOp(kind)) => {
                let (x, y) = {
                    let inst = a.module().expect_inst(v);
                    (inst.operands[0], inst.operands[1])
                };
                let rx = Self::range_of(a, x);
                let ry = Self::range_of(a, y);
                if rx.is_empty() || ry.is_empty() {
                    return SignedRange::empty();
                }
                use crate::ir::BinOpKind::*;
                let raw = match kind {
                    Add => rx.add(&ry),
                    Sub => rx.sub(&ry),
                    Mul => rx.mul(&ry),
                    _ => widest,
                };
                raw.intersect(&self.state.known())
            }
            Some(Opcode::Icmp(pred)) => {
                let (x, y) = {
                    let inst = a.module().expect_inst(v);
                    (inst.operands[0], inst.operands[1])
                };
                let rx = Self::range_of(a, x);
                let ry = Self::range_of(a, y);
                if rx.is_empty() || ry.is_empty() {
                    return SignedRange::empty();
                }
                match SignedRange::cmp_always(pred, &rx, &ry) {
                    Some(true) => SignedRange::constant(1),
                    Some(false) => SignedRange::constant(0),
                    None => SignedRange::new(0, 1),
                }
            }
            Some(Opcode::Cast(CastKind::ZExt)) | Some(Opcode::Cast(CastKind::SExt)) => {
                let src = a.module().expect_inst(v).operands[0];
                let r = Self::range_of(a, src);
                if r.is_empty() {
                    SignedRange::empty()
                } else {
                    r.intersect(&widest)
                }
            }
            Some(Opcode::Load { .. }) | Some(Opcode::Call) | Some(Opcode::Invoke { .. }) => {
                match a.module().val(v).range {
                    Some((lo, hi)) => SignedRange::new(lo, hi),
                    None => widest,
                }
            }
            _ => widest,
        }
    }
}

impl Deduce for ValueRangeAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        &mut self.state
    }

    fn initialize(&mut self, a: &mut FixpointEngine) {
        let m = a.module();
        let width = match Self::width_of(m, &self.pos) {
            Some(w) => w,
            None => {
                self.state.indicate_pessimistic_fixpoint();
                return;
            }
        };
        self.state = RangeState::new(SignedRange::of_width(width));
        if let Some(v) = self.pos.associated_value(m) {
            if let Some(c) = m.is_int_const(v) {
                self.state.union_assumed(&SignedRange::constant(c));
                self.state.indicate_optimistic_fixpoint();
                return;
            }
            if let Some((lo, hi)) = m.val(v).range {
                self.state.union_assumed(&SignedRange::new(lo, hi));
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let width = match Self::width_of(a.module(), &self.pos) {
            Some(w) => w,
            None => return ChangeStatus::Unchanged,
        };
        let widest = SignedRange::of_width(width);
        let evidence = match self.pos {
            Position::Float(v) => self.float_range(a, v, width),
            Position::Argument(f, i) => {
                let mut acc = SignedRange::empty();
                let complete = a.check_for_all_call_sites(f, |a, call| {
                    if i >= a.module().call_args(call).len() {
                        return false;
                    }
                    let operand = a.module().call_args(call)[i];
                    acc = acc.union(&Self::range_of(a, operand));
                    true
                });
                if complete {
                    acc
                } else {
                    widest
                }
            }
            Position::Returned(f) => {
                match returned_value_positions(a, f, DepClass::Required) {
                    Some(positions) => {
                        let mut acc = SignedRange::empty();
                        for (v, _) in positions {
                            acc = acc.union(&Self::range_of(a, v));
                        }
                        acc
                    }
                    None => widest,
                }
            }
            Position::CallSiteReturned(c) => match a.module().callee_of(c) {
                Some(callee) if !a.module().func(callee).is_declaration() => {
                    let s = a.range_state(Position::Returned(callee), DepClass::Required);
                    s.assumed()
                }
                _ => match a.module().val(c).range {
                    Some((lo, hi)) => SignedRange::new(lo, hi),
                    None => widest,
                },
            },
            Position::CallSiteArgument(c, i) => {
                let operand = a.module().call_args(c)[i];
                Self::range_of(a, operand)
            }
            _ => widest,
        };
        self.state.union_assumed(&evidence)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        // Ranges are written back as metadata on loads and calls.
        let eligible = match self.pos {
            Position::CallSiteReturned(_) => true,
            Position::Float(v) => {
                matches!(
                    a.module().inst(v).map(|i| &i.op),
                    Some(Opcode::Load { .. })
                )
            }
            _ => false,
        };
        if !eligible {
            return ChangeStatus::Unchanged;
        }
        let r = self.state.assumed();
        let width = match Self::width_of(a.module(), &self.pos) {
            Some(w) => w,
            None => return ChangeStatus::Unchanged,
        };
        if r.is_empty() || r == SignedRange::of_width(width) {
            return ChangeStatus::Unchanged;
        }
        let (lo, hi) = match (r.lo, r.hi) {
            (crate::lattice::Bound::Finite(lo), crate::lattice::Bound::Finite(hi)) => (lo, hi),
            _ => return ChangeStatus::Unchanged,
        };
        let v = self
            .pos
            .associated_value(a.module())
            .expect("value position");
        let existing = a.module().val(v).range;
        if existing == Some((lo, hi)) {
            return ChangeStatus::Unchanged;
        }
        a.module_mut().val_mut(v).range = Some((lo, hi));
        ChangeStatus::Changed
    }

    fn as_str(&self, _m: &Module) -> String {
        format!("range<{:?}>", self.state.assumed())
    }
}
