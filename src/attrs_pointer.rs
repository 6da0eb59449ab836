//! Pointer facts: non-null, no-alias, dereferenceable bytes, alignment, no-capture.

use crate::combinators::{
    bool_from_call_site_args, bool_from_callee, bool_from_returned_values, deref_bytes_of_use,
    may_alias, must_be_executed_uses, returned_value_positions, value_position, ExecutedUse,
};
use crate::containers::unordered::UnorderedSet;
use crate::engine::{AttrKind, FixpointEngine, Deduce, DepClass};
use crate::ir::{
    AllocKind, Attr, AttrKindTag, CastKind, Module, Opcode, Ty, UseRef, Val,
};
use crate::lattice::{
    align_of_offset, new_align_state, AbstractState, BitSetState, BooleanState, ChangeStatus,
    DerefState, IncIntState, MAX_ALIGN,
};
use crate::position::Position;

pub const NOT_CAPTURED_IN_MEM: u32 = 1 << 0;
pub const NOT_CAPTURED_IN_INT: u32 = 1 << 1;
pub const NOT_CAPTURED_IN_RET: u32 = 1 << 2;
pub const NOT_CAPTURED_ALL: u32 = NOT_CAPTURED_IN_MEM | NOT_CAPTURED_IN_INT | NOT_CAPTURED_IN_RET;

fn delta_bool(before: BooleanState, after: BooleanState) -> ChangeStatus {
    if before == after {
        ChangeStatus::Unchanged
    } else {
        ChangeStatus::Changed
    }
}

fn is_alloca(m: &Module, v: Val) -> bool {
    matches!(m.inst(v).map(|i| &i.op), Some(Opcode::Alloca { .. }))
}

/// Evidence from the must-be-executed context that the pointer at `pos` is dereferenced: the
/// largest byte count proven accessed on every path. Also reports whether any evidence exists at
/// all (for non-null purposes a single guaranteed access suffices).
fn executed_deref_evidence(a: &mut FixpointEngine, pos: Position) -> (bool, u64) {
    let uses = must_be_executed_uses(a, pos);
    let m = a.module();
    let mut any = false;
    let mut bytes: u64 = 0;
    for eu in uses {
        match eu {
            ExecutedUse::Always(u) => {
                if let Some(n) = deref_bytes_of_use(m, u) {
                    any = true;
                    bytes = bytes.max(n);
                }
            }
            ExecutedUse::OnBothBranches(left, right) => {
                let side_max = |side: &[UseRef]| {
                    side.iter()
                        .filter_map(|&u| deref_bytes_of_use(m, u))
                        .max()
                        .unwrap_or(0)
                };
                let l = side_max(&left);
                let r = side_max(&right);
                if l > 0 && r > 0 {
                    any = true;
                    bytes = bytes.max(l.min(r));
                }
            }
        }
    }
    (any, bytes)
}

// ---- non-null --------------------------------------------------------------

/// The pointer is never null.
pub struct NonNullAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NonNullAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }

    fn seed(&mut self, a: &FixpointEngine) {
        let m = a.module();
        if self.pos.has_attr(m, AttrKindTag::NonNull) {
            self.state.set_known();
            return;
        }
        // A plain `dereferenceable` (not `_or_null`) implies non-null.
        if self
            .pos
            .attrs_at(m, &[AttrKindTag::Dereferenceable])
            .iter()
            .any(|attr| matches!(attr, Attr::Dereferenceable(n) if *n > 0))
        {
            self.state.set_known();
            return;
        }
        if let Some(v) = self.pos.associated_value(m) {
            if m.is_null_const(v) {
                self.state.indicate_pessimistic_fixpoint();
            } else if is_alloca(m, v) {
                self.state.set_known();
                self.state.indicate_optimistic_fixpoint();
            }
        }
    }

    /// Whether a guaranteed dereference justifies non-null at this position.
    fn executed_deref_implies_nonnull(a: &mut FixpointEngine, pos: Position) -> bool {
        let f = match pos.anchor_func(a.module()) {
            Some(f) => f,
            None => return false,
        };
        if a.module().null_pointer_is_defined(f) {
            // Address zero is a valid address here; dereferences prove nothing.
            return false;
        }
        let (any, _) = executed_deref_evidence(a, pos);
        any
    }
}

impl Deduce for NonNullAttr {
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
        self.seed(a);
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        let ok = match self.pos {
            Position::Float(v) => {
                let op = a.module().inst(v).map(|i| i.op.clone());
                match op {
                    Some(Opcode::Alloca { .. }) => {
                        self.state.set_known();
                        true
                    }
                    Some(Opcode::Gep) => {
                        let base = a.module().expect_inst(v).operands[0];
                        let base_pos = value_position(a.module(), base);
                        a.is_assumed(AttrKind::NonNull, base_pos, DepClass::Required)
                            || Self::executed_deref_implies_nonnull(a, self.pos)
                    }
                    Some(Opcode::Cast(CastKind::Bitcast)) => {
                        let src = a.module().expect_inst(v).operands[0];
                        let src_pos = value_position(a.module(), src);
                        a.is_assumed(AttrKind::NonNull, src_pos, DepClass::Required)
                    }
                    Some(Opcode::Select) | Some(Opcode::Phi { .. }) => {
                        let operands: Vec<Val> = {
                            let inst = a.module().expect_inst(v);
                            match inst.op {
                                Opcode::Select => inst.operands[1..].to_vec(),
                                _ => inst.operands.clone(),
                            }
                        };
                        operands.into_iter().all(|operand| {
                            let pos = value_position(a.module(), operand);
                            a.is_assumed(AttrKind::NonNull, pos, DepClass::Required)
                        })
                    }
                    _ => Self::executed_deref_implies_nonnull(a, self.pos),
                }
            }
            Position::Argument(f, i) => {
                if Self::executed_deref_implies_nonnull(a, self.pos) {
                    true
                } else {
                    bool_from_call_site_args(a, AttrKind::NonNull, f, i).unwrap_or(false)
                }
            }
            Position::CallSiteArgument(c, _) => {
                let operand = self
                    .pos
                    .associated_value(a.module())
                    .expect("call-site argument value");
                let operand_pos = value_position(a.module(), operand);
                let _ = c;
                if operand_pos != self.pos
                    && a.is_assumed(AttrKind::NonNull, operand_pos, DepClass::Required)
                {
                    true
                } else {
                    bool_from_callee(a, AttrKind::NonNull, self.pos)
                        .map_or(false, |(assumed, _)| assumed)
                }
            }
            Position::Returned(f) => bool_from_returned_values(a, AttrKind::NonNull, f)
                .unwrap_or(false),
            Position::CallSiteReturned(_) => bool_from_callee(a, AttrKind::NonNull, self.pos)
                .map_or(false, |(assumed, known)| {
                    if known {
                        self.state.set_known();
                    }
                    assumed
                }),
            _ => false,
        };
        if !ok {
            self.state.indicate_pessimistic_fixpoint();
        }
        delta_bool(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        match self.pos {
            Position::Float(_) | Position::Invalid => ChangeStatus::Unchanged,
            _ if self.state.assumed() => a.manifest_attrs(self.pos, vec![Attr::NonNull]),
            _ => ChangeStatus::Unchanged,
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        if self.state.assumed() {
            "nonnull".to_owned()
        } else {
            "maybe-null".to_owned()
        }
    }
}

// ---- no-alias --------------------------------------------------------------

/// The pointer does not alias any other pointer visible at its position.
pub struct NoAliasAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NoAliasAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }

    /// A floating pointer is no-alias when it is a fresh object: a stack slot, null (where null is
    /// no valid object), or the result of an allocation routine.
    fn floating_no_alias(a: &mut FixpointEngine, v: Val) -> bool {
        let m = a.module();
        let (base, _) = crate::combinators::strip_pointer_casts(m, v);
        if is_alloca(m, base) || m.is_null_const(base) {
            return true;
        }
        if m.is_call_like(base) {
            return a.is_assumed(
                AttrKind::NoAlias,
                Position::CallSiteReturned(base),
                DepClass::Required,
            );
        }
        false
    }

    /// Whether the argument's aliasing story can be read off its call sites: either no
    /// synchronization can observe a difference, or the argument is never written through, or it
    /// never escapes into a call whose callee we cannot see.
    fn argument_delegation_sound(a: &mut FixpointEngine, f: crate::ir::Func, i: usize) -> bool {
        if a.is_assumed(AttrKind::NoSync, Position::Function(f), DepClass::Optional) {
            return true;
        }
        let mb = a.memory_behavior_state(Position::Argument(f, i), DepClass::Optional);
        if mb.is_assumed(crate::attrs_memory::NO_WRITES) {
            return true;
        }
        // No opaque indirect flows: every call-like use has a visible callee.
        let arg = a.module().func(f).args[i];
        let users = crate::ir::transitive_users(a.module(), arg);
        users.iter().all(|&u| {
            let m = a.module();
            !m.is_call_like(u) || m.callee_of(u).is_some()
        })
    }
}

impl Deduce for NoAliasAttr {
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
        if self.pos.has_attr(m, AttrKindTag::NoAlias) {
            self.state.set_known();
            return;
        }
        match self.pos {
            Position::CallSiteReturned(c) if m.alloc_kind_of(c).is_some() => {
                // Fresh allocations never alias anything else.
                self.state.set_known();
                self.state.indicate_optimistic_fixpoint();
            }
            Position::Float(v) if is_alloca(m, v) => {
                self.state.set_known();
                self.state.indicate_optimistic_fixpoint();
            }
            _ => {}
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        let ok = match self.pos {
            Position::Float(v) => Self::floating_no_alias(a, v),
            Position::Argument(f, i) => {
                Self::argument_delegation_sound(a, f, i)
                    && bool_from_call_site_args(a, AttrKind::NoAlias, f, i).unwrap_or(false)
            }
            Position::CallSiteArgument(c, i) => {
                let operand = a.module().call_args(c)[i];
                let callee_ok = bool_from_callee(a, AttrKind::NoAlias, self.pos)
                    .map_or(false, |(assumed, _)| assumed);
                let capture_ok = {
                    let operand_pos = value_position(a.module(), operand);
                    let caps = a.no_capture_state(operand_pos, DepClass::Required);
                    caps.is_assumed(NOT_CAPTURED_ALL)
                };
                let siblings_ok = {
                    let args: Vec<Val> = a.module().call_args(c).to_vec();
                    args.into_iter().enumerate().all(|(j, other)| {
                        j == i
                            || !a.module().ty_of(other).is_pointer()
                            || !may_alias(a.module(), operand, other)
                    })
                };
                callee_ok && capture_ok && siblings_ok
            }
            Position::Returned(f) => {
                bool_from_returned_values(a, AttrKind::NoAlias, f).unwrap_or(false)
            }
            Position::CallSiteReturned(_) => bool_from_callee(a, AttrKind::NoAlias, self.pos)
                .map_or(false, |(assumed, known)| {
                    if known {
                        self.state.set_known();
                    }
                    assumed
                }),
            _ => false,
        };
        if !ok {
            self.state.indicate_pessimistic_fixpoint();
        }
        delta_bool(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        match self.pos {
            Position::Float(_) | Position::Invalid => ChangeStatus::Unchanged,
            _ if self.state.assumed() => a.manifest_attrs(self.pos, vec![Attr::NoAlias]),
            _ => ChangeStatus::Unchanged,
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        if self.state.assumed() {
            "noalias".to_owned()
        } else {
            "may-alias".to_owned()
        }
    }
}

// ---- dereferenceable -------------------------------------------------------

/// Bytes behind the pointer that are dereferenceable.
pub struct DereferenceableAttr {
    pub pos: Position,
    pub state: DerefState,
}

impl DereferenceableAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: DerefState::new(),
        }
    }

    fn attr_seed(&mut self, m: &Module) {
        for attr in self
            .pos
            .attrs_at(m, &[AttrKindTag::Dereferenceable, AttrKindTag::DereferenceableOrNull])
        {
            match attr {
                Attr::Dereferenceable(n) => {
                    self.state.bytes.take_known_maximum(n);
                }
                Attr::DereferenceableOrNull(n) => {
                    // Only usable as a firm bound when the pointer is separately non-null.
                    if self.pos.has_attr(m, AttrKindTag::NonNull) {
                        self.state.bytes.take_known_maximum(n);
                    }
                }
                _ => {}
            }
        }
    }
}

impl Deduce for DereferenceableAttr {
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
        self.attr_seed(m);
        if let Some(v) = self.pos.associated_value(m) {
            if let Some(Opcode::Alloca { allocated }) = m.inst(v).map(|i| i.op.clone()) {
                self.state.bytes.take_known_maximum(allocated.size_in_bytes());
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;

        // Sound evidence raises `known`; peer-assumed evidence only feeds the optimistic bound.
        let (_, executed_bytes) = executed_deref_evidence(a, self.pos);
        let mut known_evidence = executed_bytes;
        let mut assumed_evidence = executed_bytes;

        match self.pos {
            Position::Float(v) => {
                let inst_op = a.module().inst(v).map(|i| i.op.clone());
                match inst_op {
                    Some(Opcode::Gep) => {
                        // Strip the constant offset and discount it from the base's bytes.
                        let (base, offset) = crate::combinators::strip_pointer_casts(a.module(), v);
                        if offset >= 0 {
                            let base_pos = value_position(a.module(), base);
                            let base_state = a.deref_state(base_pos, DepClass::Required);
                            known_evidence = known_evidence
                                .max(base_state.bytes.known().saturating_sub(offset as u64));
                            assumed_evidence = assumed_evidence
                                .max(base_state.bytes.assumed().saturating_sub(offset as u64));
                        }
                    }
                    Some(Opcode::Cast(CastKind::Bitcast)) => {
                        let src = a.module().expect_inst(v).operands[0];
                        let src_pos = value_position(a.module(), src);
                        let src_state = a.deref_state(src_pos, DepClass::Required);
                        known_evidence = known_evidence.max(src_state.bytes.known());
                        assumed_evidence = assumed_evidence.max(src_state.bytes.assumed());
                    }
                    Some(Opcode::Alloca { allocated }) => {
                        known_evidence = known_evidence.max(allocated.size_in_bytes());
                        assumed_evidence = assumed_evidence.max(allocated.size_in_bytes());
                    }
                    _ => {}
                }
            }
            Position::Argument(f, i) => {
                let mut sites: Option<(u64, u64)> = None;
                let complete = a.check_for_all_call_sites(f, |a, call| {
                    if i >= a.module().call_args(call).len() {
                        return false;
                    }
                    let s = a.deref_state(Position::CallSiteArgument(call, i), DepClass::Required);
                    let (k, asm) = sites.unwrap_or((u64::MAX, u64::MAX));
                    sites = Some((k.min(s.bytes.known()), asm.min(s.bytes.assumed())));
                    true
                });
                // A function with no visible call sites contributes no evidence either way.
                if complete {
                    if let Some((k, asm)) = sites {
                        known_evidence = known_evidence.max(k);
                        assumed_evidence = assumed_evidence.max(asm);
                    }
                }
            }
            Position::CallSiteArgument(c, i) => {
                let operand = a.module().call_args(c)[i];
                let operand_pos = value_position(a.module(), operand);
                if operand_pos != self.pos {
                    let s = a.deref_state(operand_pos, DepClass::Required);
                    known_evidence = known_evidence.max(s.bytes.known());
                    assumed_evidence = assumed_evidence.max(s.bytes.assumed());
                }
            }
            Position::Returned(f) => {
                if let Some(positions) = returned_value_positions(a, f, DepClass::Required) {
                    let mut min_known = u64::MAX;
                    let mut min_assumed = u64::MAX;
                    for (_, pos) in positions {
                        let s = a.deref_state(pos, DepClass::Required);
                        min_known = min_known.min(s.bytes.known());
                        min_assumed = min_assumed.min(s.bytes.assumed());
                    }
                    if min_known != u64::MAX {
                        known_evidence = known_evidence.max(min_known);
                    }
                    if min_assumed != u64::MAX {
                        assumed_evidence = assumed_evidence.max(min_assumed);
                    }
                }
            }
            Position::CallSiteReturned(_) => {
                if let Some(callee) = self.pos.callee_func(a.module()) {
                    let s = a.deref_state(Position::Returned(callee), DepClass::Required);
                    known_evidence = known_evidence.max(s.bytes.known());
                    assumed_evidence = assumed_evidence.max(s.bytes.assumed());
                }
            }
            _ => {}
        }

        self.state.bytes.take_known_maximum(known_evidence);
        self.state
            .bytes
            .take_assumed_minimum(assumed_evidence.max(self.state.bytes.known()));

        if before == self.state {
            ChangeStatus::Unchanged
        } else {
            ChangeStatus::Changed
        }
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        if matches!(self.pos, Position::Float(_) | Position::Invalid) {
            return ChangeStatus::Unchanged;
        }
        let n = self.state.bytes.assumed();
        if n == 0 || n == u64::MAX {
            return ChangeStatus::Unchanged;
        }
        let nonnull_known = a
            .lookup(AttrKind::NonNull, self.pos)
            .and_then(|id| a.boolean_state(id))
            .map_or(false, |s| s.assumed())
            || self.pos.has_attr(a.module(), AttrKindTag::NonNull);
        let attr = if nonnull_known {
            Attr::Dereferenceable(n)
        } else {
            Attr::DereferenceableOrNull(n)
        };
        a.manifest_attrs(self.pos, vec![attr])
    }

    fn as_str(&self, _m: &Module) -> String {
        format!(
            "dereferenceable<{},{}>",
            self.state.bytes.known(),
            self.state.bytes.assumed()
        )
    }
}

// ---- alignment -------------------------------------------------------------

/// Power-of-two alignment of the pointer.
pub struct AlignAttr {
    pub pos: Position,
    pub state: IncIntState,
}

impl AlignAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: new_align_state(),
        }
    }

    /// Alignment proven by guaranteed loads/stores through the pointer.
    fn executed_align_evidence(a: &mut FixpointEngine, pos: Position) -> u64 {
        let uses = must_be_executed_uses(a, pos);
        let m = a.module();
        let access_align = |u: UseRef| -> Option<u64> {
            let inst = m.inst(u.user)?;
            match &inst.op {
                Opcode::Load { .. } if u.index == 0 => Some(m.ty_of(u.user).abi_align()),
                Opcode::Store { .. } if u.index == 1 => {
                    Some(m.ty_of(inst.operands[0]).abi_align())
                }
                _ => None,
            }
        };
        let mut best = 1;
        for eu in uses {
            match eu {
                ExecutedUse::Always(u) => {
                    if let Some(n) = access_align(u) {
                        best = best.max(n);
                    }
                }
                ExecutedUse::OnBothBranches(left, right) => {
                    let side = |s: &[UseRef]| {
                        s.iter().filter_map(|&u| access_align(u)).max().unwrap_or(1)
                    };
                    best = best.max(side(&left).min(side(&right)));
                }
            }
        }
        best
    }
}

impl Deduce for AlignAttr {
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
        for attr in self.pos.attrs_at(m, &[AttrKindTag::Align]) {
            if let Attr::Align(n) = attr {
                self.state.take_known_maximum(n);
            }
        }
        if let Some(v) = self.pos.associated_value(m) {
            if m.is_null_const(v) {
                // Null carries maximal alignment.
                self.state.take_known_maximum(MAX_ALIGN);
            }
            if let Some(Opcode::Alloca { allocated }) = m.inst(v).map(|i| i.op.clone()) {
                self.state.take_known_maximum(allocated.abi_align());
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        let executed = Self::executed_align_evidence(a, self.pos);
        let mut known_evidence = executed;
        let mut assumed_evidence = executed;

        match self.pos {
            Position::Float(v) => {
                let inst_op = a.module().inst(v).map(|i| i.op.clone());
                match inst_op {
                    Some(Opcode::Gep) => {
                        let (base, offset) = crate::combinators::strip_pointer_casts(a.module(), v);
                        let base_pos = value_position(a.module(), base);
                        let base_state = a.align_state(base_pos, DepClass::Required);
                        let combine = |n: u64| n.min(align_of_offset(offset));
                        known_evidence = known_evidence.max(combine(base_state.known()));
                        assumed_evidence = assumed_evidence.max(combine(base_state.assumed()));
                    }
                    Some(Opcode::Cast(CastKind::Bitcast)) => {
                        let src = a.module().expect_inst(v).operands[0];
                        let src_pos = value_position(a.module(), src);
                        let src_state = a.align_state(src_pos, DepClass::Required);
                        known_evidence = known_evidence.max(src_state.known());
                        assumed_evidence = assumed_evidence.max(src_state.assumed());
                    }
                    Some(Opcode::Select) | Some(Opcode::Phi { .. }) => {
                        let operands: Vec<Val> = {
                            let inst = a.module().expect_inst(v);
                            match inst.op {
                                Opcode::Select => inst.operands[1..].to_vec(),
                                _ => inst.operands.clone(),
                            }
                        };
                        let mut min_known = MAX_ALIGN;
                        let mut min_assumed = MAX_ALIGN;
                        for operand in operands {
                            let pos = value_position(a.module(), operand);
                            let s = a.align_state(pos, DepClass::Required);
                            min_known = min_known.min(s.known());
                            min_assumed = min_assumed.min(s.assumed());
                        }
                        known_evidence = known_evidence.max(min_known);
                        assumed_evidence = assumed_evidence.max(min_assumed);
                    }
                    _ => {}
                }
            }
            Position::Argument(f, i) => {
                let mut sites: Option<(u64, u64)> = None;
                let complete = a.check_for_all_call_sites(f, |a, call| {
                    if i >= a.module().call_args(call).len() {
                        return false;
                    }
                    let s = a.align_state(Position::CallSiteArgument(call, i), DepClass::Required);
                    let (k, asm) = sites.unwrap_or((MAX_ALIGN, MAX_ALIGN));
                    sites = Some((k.min(s.known()), asm.min(s.assumed())));
                    true
                });
                if complete {
                    if let Some((k, asm)) = sites {
                        known_evidence = known_evidence.max(k);
                        assumed_evidence = assumed_evidence.max(asm);
                    }
                }
            }
            Position::CallSiteArgument(c, i) => {
                let operand = a.module().call_args(c)[i];
                let operand_pos = value_position(a.module(), operand);
                if operand_pos != self.pos {
                    let s = a.align_state(operand_pos, DepClass::Required);
                    known_evidence = known_evidence.max(s.known());
                    assumed_evidence = assumed_evidence.max(s.assumed());
                }
            }
            Position::Returned(f) => {
                if let Some(positions) = returned_value_positions(a, f, DepClass::Required) {
                    let mut min_known = MAX_ALIGN;
                    let mut min_assumed = MAX_ALIGN;
                    for (_, pos) in positions {
                        let s = a.align_state(pos, DepClass::Required);
                        min_known = min_known.min(s.known());
                        min_assumed = min_assumed.min(s.assumed());
                    }
                    known_evidence = known_evidence.max(min_known);
                    assumed_evidence = assumed_evidence.max(min_assumed);
                }
            }
            Position::CallSiteReturned(c) => {
                if a.module().alloc_kind_of(c) == Some(AllocKind::AlignedAlloc) {
                    let align_arg = a.module().call_args(c)[0];
                    if let Some(n) = a.module().is_int_const(align_arg) {
                        if n > 0 && (n as u64).is_power_of_two() {
                            known_evidence = known_evidence.max(n as u64);
                            assumed_evidence = assumed_evidence.max(n as u64);
                        }
                    }
                } else if let Some(callee) = self.pos.callee_func(a.module()) {
                    let s = a.align_state(Position::Returned(callee), DepClass::Required);
                    known_evidence = known_evidence.max(s.known());
                    assumed_evidence = assumed_evidence.max(s.assumed());
                }
            }
            _ => {}
        }

        self.state.take_known_maximum(known_evidence);
        self.state
            .take_assumed_minimum(assumed_evidence.max(self.state.known()));

        if before == self.state {
            ChangeStatus::Unchanged
        } else {
            ChangeStatus::Changed
        }
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        let n = self.state.assumed();
        let mut changed = ChangeStatus::Unchanged;
        if n > 1 && n < MAX_ALIGN && !matches!(self.pos, Position::Float(_) | Position::Invalid) {
            changed |= a.manifest_attrs(self.pos, vec![Attr::Align(n)]);
        }
        // Raise alignment annotations on accesses through this pointer.
        if n > 1 {
            if let Some(v) = self.pos.associated_value(a.module()) {
                let uses: Vec<UseRef> = a.module().val(v).uses.clone();
                for u in uses {
                    let m = a.module_mut();
                    if m.val(u.user).deleted {
                        continue;
                    }
                    if let Some(inst) = m.inst_mut(u.user) {
                        match &mut inst.op {
                            Opcode::Load { align, .. } if u.index == 0 && *align < n => {
                                *align = n;
                                changed = ChangeStatus::Changed;
                            }
                            Opcode::Store { align, .. } if u.index == 1 && *align < n => {
                                *align = n;
                                changed = ChangeStatus::Changed;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        changed
    }

    fn as_str(&self, _m: &Module) -> String {
        format!("align<{},{}>", self.state.known(), self.state.assumed())
    }
}

// ---- no-capture ------------------------------------------------------------

/// The pointer does not escape: not through memory, not as an integer, not via the return value.
pub struct NoCaptureAttr {
    pub pos: Position,
    pub state: BitSetState,
}

impl NoCaptureAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BitSetState::new(NOT_CAPTURED_ALL),
        }
    }

    /// Track uses of an integer derived from the pointer; any flow we cannot follow counts as an
    /// integer capture.
    fn track_int_uses(a: &FixpointEngine, start: Val) -> bool {
        let m = a.module();
        let mut seen: UnorderedSet<Val> = Default::default();
        let mut stack = vec![start];
        while let Some(v) = stack.pop() {
            for u in &m.val(v).uses {
                let user = u.user;
                match m.inst(user).map(|i| &i.op) {
                    Some(Opcode::Icmp(_)) => {}
                    Some(Opcode::BinOp(_))
                    | Some(Opcode::Cast(CastKind::ZExt))
                    | Some(Opcode::Cast(CastKind::SExt))
                    | Some(Opcode::Cast(CastKind::Trunc)) => {
                        if seen.insert(user) {
                            stack.push(user);
                        }
                    }
                    _ => return false,
                }
            }
        }
        true
    }

    /// Drive the capture walk over the value's transitive pointer uses, clearing assumed bits as
    /// escapes show up. Returns the surviving bit set.
    fn capture_walk(a: &mut FixpointEngine, value: Val, mut bits: u32) -> u32 {
        let mut seen: UnorderedSet<Val> = Default::default();
        let mut stack = vec![value];
        while let Some(v) = stack.pop() {
            let uses: Vec<UseRef> = a.module().val(v).uses.clone();
            for u in uses {
                let user = u.user;
                if a.module().val(user).deleted || a.is_assumed_dead_inst(user) {
                    continue;
                }
                let op = a.module().expect_inst(user).op.clone();
                match op {
                    Opcode::Load { .. } | Opcode::Icmp(_) => {}
                    Opcode::Store { .. } => {
                        if u.index == 0 {
                            bits &= !NOT_CAPTURED_IN_MEM;
                        }
                    }
                    Opcode::Ret => {
                        bits &= !NOT_CAPTURED_IN_RET;
                    }
                    Opcode::Gep
                    | Opcode::Cast(CastKind::Bitcast)
                    | Opcode::Select
                    | Opcode::Phi { .. } => {
                        if seen.insert(user) {
                            stack.push(user);
                        }
                    }
                    Opcode::Cast(CastKind::PtrToInt) => {
                        if !Self::track_int_uses(a, user) {
                            bits &= !(NOT_CAPTURED_IN_INT | NOT_CAPTURED_IN_MEM);
                        }
                    }
                    Opcode::Call | Opcode::Invoke { .. } => {
                        if u.index == 0 {
                            bits = 0;
                        } else {
                            let callee_caps = a.no_capture_state(
                                Position::CallSiteArgument(user, u.index - 1),
                                DepClass::Required,
                            );
                            bits &= callee_caps.assumed();
                        }
                    }
                    _ => {
                        bits = 0;
                    }
                }
                if bits == 0 {
                    return 0;
                }
            }
        }
        bits
    }
}

impl Deduce for NoCaptureAttr {
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
        if self.pos.has_attr(m, AttrKindTag::NoCapture) {
            self.state.add_known_bits(NOT_CAPTURED_ALL);
            self.state.indicate_optimistic_fixpoint();
            return;
        }
        match self.pos {
            Position::Argument(_, _) | Position::CallSiteArgument(_, _)
                if self
                    .pos
                    .callee_func(m)
                    .map_or(false, |g| m.func(g).is_declaration()) =>
            {
                // Upper bounds from the declared callee's purity and return type.
                let callee = self.pos.callee_func(m).unwrap();
                let fd = m.func(callee);
                let mut known = 0;
                if fd.fn_attrs.has(AttrKindTag::ReadNone) || fd.fn_attrs.has(AttrKindTag::ReadOnly)
                {
                    known |= NOT_CAPTURED_IN_MEM;
                }
                if fd.ty.ret.is_void() {
                    known |= NOT_CAPTURED_IN_RET;
                }
                self.state.add_known_bits(known);
                self.state.indicate_pessimistic_fixpoint();
            }
            Position::Argument(f, _) => {
                let fd = m.func(f);
                if fd.fn_attrs.has(AttrKindTag::ReadNone) {
                    self.state.add_known_bits(NOT_CAPTURED_IN_MEM);
                }
                if fd.ty.ret.is_void() {
                    self.state.add_known_bits(NOT_CAPTURED_IN_RET);
                }
            }
            Position::Float(_) | Position::CallSiteArgument(_, _) => {}
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Argument(_, _) | Position::Float(_) => {
                let v = self
                    .pos
                    .associated_value(a.module())
                    .expect("value position");
                let bits = Self::capture_walk(a, v, self.state.assumed());
                self.state.intersect_assumed(bits | self.state.known());
            }
            Position::CallSiteArgument(_, _) => {
                match bool_state_bits(a, self.pos) {
                    Some(bits) => {
                        self.state.intersect_assumed(bits | self.state.known());
                    }
                    None => {
                        self.state.indicate_pessimistic_fixpoint();
                    }
                }
            }
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
        if before == self.state {
            ChangeStatus::Unchanged
        } else {
            ChangeStatus::Changed
        }
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        match self.pos {
            Position::Argument(_, _) | Position::CallSiteArgument(_, _)
                if self.state.is_assumed(NOT_CAPTURED_ALL) =>
            {
                a.manifest_attrs(self.pos, vec![Attr::NoCapture])
            }
            _ => ChangeStatus::Unchanged,
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        format!(
            "nocapture<{}{}{}>",
            if self.state.is_assumed(NOT_CAPTURED_IN_MEM) {
                "m"
            } else {
                "-"
            },
            if self.state.is_assumed(NOT_CAPTURED_IN_INT) {
                "i"
            } else {
                "-"
            },
            if self.state.is_assumed(NOT_CAPTURED_IN_RET) {
                "r"
            } else {
                "-"
            },
        )
    }
}

/// The callee-side no-capture bits for a call-site argument position, when the callee argument is
/// addressable.
fn bool_state_bits(a: &mut FixpointEngine, pos: Position) -> Option<u32> {
    let callee = pos.callee_func(a.module())?;
    let i = pos.arg_index()?;
    if i >= a.module().func(callee).ty.params.len() {
        return None;
    }
    let s = a.no_capture_state(Position::Argument(callee, i), DepClass::Required);
    Some(s.assumed())
}

/// Whether the pointer at `pos` is known dereferenceable or null, which lets capture analysis
/// ignore comparisons against null.
pub fn dereferenceable_or_null(a: &mut FixpointEngine, pos: Position) -> bool {
    if matches!(pos, Position::Invalid) {
        return false;
    }
    let s = a.deref_state(pos, DepClass::Optional);
    s.bytes.known() > 0
}

/// Types eligible for splitting in a privatization rewrite: scalars and aggregates thereof.
pub fn flattenable(ty: &Ty) -> bool {
    match ty {
        Ty::Int(_) | Ty::Float | Ty::Ptr(_) => true,
        Ty::Struct(fields) => fields.iter().all(flattenable),
        Ty::Array(elem, _) => flattenable(elem),
        Ty::Void | Ty::Func(_) => false,
    }
}
