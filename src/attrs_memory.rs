//! Memory facts: read/write behavior, accessed location classes, heap-to-stack conversion of
//! small allocations, and pointer-argument privatization.

use crate::attrs_function::is_ipo_amendable;
use crate::attrs_pointer::flattenable;
use crate::combinators::strip_pointer_casts;
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::engine::{AttrKind, FixpointEngine, Deduce, DepClass};
use crate::ir::{
    Attr, AttrKindTag, CastKind, Func, Module, Opcode, Ty, UseRef, Val, ValueKind,
};
use crate::lattice::{AbstractState, BitSetState, BooleanState, ChangeStatus};
use crate::log::*;
use crate::position::Position;
use crate::rewriter::{HeapToStackRewrite, SignatureRewrite};

/// Bit: the position performs no reads.
pub const NO_READS: u32 = 1 << 0;
/// Bit: the position performs no writes.
pub const NO_WRITES: u32 = 1 << 1;
pub const BEHAVIOR_ALL: u32 = NO_READS | NO_WRITES;

// Memory-location classes. A set bit means the location is assumed *not* accessed.
pub const LOC_LOCAL: u32 = 1 << 0;
pub const LOC_CONST: u32 = 1 << 1;
pub const LOC_GLOBAL_INTERNAL: u32 = 1 << 2;
pub const LOC_GLOBAL_EXTERNAL: u32 = 1 << 3;
pub const LOC_ARGUMENT: u32 = 1 << 4;
pub const LOC_INACCESSIBLE: u32 = 1 << 5;
pub const LOC_MALLOCED: u32 = 1 << 6;
pub const LOC_UNKNOWN: u32 = 1 << 7;
pub const LOC_ALL: u32 = (1 << 8) - 1;

// ---- memory behavior -------------------------------------------------------

/// Whether the position reads or writes memory.
pub struct MemoryBehaviorAttr {
    pub pos: Position,
    pub state: BitSetState,
}

impl MemoryBehaviorAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BitSetState::new(BEHAVIOR_ALL),
        }
    }

    fn seed_from_attrs(&mut self, m: &Module) {
        for attr in self.pos.attrs_at(
            m,
            &[
                AttrKindTag::ReadNone,
                AttrKindTag::ReadOnly,
                AttrKindTag::WriteOnly,
            ],
        ) {
            match attr {
                Attr::ReadNone => {
                    self.state.add_known_bits(BEHAVIOR_ALL);
                }
                Attr::ReadOnly => {
                    self.state.add_known_bits(NO_WRITES);
                }
                Attr::WriteOnly => {
                    self.state.add_known_bits(NO_READS);
                }
                _ => {}
            }
        }
    }

    /// Behavior of a pointer value: which of read/write can happen *through* it.
    fn pointer_use_behavior(a: &mut FixpointEngine, value: Val) -> u32 {
        let mut bits = BEHAVIOR_ALL;
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
                    Opcode::Load { .. } if u.index == 0 => bits &= !NO_READS,
                    Opcode::Load { .. } => {}
                    Opcode::Store { .. } => {
                        if u.index == 1 {
                            bits &= !NO_WRITES;
                        } else {
                            // The pointer itself escapes into memory; anything may happen.
                            bits = 0;
                        }
                    }
                    Opcode::Gep
                    | Opcode::Cast(CastKind::Bitcast)
                    | Opcode::Select
                    | Opcode::Phi { .. } => {
                        if seen.insert(user) {
                            stack.push(user);
                        }
                    }
                    Opcode::Call | Opcode::Invoke { .. } if u.index > 0 => {
                        let callee_pos = Position::CallSiteArgument(user, u.index - 1);
                        let s = a.memory_behavior_state(callee_pos, DepClass::Required);
                        bits &= s.assumed();
                    }
                    Opcode::Icmp(_) | Opcode::Ret => {}
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

impl Deduce for MemoryBehaviorAttr {
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
        self.seed_from_attrs(m);
        // Whatever the attributes did not already promise about a declaration stays unknowable.
        let is_declaration = self
            .pos
            .callee_func(m)
            .map_or(false, |f| m.func(f).is_declaration());
        if is_declaration {
            self.state.indicate_pessimistic_fixpoint();
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                let mut bits = BEHAVIOR_ALL;
                let insts: Vec<Val> = a
                    .module()
                    .insts_of_func(f)
                    .filter(|&v| a.module().reads_memory(v) || a.module().writes_memory(v))
                    .collect();
                for v in insts {
                    if a.is_assumed_dead_inst(v) {
                        continue;
                    }
                    let op = a.module().expect_inst(v).op.clone();
                    match op {
                        Opcode::Load { .. } => bits &= !NO_READS,
                        Opcode::Store { .. } => bits &= !NO_WRITES,
                        Opcode::Call | Opcode::Invoke { .. } => {
                            let s = a
                                .memory_behavior_state(Position::CallSite(v), DepClass::Required);
                            bits &= s.assumed();
                        }
                        _ => {}
                    }
                }
                self.state.intersect_assumed(bits);
            }
            Position::CallSite(c) => match a.module().callee_of(c) {
                Some(callee) => {
                    let s =
                        a.memory_behavior_state(Position::Function(callee), DepClass::Required);
                    self.state.intersect_assumed(s.assumed());
                    self.state.add_known_bits(s.known());
                }
                None => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
            Position::Argument(_, _) | Position::Float(_) => {
                let v = self
                    .pos
                    .associated_value(a.module())
                    .expect("value position");
                let bits = Self::pointer_use_behavior(a, v);
                self.state.intersect_assumed(bits);
            }
            Position::CallSiteArgument(c, i) => match a.module().callee_of(c) {
                Some(callee) if i < a.module().func(callee).ty.params.len() => {
                    let s = a.memory_behavior_state(
                        Position::Argument(callee, i),
                        DepClass::Required,
                    );
                    self.state.intersect_assumed(s.assumed());
                    self.state.add_known_bits(s.known());
                }
                _ => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
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
        let attr = if self.state.is_assumed(BEHAVIOR_ALL) {
            Attr::ReadNone
        } else if self.state.is_assumed(NO_WRITES) {
            Attr::ReadOnly
        } else if self.state.is_assumed(NO_READS) {
            Attr::WriteOnly
        } else {
            return ChangeStatus::Unchanged;
        };
        match self.pos {
            Position::Float(_) | Position::Invalid => ChangeStatus::Unchanged,
            _ => a.manifest_attrs(self.pos, vec![attr]),
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        let s = if self.state.is_assumed(BEHAVIOR_ALL) {
            "readnone"
        } else if self.state.is_assumed(NO_WRITES) {
            "readonly"
        } else if self.state.is_assumed(NO_READS) {
            "writeonly"
        } else {
            "may-read-write"
        };
        format!("memory<{}>", s)
    }
}

// ---- memory location -------------------------------------------------------

/// Which classes of memory the position can touch. A set bit means the class is assumed
/// untouched.
pub struct MemoryLocationAttr {
    pub pos: Position,
    pub state: BitSetState,
}

impl MemoryLocationAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BitSetState::new(LOC_ALL),
        }
    }

    /// Classify an accessed pointer by tracing it to its origin.
    fn categorize(m: &Module, ptr: Val) -> u32 {
        let (base, _) = strip_pointer_casts(m, ptr);
        match &m.val(base).kind {
            ValueKind::Inst(inst) => match &inst.op {
                Opcode::Alloca { .. } => LOC_LOCAL,
                Opcode::Call | Opcode::Invoke { .. } => {
                    if m.alloc_kind_of(base).is_some() {
                        LOC_MALLOCED
                    } else {
                        LOC_UNKNOWN
                    }
                }
                _ => LOC_UNKNOWN,
            },
            ValueKind::Argument { .. } => LOC_ARGUMENT,
            _ => LOC_UNKNOWN,
        }
    }
}

impl Deduce for MemoryLocationAttr {
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
        let is_declaration = self
            .pos
            .callee_func(m)
            .map_or(false, |f| m.func(f).is_declaration());
        if is_declaration {
            // Without a body, only function-level purity attributes constrain the set.
            if self
                .pos
                .attrs_at(m, &[AttrKindTag::ReadNone])
                .iter()
                .any(|attr| matches!(attr, Attr::ReadNone))
            {
                self.state.add_known_bits(LOC_ALL);
            }
            self.state.indicate_pessimistic_fixpoint();
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                let mut bits = LOC_ALL;
                let insts: Vec<Val> = a
                    .module()
                    .insts_of_func(f)
                    .filter(|&v| a.module().reads_memory(v) || a.module().writes_memory(v))
                    .collect();
                for v in insts {
                    if a.is_assumed_dead_inst(v) {
                        continue;
                    }
                    let op = a.module().expect_inst(v).op.clone();
                    match op {
                        Opcode::Load { .. } => {
                            let ptr = a.module().expect_inst(v).operands[0];
                            bits &= !Self::categorize(a.module(), ptr);
                        }
                        Opcode::Store { .. } => {
                            let ptr = a.module().expect_inst(v).operands[1];
                            bits &= !Self::categorize(a.module(), ptr);
                        }
                        Opcode::Call | Opcode::Invoke { .. } => {
                            let s = a
                                .memory_location_state(Position::CallSite(v), DepClass::Required);
                            bits &= s.assumed();
                        }
                        _ => {}
                    }
                }
                self.state.intersect_assumed(bits);
            }
            Position::CallSite(c) => match a.module().callee_of(c) {
                Some(callee) => {
                    let s =
                        a.memory_location_state(Position::Function(callee), DepClass::Required);
                    self.state.intersect_assumed(s.assumed());
                    self.state.add_known_bits(s.known());
                }
                None => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
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

    fn manifest(&self, _a: &mut FixpointEngine) -> ChangeStatus {
        // Location sets inform peers (aliasing, behavior); there is no IR attribute to write.
        ChangeStatus::Unchanged
    }

    fn as_str(&self, _m: &Module) -> String {
        format!("memory-locations<{:#04x}>", self.state.assumed())
    }
}

// ---- heap to stack ---------------------------------------------------------

/// Small, provably-local heap allocations that can live on the stack instead.
pub struct HeapToStackAttr {
    pub pos: Position,
    explore: crate::attrs_liveness::ExplorationState,
    safe: UnorderedSet<Val>,
    bad: UnorderedSet<Val>,
    frees: UnorderedMap<Val, UnorderedSet<Val>>,
}

impl HeapToStackAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            explore: Default::default(),
            safe: Default::default(),
            bad: Default::default(),
            frees: Default::default(),
        }
    }

    /// Every transitive user of the allocation must be a known-safe pattern. Fills in the set of
    /// free calls taking (a derivation of) the pointer.
    fn uses_check(a: &mut FixpointEngine, malloc: Val, frees: &mut UnorderedSet<Val>) -> bool {
        let mut derived: UnorderedSet<Val> = Default::default();
        derived.insert(malloc);
        let mut stack = vec![malloc];
        let mut ok = true;
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
                            // Storing the pointer itself lets it escape.
                            ok = false;
                        }
                    }
                    Opcode::Gep
                    | Opcode::Cast(CastKind::Bitcast)
                    | Opcode::Select
                    | Opcode::Phi { .. } => {
                        if derived.insert(user) {
                            stack.push(user);
                        }
                    }
                    Opcode::Call | Opcode::Invoke { .. } => {
                        if a.module().is_free_call(user) {
                            frees.insert(user);
                        } else if u.index == 0 {
                            ok = false;
                        } else {
                            let arg_pos = Position::CallSiteArgument(user, u.index - 1);
                            let caps = a.no_capture_state(arg_pos, DepClass::Required);
                            let no_free =
                                a.is_assumed(AttrKind::NoFree, arg_pos, DepClass::Required);
                            if !caps.is_assumed(crate::attrs_pointer::NOT_CAPTURED_ALL) || !no_free
                            {
                                ok = false;
                            }
                        }
                    }
                    Opcode::Ret => {
                        ok = false;
                    }
                    _ => {
                        ok = false;
                    }
                }
            }
        }
        ok
    }

    /// The allocation is freed exactly once, at a point the allocation dominates, or not freed at
    /// all.
    fn frees_check(a: &mut FixpointEngine, malloc: Val, frees: &UnorderedSet<Val>) -> bool {
        if frees.is_empty() {
            return true;
        }
        if frees.len() != 1 {
            return false;
        }
        let f = a.module().parent_func(malloc).expect("malloc in a function");
        let summary = a.summary_of(f);
        frees
            .iter()
            .all(|&free| summary.dominates_inst(a.module(), malloc, free))
    }
}

impl Deduce for HeapToStackAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        &self.explore
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        &mut self.explore
    }

    fn initialize(&mut self, _a: &mut FixpointEngine) {
        if !CONFIG.enable_heap_to_stack {
            self.explore.indicate_pessimistic_fixpoint();
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let f = match self.pos {
            Position::Function(f) => f,
            _ => return ChangeStatus::Unchanged,
        };
        let mut changed = ChangeStatus::Unchanged;
        let mallocs: Vec<Val> = a
            .module()
            .insts_of_func(f)
            .filter(|&v| a.module().alloc_kind_of(v).is_some())
            .collect();
        for malloc in mallocs {
            if self.bad.contains(&malloc) || a.is_assumed_dead_inst(malloc) {
                continue;
            }
            match a.module().constant_alloc_size(malloc) {
                Some(size) if size <= CONFIG.max_heap_to_stack_size => {}
                _ => {
                    self.bad.insert(malloc);
                    if self.safe.remove(&malloc) {
                        changed = ChangeStatus::Changed;
                    }
                    continue;
                }
            }
            let mut frees: UnorderedSet<Val> = Default::default();
            let uses_ok = Self::uses_check(a, malloc, &mut frees);
            let frees_ok = Self::frees_check(a, malloc, &frees);
            // The admission predicate is a disjunction, matching the shipped behavior of the
            // analysis this one mirrors.
            if uses_ok || frees_ok {
                self.frees.insert(malloc, frees);
                if self.safe.insert(malloc) {
                    changed = ChangeStatus::Changed;
                }
            } else {
                self.bad.insert(malloc);
                if self.safe.remove(&malloc) {
                    changed = ChangeStatus::Changed;
                }
            }
        }
        changed
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        if self.explore.is_pessimized() {
            return ChangeStatus::Unchanged;
        }
        let mut changed = ChangeStatus::Unchanged;
        for &malloc in self.safe.iter() {
            if a.module().val(malloc).deleted || self.bad.contains(&malloc) {
                continue;
            }
            let size = match a.module().constant_alloc_size(malloc) {
                Some(size) => size,
                None => continue,
            };
            debug!("heap-to-stack conversion"; "malloc" => ?malloc, "bytes" => size);
            a.changes.heap_to_stack.push(HeapToStackRewrite {
                malloc,
                size,
                frees: self
                    .frees
                    .get(&malloc)
                    .map(|s| s.iter().copied().collect())
                    .unwrap_or_default(),
            });
            changed = ChangeStatus::Changed;
        }
        changed
    }

    fn as_str(&self, _m: &Module) -> String {
        format!("heap-to-stack<{} safe, {} bad>", self.safe.len(), self.bad.len())
    }
}

// ---- privatizable pointer --------------------------------------------------

/// A pointer argument whose pointee can be passed by value: the argument is replaced by the
/// flattened fields of its pointee type, with a scratch allocation rebuilt in the callee.
pub struct PrivatizableAttr {
    pub pos: Position,
    pub state: BooleanState,
    priv_ty: Option<Ty>,
}

impl PrivatizableAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
            priv_ty: None,
        }
    }

    /// The common single-element stack-allocation type of all call-site operands, if there is
    /// one.
    fn common_call_site_alloca_ty(a: &mut FixpointEngine, f: Func, i: usize) -> Option<Ty> {
        let mut common: Option<Ty> = None;
        let complete = a.check_for_all_call_sites(f, |a, call| {
            if i >= a.module().call_args(call).len() {
                return false;
            }
            let operand = a.module().call_args(call)[i];
            let allocated = match a.module().inst(operand).map(|inst| inst.op.clone()) {
                Some(Opcode::Alloca { allocated }) => allocated,
                _ => return false,
            };
            match common.take() {
                None => {
                    common = Some(allocated);
                    true
                }
                Some(ty) => {
                    let compatible = ty == allocated;
                    common = Some(ty);
                    compatible
                }
            }
        });
        if complete {
            common
        } else {
            None
        }
    }
}

impl Deduce for PrivatizableAttr {
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
        let (f, i) = match self.pos {
            Position::Argument(f, i) => (f, i),
            _ => {
                self.state.indicate_pessimistic_fixpoint();
                return;
            }
        };
        let m = a.module();
        let fd = m.func(f);
        if !is_ipo_amendable(m, f)
            || fd.ty.varargs
            || !fd.ty.params[i].is_pointer()
        {
            // Signature rewriting needs full control over every caller.
            self.state.indicate_pessimistic_fixpoint();
            return;
        }
        if fd.arg_attrs[i].has(AttrKindTag::ByVal) {
            self.priv_ty = fd.ty.params[i].pointee().cloned();
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        let (f, i) = match self.pos {
            Position::Argument(f, i) => (f, i),
            _ => return ChangeStatus::Unchanged,
        };
        let candidate = match &self.priv_ty {
            Some(ty) => Some(ty.clone()),
            None => Self::common_call_site_alloca_ty(a, f, i),
        };
        match candidate {
            Some(ty) if flattenable(&ty) && ty.size_in_bytes() > 0 => {
                self.priv_ty = Some(ty);
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
        let (f, i) = match self.pos {
            Position::Argument(f, i) => (f, i),
            _ => return ChangeStatus::Unchanged,
        };
        if !self.state.assumed() {
            return ChangeStatus::Unchanged;
        }
        let priv_ty = match &self.priv_ty {
            Some(ty) => ty.clone(),
            None => return ChangeStatus::Unchanged,
        };
        let leaves = priv_ty.flattened_with_offsets();
        let replacement_types: Vec<Ty> = leaves.iter().map(|(ty, _)| ty.clone()).collect();

        let callee_leaves = leaves.clone();
        let callee_priv_ty = priv_ty.clone();
        let callee_repair = Box::new(
            move |m: &mut Module, new_func: Func, replacement_args: &[Val]| -> Option<Val> {
                // Rebuild the pointee in a scratch stack slot at the entry, then hand the old
                // argument's users that slot.
                let entry = m.entry_block(new_func)?;
                let scratch = m.insert_inst_at(
                    entry,
                    0,
                    Ty::Ptr(Box::new(callee_priv_ty.clone())),
                    Opcode::Alloca {
                        allocated: callee_priv_ty.clone(),
                    },
                    vec![],
                    None,
                );
                let mut at = 1;
                for ((leaf_ty, offset), &arg) in callee_leaves.iter().zip(replacement_args) {
                    let offset_const = m.const_int(64, *offset as i128);
                    let slot = m.insert_inst_at(
                        entry,
                        at,
                        Ty::Ptr(Box::new(leaf_ty.clone())),
                        Opcode::Gep,
                        vec![scratch, offset_const],
                        None,
                    );
                    at += 1;
                    m.insert_inst_at(
                        entry,
                        at,
                        Ty::Void,
                        Opcode::Store {
                            volatile: false,
                            ordering: crate::ir::AtomicOrdering::NotAtomic,
                            align: 0,
                        },
                        vec![arg, slot],
                        None,
                    );
                    at += 1;
                }
                Some(scratch)
            },
        );

        let site_leaves = leaves;
        let call_site_repair = Box::new(
            move |m: &mut Module, call: Val, old_operand: Val| -> Vec<Val> {
                // Load each field out of the pointer the caller used to pass.
                let mut new_operands = vec![];
                for (leaf_ty, offset) in &site_leaves {
                    let offset_const = m.const_int(64, *offset as i128);
                    let slot = m.insert_inst_before(
                        call,
                        Ty::Ptr(Box::new(leaf_ty.clone())),
                        Opcode::Gep,
                        vec![old_operand, offset_const],
                        None,
                    );
                    let field = m.insert_inst_before(
                        call,
                        leaf_ty.clone(),
                        Opcode::Load {
                            volatile: false,
                            ordering: crate::ir::AtomicOrdering::NotAtomic,
                            align: 0,
                        },
                        vec![slot],
                        None,
                    );
                    new_operands.push(field);
                }
                new_operands
            },
        );

        a.changes.signature_rewrites.push(SignatureRewrite {
            func: f,
            arg_index: i,
            replacement_types,
            callee_repair,
            call_site_repair,
        });
        ChangeStatus::Changed
    }

    fn as_str(&self, _m: &Module) -> String {
        match &self.priv_ty {
            Some(ty) if self.state.assumed() => format!("privatizable<{:?}>", ty),
            _ => "not-privatizable".to_owned(),
        }
    }
}
