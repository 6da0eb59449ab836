//! Liveness (which code and values still matter), undefined behavior, and the reachability stub.

use crate::combinators::{simplified_int_constant, simplified_is_null, simplified_is_undef};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::engine::{AttrKind, FixpointEngine, Deduce, DepClass};
use crate::ir::{Block, Func, Module, Opcode, UseRef, Val};
use crate::lattice::{AbstractState, BooleanState, ChangeStatus};
use crate::position::Position;

/// State for analyses whose progress is a monotonically growing set rather than a shrinking
/// assumed bound. Always valid; frozen explicitly or by the engine's promotion. A pessimistic
/// freeze additionally marks the accumulated set as unusable, since it may be incomplete.
#[derive(Clone, Copy, Default, Debug)]
pub struct ExplorationState {
    fixed: bool,
    pessimized: bool,
}

impl ExplorationState {
    pub fn is_pessimized(&self) -> bool {
        self.pessimized
    }
}

impl AbstractState for ExplorationState {
    fn is_valid(&self) -> bool {
        true
    }

    fn is_at_fixpoint(&self) -> bool {
        self.fixed
    }

    fn indicate_optimistic_fixpoint(&mut self) -> ChangeStatus {
        self.fixed = true;
        ChangeStatus::Unchanged
    }

    fn indicate_pessimistic_fixpoint(&mut self) -> ChangeStatus {
        self.fixed = true;
        if self.pessimized {
            ChangeStatus::Unchanged
        } else {
            self.pessimized = true;
            ChangeStatus::Changed
        }
    }
}

// ---- liveness --------------------------------------------------------------

/// Liveness comes in two forms sharing one record type.
///
/// At a *function* position, the record explores control flow from the entry, optimistically
/// assuming that calls to assumed-no-return callees never fall through and that branch conditions
/// the simplifier has settled prune their untaken edges. Everything not reached is assumed dead.
///
/// At *value* positions, the record tracks whether the value's result is needed at all: a value is
/// dead when it is side-effect-free and every user is dead.
pub struct IsDeadAttr {
    pub pos: Position,
    pub state: BooleanState,
    explore: ExplorationState,
    live_blocks: UnorderedSet<Block>,
    live_insts: UnorderedSet<Val>,
    to_explore: Vec<Val>,
    /// Call-like instructions where the walk stopped because the callee was assumed no-return.
    dead_ends: UnorderedSet<Val>,
    /// Terminators whose untaken edges were pruned under a simplified condition, with the constant
    /// that justified the pruning.
    pruned_branches: UnorderedMap<Val, i128>,
    /// Invokes whose unwind edge was skipped because the callee was assumed no-unwind.
    pruned_unwinds: UnorderedSet<Val>,
}

impl IsDeadAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
            explore: ExplorationState::default(),
            live_blocks: Default::default(),
            live_insts: Default::default(),
            to_explore: vec![],
            dead_ends: Default::default(),
            pruned_branches: Default::default(),
            pruned_unwinds: Default::default(),
        }
    }

    pub fn is_assumed_live_block(&self, b: Block) -> bool {
        self.explore.is_pessimized() || self.live_blocks.contains(&b)
    }

    pub fn is_assumed_live_inst(&self, v: Val) -> bool {
        self.explore.is_pessimized() || self.live_insts.contains(&v)
    }

    fn mark_block_live(&mut self, m: &Module, b: Block) -> ChangeStatus {
        if self.live_blocks.insert(b) {
            if let Some(first) = m.insts_of(b).next() {
                self.to_explore.push(first);
            }
            ChangeStatus::Changed
        } else {
            ChangeStatus::Unchanged
        }
    }

    /// Walk live instructions of `start`'s block from `start` onward, stopping at assumed-dead
    /// ends and queueing newly live successors.
    fn walk_from(&mut self, a: &mut FixpointEngine, start: Val) -> ChangeStatus {
        let mut changed = ChangeStatus::Unchanged;
        let block = match a.module().parent_block(start) {
            Some(b) => b,
            None => return changed,
        };
        let insts: Vec<Val> = {
            let m = a.module();
            m.insts_of(block)
                .skip_while(|&v| v != start)
                .collect()
        };
        for v in insts {
            if self.live_insts.insert(v) {
                changed = ChangeStatus::Changed;
            }
            let op = a.module().expect_inst(v).op.clone();
            match op {
                Opcode::Call => {
                    if a.is_assumed(AttrKind::NoReturn, Position::CallSite(v), DepClass::Optional) {
                        // Control is assumed to never pass this call.
                        self.dead_ends.insert(v);
                        return ChangeStatus::Changed;
                    }
                    self.dead_ends.remove(&v);
                }
                Opcode::Invoke { normal, unwind } => {
                    if a.is_assumed(AttrKind::NoReturn, Position::CallSite(v), DepClass::Optional) {
                        self.dead_ends.insert(v);
                        return ChangeStatus::Changed;
                    }
                    self.dead_ends.remove(&v);
                    changed |= self.mark_block_live(a.module(), normal);
                    if a.is_assumed(AttrKind::NoUnwind, Position::CallSite(v), DepClass::Optional) {
                        self.pruned_unwinds.insert(v);
                    } else {
                        self.pruned_unwinds.remove(&v);
                        changed |= self.mark_block_live(a.module(), unwind);
                    }
                    return changed;
                }
                Opcode::Br(dest) => {
                    changed |= self.mark_block_live(a.module(), dest);
                    return changed;
                }
                Opcode::CondBr {
                    then_dest,
                    else_dest,
                } => {
                    let cond = a.module().expect_inst(v).operands[0];
                    let decided = simplified_int_constant(a, cond, DepClass::Optional);
                    match decided {
                        Some(c) => {
                            let taken = if c != 0 { then_dest } else { else_dest };
                            self.pruned_branches.insert(v, c);
                            changed |= self.mark_block_live(a.module(), taken);
                        }
                        None => {
                            self.pruned_branches.remove(&v);
                            changed |= self.mark_block_live(a.module(), then_dest);
                            changed |= self.mark_block_live(a.module(), else_dest);
                        }
                    }
                    return changed;
                }
                Opcode::Switch { default, cases } => {
                    let on = a.module().expect_inst(v).operands[0];
                    let decided = simplified_int_constant(a, on, DepClass::Optional);
                    match decided {
                        Some(c) => {
                            let taken = cases
                                .iter()
                                .find(|(case, _)| *case == c)
                                .map(|(_, b)| *b)
                                .unwrap_or(default);
                            self.pruned_branches.insert(v, c);
                            changed |= self.mark_block_live(a.module(), taken);
                        }
                        None => {
                            self.pruned_branches.remove(&v);
                            changed |= self.mark_block_live(a.module(), default);
                            for (_, b) in cases {
                                changed |= self.mark_block_live(a.module(), b);
                            }
                        }
                    }
                    return changed;
                }
                Opcode::Ret | Opcode::Unreachable => return changed,
                _ => {}
            }
        }
        changed
    }

    fn update_function(&mut self, a: &mut FixpointEngine, _f: Func) -> ChangeStatus {
        let mut changed = ChangeStatus::Unchanged;
        // Every pruning decision was optimistic; re-visit the ones whose justification no longer
        // holds. The walk itself re-derives what to prune.
        let stale_dead_ends: Vec<Val> = self
            .dead_ends
            .iter()
            .copied()
            .filter(|&c| {
                !a.is_assumed(AttrKind::NoReturn, Position::CallSite(c), DepClass::Optional)
            })
            .collect();
        for c in stale_dead_ends {
            self.dead_ends.remove(&c);
            self.to_explore.push(c);
        }
        let stale_branches: Vec<Val> = self
            .pruned_branches
            .iter()
            .map(|(&term, &c)| (term, c))
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|&(term, c)| {
                let cond = a.module().expect_inst(term).operands[0];
                simplified_int_constant(a, cond, DepClass::Optional) != Some(c)
            })
            .map(|(term, _)| term)
            .collect();
        for term in stale_branches {
            self.pruned_branches.remove(&term);
            self.to_explore.push(term);
        }
        let stale_unwinds: Vec<Val> = self
            .pruned_unwinds
            .iter()
            .copied()
            .filter(|&v| {
                !a.is_assumed(AttrKind::NoUnwind, Position::CallSite(v), DepClass::Optional)
            })
            .collect();
        for v in stale_unwinds {
            self.pruned_unwinds.remove(&v);
            self.to_explore.push(v);
        }
        while let Some(start) = self.to_explore.pop() {
            changed |= self.walk_from(a, start);
        }
        changed
    }

    /// Whether every user of `v` is assumed dead.
    fn users_all_dead(a: &mut FixpointEngine, v: Val) -> bool {
        let uses: Vec<UseRef> = a.module().val(v).uses.clone();
        for use_ref in uses {
            let user = use_ref.user;
            if a.module().val(user).deleted || a.is_assumed_dead_inst(user) {
                continue;
            }
            let is_ret = matches!(a.module().expect_inst(user).op, Opcode::Ret);
            let dead = if is_ret {
                let f = a.module().parent_func(user).expect("ret in a function");
                a.is_assumed(AttrKind::IsDead, Position::Returned(f), DepClass::Required)
            } else {
                a.is_assumed(AttrKind::IsDead, Position::Float(user), DepClass::Required)
            };
            if !dead {
                return false;
            }
        }
        true
    }
}

impl Deduce for IsDeadAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        match self.pos {
            Position::Function(_) => &self.explore,
            _ => &self.state,
        }
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        match self.pos {
            Position::Function(_) => &mut self.explore,
            _ => &mut self.state,
        }
    }

    fn initialize(&mut self, a: &mut FixpointEngine) {
        match self.pos {
            Position::Function(f) => {
                let m = a.module();
                if let Some(entry) = m.entry_block(f) {
                    self.live_blocks.insert(entry);
                    if let Some(first) = m.insts_of(entry).next() {
                        self.to_explore.push(first);
                    }
                }
            }
            Position::Float(v) => {
                let m = a.module();
                let is_terminator = m.inst(v).map_or(false, |i| i.op.is_terminator());
                if m.has_side_effects(v) || is_terminator || m.ty_of(v).is_void() {
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
            Position::Returned(_) | Position::Argument(_, _) | Position::CallSiteReturned(_) => {}
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        match self.pos {
            Position::Function(f) => self.update_function(a, f),
            Position::Returned(f) => {
                let before = self.state;
                let all_results_dead = a.check_for_all_call_sites(f, |a, call| {
                    if a.module().ty_of(call).is_void() {
                        return true;
                    }
                    a.is_assumed(
                        AttrKind::IsDead,
                        Position::CallSiteReturned(call),
                        DepClass::Required,
                    )
                });
                if !all_results_dead {
                    self.state.indicate_pessimistic_fixpoint();
                }
                if before == self.state {
                    ChangeStatus::Unchanged
                } else {
                    ChangeStatus::Changed
                }
            }
            Position::Float(_) | Position::Argument(_, _) | Position::CallSiteReturned(_) => {
                let before = self.state;
                let v = self
                    .pos
                    .associated_value(a.module())
                    .expect("value position");
                if !Self::users_all_dead(a, v) {
                    self.state.indicate_pessimistic_fixpoint();
                }
                if before == self.state {
                    ChangeStatus::Unchanged
                } else {
                    ChangeStatus::Changed
                }
            }
            _ => ChangeStatus::Unchanged,
        }
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        let mut changed = ChangeStatus::Unchanged;
        match self.pos {
            Position::Function(f) => {
                if self.explore.is_pessimized() {
                    // The exploration never finished; the live sets are not trustworthy.
                    return ChangeStatus::Unchanged;
                }
                let dead_blocks: Vec<Block> = a
                    .module()
                    .blocks_of(f)
                    .filter(|b| !self.live_blocks.contains(b))
                    .collect();
                for b in dead_blocks {
                    a.changes.dead_blocks.push(b);
                    changed = ChangeStatus::Changed;
                }
                for &c in self.dead_ends.iter() {
                    let cut_here = {
                        let m = a.module();
                        !m.val(c).deleted
                            && self.is_assumed_live_inst(c)
                            && matches!(m.expect_inst(c).op, Opcode::Call)
                    };
                    if cut_here {
                        a.changes.unreachable_after.push(c);
                        changed = ChangeStatus::Changed;
                    }
                }
                // Invokes whose unwind edge was never reached can drop their exceptional path.
                let invokes: Vec<(Val, Block)> = a
                    .module()
                    .insts_of_func(f)
                    .filter_map(|v| match a.module().expect_inst(v).op {
                        Opcode::Invoke { unwind, .. } => Some((v, unwind)),
                        _ => None,
                    })
                    .collect();
                let personality = a.module().func(f).has_personality;
                for (v, unwind) in invokes {
                    if self.is_assumed_live_inst(v)
                        && !self.live_blocks.contains(&unwind)
                        && !personality
                    {
                        a.changes.invoke_to_call.push(v);
                        changed = ChangeStatus::Changed;
                    }
                }
            }
            Position::Returned(f) => {
                if !self.state.assumed() {
                    return ChangeStatus::Unchanged;
                }
                // The returned value is never observed; unhook it so the computation behind it
                // can die.
                let rets: Vec<Val> = a
                    .module()
                    .insts_of_func(f)
                    .filter(|&v| matches!(a.module().expect_inst(v).op, Opcode::Ret))
                    .filter(|&v| !a.module().expect_inst(v).operands.is_empty())
                    .collect();
                for ret in rets {
                    let operand = a.module().expect_inst(ret).operands[0];
                    if a.module().is_constant(operand) || a.module().is_undef(operand) {
                        continue;
                    }
                    let ty = a.module().ty_of(operand).clone();
                    let undef = a.module_mut().undef(ty);
                    a.changes
                        .use_replacements
                        .push((UseRef { user: ret, index: 0 }, undef));
                    changed = ChangeStatus::Changed;
                }
            }
            Position::Float(v) => {
                if self.state.assumed() {
                    a.changes.dead_values.push(v);
                    changed = ChangeStatus::Changed;
                }
            }
            _ => {}
        }
        changed
    }

    fn as_str(&self, m: &Module) -> String {
        match self.pos {
            Position::Function(f) => format!(
                "live<{}/{} blocks>",
                self.live_blocks.len(),
                m.blocks_of(f).count()
            ),
            _ => {
                if self.state.assumed() {
                    "assumed-dead".to_owned()
                } else {
                    "live".to_owned()
                }
            }
        }
    }
}

// ---- undefined behavior ----------------------------------------------------

/// Collects instructions whose execution is undefined: memory accesses through pointers the
/// simplifier settled to null (where null is not a valid address), and conditional branches on
/// undefined conditions.
pub struct UndefinedBehaviorAttr {
    pub pos: Position,
    explore: ExplorationState,
    ub_insts: UnorderedSet<Val>,
}

impl UndefinedBehaviorAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            explore: ExplorationState::default(),
            ub_insts: Default::default(),
        }
    }

    pub fn is_known_ub(&self, v: Val) -> bool {
        self.ub_insts.contains(&v)
    }
}

impl Deduce for UndefinedBehaviorAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        &self.explore
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        &mut self.explore
    }

    fn initialize(&mut self, _a: &mut FixpointEngine) {}

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let f = match self.pos {
            Position::Function(f) => f,
            _ => return ChangeStatus::Unchanged,
        };
        let null_is_defined = a.module().null_pointer_is_defined(f);

        // The classification leans on assumed simplifications that may later retract; rebuild the
        // set from scratch every round rather than only growing it.
        let mut ub_insts: UnorderedSet<Val> = Default::default();

        let accesses: Vec<(Val, Val)> = a
            .module()
            .insts_of_func(f)
            .filter_map(|v| {
                let inst = a.module().expect_inst(v);
                match inst.op {
                    Opcode::Load { .. } => Some((v, inst.operands[0])),
                    Opcode::Store { .. } => Some((v, inst.operands[1])),
                    _ => None,
                }
            })
            .collect();
        for (inst, ptr) in accesses {
            if a.is_assumed_dead_inst(inst) || null_is_defined {
                continue;
            }
            let is_null =
                a.module().is_null_const(ptr) || simplified_is_null(a, ptr, DepClass::Optional);
            if is_null {
                ub_insts.insert(inst);
            }
        }

        let branches: Vec<(Val, Val)> = a
            .module()
            .insts_of_func(f)
            .filter_map(|v| {
                let inst = a.module().expect_inst(v);
                match inst.op {
                    Opcode::CondBr { .. } => Some((v, inst.operands[0])),
                    _ => None,
                }
            })
            .collect();
        for (inst, cond) in branches {
            if a.is_assumed_dead_inst(inst) {
                continue;
            }
            let undef_cond =
                a.module().is_undef(cond) || simplified_is_undef(a, cond, DepClass::Optional);
            if undef_cond {
                ub_insts.insert(inst);
            }
        }

        if ub_insts == self.ub_insts {
            ChangeStatus::Unchanged
        } else {
            self.ub_insts = ub_insts;
            ChangeStatus::Changed
        }
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        if self.explore.is_pessimized() {
            return ChangeStatus::Unchanged;
        }
        let mut changed = ChangeStatus::Unchanged;
        for &v in self.ub_insts.iter() {
            if !a.module().val(v).deleted {
                a.changes.unreachable_before.push(v);
                changed = ChangeStatus::Changed;
            }
        }
        changed
    }

    fn as_str(&self, _m: &Module) -> String {
        format!("undefined-behavior<{} insts>", self.ub_insts.len())
    }
}

// ---- reachability ----------------------------------------------------------

/// Instruction-to-instruction reachability. Kept as an interface point; the implementation always
/// answers conservatively.
pub struct ReachabilityAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl ReachabilityAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }

    /// Whether `_from` may reach `_to`. Conservatively `true`.
    pub fn can_reach(&self, _from: Val, _to: Val) -> bool {
        true
    }
}

impl Deduce for ReachabilityAttr {
    fn position(&self) -> Position {
        self.pos
    }

    fn state(&self) -> &dyn AbstractState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut dyn AbstractState {
        &mut self.state
    }

    fn initialize(&mut self, _a: &mut FixpointEngine) {
        self.state.indicate_pessimistic_fixpoint();
    }

    fn update(&mut self, _a: &mut FixpointEngine) -> ChangeStatus {
        ChangeStatus::Unchanged
    }

    fn manifest(&self, _a: &mut FixpointEngine) -> ChangeStatus {
        ChangeStatus::Unchanged
    }

    fn as_str(&self, _m: &Module) -> String {
        "reachability<pessimistic>".to_owned()
    }
}
