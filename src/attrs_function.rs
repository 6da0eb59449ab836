//! Function-behavior facts: no-unwind, no-sync, no-free, no-recurse, will-return, no-return.
//!
//! Each record serves every position kind it is meaningful at; the position is matched inside the
//! hooks. Call-site mirrors defer to the callee-side position unless they have site-specific
//! reasoning.

use crate::combinators::bool_from_callee;
use crate::engine::{AttrKind, FixpointEngine, Deduce, DepClass};
use crate::ir::{AtomicOrdering, Attr, AttrKindTag, CastKind, Func, Module, Opcode, Val};
use crate::lattice::{AbstractState, BooleanState, ChangeStatus};
use crate::position::Position;

fn delta(before: BooleanState, after: BooleanState) -> ChangeStatus {
    if before == after {
        ChangeStatus::Unchanged
    } else {
        ChangeStatus::Changed
    }
}

/// Seed a boolean function fact from IR attributes; declarations settle immediately since their
/// bodies cannot be inspected.
fn seed_boolean(state: &mut BooleanState, a: &FixpointEngine, pos: Position, tag: AttrKindTag) {
    let m = a.module();
    if pos.has_attr(m, tag) {
        state.set_known();
        state.indicate_optimistic_fixpoint();
        return;
    }
    let is_declaration = pos
        .callee_func(m)
        .map_or(true, |f| m.func(f).is_declaration());
    if is_declaration {
        state.indicate_pessimistic_fixpoint();
    }
}

fn manifest_boolean(
    a: &mut FixpointEngine,
    pos: Position,
    state: &BooleanState,
    attr: Attr,
) -> ChangeStatus {
    if state.assumed() {
        a.manifest_attrs(pos, vec![attr])
    } else {
        ChangeStatus::Unchanged
    }
}

fn boolean_as_str(name: &str, state: &BooleanState) -> String {
    let level = if state.known() {
        "known"
    } else if state.assumed() {
        "assumed"
    } else {
        "no"
    };
    format!("{}<{}>", name, level)
}

// ---- no-unwind -------------------------------------------------------------

/// The function (or call) never transfers control out by unwinding.
pub struct NoUnwindAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NoUnwindAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }
}

impl Deduce for NoUnwindAttr {
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
        seed_boolean(&mut self.state, a, self.pos, AttrKindTag::NoUnwind);
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                // Only call-like instructions can raise in this IR; each one is fine when its
                // callee is assumed not to unwind.
                let ok = a.check_for_all_call_like(f, |a, c| {
                    a.is_assumed(AttrKind::NoUnwind, Position::CallSite(c), DepClass::Required)
                });
                if !ok {
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
            Position::CallSite(_) => match bool_from_callee(a, AttrKind::NoUnwind, self.pos) {
                Some((assumed, known)) => {
                    if !assumed {
                        self.state.indicate_pessimistic_fixpoint();
                    } else if known {
                        self.state.set_known();
                    }
                }
                None => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
        delta(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        manifest_boolean(a, self.pos, &self.state, Attr::NoUnwind)
    }

    fn as_str(&self, _m: &Module) -> String {
        boolean_as_str("nounwind", &self.state)
    }
}

// ---- no-sync ---------------------------------------------------------------

/// The function never synchronizes with other threads of execution.
pub struct NoSyncAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NoSyncAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }

    fn inst_is_no_sync(a: &mut FixpointEngine, v: Val) -> bool {
        enum Step {
            Memory { volatile: bool, ordering: AtomicOrdering },
            CallLike,
            Other,
        }
        let step = match &a.module().expect_inst(v).op {
            Opcode::Load {
                volatile, ordering, ..
            }
            | Opcode::Store {
                volatile, ordering, ..
            } => Step::Memory {
                volatile: *volatile,
                ordering: *ordering,
            },
            op if op.is_call_like() => Step::CallLike,
            _ => Step::Other,
        };
        match step {
            Step::Memory { volatile, ordering } => {
                !volatile && ordering <= AtomicOrdering::Monotonic
            }
            Step::CallLike => {
                a.is_assumed(AttrKind::NoSync, Position::CallSite(v), DepClass::Required)
            }
            Step::Other => true,
        }
    }
}

impl Deduce for NoSyncAttr {
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
        seed_boolean(&mut self.state, a, self.pos, AttrKindTag::NoSync);
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                let ok = a.check_for_all_instructions(
                    f,
                    |op| {
                        matches!(op, Opcode::Load { .. } | Opcode::Store { .. })
                            || op.is_call_like()
                    },
                    Self::inst_is_no_sync,
                );
                if !ok {
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
            Position::CallSite(_) => {
                // A convergent call synchronizes by definition unless the callee itself is
                // no-sync, which is exactly the check below.
                match bool_from_callee(a, AttrKind::NoSync, self.pos) {
                    Some((assumed, known)) => {
                        if !assumed {
                            self.state.indicate_pessimistic_fixpoint();
                        } else if known {
                            self.state.set_known();
                        }
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
        delta(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        manifest_boolean(a, self.pos, &self.state, Attr::NoSync)
    }

    fn as_str(&self, _m: &Module) -> String {
        boolean_as_str("nosync", &self.state)
    }
}

// ---- no-free ---------------------------------------------------------------

/// The function (or the tracked pointer) is never passed to a deallocation routine.
pub struct NoFreeAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NoFreeAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }

    /// Floating walk: every use of `value` must be benign with respect to freeing. Propagation
    /// through geps, casts, phis, selects, and returns goes via peer records, so cycles in the use
    /// graph land on the engine's self-cycle pessimism instead of recursing.
    fn uses_dont_free(a: &mut FixpointEngine, value: Val) -> bool {
        let uses = a.module().val(value).uses.clone();
        for use_ref in uses {
            let user = use_ref.user;
            if a.module().val(user).deleted || a.is_assumed_dead_inst(user) {
                continue;
            }
            let op = a.module().expect_inst(user).op.clone();
            let ok = match op {
                Opcode::Load { .. } | Opcode::Icmp(_) => true,
                Opcode::Store { .. } => use_ref.index == 1,
                Opcode::Gep if use_ref.index == 0 => {
                    a.is_assumed(AttrKind::NoFree, Position::Float(user), DepClass::Required)
                }
                Opcode::Cast(CastKind::Bitcast) | Opcode::Phi { .. } | Opcode::Select => {
                    a.is_assumed(AttrKind::NoFree, Position::Float(user), DepClass::Required)
                }
                Opcode::Ret => {
                    let f = a.module().parent_func(user).expect("ret inside a function");
                    a.check_for_all_call_sites(f, |a, call| {
                        if a.module().ty_of(call).is_void() {
                            return true;
                        }
                        a.is_assumed(
                            AttrKind::NoFree,
                            Position::CallSiteReturned(call),
                            DepClass::Required,
                        )
                    })
                }
                Opcode::Call | Opcode::Invoke { .. } => {
                    if use_ref.index == 0 {
                        // The value is the callee operand; nothing frees a code address.
                        true
                    } else if a.module().is_free_call(user) {
                        false
                    } else {
                        a.is_assumed(
                            AttrKind::NoFree,
                            Position::CallSiteArgument(user, use_ref.index - 1),
                            DepClass::Required,
                        )
                    }
                }
                _ => false,
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

impl Deduce for NoFreeAttr {
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
        match self.pos {
            Position::Function(_) | Position::CallSite(_) => {
                seed_boolean(&mut self.state, a, self.pos, AttrKindTag::NoFree);
            }
            _ => {
                let m = a.module();
                if self.pos.has_attr(m, AttrKindTag::NoFree) {
                    self.state.set_known();
                    self.state.indicate_optimistic_fixpoint();
                } else if self
                    .pos
                    .callee_func(m)
                    .map_or(false, |f| m.func(f).is_declaration())
                {
                    // A declaration's body is invisible; nothing about its use of the pointer can
                    // be assumed.
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        let ok = match self.pos {
            Position::Function(f) => a.check_for_all_call_like(f, |a, c| {
                a.is_assumed(AttrKind::NoFree, Position::CallSite(c), DepClass::Required)
            }),
            Position::CallSite(_) => match bool_from_callee(a, AttrKind::NoFree, self.pos) {
                Some((assumed, known)) => {
                    if known {
                        self.state.set_known();
                    }
                    assumed
                }
                None => false,
            },
            Position::CallSiteArgument(c, i) => {
                // The whole callee not freeing anything subsumes it not freeing this operand.
                if a.is_assumed(AttrKind::NoFree, Position::CallSite(c), DepClass::Optional) {
                    true
                } else {
                    match a.module().callee_of(c) {
                        Some(callee) if i < a.module().func(callee).ty.params.len() => a
                            .is_assumed(
                                AttrKind::NoFree,
                                Position::Argument(callee, i),
                                DepClass::Required,
                            ),
                        _ => false,
                    }
                }
            }
            Position::Argument(_, _) | Position::Float(_) | Position::CallSiteReturned(_) => {
                match self.pos.associated_value(a.module()) {
                    Some(v) => Self::uses_dont_free(a, v),
                    None => false,
                }
            }
            _ => false,
        };
        if !ok {
            self.state.indicate_pessimistic_fixpoint();
        }
        delta(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        match self.pos {
            Position::Float(_) | Position::CallSiteReturned(_) => ChangeStatus::Unchanged,
            _ => manifest_boolean(a, self.pos, &self.state, Attr::NoFree),
        }
    }

    fn as_str(&self, _m: &Module) -> String {
        boolean_as_str("nofree", &self.state)
    }
}

// ---- no-recurse ------------------------------------------------------------

/// The function is never re-entered while an activation of it is on the stack.
pub struct NoRecurseAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NoRecurseAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }
}

impl Deduce for NoRecurseAttr {
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
        seed_boolean(&mut self.state, a, self.pos, AttrKindTag::NoRecurse);
        if self.state.is_at_fixpoint() {
            return;
        }
        if let Position::Function(f) = self.pos {
            let sccs = a.sccs();
            if sccs.in_cycle(f) {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                // Either every callee is no-recurse and is not us, or every caller is no-recurse,
                // which makes re-entry impossible from above.
                let callees_ok = a.check_for_all_call_like(f, |a, c| {
                    match a.module().callee_of(c) {
                        Some(callee) if callee != f => a.is_assumed(
                            AttrKind::NoRecurse,
                            Position::Function(callee),
                            DepClass::Required,
                        ),
                        _ => false,
                    }
                });
                let ok = callees_ok
                    || a.check_for_all_call_sites(f, |a, call| {
                        let caller = a.module().parent_func(call).expect("call in a function");
                        a.is_known(
                            AttrKind::NoRecurse,
                            Position::Function(caller),
                            DepClass::Required,
                        )
                    });
                if !ok {
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
            Position::CallSite(_) => match bool_from_callee(a, AttrKind::NoRecurse, self.pos) {
                Some((assumed, known)) => {
                    if !assumed {
                        self.state.indicate_pessimistic_fixpoint();
                    } else if known {
                        self.state.set_known();
                    }
                }
                None => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
        delta(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        manifest_boolean(a, self.pos, &self.state, Attr::NoRecurse)
    }

    fn as_str(&self, _m: &Module) -> String {
        boolean_as_str("norecurse", &self.state)
    }
}

// ---- will-return -----------------------------------------------------------

/// Every invocation of the function eventually returns (or unwinds); it cannot run forever.
pub struct WillReturnAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl WillReturnAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }
}

impl Deduce for WillReturnAttr {
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
        seed_boolean(&mut self.state, a, self.pos, AttrKindTag::WillReturn);
        if self.state.is_at_fixpoint() {
            return;
        }
        if let Position::Function(f) = self.pos {
            let summary = a.summary_of(f);
            if summary.has_cycle() && !summary.all_cycles_bounded(a.module()) {
                // A loop with no known trip bound may run forever.
                self.state.indicate_pessimistic_fixpoint();
            }
        }
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                let ok = a.check_for_all_call_like(f, |a, c| {
                    let cs = Position::CallSite(c);
                    if a.is_known(AttrKind::WillReturn, cs, DepClass::Required) {
                        return true;
                    }
                    if !a.is_assumed(AttrKind::WillReturn, cs, DepClass::Required) {
                        return false;
                    }
                    // An assumed-will-return callee still needs no-recurse, or the cycle through
                    // us could spin forever.
                    match a.module().callee_of(c) {
                        Some(callee) => a.is_assumed(
                            AttrKind::NoRecurse,
                            Position::Function(callee),
                            DepClass::Required,
                        ),
                        None => false,
                    }
                });
                if !ok {
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
            Position::CallSite(_) => match bool_from_callee(a, AttrKind::WillReturn, self.pos) {
                Some((assumed, known)) => {
                    if !assumed {
                        self.state.indicate_pessimistic_fixpoint();
                    } else if known {
                        self.state.set_known();
                    }
                }
                None => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
        delta(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        manifest_boolean(a, self.pos, &self.state, Attr::WillReturn)
    }

    fn as_str(&self, _m: &Module) -> String {
        boolean_as_str("willreturn", &self.state)
    }
}

// ---- no-return -------------------------------------------------------------

/// Control never returns from the function to its caller.
pub struct NoReturnAttr {
    pub pos: Position,
    pub state: BooleanState,
}

impl NoReturnAttr {
    pub fn new(pos: Position) -> Self {
        Self {
            pos,
            state: BooleanState::default(),
        }
    }
}

impl Deduce for NoReturnAttr {
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
        seed_boolean(&mut self.state, a, self.pos, AttrKindTag::NoReturn);
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        let before = self.state;
        match self.pos {
            Position::Function(f) => {
                // `no-return` survives exactly as long as no return instruction is assumed live.
                let no_live_returns = a.check_for_all_instructions(
                    f,
                    |op| matches!(op, Opcode::Ret),
                    |_, _| false,
                );
                if !no_live_returns {
                    self.state.indicate_pessimistic_fixpoint();
                }
            }
            Position::CallSite(_) => match bool_from_callee(a, AttrKind::NoReturn, self.pos) {
                Some((assumed, known)) => {
                    if !assumed {
                        self.state.indicate_pessimistic_fixpoint();
                    } else if known {
                        self.state.set_known();
                    }
                }
                None => {
                    self.state.indicate_pessimistic_fixpoint();
                }
            },
            _ => {
                self.state.indicate_pessimistic_fixpoint();
            }
        }
        delta(before, self.state)
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        manifest_boolean(a, self.pos, &self.state, Attr::NoReturn)
    }

    fn as_str(&self, _m: &Module) -> String {
        boolean_as_str("noreturn", &self.state)
    }
}

/// Whether `f` can be analyzed and annotated as a unit: it either has internal linkage (every use
/// is visible) or is a definition we may still read, in which case facts hold but signature-level
/// rewrites must not assume all callers are known.
pub fn is_ipo_amendable(m: &Module, f: Func) -> bool {
    let fd = m.func(f);
    fd.internal && !fd.is_declaration()
}
