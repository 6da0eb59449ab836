//! The cooperative fixpoint engine.
//!
//! The engine owns every in-flight analysis record, the cache that interns them by
//! `(kind, position)`, the dependency graph between them, and the deduplicating worklist. It runs
//! records' update hooks until quiescence (or an iteration cap), cascades invalidation along
//! required dependency edges, and finally asks every surviving record to manifest its fact, after
//! which the staged IR edits are replayed in one batch.
//!
//! Records are stored in `Option` slots: an update takes its record out of the arena, runs it with
//! full engine access, and puts it back. A record that observes its own slot empty during a query
//! has found a self-cycle and must treat that as a signal to pessimize, never to recurse.

use crate::analysis::AnalysisCache;
use crate::attrs_function::{
    NoFreeAttr, NoRecurseAttr, NoReturnAttr, NoSyncAttr, NoUnwindAttr, WillReturnAttr,
};
use crate::attrs_liveness::{IsDeadAttr, ReachabilityAttr, UndefinedBehaviorAttr};
use crate::attrs_memory::{HeapToStackAttr, MemoryBehaviorAttr, MemoryLocationAttr, PrivatizableAttr};
use crate::attrs_pointer::{AlignAttr, DereferenceableAttr, NoAliasAttr, NoCaptureAttr, NonNullAttr};
use crate::attrs_value::{ReturnedValuesAttr, ValueRangeAttr, ValueSimplifyAttr};
use crate::callgraph::CallGraphUpdater;
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::InsertionOrderedSet;
use crate::ir::{Attr, Func, Module, Opcode, Val};
use crate::lattice::{AbstractState, BitSetState, BooleanState, ChangeStatus, DerefState, IncIntState, RangeState};
use crate::log::*;
use crate::position::Position;
use crate::rewriter::RewriteChanges;

/// The analysis a record belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum AttrKind {
    NoUnwind,
    NoSync,
    NoFree,
    NoRecurse,
    WillReturn,
    NoReturn,
    ReturnedValues,
    NoAlias,
    NonNull,
    Dereferenceable,
    Align,
    NoCapture,
    ValueSimplify,
    HeapToStack,
    Privatizable,
    MemoryBehavior,
    MemoryLocation,
    ValueRange,
    IsDead,
    UndefinedBehavior,
    Reachability,
}

/// Dependency edge class. `Required` edges propagate invalidation; `Optional` edges only cause
/// re-enqueueing on change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DepClass {
    Required,
    Optional,
}

/// Handle to a record in the engine's arena. Never outlives the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RecordId(pub(crate) usize);

/// The capability set every concrete analysis implements.
pub trait Deduce {
    fn position(&self) -> Position;
    fn state(&self) -> &dyn AbstractState;
    fn state_mut(&mut self) -> &mut dyn AbstractState;
    /// Seed the state from pre-existing IR facts. Runs exactly once, at creation.
    fn initialize(&mut self, a: &mut FixpointEngine);
    /// One monotone step. Must only move `assumed` down and `known` up.
    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus;
    /// Stage IR edits and attribute additions implied by the settled state.
    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus;
    /// Compact rendering for trace logs.
    fn as_str(&self, m: &Module) -> String;
}

/// A record: one analysis at one position, as a discriminated union over the catalogue.
pub enum AbstractAttribute {
    NoUnwind(NoUnwindAttr),
    NoSync(NoSyncAttr),
    NoFree(NoFreeAttr),
    NoRecurse(NoRecurseAttr),
    WillReturn(WillReturnAttr),
    NoReturn(NoReturnAttr),
    ReturnedValues(ReturnedValuesAttr),
    NoAlias(NoAliasAttr),
    NonNull(NonNullAttr),
    Dereferenceable(DereferenceableAttr),
    Align(AlignAttr),
    NoCapture(NoCaptureAttr),
    ValueSimplify(ValueSimplifyAttr),
    HeapToStack(HeapToStackAttr),
    Privatizable(PrivatizableAttr),
    MemoryBehavior(MemoryBehaviorAttr),
    MemoryLocation(MemoryLocationAttr),
    ValueRange(ValueRangeAttr),
    IsDead(IsDeadAttr),
    UndefinedBehavior(UndefinedBehaviorAttr),
    Reachability(ReachabilityAttr),
}

macro_rules! dispatch {
    ($self:expr, $aa:ident => $e:expr) => {
        match $self {
            AbstractAttribute::NoUnwind($aa) => $e,
            AbstractAttribute::NoSync($aa) => $e,
            AbstractAttribute::NoFree($aa) => $e,
            AbstractAttribute::NoRecurse($aa) => $e,
            AbstractAttribute::WillReturn($aa) => $e,
            AbstractAttribute::NoReturn($aa) => $e,
            AbstractAttribute::ReturnedValues($aa) => $e,
            AbstractAttribute::NoAlias($aa) => $e,
            AbstractAttribute::NonNull($aa) => $e,
            AbstractAttribute::Dereferenceable($aa) => $e,
            AbstractAttribute::Align($aa) => $e,
            AbstractAttribute::NoCapture($aa) => $e,
            AbstractAttribute::ValueSimplify($aa) => $e,
            AbstractAttribute::HeapToStack($aa) => $e,
            AbstractAttribute::Privatizable($aa) => $e,
            AbstractAttribute::MemoryBehavior($aa) => $e,
            AbstractAttribute::MemoryLocation($aa) => $e,
            AbstractAttribute::ValueRange($aa) => $e,
            AbstractAttribute::IsDead($aa) => $e,
            AbstractAttribute::UndefinedBehavior($aa) => $e,
            AbstractAttribute::Reachability($aa) => $e,
        }
    };
}

impl AbstractAttribute {
    pub fn kind(&self) -> AttrKind {
        match self {
            AbstractAttribute::NoUnwind(_) => AttrKind::NoUnwind,
            AbstractAttribute::NoSync(_) => AttrKind::NoSync,
            AbstractAttribute::NoFree(_) => AttrKind::NoFree,
            AbstractAttribute::NoRecurse(_) => AttrKind::NoRecurse,
            AbstractAttribute::WillReturn(_) => AttrKind::WillReturn,
            AbstractAttribute::NoReturn(_) => AttrKind::NoReturn,
            AbstractAttribute::ReturnedValues(_) => AttrKind::ReturnedValues,
            AbstractAttribute::NoAlias(_) => AttrKind::NoAlias,
            AbstractAttribute::NonNull(_) => AttrKind::NonNull,
            AbstractAttribute::Dereferenceable(_) => AttrKind::Dereferenceable,
            AbstractAttribute::Align(_) => AttrKind::Align,
            AbstractAttribute::NoCapture(_) => AttrKind::NoCapture,
            AbstractAttribute::ValueSimplify(_) => AttrKind::ValueSimplify,
            AbstractAttribute::HeapToStack(_) => AttrKind::HeapToStack,
            AbstractAttribute::Privatizable(_) => AttrKind::Privatizable,
            AbstractAttribute::MemoryBehavior(_) => AttrKind::MemoryBehavior,
            AbstractAttribute::MemoryLocation(_) => AttrKind::MemoryLocation,
            AbstractAttribute::ValueRange(_) => AttrKind::ValueRange,
            AbstractAttribute::IsDead(_) => AttrKind::IsDead,
            AbstractAttribute::UndefinedBehavior(_) => AttrKind::UndefinedBehavior,
            AbstractAttribute::Reachability(_) => AttrKind::Reachability,
        }
    }

    pub fn position(&self) -> Position {
        dispatch!(self, aa => aa.position())
    }

    pub fn is_valid(&self) -> bool {
        dispatch!(self, aa => aa.state().is_valid())
    }

    pub fn is_at_fixpoint(&self) -> bool {
        dispatch!(self, aa => aa.state().is_at_fixpoint())
    }

    pub fn indicate_optimistic_fixpoint(&mut self) -> ChangeStatus {
        dispatch!(self, aa => aa.state_mut().indicate_optimistic_fixpoint())
    }

    pub fn indicate_pessimistic_fixpoint(&mut self) -> ChangeStatus {
        dispatch!(self, aa => aa.state_mut().indicate_pessimistic_fixpoint())
    }

    fn initialize(&mut self, a: &mut FixpointEngine) {
        dispatch!(self, aa => aa.initialize(a))
    }

    fn update(&mut self, a: &mut FixpointEngine) -> ChangeStatus {
        dispatch!(self, aa => aa.update(a))
    }

    fn manifest(&self, a: &mut FixpointEngine) -> ChangeStatus {
        dispatch!(self, aa => aa.manifest(a))
    }

    pub fn as_str(&self, m: &Module) -> String {
        dispatch!(self, aa => aa.as_str(m))
    }
}

/// The typed factory: picks the concrete record for an analysis kind at a position. Position-kind
/// specialization happens inside each record's hooks.
fn create_attribute(kind: AttrKind, pos: Position) -> AbstractAttribute {
    match kind {
        AttrKind::NoUnwind => AbstractAttribute::NoUnwind(NoUnwindAttr::new(pos)),
        AttrKind::NoSync => AbstractAttribute::NoSync(NoSyncAttr::new(pos)),
        AttrKind::NoFree => AbstractAttribute::NoFree(NoFreeAttr::new(pos)),
        AttrKind::NoRecurse => AbstractAttribute::NoRecurse(NoRecurseAttr::new(pos)),
        AttrKind::WillReturn => AbstractAttribute::WillReturn(WillReturnAttr::new(pos)),
        AttrKind::NoReturn => AbstractAttribute::NoReturn(NoReturnAttr::new(pos)),
        AttrKind::ReturnedValues => AbstractAttribute::ReturnedValues(ReturnedValuesAttr::new(pos)),
        AttrKind::NoAlias => AbstractAttribute::NoAlias(NoAliasAttr::new(pos)),
        AttrKind::NonNull => AbstractAttribute::NonNull(NonNullAttr::new(pos)),
        AttrKind::Dereferenceable => {
            AbstractAttribute::Dereferenceable(DereferenceableAttr::new(pos))
        }
        AttrKind::Align => AbstractAttribute::Align(AlignAttr::new(pos)),
        AttrKind::NoCapture => AbstractAttribute::NoCapture(NoCaptureAttr::new(pos)),
        AttrKind::ValueSimplify => AbstractAttribute::ValueSimplify(ValueSimplifyAttr::new(pos)),
        AttrKind::HeapToStack => AbstractAttribute::HeapToStack(HeapToStackAttr::new(pos)),
        AttrKind::Privatizable => AbstractAttribute::Privatizable(PrivatizableAttr::new(pos)),
        AttrKind::MemoryBehavior => AbstractAttribute::MemoryBehavior(MemoryBehaviorAttr::new(pos)),
        AttrKind::MemoryLocation => AbstractAttribute::MemoryLocation(MemoryLocationAttr::new(pos)),
        AttrKind::ValueRange => AbstractAttribute::ValueRange(ValueRangeAttr::new(pos)),
        AttrKind::IsDead => AbstractAttribute::IsDead(IsDeadAttr::new(pos)),
        AttrKind::UndefinedBehavior => {
            AbstractAttribute::UndefinedBehavior(UndefinedBehaviorAttr::new(pos))
        }
        AttrKind::Reachability => AbstractAttribute::Reachability(ReachabilityAttr::new(pos)),
    }
}

struct RecordMeta {
    kind: AttrKind,
    position: Position,
}

/// Result of asking for a simplified value.
#[derive(Clone, PartialEq, Debug)]
pub enum Simplified {
    /// No simplification attempted yet; optimistically anything is possible.
    NotYet,
    Cannot,
    To(crate::attrs_value::SimpVal),
}

/// The engine.
pub struct FixpointEngine<'m> {
    m: &'m mut Module,
    pub analyses: AnalysisCache,
    records: Vec<Option<AbstractAttribute>>,
    meta: Vec<RecordMeta>,
    intern: UnorderedMap<(AttrKind, Position), RecordId>,
    /// dependee -> (dependent -> strongest class). Cleared edges are re-registered the next time
    /// the dependent runs its update.
    dependents: UnorderedMap<RecordId, UnorderedMap<RecordId, DepClass>>,
    worklist: InsertionOrderedSet<RecordId>,
    invalid_pending: Vec<RecordId>,
    current: Option<RecordId>,
    queried_non_fixed: bool,
    pub changes: RewriteChanges,
    funcs: Vec<Func>,
}

impl<'m> FixpointEngine<'m> {
    pub fn new(m: &'m mut Module) -> Self {
        Self {
            m,
            analyses: AnalysisCache::new(),
            records: vec![],
            meta: vec![],
            intern: Default::default(),
            dependents: Default::default(),
            worklist: InsertionOrderedSet::new(),
            invalid_pending: vec![],
            current: None,
            queried_non_fixed: false,
            changes: RewriteChanges::new(),
            funcs: vec![],
        }
    }

    pub fn module(&self) -> &Module {
        self.m
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.m
    }

    /// The CFG summary for `f`, computed on first request.
    pub fn summary_of(&mut self, f: Func) -> std::rc::Rc<crate::analysis::FunctionSummary> {
        self.analyses.summary(self.m, f)
    }

    /// The call-graph SCC partition, computed on first request.
    pub fn sccs(&mut self) -> std::rc::Rc<crate::analysis::CallGraphSccs> {
        self.analyses.sccs(self.m)
    }

    pub fn admitted_funcs(&self) -> &[Func] {
        &self.funcs
    }

    // ---- record management -----------------------------------------------

    /// The unique record for `kind` at `pos`, created (and initialized, and enqueued) on first
    /// request. A dependence edge of class `dep` from the currently-updating record is registered.
    pub fn get_or_create(&mut self, kind: AttrKind, pos: Position, dep: DepClass) -> RecordId {
        if let Some(&id) = self.intern.get(&(kind, pos)) {
            self.note_query(id, dep);
            return id;
        }
        let id = RecordId(self.records.len());
        self.meta.push(RecordMeta {
            kind,
            position: pos,
        });
        self.records.push(Some(create_attribute(kind, pos)));
        self.intern.insert((kind, pos), id);
        let mut aa = self.records[id.0].take().expect("freshly created record");
        aa.initialize(self);
        trace!("created record";
            "kind" => ?kind,
            "pos" => self.meta[id.0].position.describe(self.m),
            "state" => aa.as_str(self.m),
        );
        self.records[id.0] = Some(aa);
        self.worklist.insert(id);
        self.note_query(id, dep);
        id
    }

    /// The record for `kind` at `pos` if one exists; never creates.
    pub fn lookup(&self, kind: AttrKind, pos: Position) -> Option<RecordId> {
        self.intern.get(&(kind, pos)).copied()
    }

    /// Register an explicit dependence edge `from -> to`.
    pub fn record_dependence(&mut self, from: RecordId, to: RecordId, class: DepClass) {
        if from == to {
            return;
        }
        let slot = self
            .dependents
            .entry(to)
            .or_insert_with(Default::default)
            .entry(from)
            .or_insert(class);
        if *slot == DepClass::Optional && class == DepClass::Required {
            *slot = DepClass::Required;
        }
    }

    fn note_query(&mut self, target: RecordId, dep: DepClass) {
        if let Some(cur) = self.current {
            self.record_dependence(cur, target, dep);
            let fixed = match &self.records[target.0] {
                Some(aa) => aa.is_at_fixpoint(),
                // The slot is empty: we are querying the record currently being updated.
                None => false,
            };
            if !fixed {
                self.queried_non_fixed = true;
            }
        }
    }

    pub fn record(&self, id: RecordId) -> Option<&AbstractAttribute> {
        self.records[id.0].as_ref()
    }

    pub fn position_of(&self, id: RecordId) -> Position {
        self.meta[id.0].position
    }

    pub fn kind_of(&self, id: RecordId) -> AttrKind {
        self.meta[id.0].kind
    }

    // ---- state snapshots ---------------------------------------------------
    //
    // Queries copy small state out of the arena. A query that hits the record currently being
    // updated (empty slot) reports the pessimistic answer: that is the self-cycle signal.

    pub fn boolean_state(&self, id: RecordId) -> Option<BooleanState> {
        match self.records[id.0].as_ref()? {
            AbstractAttribute::NoUnwind(aa) => Some(aa.state),
            AbstractAttribute::NoSync(aa) => Some(aa.state),
            AbstractAttribute::NoFree(aa) => Some(aa.state),
            AbstractAttribute::NoRecurse(aa) => Some(aa.state),
            AbstractAttribute::WillReturn(aa) => Some(aa.state),
            AbstractAttribute::NoReturn(aa) => Some(aa.state),
            AbstractAttribute::NoAlias(aa) => Some(aa.state),
            AbstractAttribute::NonNull(aa) => Some(aa.state),
            // Value-form liveness: `assumed` means assumed dead. The function form does not go
            // through here (its callers use the dedicated liveness helpers).
            AbstractAttribute::IsDead(aa) if !matches!(aa.pos, Position::Function(_)) => {
                Some(aa.state)
            }
            _ => None,
        }
    }

    /// Whether the boolean fact `kind` is assumed to hold at `pos`.
    pub fn is_assumed(&mut self, kind: AttrKind, pos: Position, dep: DepClass) -> bool {
        let id = self.get_or_create(kind, pos, dep);
        self.boolean_state(id).map_or(false, |s| s.assumed())
    }

    /// Whether the boolean fact `kind` is known to hold at `pos`.
    pub fn is_known(&mut self, kind: AttrKind, pos: Position, dep: DepClass) -> bool {
        let id = self.get_or_create(kind, pos, dep);
        self.boolean_state(id).map_or(false, |s| s.known())
    }

    pub fn deref_state(&mut self, pos: Position, dep: DepClass) -> DerefState {
        let id = self.get_or_create(AttrKind::Dereferenceable, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::Dereferenceable(aa)) => aa.state,
            _ => {
                let mut s = DerefState::new();
                s.indicate_pessimistic_fixpoint();
                s
            }
        }
    }

    pub fn align_state(&mut self, pos: Position, dep: DepClass) -> IncIntState {
        let id = self.get_or_create(AttrKind::Align, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::Align(aa)) => aa.state,
            _ => {
                let mut s = crate::lattice::new_align_state();
                s.indicate_pessimistic_fixpoint();
                s
            }
        }
    }

    pub fn range_state(&mut self, pos: Position, dep: DepClass) -> RangeState {
        let id = self.get_or_create(AttrKind::ValueRange, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::ValueRange(aa)) => aa.state,
            _ => {
                let mut s = RangeState::new(crate::lattice::SignedRange::full());
                s.indicate_pessimistic_fixpoint();
                s
            }
        }
    }

    pub fn memory_behavior_state(&mut self, pos: Position, dep: DepClass) -> BitSetState {
        let id = self.get_or_create(AttrKind::MemoryBehavior, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::MemoryBehavior(aa)) => aa.state,
            _ => {
                let mut s = BitSetState::new(crate::attrs_memory::NO_READS | crate::attrs_memory::NO_WRITES);
                s.indicate_pessimistic_fixpoint();
                s
            }
        }
    }

    pub fn memory_location_state(&mut self, pos: Position, dep: DepClass) -> BitSetState {
        let id = self.get_or_create(AttrKind::MemoryLocation, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::MemoryLocation(aa)) => aa.state,
            _ => {
                let mut s = BitSetState::new(crate::attrs_memory::LOC_ALL);
                s.indicate_pessimistic_fixpoint();
                s
            }
        }
    }

    pub fn no_capture_state(&mut self, pos: Position, dep: DepClass) -> BitSetState {
        let id = self.get_or_create(AttrKind::NoCapture, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::NoCapture(aa)) => aa.state,
            _ => {
                let mut s = BitSetState::new(crate::attrs_pointer::NOT_CAPTURED_ALL);
                s.indicate_pessimistic_fixpoint();
                s
            }
        }
    }

    /// The simplified stand-in for the value at `pos`, if any.
    pub fn simplified(&mut self, pos: Position, dep: DepClass) -> Simplified {
        let id = self.get_or_create(AttrKind::ValueSimplify, pos, dep);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::ValueSimplify(aa)) => aa.result(),
            _ => Simplified::Cannot,
        }
    }

    // ---- liveness filtering ------------------------------------------------

    fn liveness_record_for(&mut self, f: Func, dep: DepClass) -> RecordId {
        self.get_or_create(AttrKind::IsDead, Position::Function(f), dep)
    }

    /// Whether `inst` lies in code the liveness analysis assumes unreachable. Records an optional
    /// dependence on the enclosing function's liveness.
    pub fn is_assumed_dead_inst(&mut self, inst: Val) -> bool {
        let f = match self.m.parent_func(inst) {
            Some(f) => f,
            None => return false,
        };
        if self.m.func(f).is_declaration() {
            return false;
        }
        let id = self.liveness_record_for(f, DepClass::Optional);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::IsDead(aa)) => !aa.is_assumed_live_inst(inst),
            _ => false,
        }
    }

    pub fn is_assumed_dead_block(&mut self, b: crate::ir::Block) -> bool {
        let f = self.m.block(b).func;
        if self.m.func(f).is_declaration() {
            return false;
        }
        let id = self.liveness_record_for(f, DepClass::Optional);
        match self.records[id.0].as_ref() {
            Some(AbstractAttribute::IsDead(aa)) => !aa.is_assumed_live_block(b),
            _ => false,
        }
    }

    pub fn is_assumed_dead_position(&mut self, pos: Position) -> bool {
        // Function positions are never dead via a context instruction; everything else is exactly
        // as dead as the instruction anchoring it.
        if matches!(pos, Position::Function(_)) {
            return false;
        }
        match pos.context_inst(self.m) {
            Some(inst) => self.is_assumed_dead_inst(inst),
            None => false,
        }
    }

    // ---- bulk iteration helpers -------------------------------------------

    /// Run `pred` over every live instruction of `f` matching `filter`, under liveness filtering.
    /// Returns `true` iff the predicate held everywhere it was asked.
    pub fn check_for_all_instructions(
        &mut self,
        f: Func,
        filter: impl Fn(&Opcode) -> bool,
        mut pred: impl FnMut(&mut FixpointEngine, Val) -> bool,
    ) -> bool {
        let insts: Vec<Val> = self
            .m
            .insts_of_func(f)
            .filter(|&v| filter(&self.m.expect_inst(v).op))
            .collect();
        for v in insts {
            if self.is_assumed_dead_inst(v) {
                continue;
            }
            if !pred(self, v) {
                return false;
            }
        }
        true
    }

    /// [`Self::check_for_all_instructions`] restricted to call-like instructions.
    pub fn check_for_all_call_like(
        &mut self,
        f: Func,
        pred: impl FnMut(&mut FixpointEngine, Val) -> bool,
    ) -> bool {
        self.check_for_all_instructions(f, |op| op.is_call_like(), pred)
    }

    /// Run `pred` over every memory-touching instruction of `f`.
    pub fn check_for_all_read_write_instructions(
        &mut self,
        f: Func,
        pred: impl FnMut(&mut FixpointEngine, Val) -> bool,
    ) -> bool {
        self.check_for_all_instructions(
            f,
            |op| matches!(op, Opcode::Load { .. } | Opcode::Store { .. }),
            pred,
        )
    }

    /// Every call site of `f` that the engine can enumerate. Returns `false` when the set of call
    /// sites is not known completely (the function's address escapes, or a use is not a direct
    /// callee operand).
    pub fn check_for_all_call_sites(
        &mut self,
        f: Func,
        mut pred: impl FnMut(&mut FixpointEngine, Val) -> bool,
    ) -> bool {
        if !self.m.func(f).internal {
            // External linkage: unknown callers may exist.
            return false;
        }
        let uses: Vec<crate::ir::UseRef> = {
            let fref = self.m.func_ref(f);
            self.m.val(fref).uses.clone()
        };
        for use_ref in uses {
            let user = use_ref.user;
            if self.m.val(user).deleted {
                continue;
            }
            if !self.m.is_call_like(user) || use_ref.index != 0 {
                // The function's address flows somewhere that is not a direct call.
                return false;
            }
            if self.is_assumed_dead_inst(user) {
                continue;
            }
            if !pred(self, user) {
                return false;
            }
        }
        true
    }

    /// Run `pred` over every live `ret` of `f`. Returns `false` if `f` has no body.
    pub fn check_for_all_returns(
        &mut self,
        f: Func,
        pred: impl FnMut(&mut FixpointEngine, Val) -> bool,
    ) -> bool {
        if self.m.func(f).is_declaration() {
            return false;
        }
        self.check_for_all_instructions(f, |op| matches!(op, Opcode::Ret), pred)
    }

    // ---- the main loop ----------------------------------------------------

    /// Admit `f`: create the §-seeding records for its positions.
    pub fn seed_function(&mut self, f: Func) {
        self.funcs.push(f);
        if self.m.func(f).is_declaration() {
            return;
        }
        use AttrKind::*;
        for kind in [
            IsDead,
            WillReturn,
            UndefinedBehavior,
            NoUnwind,
            NoSync,
            NoFree,
            NoReturn,
            NoRecurse,
            MemoryBehavior,
            MemoryLocation,
            HeapToStack,
        ] {
            self.get_or_create(kind, Position::Function(f), DepClass::Optional);
        }

        let ret_ty = (*self.m.func(f).ty.ret).clone();
        if !ret_ty.is_void() {
            let rpos = Position::Returned(f);
            self.get_or_create(ReturnedValues, rpos, DepClass::Optional);
            self.get_or_create(IsDead, rpos, DepClass::Optional);
            self.get_or_create(ValueSimplify, rpos, DepClass::Optional);
            if ret_ty.is_pointer() {
                for kind in [Align, NonNull, NoAlias, Dereferenceable] {
                    self.get_or_create(kind, rpos, DepClass::Optional);
                }
            }
        }

        let params: Vec<crate::ir::Ty> = self.m.func(f).ty.params.clone();
        for (i, ty) in params.iter().enumerate() {
            let apos = Position::Argument(f, i);
            self.get_or_create(ValueSimplify, apos, DepClass::Optional);
            self.get_or_create(IsDead, apos, DepClass::Optional);
            if ty.is_pointer() {
                for kind in [
                    NonNull,
                    NoAlias,
                    Dereferenceable,
                    Align,
                    NoCapture,
                    MemoryBehavior,
                    NoFree,
                    Privatizable,
                ] {
                    self.get_or_create(kind, apos, DepClass::Optional);
                }
            }
        }

        let calls: Vec<Val> = self
            .m
            .insts_of_func(f)
            .filter(|&v| self.m.is_call_like(v))
            .collect();
        for c in calls {
            let ret_ty = self.m.ty_of(c).clone();
            if !ret_ty.is_void() {
                let rpos = Position::CallSiteReturned(c);
                self.get_or_create(ValueSimplify, rpos, DepClass::Optional);
                if ret_ty.is_pointer() {
                    for kind in [NonNull, NoAlias, Dereferenceable, Align] {
                        self.get_or_create(kind, rpos, DepClass::Optional);
                    }
                }
                if matches!(ret_ty, crate::ir::Ty::Int(_)) {
                    self.get_or_create(ValueRange, rpos, DepClass::Optional);
                }
            }
            let nargs = self.m.call_args(c).len();
            for i in 0..nargs {
                let apos = Position::CallSiteArgument(c, i);
                self.get_or_create(ValueSimplify, apos, DepClass::Optional);
                let arg = self.m.call_args(c)[i];
                if self.m.ty_of(arg).is_pointer() {
                    for kind in [NonNull, NoAlias, Dereferenceable, Align, NoCapture] {
                        self.get_or_create(kind, apos, DepClass::Optional);
                    }
                }
            }
        }
    }

    fn update_record(&mut self, id: RecordId) -> ChangeStatus {
        let mut aa = match self.records[id.0].take() {
            Some(aa) => aa,
            None => return ChangeStatus::Unchanged,
        };
        let prev_current = self.current.replace(id);
        let prev_flag = self.queried_non_fixed;
        self.queried_non_fixed = false;
        let status = aa.update(self);
        let queried_non_fixed = self.queried_non_fixed;
        self.current = prev_current;
        self.queried_non_fixed = prev_flag;

        trace!("update";
            "kind" => ?self.meta[id.0].kind,
            "pos" => self.meta[id.0].position.describe(self.m),
            "state" => aa.as_str(self.m),
            "changed" => status == ChangeStatus::Changed,
        );

        let became_invalid = !aa.is_valid();
        let at_fixpoint = aa.is_at_fixpoint();
        if status == ChangeStatus::Unchanged && !queried_non_fixed && !at_fixpoint {
            // Every queried peer was already frozen; this state can never change again.
            aa.indicate_optimistic_fixpoint();
        }
        self.records[id.0] = Some(aa);

        if status == ChangeStatus::Changed {
            if became_invalid {
                self.invalid_pending.push(id);
            }
            self.enqueue_dependents(id);
        }
        status
    }

    fn enqueue_dependents(&mut self, id: RecordId) {
        if let Some(deps) = self.dependents.remove(&id) {
            for (dep_id, _) in deps {
                self.worklist.insert(dep_id);
            }
        }
    }

    /// Force `id` to its pessimistic fixpoint (outside of its own update), cascading along
    /// required edges.
    fn force_pessimistic(&mut self, id: RecordId) {
        let became_invalid = {
            let aa = match self.records[id.0].as_mut() {
                Some(aa) => aa,
                None => return,
            };
            if aa.is_at_fixpoint() && !aa.is_valid() {
                return;
            }
            aa.indicate_pessimistic_fixpoint();
            !aa.is_valid()
        };
        if became_invalid {
            self.invalid_pending.push(id);
        }
        self.enqueue_dependents(id);
    }

    fn run_invalidation_cascade(&mut self) {
        while let Some(invalid) = self.invalid_pending.pop() {
            debug!("invalidation cascade";
                "kind" => ?self.meta[invalid.0].kind,
                "pos" => self.meta[invalid.0].position.describe(self.m),
            );
            let deps = match self.dependents.remove(&invalid) {
                Some(deps) => deps,
                None => continue,
            };
            for (dep_id, class) in deps {
                match class {
                    DepClass::Required => self.force_pessimistic(dep_id),
                    DepClass::Optional => {
                        self.worklist.insert(dep_id);
                    }
                }
            }
        }
    }

    /// Run the fixpoint loop, manifest, and replay staged IR edits. Returns whether the IR
    /// changed.
    pub fn run(&mut self, cg: &mut dyn CallGraphUpdater) -> bool {
        let max_iterations = CONFIG.max_fixpoint_iterations;
        let recompute_interval = CONFIG.dep_recompute_interval;

        let mut iteration = 0usize;
        loop {
            self.run_invalidation_cascade();
            if self.worklist.is_empty() || iteration >= max_iterations {
                break;
            }
            if recompute_interval > 0 && iteration > 0 && iteration % recompute_interval == 0 {
                // Toss the dependency graph; every unsettled record recomputes its edges on its
                // next update.
                self.dependents.clear();
                for i in 0..self.records.len() {
                    let settled = self.records[i]
                        .as_ref()
                        .map_or(true, |aa| aa.is_at_fixpoint());
                    if !settled {
                        self.worklist.insert(RecordId(i));
                    }
                }
            }

            let batch = std::mem::take(&mut self.worklist).into_vec();
            debug!("fixpoint iteration"; "iteration" => iteration, "worklist" => batch.len());
            for id in batch {
                let at_fixpoint = self.records[id.0]
                    .as_ref()
                    .map_or(true, |aa| aa.is_at_fixpoint());
                if at_fixpoint {
                    continue;
                }
                let pos = self.meta[id.0].position;
                if !matches!(pos, Position::Function(_)) && self.is_assumed_dead_position(pos) {
                    continue;
                }
                self.update_record(id);
            }
            iteration += 1;
        }
        self.run_invalidation_cascade();

        // Anything still asking for updates did not settle within the cap. Collapsing one record
        // re-enqueues its dependents, which were computed against its old optimism and must
        // collapse too; iterate until the wave dies out.
        let mut collapsed = 0usize;
        loop {
            let unsettled: Vec<RecordId> = std::mem::take(&mut self.worklist)
                .into_vec()
                .into_iter()
                .filter(|id| {
                    self.records[id.0]
                        .as_ref()
                        .map_or(false, |aa| !aa.is_at_fixpoint())
                })
                .collect();
            if unsettled.is_empty() {
                break;
            }
            if collapsed == 0 && CONFIG.verify_max_iterations {
                let names: Vec<String> = unsettled
                    .iter()
                    .map(|id| {
                        format!(
                            "{:?} at {}",
                            self.meta[id.0].kind,
                            self.meta[id.0].position.describe(self.m)
                        )
                    })
                    .collect();
                panic!(
                    "fixpoint did not settle within {} iterations; unsettled records: {}",
                    max_iterations,
                    names.join(", ")
                );
            }
            collapsed += unsettled.len();
            for id in unsettled {
                self.force_pessimistic(id);
            }
            self.run_invalidation_cascade();
        }
        if collapsed > 0 {
            warn!("iteration cap reached; collapsed unsettled records"; "count" => collapsed);
        }

        // Promote everything that quiesced naturally.
        for i in 0..self.records.len() {
            if let Some(aa) = self.records[i].as_mut() {
                if !aa.is_at_fixpoint() {
                    aa.indicate_optimistic_fixpoint();
                }
            }
        }

        // Manifest phase: valid records stage their IR edits.
        let mut manifested = ChangeStatus::Unchanged;
        for i in 0..self.records.len() {
            let id = RecordId(i);
            let (valid, pos) = match self.records[i].as_ref() {
                Some(aa) => (aa.is_valid(), aa.position()),
                None => continue,
            };
            if !valid {
                continue;
            }
            if !matches!(pos, Position::Function(_)) && self.is_assumed_dead_position(pos) {
                continue;
            }
            let aa = self.records[id.0].take().expect("record present");
            let status = aa.manifest(self);
            if status == ChangeStatus::Changed {
                trace!("manifested";
                    "kind" => ?self.meta[id.0].kind,
                    "pos" => self.meta[id.0].position.describe(self.m),
                    "state" => aa.as_str(self.m),
                );
            }
            manifested |= status;
            self.records[id.0] = Some(aa);
        }

        // Internal functions nothing outside themselves references anymore are dead wholesale.
        let candidates: Vec<Func> = self.funcs.clone();
        for f in candidates {
            let fd = self.m.func(f);
            if fd.deleted || fd.is_declaration() || !fd.internal {
                continue;
            }
            let referenced = self.m.existing_func_ref(f).map_or(false, |fref| {
                self.m.val(fref).uses.iter().any(|u| {
                    !self.m.val(u.user).deleted && self.m.parent_func(u.user) != Some(f)
                })
            });
            if !referenced {
                self.changes.delete_functions.push(f);
            }
        }

        let changes = std::mem::replace(&mut self.changes, RewriteChanges::new());
        manifested |= changes.replay(self.m, cg);
        manifested == ChangeStatus::Changed
    }

    // ---- manifest support --------------------------------------------------

    /// Add deduced attributes at `pos`, skipping any that are already implied by what the IR
    /// carries there or at a subsuming position. Call sites of bare declarations are only
    /// annotated when the configuration asks for it.
    pub fn manifest_attrs(&mut self, pos: Position, attrs: Vec<Attr>) -> ChangeStatus {
        if pos.is_call_site_position() && !CONFIG.annotate_declaration_call_sites {
            let declared_only = pos
                .callee_func(self.m)
                .map_or(true, |callee| self.m.func(callee).is_declaration());
            if declared_only {
                return ChangeStatus::Unchanged;
            }
        }
        let mut changed = ChangeStatus::Unchanged;
        for attr in attrs {
            if self.attr_already_covers(pos, attr) {
                continue;
            }
            let applied = match pos {
                Position::Function(f) => self.m.func_mut(f).fn_attrs.add(attr),
                Position::Returned(f) => self.m.func_mut(f).ret_attrs.add(attr),
                Position::Argument(f, i) => self.m.func_mut(f).arg_attrs[i].add(attr),
                Position::CallSite(c) => match self.m.inst_mut(c).and_then(|i| i.call_attrs.as_deref_mut()) {
                    Some(a) => a.fn_attrs.add(attr),
                    None => false,
                },
                Position::CallSiteReturned(c) => {
                    match self.m.inst_mut(c).and_then(|i| i.call_attrs.as_deref_mut()) {
                        Some(a) => a.ret_attrs.add(attr),
                        None => false,
                    }
                }
                Position::CallSiteArgument(c, i) => {
                    match self.m.inst_mut(c).and_then(|i| i.call_attrs.as_deref_mut()) {
                        Some(a) => match a.arg_attrs.get_mut(i) {
                            Some(set) => set.add(attr),
                            None => false,
                        },
                        None => false,
                    }
                }
                Position::Float(_) | Position::Invalid => false,
            };
            if applied {
                changed = ChangeStatus::Changed;
            }
        }
        changed
    }

    fn attr_already_covers(&self, pos: Position, attr: Attr) -> bool {
        let existing = pos.attrs_at(self.m, &[attr.tag()]);
        existing.iter().any(|have| match (have, &attr) {
            (Attr::Dereferenceable(a), Attr::Dereferenceable(b)) => a >= b,
            (Attr::DereferenceableOrNull(a), Attr::DereferenceableOrNull(b)) => a >= b,
            (Attr::Align(a), Attr::Align(b)) => a >= b,
            (x, y) => x == y,
        })
    }
}

/// Interned record lookup plus dependence registration in one step, for peers that only need a
/// snapshot of a sibling's validity.
pub fn record_is_valid(a: &FixpointEngine, id: RecordId) -> bool {
    a.record(id).map_or(false, |aa| aa.is_valid())
}

/// Set of values reachable from `roots` by following uses, with a visited set to short-circuit
/// cyclic use graphs.
pub fn collect_uses_transitively(m: &Module, roots: &[Val]) -> Vec<crate::ir::UseRef> {
    let mut seen: UnorderedSet<Val> = Default::default();
    let mut out = vec![];
    let mut stack: Vec<Val> = roots.to_vec();
    while let Some(v) = stack.pop() {
        for use_ref in &m.val(v).uses {
            out.push(*use_ref);
            if seen.insert(use_ref.user) {
                stack.push(use_ref.user);
            }
        }
    }
    out
}
