//! Per-function structural analyses consumed by the fixpoint engine.
//!
//! These are computed lazily, cached per function, and treated as read-only for the duration of an
//! engine run; the IR is only rewritten after the lattice has settled, at which point the cache is
//! discarded wholesale.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::ir::{Block, Func, Module, Opcode, Val};
use std::rc::Rc;

/// Control-flow facts about one function: predecessor/successor lists, reverse post-order,
/// dominators, and loop structure.
#[derive(Debug)]
pub struct FunctionSummary {
    pub func: Func,
    pub preds: UnorderedMap<Block, Vec<Block>>,
    pub succs: UnorderedMap<Block, Vec<Block>>,
    /// Reverse post-order over blocks reachable from the entry.
    pub rpo: Vec<Block>,
    rpo_index: UnorderedMap<Block, usize>,
    pub reachable: UnorderedSet<Block>,
    /// Edges `(tail, header)` where `header` dominates `tail`.
    pub back_edges: Vec<(Block, Block)>,
    /// A retreating edge whose target does not dominate its source was seen; the control flow is
    /// not reducible and no cycle in it can be assumed bounded.
    pub irreducible: bool,
    idom: UnorderedMap<Block, Block>,
}

impl FunctionSummary {
    pub fn compute(m: &Module, f: Func) -> Self {
        let mut preds: UnorderedMap<Block, Vec<Block>> = Default::default();
        let mut succs: UnorderedMap<Block, Vec<Block>> = Default::default();
        for b in m.blocks_of(f) {
            let terminator_succs = m
                .terminator_of(b)
                .map(|t| m.successors_of(t))
                .unwrap_or_default();
            for &s in &terminator_succs {
                preds.entry(s).or_insert_with(Vec::new).push(b);
            }
            succs.insert(b, terminator_succs);
        }

        // Post-order DFS from the entry.
        let mut rpo = vec![];
        let mut reachable: UnorderedSet<Block> = Default::default();
        if let Some(entry) = m.entry_block(f) {
            let mut visited: UnorderedSet<Block> = Default::default();
            // (block, next-successor-to-visit)
            let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
            visited.insert(entry);
            while let Some((b, i)) = stack.pop() {
                let bsuccs = succs.get(&b).map(|v| v.as_slice()).unwrap_or(&[]);
                if i < bsuccs.len() {
                    stack.push((b, i + 1));
                    let s = bsuccs[i];
                    if visited.insert(s) {
                        stack.push((s, 0));
                    }
                } else {
                    rpo.push(b);
                }
            }
            rpo.reverse();
            reachable = visited;
        }
        let rpo_index: UnorderedMap<Block, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut r = Self {
            func: f,
            preds,
            succs,
            rpo,
            rpo_index,
            reachable,
            back_edges: vec![],
            irreducible: false,
            idom: Default::default(),
        };
        r.compute_dominators();
        r.classify_retreating_edges();
        r
    }

    /// Iterative dominator computation over reverse post-order (Cooper/Harvey/Kennedy).
    fn compute_dominators(&mut self) {
        let entry = match self.rpo.first() {
            Some(&e) => e,
            None => return,
        };
        self.idom.insert(entry, entry);
        let order: Vec<Block> = self.rpo.iter().skip(1).copied().collect();
        let mut changed = true;
        while changed {
            changed = false;
            for &b in &order {
                let preds: Vec<Block> = self.preds.get(&b).cloned().unwrap_or_default();
                let mut new_idom: Option<Block> = None;
                for p in preds {
                    if !self.idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => self.intersect(p, cur),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if self.idom.get(&b) != Some(&new_idom) {
                        self.idom.insert(b, new_idom);
                        changed = true;
                    }
                }
            }
        }
    }

    fn intersect(&self, a: Block, b: Block) -> Block {
        let mut x = a;
        let mut y = b;
        while x != y {
            while self.rpo_index[&x] > self.rpo_index[&y] {
                x = self.idom[&x];
            }
            while self.rpo_index[&y] > self.rpo_index[&x] {
                y = self.idom[&y];
            }
        }
        x
    }

    fn classify_retreating_edges(&mut self) {
        let order = self.rpo.clone();
        for b in order {
            let succs: Vec<Block> = self.succs.get(&b).cloned().unwrap_or_default();
            for s in succs {
                if !self.reachable.contains(&s) {
                    continue;
                }
                if self.rpo_index[&s] <= self.rpo_index[&b] {
                    if self.dominates_block(s, b) {
                        self.back_edges.push((b, s));
                    } else {
                        self.irreducible = true;
                    }
                }
            }
        }
    }

    pub fn dominates_block(&self, a: Block, b: Block) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom.get(&cur) {
                Some(&up) if up != cur => cur = up,
                _ => return false,
            }
        }
    }

    /// Whether instruction `a` executes before `b` on every path reaching `b`.
    pub fn dominates_inst(&self, m: &Module, a: Val, b: Val) -> bool {
        let (ba, bb) = match (m.parent_block(a), m.parent_block(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        if ba == bb {
            let mut saw_a = false;
            for v in m.insts_of(ba) {
                if v == a {
                    saw_a = true;
                }
                if v == b {
                    return saw_a && a != b;
                }
            }
            return false;
        }
        self.dominates_block(ba, bb)
    }

    pub fn has_cycle(&self) -> bool {
        self.irreducible || !self.back_edges.is_empty()
    }

    /// Whether every cycle in the function carries a known trip bound. Irreducible control flow
    /// never qualifies.
    pub fn all_cycles_bounded(&self, m: &Module) -> bool {
        if self.irreducible {
            return false;
        }
        self.back_edges
            .iter()
            .all(|&(_, header)| m.block(header).max_trip_count.is_some())
    }
}

/// Strongly-connected components of the direct call graph (Tarjan). Used to decide up front which
/// functions sit in recursive cycles.
#[derive(Debug, Default)]
pub struct CallGraphSccs {
    scc_of: UnorderedMap<Func, usize>,
    scc_sizes: Vec<usize>,
    self_calls: UnorderedSet<Func>,
}

impl CallGraphSccs {
    pub fn compute(m: &Module) -> Self {
        let funcs: Vec<Func> = m.funcs().collect();
        let mut callees: UnorderedMap<Func, Vec<Func>> = Default::default();
        let mut self_calls: UnorderedSet<Func> = Default::default();
        for &f in &funcs {
            let mut edges = vec![];
            for v in m.insts_of_func(f) {
                if m.is_call_like(v) {
                    if let Some(callee) = m.callee_of(v) {
                        if callee == f {
                            self_calls.insert(f);
                        }
                        edges.push(callee);
                    }
                }
            }
            callees.insert(f, edges);
        }

        struct TarjanState {
            index: UnorderedMap<Func, usize>,
            lowlink: UnorderedMap<Func, usize>,
            on_stack: UnorderedSet<Func>,
            stack: Vec<Func>,
            next_index: usize,
            scc_of: UnorderedMap<Func, usize>,
            scc_sizes: Vec<usize>,
        }
        let mut st = TarjanState {
            index: Default::default(),
            lowlink: Default::default(),
            on_stack: Default::default(),
            stack: vec![],
            next_index: 0,
            scc_of: Default::default(),
            scc_sizes: vec![],
        };

        // Explicit DFS stack, to keep deep call graphs off the thread stack.
        enum Frame {
            Enter(Func),
            Resume(Func, usize),
        }
        for &root in &funcs {
            if st.index.contains_key(&root) {
                continue;
            }
            let mut frames = vec![Frame::Enter(root)];
            while let Some(frame) = frames.pop() {
                match frame {
                    Frame::Enter(f) => {
                        st.index.insert(f, st.next_index);
                        st.lowlink.insert(f, st.next_index);
                        st.next_index += 1;
                        st.stack.push(f);
                        st.on_stack.insert(f);
                        frames.push(Frame::Resume(f, 0));
                    }
                    Frame::Resume(f, mut i) => {
                        let mut descended = false;
                        let edges = callees.get(&f).cloned().unwrap_or_default();
                        while i < edges.len() {
                            let callee = edges[i];
                            i += 1;
                            if !st.index.contains_key(&callee) {
                                frames.push(Frame::Resume(f, i));
                                frames.push(Frame::Enter(callee));
                                descended = true;
                                break;
                            } else if st.on_stack.contains(&callee) {
                                let low = st.lowlink[&f].min(st.index[&callee]);
                                st.lowlink.insert(f, low);
                            }
                        }
                        if descended {
                            continue;
                        }
                        // All edges visited: pop the component if this is a root.
                        if st.lowlink[&f] == st.index[&f] {
                            let scc_id = st.scc_sizes.len();
                            let mut size = 0;
                            loop {
                                let g = st.stack.pop().unwrap();
                                st.on_stack.remove(&g);
                                st.scc_of.insert(g, scc_id);
                                size += 1;
                                if g == f {
                                    break;
                                }
                            }
                            st.scc_sizes.push(size);
                        }
                        // Propagate lowlink into the caller frame, if any.
                        if let Some(Frame::Resume(parent, _)) = frames.last() {
                            let low = st.lowlink[parent].min(st.lowlink[&f]);
                            st.lowlink.insert(*parent, low);
                        }
                    }
                }
            }
        }

        Self {
            scc_of: st.scc_of,
            scc_sizes: st.scc_sizes,
            self_calls,
        }
    }

    /// Whether `f` sits in a call cycle: an SCC with more than one member, or a direct self call.
    pub fn in_cycle(&self, f: Func) -> bool {
        self.self_calls.contains(&f)
            || self
                .scc_of
                .get(&f)
                .map_or(false, |&id| self.scc_sizes[id] > 1)
    }
}

/// Walks forward from a context instruction along edges that are guaranteed to execute whenever
/// the context does: the remainder of its block, then through unconditional branches into blocks
/// with a single predecessor.
pub fn must_be_executed_context(
    m: &Module,
    summary: &FunctionSummary,
    from: Val,
) -> Vec<Val> {
    const EXPLORATION_CAP: usize = 128;
    let mut out = vec![];
    let mut block = match m.parent_block(from) {
        Some(b) => b,
        None => return out,
    };
    let mut skipping = true;
    loop {
        for v in m.insts_of(block) {
            if skipping {
                if v == from {
                    skipping = false;
                } else {
                    continue;
                }
            }
            out.push(v);
            if out.len() >= EXPLORATION_CAP {
                return out;
            }
        }
        let term = match m.terminator_of(block) {
            Some(t) => t,
            None => return out,
        };
        match &m.expect_inst(term).op {
            Opcode::Br(next) => {
                let preds = summary
                    .preds
                    .get(next)
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);
                if preds.len() != 1 {
                    return out;
                }
                block = *next;
                skipping = false;
            }
            _ => return out,
        }
    }
}

/// At a two-way branch, the contexts of both targets execute on their respective paths; a fact
/// established along *both* holds after the branch. Returns the two single-predecessor successor
/// blocks if the terminator splits that way.
pub fn branch_sides(
    m: &Module,
    summary: &FunctionSummary,
    term: Val,
) -> Option<(Block, Block)> {
    match &m.expect_inst(term).op {
        Opcode::CondBr {
            then_dest,
            else_dest,
        } if then_dest != else_dest => {
            let single_pred = |b: &Block| {
                summary
                    .preds
                    .get(b)
                    .map_or(false, |p| p.len() == 1)
            };
            (single_pred(then_dest) && single_pred(else_dest))
                .then(|| (*then_dest, *else_dest))
        }
        _ => None,
    }
}

/// Lazily-computed, per-run cache of the structural analyses.
#[derive(Default)]
pub struct AnalysisCache {
    summaries: UnorderedMap<Func, Rc<FunctionSummary>>,
    sccs: Option<Rc<CallGraphSccs>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn summary(&mut self, m: &Module, f: Func) -> Rc<FunctionSummary> {
        if let Some(s) = self.summaries.get(&f) {
            return s.clone();
        }
        let s = Rc::new(FunctionSummary::compute(m, f));
        self.summaries.insert(f, s.clone());
        s
    }

    pub fn sccs(&mut self, m: &Module) -> Rc<CallGraphSccs> {
        if let Some(s) = &self.sccs {
            return s.clone();
        }
        let s = Rc::new(CallGraphSccs::compute(m));
        self.sccs = Some(s.clone());
        s
    }
}
