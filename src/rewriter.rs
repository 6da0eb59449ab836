//! Deferred IR edits and their replay.
//!
//! During the manifest phase records only *stage* changes; nothing touches the IR until the
//! lattice has settled everywhere. Replay then applies the queues in a fixed order so that edits
//! compose: first value substitutions, then unreachable markers, then control-flow folding, then
//! deletions, and structural surgery (allocation demotion, signature rewriting, function removal)
//! last.

use crate::callgraph::CallGraphUpdater;
use crate::containers::unordered::UnorderedSet;
use crate::ir::{
    AttrSet, Block, CallSiteAttrs, Func, FunctionData, Module, Opcode, Ty, UseRef, Val,
};
use crate::lattice::ChangeStatus;
use crate::log::*;

/// A staged demotion of one heap allocation to a stack slot.
pub struct HeapToStackRewrite {
    pub malloc: Val,
    pub size: u64,
    pub frees: Vec<Val>,
}

/// A staged signature change: one pointer argument becomes a sequence of flattened values.
///
/// `callee_repair` runs once inside the new function body and returns the value that stands in
/// for the old argument (typically a rebuilt stack slot). `call_site_repair` runs per call site
/// and produces the operand values replacing the old pointer operand.
pub struct SignatureRewrite {
    pub func: Func,
    pub arg_index: usize,
    pub replacement_types: Vec<Ty>,
    pub callee_repair:
        Box<dyn Fn(&mut Module, Func, &[Val]) -> Option<Val>>,
    pub call_site_repair: Box<dyn Fn(&mut Module, Val, Val) -> Vec<Val>>,
}

/// All queues of deferred edits.
#[derive(Default)]
pub struct RewriteChanges {
    pub use_replacements: Vec<(UseRef, Val)>,
    pub value_replacements: Vec<(Val, Val)>,
    /// Instructions whose execution is undefined; everything from them onward is cut.
    pub unreachable_before: Vec<Val>,
    /// Call-like instructions control provably never passes; their tails are cut.
    pub unreachable_after: Vec<Val>,
    pub dead_values: Vec<Val>,
    pub dead_blocks: Vec<Block>,
    pub invoke_to_call: Vec<Val>,
    pub heap_to_stack: Vec<HeapToStackRewrite>,
    pub signature_rewrites: Vec<SignatureRewrite>,
    pub delete_functions: Vec<Func>,
}

impl RewriteChanges {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.use_replacements.is_empty()
            && self.value_replacements.is_empty()
            && self.unreachable_before.is_empty()
            && self.unreachable_after.is_empty()
            && self.dead_values.is_empty()
            && self.dead_blocks.is_empty()
            && self.invoke_to_call.is_empty()
            && self.heap_to_stack.is_empty()
            && self.signature_rewrites.is_empty()
            && self.delete_functions.is_empty()
    }

    /// Apply every staged edit. Returns whether the IR changed.
    pub fn replay(mut self, m: &mut Module, cg: &mut dyn CallGraphUpdater) -> ChangeStatus {
        if self.is_empty() {
            return ChangeStatus::Unchanged;
        }
        let mut changed = ChangeStatus::Unchanged;

        // 1. Value and use substitutions. Substituting undef into a branch condition would leave
        //    the branch picking an arbitrary edge; it becomes an unreachable marker instead.
        let mut extra_unreachable: Vec<Val> = vec![];
        let use_is_branch_condition = |m: &Module, u: &UseRef| {
            u.index == 0
                && matches!(
                    m.inst(u.user).map(|i| &i.op),
                    Some(Opcode::CondBr { .. }) | Some(Opcode::Switch { .. })
                )
        };
        for (old, new) in std::mem::take(&mut self.value_replacements) {
            if old == new || m.val(old).deleted || m.val(new).deleted {
                continue;
            }
            let uses: Vec<UseRef> = m.val(old).uses.clone();
            for u in uses {
                if m.is_undef(new) && use_is_branch_condition(m, &u) {
                    extra_unreachable.push(u.user);
                } else {
                    m.replace_use(u, new);
                    changed = ChangeStatus::Changed;
                }
            }
        }
        for (u, new) in std::mem::take(&mut self.use_replacements) {
            if m.val(u.user).deleted || m.val(new).deleted {
                continue;
            }
            let still_present = m
                .inst(u.user)
                .map_or(false, |inst| inst.operands.get(u.index).is_some());
            if !still_present {
                continue;
            }
            if m.is_undef(new) && use_is_branch_condition(m, &u) {
                extra_unreachable.push(u.user);
            } else {
                m.replace_use(u, new);
                changed = ChangeStatus::Changed;
            }
        }
        self.unreachable_before.extend(extra_unreachable);

        // 2. Unreachable markers.
        for v in std::mem::take(&mut self.unreachable_before) {
            if m.val(v).deleted {
                continue;
            }
            changed |= change_to_unreachable(m, v, true);
        }
        for v in std::mem::take(&mut self.unreachable_after) {
            if m.val(v).deleted {
                continue;
            }
            changed |= change_to_unreachable(m, v, false);
        }

        // 3. Branch folding: conditions that became constants pick their edge now.
        changed |= fold_constant_branches(m);

        // 4. Heap allocations demoted to the stack.
        for h2s in std::mem::take(&mut self.heap_to_stack) {
            changed |= apply_heap_to_stack(m, h2s);
        }

        // 5. Dead instruction deletion: staged dead values first, then the trivial sweep.
        for v in std::mem::take(&mut self.dead_values) {
            if m.val(v).deleted {
                continue;
            }
            let uses: Vec<UseRef> = m.val(v).uses.clone();
            for u in uses {
                let ty = m.ty_of(v).clone();
                let undef = m.undef(ty);
                m.replace_use(u, undef);
            }
            m.erase_inst(v);
            changed = ChangeStatus::Changed;
        }
        changed |= delete_trivially_dead(m);

        // 6. Invoke demotion ahead of block deletion, so the unwind edge is unhooked first.
        for v in std::mem::take(&mut self.invoke_to_call) {
            if m.val(v).deleted {
                continue;
            }
            changed |= demote_invoke_to_call(m, v);
            cg.replace_call_site(v, v);
        }

        // 7. Dead blocks are detached in batch.
        let mut seen: UnorderedSet<Block> = Default::default();
        for b in std::mem::take(&mut self.dead_blocks) {
            if !seen.insert(b) || m.block(b).deleted {
                continue;
            }
            detach_block(m, b);
            changed = ChangeStatus::Changed;
        }

        // 8. Signature rewrites.
        for sr in std::mem::take(&mut self.signature_rewrites) {
            if m.func(sr.func).deleted {
                continue;
            }
            let new_func = rewrite_signature(m, &sr);
            cg.replace_function_with(sr.func, new_func);
            changed = ChangeStatus::Changed;
        }

        // 9. Function deletion last; everything referencing these is gone by now.
        for f in std::mem::take(&mut self.delete_functions) {
            if m.func(f).deleted {
                continue;
            }
            info!("deleting dead function"; "name" => &m.func(f).name);
            cg.remove_function(f);
            m.delete_function(f);
            changed = ChangeStatus::Changed;
        }

        changed
    }
}

/// Cut the block at `v`: everything from `v` (inclusive when `inclusive`) to the end goes away
/// and an `unreachable` terminator is appended. Successor phis lose their incoming edge.
fn change_to_unreachable(m: &mut Module, v: Val, inclusive: bool) -> ChangeStatus {
    let b = match m.parent_block(v) {
        Some(b) => b,
        None => return ChangeStatus::Unchanged,
    };
    if let Some(term) = m.terminator_of(b) {
        if matches!(m.expect_inst(term).op, Opcode::Unreachable) && term != v && !inclusive {
            // The tail is already cut.
            return ChangeStatus::Unchanged;
        }
        for s in m.successors_of(term) {
            m.remove_phi_incoming(s, b);
        }
    }
    if inclusive {
        m.truncate_block_from(b, v);
    } else {
        m.truncate_block_after(b, v);
    }
    m.append_inst(b, Ty::Void, Opcode::Unreachable, vec![], None);
    ChangeStatus::Changed
}

/// Fold conditional branches and switches whose scrutinee is a constant.
fn fold_constant_branches(m: &mut Module) -> ChangeStatus {
    let mut changed = ChangeStatus::Unchanged;
    let funcs: Vec<Func> = m.funcs().collect();
    for f in funcs {
        let terms: Vec<Val> = m
            .blocks_of(f)
            .filter_map(|b| m.terminator_of(b))
            .collect();
        for term in terms {
            let (taken, dropped) = {
                let inst = m.expect_inst(term);
                match &inst.op {
                    Opcode::CondBr {
                        then_dest,
                        else_dest,
                    } => match m.is_int_const(inst.operands[0]) {
                        Some(c) => {
                            let taken = if c != 0 { *then_dest } else { *else_dest };
                            let dropped = if c != 0 { *else_dest } else { *then_dest };
                            (taken, vec![dropped])
                        }
                        None => continue,
                    },
                    Opcode::Switch { default, cases } => {
                        match m.is_int_const(inst.operands[0]) {
                            Some(c) => {
                                let taken = cases
                                    .iter()
                                    .find(|(case, _)| *case == c)
                                    .map(|(_, b)| *b)
                                    .unwrap_or(*default);
                                let dropped = std::iter::once(*default)
                                    .chain(cases.iter().map(|(_, b)| *b))
                                    .filter(|&b| b != taken)
                                    .collect();
                                (taken, dropped)
                            }
                            None => continue,
                        }
                    }
                    _ => continue,
                }
            };
            let block = m.parent_block(term).expect("terminator in a block");
            let condition = m.expect_inst(term).operands[0];
            m.val_mut(condition)
                .uses
                .retain(|u| u.user != term);
            {
                let inst = m.inst_mut(term).unwrap();
                inst.operands.clear();
                inst.op = Opcode::Br(taken);
            }
            let mut dropped_seen: UnorderedSet<Block> = Default::default();
            for d in dropped {
                if dropped_seen.insert(d) {
                    m.remove_phi_incoming(d, block);
                }
            }
            changed = ChangeStatus::Changed;
        }
    }
    changed
}

/// Sweep side-effect-free instructions whose results are unused, bottom-up until stable.
fn delete_trivially_dead(m: &mut Module) -> ChangeStatus {
    let mut changed = ChangeStatus::Unchanged;
    loop {
        let mut any = false;
        let funcs: Vec<Func> = m.funcs().collect();
        for f in funcs {
            let dead: Vec<Val> = m
                .insts_of_func(f)
                .filter(|&v| {
                    !m.has_side_effects(v)
                        && !m.expect_inst(v).op.is_terminator()
                        && m.val(v).uses.is_empty()
                })
                .collect();
            for v in dead {
                m.erase_inst(v);
                any = true;
            }
        }
        if !any {
            break;
        }
        changed = ChangeStatus::Changed;
    }
    changed
}

/// Detach one dead block: successors lose their phi edges, then the block is emptied and
/// tombstoned.
fn detach_block(m: &mut Module, b: Block) {
    if let Some(term) = m.terminator_of(b) {
        for s in m.successors_of(term) {
            m.remove_phi_incoming(s, b);
        }
    }
    m.delete_block(b);
}

/// Turn an invoke whose exceptional edge is gone into a plain call followed by a branch to the
/// old normal destination.
fn demote_invoke_to_call(m: &mut Module, v: Val) -> ChangeStatus {
    let (normal, unwind, block) = {
        let inst = m.expect_inst(v);
        match inst.op {
            Opcode::Invoke { normal, unwind } => (normal, unwind, inst.block),
            _ => return ChangeStatus::Unchanged,
        }
    };
    m.remove_phi_incoming(unwind, block);
    {
        let inst = m.inst_mut(v).unwrap();
        inst.op = Opcode::Call;
    }
    m.append_inst(block, Ty::Void, Opcode::Br(normal), vec![], None);
    ChangeStatus::Changed
}

/// Replace a recognized allocation call with a stack slot of the same size (plus a cast back to
/// the call's pointer type) and drop its matched frees.
fn apply_heap_to_stack(m: &mut Module, h2s: HeapToStackRewrite) -> ChangeStatus {
    let HeapToStackRewrite {
        malloc,
        size,
        frees,
    } = h2s;
    if m.val(malloc).deleted {
        return ChangeStatus::Unchanged;
    }
    let slot_ty = Ty::Array(Box::new(Ty::Int(8)), size);
    let result_ty = m.ty_of(malloc).clone();
    let slot = m.insert_inst_before(
        malloc,
        Ty::Ptr(Box::new(slot_ty.clone())),
        Opcode::Alloca { allocated: slot_ty },
        vec![],
        None,
    );
    let replacement = if m.ty_of(slot) == &result_ty {
        slot
    } else {
        m.insert_inst_before(
            malloc,
            result_ty,
            Opcode::Cast(crate::ir::CastKind::Bitcast),
            vec![slot],
            None,
        )
    };
    m.replace_all_uses_with(malloc, replacement);
    m.erase_inst(malloc);
    for free in frees {
        if !m.val(free).deleted {
            // Replacement above may have redirected the free's operand; unhook it regardless.
            m.erase_inst(free);
        }
    }
    ChangeStatus::Changed
}

/// Build the new function for a signature rewrite, splice the old body in, run the repair
/// callbacks, and fix every call site. Attributes, linkage, and the personality flag carry over.
fn rewrite_signature(m: &mut Module, sr: &SignatureRewrite) -> Func {
    let old = sr.func;
    let old_fd = m.func(old).clone();
    assert!(
        sr.arg_index < old_fd.ty.params.len(),
        "signature rewrite of argument {} beyond arity {}",
        sr.arg_index,
        old_fd.ty.params.len()
    );

    // New parameter list with the rewritten argument spliced out.
    let mut new_params: Vec<Ty> = vec![];
    let mut new_arg_attrs: Vec<AttrSet> = vec![];
    for (i, ty) in old_fd.ty.params.iter().enumerate() {
        if i == sr.arg_index {
            for rty in &sr.replacement_types {
                new_params.push(rty.clone());
                new_arg_attrs.push(AttrSet::new());
            }
        } else {
            new_params.push(ty.clone());
            new_arg_attrs.push(old_fd.arg_attrs[i].clone());
        }
    }

    let new_func = Func(m.functions.len());
    let mut new_ty = old_fd.ty.clone();
    new_ty.params = new_params.clone();
    m.functions.push(FunctionData {
        name: old_fd.name.clone(),
        ty: new_ty,
        args: vec![],
        blocks: old_fd.blocks.clone(),
        internal: old_fd.internal,
        has_personality: old_fd.has_personality,
        fn_attrs: old_fd.fn_attrs.clone(),
        ret_attrs: old_fd.ret_attrs.clone(),
        arg_attrs: new_arg_attrs,
        deleted: false,
    });
    let new_args: Vec<Val> = new_params
        .iter()
        .enumerate()
        .map(|(index, ty)| {
            m.push_arg_value(ty.clone(), new_func, index)
        })
        .collect();
    m.functions[new_func.0].args = new_args.clone();

    // The body moves wholesale; block ownership follows.
    for &b in &old_fd.blocks {
        m.block_mut(b).func = new_func;
    }
    m.func_mut(old).blocks = vec![];

    // Old arguments map to new ones; the rewritten argument maps to whatever the repair callback
    // rebuilds.
    let replaced_args: Vec<Val> =
        new_args[sr.arg_index..sr.arg_index + sr.replacement_types.len()].to_vec();
    for (i, &old_arg) in old_fd.args.iter().enumerate() {
        if i == sr.arg_index {
            continue;
        }
        let new_index = if i < sr.arg_index {
            i
        } else {
            i + sr.replacement_types.len() - 1
        };
        if !m.val(old_arg).uses.is_empty() {
            m.replace_all_uses_with(old_arg, new_args[new_index]);
        }
    }
    let old_rewritten_arg = old_fd.args[sr.arg_index];
    if let Some(standin) = (sr.callee_repair)(m, new_func, &replaced_args) {
        if !m.val(old_rewritten_arg).uses.is_empty() {
            m.replace_all_uses_with(old_rewritten_arg, standin);
        }
    }

    // Rewrite every call site of the old function.
    let calls: Vec<Val> = m
        .existing_func_ref(old)
        .map(|fref| {
            m.val(fref)
                .uses
                .iter()
                .filter(|u| u.index == 0 && m.is_call_like(u.user))
                .map(|u| u.user)
                .collect()
        })
        .unwrap_or_default();
    let new_fref = m.func_ref(new_func);
    for call in calls {
        if m.val(call).deleted {
            continue;
        }
        let (old_args, op, old_attrs) = {
            let inst = m.expect_inst(call);
            (
                inst.operands[1..].to_vec(),
                inst.op.clone(),
                inst.call_attrs.clone().unwrap_or_default(),
            )
        };
        let mut new_operands = vec![new_fref];
        let mut new_cs_arg_attrs: Vec<AttrSet> = vec![];
        for (i, &operand) in old_args.iter().enumerate() {
            if i == sr.arg_index {
                let fields = (sr.call_site_repair)(m, call, operand);
                for field in fields {
                    new_operands.push(field);
                    new_cs_arg_attrs.push(AttrSet::new());
                }
            } else {
                new_operands.push(operand);
                new_cs_arg_attrs.push(
                    old_attrs
                        .arg_attrs
                        .get(i)
                        .cloned()
                        .unwrap_or_default(),
                );
            }
        }
        let ret_ty = m.ty_of(call).clone();
        let new_call = m.insert_inst_before(
            call,
            ret_ty.clone(),
            op,
            new_operands,
            Some(Box::new(CallSiteAttrs {
                fn_attrs: old_attrs.fn_attrs.clone(),
                ret_attrs: old_attrs.ret_attrs.clone(),
                arg_attrs: new_cs_arg_attrs,
            })),
        );
        if !m.val(call).uses.is_empty() {
            m.replace_all_uses_with(call, new_call);
        }
        // Invokes terminate their block; the replacement took over the successors, the original
        // goes away either way.
        m.erase_inst(call);
    }

    m.func_mut(old).deleted = true;
    new_func
}

/// Wrap a function that cannot be freely analyzed: the wrapper keeps the original's name and
/// signature and tail-calls the original, which is demoted to internal linkage under a fresh
/// name. Downstream consumers see only the wrapper.
pub fn create_shallow_wrapper(m: &mut Module, f: Func) -> Func {
    let fd = m.func(f).clone();
    let inner_name = format!("{}.inner", fd.name);
    m.func_mut(f).name = inner_name;
    m.func_mut(f).internal = true;

    let wrapper = Func(m.functions.len());
    m.functions.push(FunctionData {
        name: fd.name.clone(),
        ty: fd.ty.clone(),
        args: vec![],
        blocks: vec![],
        internal: fd.internal,
        has_personality: false,
        fn_attrs: fd.fn_attrs.clone(),
        ret_attrs: fd.ret_attrs.clone(),
        arg_attrs: fd.arg_attrs.clone(),
        deleted: false,
    });
    let args: Vec<Val> = fd
        .ty
        .params
        .iter()
        .enumerate()
        .map(|(index, ty)| m.push_arg_value(ty.clone(), wrapper, index))
        .collect();
    m.functions[wrapper.0].args = args.clone();

    let block = Block(m.blocks.len());
    m.blocks.push(crate::ir::BlockData {
        func: wrapper,
        name: "entry".to_owned(),
        insts: vec![],
        deleted: false,
        max_trip_count: None,
    });
    m.functions[wrapper.0].blocks.push(block);

    let inner_ref = m.func_ref(f);
    let ret_ty = (*fd.ty.ret).clone();
    let mut operands = vec![inner_ref];
    operands.extend(args);
    let nargs = fd.ty.params.len();
    let call = m.append_inst(
        block,
        ret_ty.clone(),
        Opcode::Call,
        operands,
        Some(Box::new(CallSiteAttrs {
            fn_attrs: AttrSet::new(),
            ret_attrs: AttrSet::new(),
            arg_attrs: (0..nargs).map(|_| AttrSet::new()).collect(),
        })),
    );
    if ret_ty.is_void() {
        m.append_inst(block, Ty::Void, Opcode::Ret, vec![], None);
    } else {
        m.append_inst(block, Ty::Void, Opcode::Ret, vec![call], None);
    }
    wrapper
}
