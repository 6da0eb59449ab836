//! Call-graph coherence and the engine's entry points.
//!
//! The engine never mutates the host's call graph directly; it reports every structural change
//! through the [`CallGraphUpdater`] seam so an embedding pass manager can keep its bookkeeping
//! intact. The two entry-point shims here mirror how such a pass manager would drive the engine:
//! once over a whole module, or over a subset of functions (one strongly-connected component).

use crate::config::CONFIG;
use crate::engine::FixpointEngine;
use crate::ir::{Func, Module, Val};
use crate::log::*;
use crate::rewriter::create_shallow_wrapper;

/// Notifications about structural IR changes, consumed by the host's call-graph maintenance. All
/// methods default to no-ops so simple hosts can opt out wholesale.
pub trait CallGraphUpdater {
    fn initialize(&mut self, _m: &Module, _funcs: &[Func]) {}
    /// `old` was replaced by `new` (possibly the same instruction mutated in place).
    fn replace_call_site(&mut self, _old: Val, _new: Val) {}
    fn replace_function_with(&mut self, _old: Func, _new: Func) {}
    fn remove_function(&mut self, _f: Func) {}
    /// The function body changed enough that cached derived analyses should be dropped.
    fn reanalyze_function(&mut self, _f: Func) {}
    fn finalize(&mut self, _m: &Module) {}
}

/// The do-nothing updater for hosts without a call graph to maintain.
#[derive(Default)]
pub struct NullCallGraphUpdater;

impl CallGraphUpdater for NullCallGraphUpdater {}

/// Run the engine over `funcs`. Returns whether the IR changed.
pub fn run_on_functions(
    m: &mut Module,
    funcs: Vec<Func>,
    cg: &mut dyn CallGraphUpdater,
) -> bool {
    cg.initialize(m, &funcs);

    // Functions we may not analyze as a unit (their callers are not all visible) can still
    // benefit when hidden behind a wrapper whose inner copy is fully ours.
    let admitted = funcs;
    if CONFIG.enable_shallow_wrappers {
        for &f in &admitted {
            let fd = m.func(f);
            if !fd.is_declaration() && !fd.internal {
                let wrapper = create_shallow_wrapper(m, f);
                // The inner copy is the one worth analyzing; the wrapper only forwards.
                debug!("created shallow wrapper";
                    "wrapper" => &m.func(wrapper).name,
                    "inner" => &m.func(f).name,
                );
            }
        }
    }

    let changed = {
        let mut a = FixpointEngine::new(m);
        for &f in &admitted {
            a.seed_function(f);
        }
        info!("engine start"; "functions" => admitted.len());
        a.run(cg)
    };
    info!("engine done"; "changed" => changed);

    cg.finalize(m);
    changed
}

/// Module-level shim: analyze every function in the module.
pub fn run_on_module(m: &mut Module) -> bool {
    let funcs: Vec<Func> = m.funcs().collect();
    run_on_functions(m, funcs, &mut NullCallGraphUpdater)
}

/// SCC-level shim: analyze one strongly-connected component handed over by an outer walk, with
/// the host's graph updater attached.
pub fn run_on_scc(m: &mut Module, scc: Vec<Func>, cg: &mut dyn CallGraphUpdater) -> bool {
    run_on_functions(m, scc, cg)
}
