//! A global store of knobs that control the fixpoint engine.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different engine executions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct EngineConfig {
    /// Maximum number of fixpoint iterations before remaining unsettled records are collapsed to
    /// their safe (pessimistic) value.
    pub max_fixpoint_iterations: usize,
    /// Every this-many iterations, the dependency graph is discarded and all unsettled records are
    /// re-enqueued, so that stale dependencies get recomputed. `0` disables the recompute entirely.
    pub dep_recompute_interval: usize,
    /// Largest allocation, in bytes, that the heap-to-stack analysis will consider turning into a
    /// stack allocation.
    pub max_heap_to_stack_size: u64,
    /// Whether the heap-to-stack analysis runs at all.
    pub enable_heap_to_stack: bool,
    /// Wrap functions that cannot be analyzed interprocedurally (external linkage, no exact
    /// definition) in an identically-typed shallow wrapper, so that downstream consumers see a
    /// function whose definition is under our control.
    pub enable_shallow_wrappers: bool,
    /// Also annotate call sites of functions that are mere declarations. Without this, facts about
    /// declared-only callees are tracked but not written back at their call sites.
    pub annotate_declaration_call_sites: bool,
    /// If `true`, reaching the iteration cap aborts with a diagnostic naming the records that had
    /// not settled. Meant for engine development, not production runs.
    pub verify_max_iterations: bool,
}

impl EngineConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineEngineConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<EngineConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: EngineConfig = EngineConfig::from_initialized();
}

/// Engine configuration parameters
#[derive(clap::ArgEnum, Clone, Debug)]
pub enum CommandLineEngineConfig {
    DisableHeapToStack,
    EnableShallowWrappers,
    EnableAnnotateDeclarationCallSites,
    VerifyMaxIterations,
    /// Run a single fixpoint iteration; anything unsettled collapses. Useful to inspect which facts
    /// survive a maximally impatient run.
    SingleIteration,
    DisableDependencyRecompute,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_fixpoint_iterations: 32,
            dep_recompute_interval: 4,
            max_heap_to_stack_size: 128,
            enable_heap_to_stack: true,
            enable_shallow_wrappers: false,
            annotate_declaration_call_sites: false,
            verify_max_iterations: false,
        }
    }
}

impl From<Vec<CommandLineEngineConfig>> for EngineConfig {
    fn from(v: Vec<CommandLineEngineConfig>) -> Self {
        use CommandLineEngineConfig::*;
        let mut r = EngineConfig::default();
        for v in v {
            match v {
                DisableHeapToStack => {
                    r.enable_heap_to_stack = false;
                }
                EnableShallowWrappers => {
                    r.enable_shallow_wrappers = true;
                }
                EnableAnnotateDeclarationCallSites => {
                    r.annotate_declaration_call_sites = true;
                }
                VerifyMaxIterations => {
                    r.verify_max_iterations = true;
                }
                SingleIteration => {
                    r.max_fixpoint_iterations = 1;
                }
                DisableDependencyRecompute => {
                    r.dep_recompute_interval = 0;
                }
            }
        }
        r
    }
}
