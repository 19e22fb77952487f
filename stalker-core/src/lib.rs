//! `stalker-core` — the data model of the x86 dynamic code-tracing engine.
//!
//! Slabs and arenas, `ExecBlock`/`ExecCtx` bookkeeping, the shadow stack,
//! inline-cache entry layout, backpatch descriptors, and the trait surfaces
//! the engine consumes from its external collaborators (transformer, event
//! sink, observer). Nothing in this crate speaks raw x86 bytes: that's
//! `stalker-codegen`, the only crate in this workspace allowed to depend on
//! an instruction decoder/encoder.

pub mod backpatch;
pub mod block;
pub mod config;
pub mod cpu;
pub mod ctx;
pub mod events;
pub mod exclusion;
pub mod ic;
pub mod insn;
pub mod probe;
pub mod shadow;
pub mod slab;
pub mod tls;
pub mod traits;

pub use backpatch::{BackpatchDescriptor, BackpatchKind, ProlKind, ReplayRecord};
pub use block::{BlockArena, BlockFlags, BlockId, ExecBlock};
pub use config::{ConfigError, StalkerConfig, IC_ENTRIES_MAX, IC_ENTRIES_MIN};
pub use cpu::{CpuContext, Gpr64};
pub use ctx::{CodeState, ExecCtx, ExecCtxState, ExecMode, HelperAddrs};
pub use events::{Event, EventMask, ProbeId};
pub use exclusion::{ExclusionRanges, Range};
pub use ic::{IcEntry, IcTable, IC_EMPTY};
pub use insn::{BranchKind, Instruction, MAX_INSN_LEN};
pub use probe::ProbeTable;
pub use shadow::{ShadowFrame, ShadowStack};
pub use slab::{CodeSlab, CodeSlabWriter, DataSlab, Slab};
pub use tls::{clear_current_ctx, current_ctx, is_followed, set_current_ctx};
pub use traits::{
    CallProbe, EventSink, GateCounter, InstructionIterator, NullTransformer, Observer,
    SingleStepHandler, Transformer,
};
