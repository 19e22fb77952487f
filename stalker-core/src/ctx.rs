//! Per-thread execution context (§3 "ExecCtx", §4.8 controller state
//! machine).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::block::{BlockArena, BlockId};
use crate::slab::{CodeSlab, DataSlab, Slab, SCRATCH_SLAB_SIZE};
use crate::shadow::ShadowStack;
use crate::traits::{EventSink, Observer, Transformer};

/// Controller state (§4.8): transitions are monotonic, `Active →
/// UnfollowPending → DestroyPending`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExecCtxState {
    Active = 0,
    UnfollowPending = 1,
    DestroyPending = 2,
}

impl ExecCtxState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => ExecCtxState::Active,
            1 => ExecCtxState::UnfollowPending,
            _ => ExecCtxState::DestroyPending,
        }
    }

    /// `true` if `self -> next` is one of the two legal forward transitions.
    pub fn can_advance_to(self, next: ExecCtxState) -> bool {
        matches!(
            (self, next),
            (ExecCtxState::Active, ExecCtxState::UnfollowPending)
                | (ExecCtxState::UnfollowPending, ExecCtxState::DestroyPending)
        )
    }
}

/// Execution mode (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExecMode {
    Normal = 0,
    SingleSteppingOnCall = 1,
    SingleSteppingThroughCall = 2,
}

impl ExecMode {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => ExecMode::Normal,
            1 => ExecMode::SingleSteppingOnCall,
            _ => ExecMode::SingleSteppingThroughCall,
        }
    }
}

/// Helper addresses cached on the `ExecCtx`, emitted once per context
/// (§4.3). `None` until the first code slab is created and the helpers are
/// emitted into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelperAddrs {
    pub prolog_minimal: Option<usize>,
    pub epilog_minimal: Option<usize>,
    pub prolog_full: Option<usize>,
    pub epilog_full: Option<usize>,
    pub prolog_ic: Option<usize>,
    pub epilog_ic: Option<usize>,
    pub stack_push: Option<usize>,
    pub stack_pop_and_go: Option<usize>,
    pub invalidator: Option<usize>,
}

impl HelperAddrs {
    /// `true` once every helper this context needs has been emitted.
    pub fn is_complete(&self) -> bool {
        self.prolog_minimal.is_some()
            && self.epilog_minimal.is_some()
            && self.prolog_full.is_some()
            && self.epilog_full.is_some()
            && self.prolog_ic.is_some()
            && self.epilog_ic.is_some()
            && self.stack_push.is_some()
            && self.stack_pop_and_go.is_some()
            && self.invalidator.is_some()
    }
}

/// Everything protected by `code_lock` (§5): the slab chains, the block
/// arena, the `real_start -> ExecBlock` mapping, and the cached helper
/// addresses. Bundled into one struct so the lock guards all of it
/// uniformly, matching §3's invariant that `code_lock` protects "all
/// code-slab mutations".
pub struct CodeState {
    pub code_slabs: Vec<CodeSlab>,
    pub data_slabs: Vec<DataSlab>,
    /// Scratch slab used to stage in-place recompiles (§4.4) before they are
    /// copied back into the original block's reserved capacity.
    pub scratch_slab: Slab,
    pub arena: BlockArena,
    pub block_map: HashMap<usize, BlockId>,
    pub helpers: HelperAddrs,
}

impl CodeState {
    pub fn new(code_slab: CodeSlab, data_slab: DataSlab) -> std::io::Result<Self> {
        Ok(Self {
            code_slabs: vec![code_slab],
            data_slabs: vec![data_slab],
            scratch_slab: Slab::new(SCRATCH_SLAB_SIZE)?,
            arena: BlockArena::new(),
            block_map: HashMap::new(),
            helpers: HelperAddrs::default(),
        })
    }

    pub fn current_code_slab(&self) -> &CodeSlab {
        self.code_slabs.last().expect("at least one code slab")
    }

    pub fn current_data_slab(&self) -> &DataSlab {
        self.data_slabs.last().expect("at least one data slab")
    }
}

/// Per-traced-thread state (§3 "ExecCtx").
pub struct ExecCtx {
    pub thread_id: u64,
    state: AtomicU32,
    mode: AtomicU32,
    /// Incremented around any call from translated code into engine
    /// callbacks (probes, callouts, transformer); while nonzero, unfollow
    /// must not complete (§4.8).
    pending_calls: AtomicU32,
    /// Wall-clock time `DestroyPending` was entered, used by
    /// `garbage_collect`'s ≈20ms grace period (§4.1, §5).
    destroy_pending_since: Mutex<Option<Instant>>,

    pub code_lock: Mutex<CodeState>,
    pub frames: Mutex<ShadowStack>,

    /// Saved original stack pointer while engine helpers run (§3, §4.3).
    app_stack: AtomicUsize,
    /// Deferred "activate here" address (§4.1 `activate`/`deactivate`).
    pub activation_target: Mutex<Option<usize>>,
    /// Saved return-path location for `deactivate` (§4.1).
    pub pending_return_location: Mutex<Option<usize>>,
    /// Pointer into translated code execution should resume at; set by
    /// `unfollow` (§4.8) and by the entry gates.
    resume_at: AtomicUsize,
    /// The ExecBlock currently executing, if any.
    pub current_block: Mutex<Option<BlockId>>,

    pub transformer: Arc<dyn Transformer>,
    pub sink: Arc<dyn EventSink>,
    pub observer: Option<Arc<dyn Observer>>,
}

impl ExecCtx {
    pub fn new(
        thread_id: u64,
        code_slab: CodeSlab,
        data_slab: DataSlab,
        shadow_capacity: usize,
        transformer: Arc<dyn Transformer>,
        sink: Arc<dyn EventSink>,
        observer: Option<Arc<dyn Observer>>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            thread_id,
            state: AtomicU32::new(ExecCtxState::Active as u32),
            mode: AtomicU32::new(ExecMode::Normal as u32),
            pending_calls: AtomicU32::new(0),
            destroy_pending_since: Mutex::new(None),
            code_lock: Mutex::new(CodeState::new(code_slab, data_slab)?),
            frames: Mutex::new(ShadowStack::new(shadow_capacity)),
            app_stack: AtomicUsize::new(0),
            activation_target: Mutex::new(None),
            pending_return_location: Mutex::new(None),
            resume_at: AtomicUsize::new(0),
            current_block: Mutex::new(None),
            transformer,
            sink,
            observer,
        })
    }

    #[inline]
    pub fn state(&self) -> ExecCtxState {
        ExecCtxState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.state(), ExecCtxState::Active)
    }

    /// Attempt the monotonic transition `self.state() -> next`. Returns
    /// `false` if the transition isn't legal from the current state (§4.8).
    /// Uses acquire-release ordering per §9's open-question resolution
    /// (`may_now_backpatch` must synchronize the state read with any
    /// concurrent patch write).
    pub fn try_advance_state(&self, next: ExecCtxState) -> bool {
        loop {
            let cur = self.state();
            if !cur.can_advance_to(next) {
                return false;
            }
            match self.state.compare_exchange(
                cur as u32,
                next as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if matches!(next, ExecCtxState::DestroyPending) {
                        *self.destroy_pending_since.lock() = Some(Instant::now());
                    }
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Elapsed time since this context entered `DestroyPending`, if it has.
    pub fn destroy_pending_elapsed(&self) -> Option<std::time::Duration> {
        self.destroy_pending_since.lock().as_ref().map(|t| t.elapsed())
    }

    #[inline]
    pub fn mode(&self) -> ExecMode {
        ExecMode::from_u32(self.mode.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_mode(&self, mode: ExecMode) {
        self.mode.store(mode as u32, Ordering::Release);
    }

    #[inline]
    pub fn pending_calls(&self) -> u32 {
        self.pending_calls.load(Ordering::Acquire)
    }

    /// Increment around a call from translated code into an engine
    /// callback (§4.8).
    #[inline]
    pub fn enter_callback(&self) {
        self.pending_calls.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement on return from an engine callback (§4.8).
    #[inline]
    pub fn leave_callback(&self) {
        self.pending_calls.fetch_sub(1, Ordering::AcqRel);
    }

    /// `true` once it is safe for `unfollow` to complete: `UnfollowPending`
    /// and no nested engine calls in flight (§4.8).
    pub fn unfollow_is_ready(&self) -> bool {
        matches!(self.state(), ExecCtxState::UnfollowPending) && self.pending_calls() == 0
    }

    #[inline]
    pub fn app_stack(&self) -> usize {
        self.app_stack.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_app_stack(&self, sp: usize) {
        self.app_stack.store(sp, Ordering::Release);
    }

    #[inline]
    pub fn resume_at(&self) -> usize {
        self.resume_at.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_resume_at(&self, addr: usize) {
        self.resume_at.store(addr, Ordering::Release);
    }

    /// Backpatching is permitted only while `Active` (§4.7), with
    /// acquire ordering so a racing transition to `UnfollowPending` is
    /// always visible before the patch write proceeds (§9 open question).
    pub fn may_now_backpatch(&self) -> bool {
        self.state.load(Ordering::Acquire) == ExecCtxState::Active as u32
    }
}
