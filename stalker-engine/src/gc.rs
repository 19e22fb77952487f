//! `garbage_collect` (§4.1, §5): destroys `ExecCtx`s whose owning thread
//! has vanished, or whose `DestroyPending` grace period has elapsed.
//!
//! Thread liveness is an OS-provided fact (§1 "Thread enumeration ...
//! assumed as OS-provided capabilities"), so this module takes it as an
//! injected predicate rather than calling into any platform API directly —
//! the `stalker` facade crate owns that boundary.

use std::sync::Arc;
use std::time::Duration;

use stalker_core::ctx::{ExecCtx, ExecCtxState};

/// §4.1: "a grace interval (≈20 ms) has elapsed since the transition."
pub const GRACE_PERIOD: Duration = Duration::from_millis(20);

/// `true` if `ctx` is eligible for collection right now (§4.1):
/// - its owning thread no longer exists, or
/// - it is `DestroyPending` and either `caller_thread_id` is the owning
///   thread itself (self-collection) or the grace period has elapsed.
pub fn is_collectible(ctx: &ExecCtx, thread_alive: bool, caller_thread_id: u64) -> bool {
    if !thread_alive {
        return true;
    }
    if ctx.state() != ExecCtxState::DestroyPending {
        return false;
    }
    if caller_thread_id == ctx.thread_id {
        return true;
    }
    ctx.destroy_pending_elapsed()
        .map(|elapsed| elapsed >= GRACE_PERIOD)
        .unwrap_or(false)
}

/// Sweep `ctxs`, dropping (and thus freeing) every collectible context.
/// `thread_alive` is consulted once per context; `caller_thread_id` is the
/// thread invoking `garbage_collect` (§4.1: "either the caller is the
/// owning thread").
pub fn garbage_collect<F>(ctxs: &mut Vec<Arc<ExecCtx>>, caller_thread_id: u64, mut thread_alive: F)
where
    F: FnMut(u64) -> bool,
{
    ctxs.retain(|ctx| !is_collectible(ctx, thread_alive(ctx.thread_id), caller_thread_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stalker_core::slab::{CodeSlab, DataSlab};
    use stalker_core::traits::{EventSink, NullTransformer};
    use stalker_core::events::{Event, EventMask};

    struct NullSink;
    impl EventSink for NullSink {
        fn query_mask(&self) -> EventMask {
            EventMask::empty()
        }
        fn process(&self, _event: Event, _cpu_context: Option<&stalker_core::CpuContext>) {}
    }

    fn make_ctx(tid: u64) -> Arc<ExecCtx> {
        Arc::new(
            ExecCtx::new(
                tid,
                CodeSlab::new(4096).unwrap(),
                DataSlab::new(4096).unwrap(),
                64,
                Arc::new(NullTransformer),
                Arc::new(NullSink),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn dead_thread_is_always_collectible() {
        let ctx = make_ctx(7);
        assert!(is_collectible(&ctx, false, 1));
    }

    #[test]
    fn active_context_on_a_live_thread_is_never_collected() {
        let ctx = make_ctx(7);
        assert!(!is_collectible(&ctx, true, 7));
    }

    #[test]
    fn self_collection_skips_the_grace_period() {
        let ctx = make_ctx(7);
        ctx.try_advance_state(ExecCtxState::UnfollowPending);
        ctx.try_advance_state(ExecCtxState::DestroyPending);
        assert!(is_collectible(&ctx, true, 7), "owning thread may self-collect immediately");
    }

    #[test]
    fn other_thread_must_wait_for_the_grace_period() {
        let ctx = make_ctx(7);
        ctx.try_advance_state(ExecCtxState::UnfollowPending);
        ctx.try_advance_state(ExecCtxState::DestroyPending);
        assert!(!is_collectible(&ctx, true, 1), "grace period has not elapsed yet");
    }

    #[test]
    fn sweep_removes_only_collectible_entries() {
        let mut ctxs = vec![make_ctx(1), make_ctx(2)];
        ctxs[1].try_advance_state(ExecCtxState::UnfollowPending);
        ctxs[1].try_advance_state(ExecCtxState::DestroyPending);
        garbage_collect(&mut ctxs, 2, |_| true);
        assert_eq!(ctxs.len(), 1);
        assert_eq!(ctxs[0].thread_id, 1);
    }
}
