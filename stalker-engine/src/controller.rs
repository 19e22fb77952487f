//! `activate`/`deactivate` and the `unfollow` completion half of the
//! `ExecCtx` controller state machine (§4.1, §4.8).

use stalker_core::ctx::{ExecCtx, ExecCtxState};
use stalker_core::StalkerConfig;

use crate::compiler::{obtain_block_for, CompileError, CompileGates, CompileQuery};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// §4.1 "activate": a no-op if `target` already lies in translated code;
/// otherwise compile it and return the translated address the caller
/// should redirect the return address to.
///
/// §9 Design Note resolves the "activate while a previous activate hasn't
/// been reached" open question as latest-wins: each call simply overwrites
/// `ExecCtx.activation_target`.
pub fn activate(
    ctx: &ExecCtx,
    target: usize,
    gates: &CompileGates,
    config: &StalkerConfig,
    query: &dyn CompileQuery,
) -> Result<Option<usize>, ControllerError> {
    *ctx.activation_target.lock() = Some(target);

    let already_translated = {
        let state = ctx.code_lock.lock();
        state
            .code_slabs
            .iter()
            .any(|s| s.slab.contains_produced(target))
    };
    if already_translated {
        return Ok(None);
    }

    let code_addr = obtain_block_for(ctx, target, gates, config, query)?;
    *ctx.pending_return_location.lock() = Some(target);
    Ok(Some(code_addr))
}

/// §4.1 "deactivate": restore the original caller return path using the
/// saved pending-return location, clearing both deferred-activation fields.
pub fn deactivate(ctx: &ExecCtx) -> Option<usize> {
    ctx.activation_target.lock().take();
    ctx.pending_return_location.lock().take()
}

/// §4.8: called from the first helper callback after `unfollow` set
/// `UnfollowPending`, once `pending_calls` has reached zero. Clears the
/// current block, stamps `resume_at`, transitions to `DestroyPending`, and
/// clears the thread-local context pointer. Returns `false` if the
/// transition wasn't ready yet (caller should leave everything as is; the
/// next helper callback will retry).
pub fn try_complete_unfollow(ctx: &ExecCtx, resume_at: usize) -> bool {
    if !ctx.unfollow_is_ready() {
        return false;
    }
    *ctx.current_block.lock() = None;
    ctx.set_resume_at(resume_at);
    let advanced = ctx.try_advance_state(ExecCtxState::DestroyPending);
    if advanced {
        // SAFETY: this runs on the owning thread, immediately after the
        // transition it gates on; nothing else touches this thread's TLS
        // handle concurrently (§9 "Global state").
        stalker_core::tls::clear_current_ctx();
    }
    advanced
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

    fn make_ctx() -> ExecCtx {
        ExecCtx::new(
            1,
            CodeSlab::new(4096).unwrap(),
            DataSlab::new(4096).unwrap(),
            64,
            Arc::new(NullTransformer),
            Arc::new(NullSink),
            None,
        )
        .unwrap()
    }

    #[test]
    fn unfollow_does_not_complete_with_pending_calls() {
        let ctx = make_ctx();
        ctx.try_advance_state(ExecCtxState::UnfollowPending);
        ctx.enter_callback();
        assert!(!try_complete_unfollow(&ctx, 0));
        assert_eq!(ctx.state(), ExecCtxState::UnfollowPending);
        ctx.leave_callback();
        assert!(try_complete_unfollow(&ctx, 0x1234));
        assert_eq!(ctx.state(), ExecCtxState::DestroyPending);
        assert_eq!(ctx.resume_at(), 0x1234);
    }

    #[test]
    fn deactivate_clears_both_fields() {
        let ctx = make_ctx();
        *ctx.activation_target.lock() = Some(0x1000);
        *ctx.pending_return_location.lock() = Some(0x2000);
        let restored = deactivate(&ctx);
        assert_eq!(restored, Some(0x2000));
        assert!(ctx.activation_target.lock().is_none());
        assert!(ctx.pending_return_location.lock().is_none());
    }
}
