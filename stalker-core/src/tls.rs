//! The thread-local "current ExecCtx" handle (§3 Stalker: "a thread-local
//! key holding the current thread's ExecCtx"; §9 Design Note "Global state
//! (thread-local current ExecCtx)").
//!
//! Kept as a single explicit thread-local pointer, set by `follow` and
//! cleared by `unfollow`, rather than threaded explicitly through every
//! helper call — translated code calls engine helpers with a fixed calling
//! convention, so there is no channel to pass a context handle through
//! (§9).

use std::cell::Cell;
use std::ptr::NonNull;

use crate::ctx::ExecCtx;

thread_local! {
    static CURRENT: Cell<Option<NonNull<ExecCtx>>> = Cell::new(None);
}

/// Install `ctx` as this thread's current `ExecCtx` (called once by
/// `follow`). The pointer must remain valid until a matching
/// [`clear_current_ctx`] — i.e. the `ExecCtx` must outlive its presence
/// here, which the controller's `DestroyPending` grace period guarantees
/// (§4.8).
///
/// # Safety
/// `ctx` must point to a live, pinned `ExecCtx` for as long as it remains
/// installed.
pub unsafe fn set_current_ctx(ctx: NonNull<ExecCtx>) {
    CURRENT.with(|c| c.set(Some(ctx)));
}

/// Clear this thread's current `ExecCtx` (called once by `unfollow`).
pub fn clear_current_ctx() {
    CURRENT.with(|c| c.set(None));
}

/// Read this thread's current `ExecCtx`, if any is installed.
///
/// # Safety
/// The caller must not retain the reference past the lifetime of the
/// installing [`set_current_ctx`]/[`clear_current_ctx`] pair, and must not
/// call this while holding a conflicting exclusive reference to the same
/// `ExecCtx`.
pub unsafe fn current_ctx<'a>() -> Option<&'a ExecCtx> {
    CURRENT.with(|c| c.get().map(|p| p.as_ref()))
}

/// `true` iff this thread currently has an installed `ExecCtx`.
pub fn is_followed() -> bool {
    CURRENT.with(|c| c.get().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unfollowed() {
        assert!(!is_followed());
    }

    #[test]
    fn clear_is_idempotent() {
        clear_current_ctx();
        clear_current_ctx();
        assert!(!is_followed());
    }
}
