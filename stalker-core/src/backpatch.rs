//! Backpatch descriptors (§3 "Backpatch descriptor", §4.7) and their
//! serializable replay form (§6 "Prefetch surface", SPEC_FULL §6 `[ADD]`).

use serde::{Deserialize, Serialize};

/// The four rewrites the backpatcher can apply (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpatchKind {
    /// Replace a call stub with a shadow-stack push plus a direct jump.
    Call {
        /// Prolog type open at the patch site, needed to reconstruct the
        /// exact shadow-stack push sequence (§3 "Call additionally carries
        /// the original prolog type at the patch site").
        prolog: ProlKind,
        /// Offset, relative to the *from* block's translated code, of the
        /// instruction immediately after the call (the landing site a
        /// real return must resume at).
        post_call_offset: u32,
    },
    /// Replace a jmp stub with an epilog (if one was open) plus a direct
    /// jump.
    Jmp,
    /// Replace a ret stub with a direct jump (monomorphic return).
    Ret,
    /// Atomically fill the first empty inline-cache slot.
    InlineCache,
}

/// Prolog flavor recorded alongside a [`BackpatchKind::Call`] (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProlKind {
    Minimal,
    Full,
    InlineCacheProlog,
}

/// A backpatch descriptor (§3): opaque to callers of the public API, but
/// emittable to an [`crate::traits::Observer`] as a replay record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpatchDescriptor {
    pub kind: BackpatchKind,
    /// Source address of the block whose translated code is being patched.
    pub from: usize,
    /// Source address of the resolved destination block.
    pub to: usize,
    /// Byte offset within the *from* block's translated code at which the
    /// patch is applied.
    pub patch_offset: u32,
}

/// Serialized form of a [`BackpatchDescriptor`] as persisted by an
/// `Observer` (§6: "observers may persist backpatch descriptors
/// externally"). Replayed through `prefetch_backpatch` by
/// `stalker-replay-dump` or any other host-supplied mechanism, so a future
/// process of the same binary can pre-install warm-path patches without
/// paying the first-miss penalty.
pub type ReplayRecord = BackpatchDescriptor;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_record_round_trips_through_json() {
        let d = BackpatchDescriptor {
            kind: BackpatchKind::Call {
                prolog: ProlKind::Minimal,
                post_call_offset: 12,
            },
            from: 0x1000,
            to: 0x2000,
            patch_offset: 8,
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: BackpatchDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
