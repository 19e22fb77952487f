//! Event kinds and the per-event payload (§6 "Event sink").
//!
//! Every event carries original-code addresses, never translated ones —
//! the sink is meant to observe the application's own address space.

use bitflags::bitflags;

bitflags! {
    /// Bitset of subscribed event kinds, returned by
    /// [`crate::traits::EventSink::query_mask`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const CALL    = 1 << 0;
        const RET     = 1 << 1;
        const EXEC    = 1 << 2;
        const BLOCK   = 1 << 3;
        const COMPILE = 1 << 4;
    }
}

/// One emitted event (§6: "Event kinds: {Call, Ret, Exec, Block, Compile}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A direct or indirect call instruction executed, carrying the
    /// original call-site address and the original target address.
    Call { location: usize, target: usize },
    /// A return instruction executed, carrying the original call-site
    /// location and the original return target.
    Ret { location: usize, target: usize },
    /// A single original instruction executed (per-instruction event hook,
    /// §4.2 step 4).
    Exec { location: usize },
    /// A translated basic block was entered.
    Block { start: usize, size: u32 },
    /// A basic block finished compiling (§4.2 step 7).
    Compile { start: usize, size: u32 },
}

impl Event {
    /// Which [`EventMask`] bit this event corresponds to.
    pub fn kind(&self) -> EventMask {
        match self {
            Event::Call { .. } => EventMask::CALL,
            Event::Ret { .. } => EventMask::RET,
            Event::Exec { .. } => EventMask::EXEC,
            Event::Block { .. } => EventMask::BLOCK,
            Event::Compile { .. } => EventMask::COMPILE,
        }
    }
}

/// Monotonically increasing identifier for a registered call probe (§4.1
/// "add_call_probe ... A monotonically increasing probe-id counter assigns
/// ids").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_maps_to_matching_mask_bit() {
        assert_eq!(Event::Call { location: 0, target: 0 }.kind(), EventMask::CALL);
        assert_eq!(Event::Compile { start: 0, size: 0 }.kind(), EventMask::COMPILE);
    }
}
