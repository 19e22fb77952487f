//! Ready-to-use [`EventSink`] implementations (SPEC_FULL §6 `[ADD]`),
//! grounded in how the corpus supplies default trait impls alongside the
//! trait itself (e.g. `stalker_core::traits::NullTransformer`).

use std::sync::mpsc::{Receiver, Sender};

use stalker_core::{CpuContext, Event, EventMask, EventSink};

/// Discards every event. `query_mask` returns empty so the engine skips
/// emitting event hooks entirely for a thread using this sink (§6: "Used as
/// the default when a caller doesn't care about events").
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn query_mask(&self) -> EventMask {
        EventMask::empty()
    }

    fn process(&self, _event: Event, _cpu_context: Option<&CpuContext>) {}
}

/// One event as delivered on a [`ChannelEventSink`]'s channel. `cpu_context`
/// is cloned out of the borrowed pointer `EventSink::process` receives,
/// since it does not outlive the call.
#[derive(Debug, Clone, Copy)]
pub struct ChannelEvent {
    pub event: Event,
    pub cpu_context: Option<CpuContext>,
}

/// Pushes every accepted event onto an `std::sync::mpsc` channel (§6
/// `[ADD]`). Used by `stalker-tests`'s integration scenarios to assert on
/// the event stream of §8 without a bespoke sink per test.
pub struct ChannelEventSink {
    mask: EventMask,
    tx: Sender<ChannelEvent>,
}

impl ChannelEventSink {
    /// Build a sink that accepts `mask` and its matching receiver.
    pub fn new(mask: EventMask) -> (Self, Receiver<ChannelEvent>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { mask, tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn query_mask(&self) -> EventMask {
        self.mask
    }

    fn process(&self, event: Event, cpu_context: Option<&CpuContext>) {
        // A closed receiver (test already dropped it) is not an error the
        // engine's hot path should care about.
        let _ = self.tx.send(ChannelEvent {
            event,
            cpu_context: cpu_context.copied(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_wants_nothing() {
        assert_eq!(NullEventSink.query_mask(), EventMask::empty());
    }

    #[test]
    fn channel_sink_forwards_accepted_events() {
        let (sink, rx) = ChannelEventSink::new(EventMask::CALL);
        assert!(sink.query_mask().contains(EventMask::CALL));
        sink.process(Event::Call { location: 1, target: 2 }, None);
        let delivered = rx.try_recv().expect("event forwarded");
        assert_eq!(delivered.event, Event::Call { location: 1, target: 2 });
        assert!(delivered.cpu_context.is_none());
    }
}
