//! External collaborator interfaces (§6): Transformer, EventSink, Observer.
//!
//! These are "polymorphic objects" the engine only ever calls through,
//! never owns the implementation of (§1: "The event sink and the
//! transformer are external polymorphic objects; only the interfaces the
//! core consumes are specified").

use crate::backpatch::BackpatchDescriptor;
use crate::cpu::CpuContext;
use crate::events::{Event, EventMask};
use crate::insn::Instruction;

/// A pull-style cursor over one basic block's original instructions (§6).
///
/// Implemented by `stalker-codegen`'s generator context; consumed by a
/// [`Transformer`]. There are no real suspension points here (§9
/// "Coroutine-like control flow") — `next` and `keep` are synchronous calls
/// against state the block compiler already has in hand.
pub trait InstructionIterator {
    /// Pull the next original instruction, in order, or `None` once the
    /// block has terminated or run out of code-slab space.
    fn next(&mut self) -> Option<Instruction>;

    /// Request that the last instruction returned by `next` have its
    /// effect preserved in the output (relocated as needed). Instructions
    /// not `keep`-ed are dropped from the translated stream entirely.
    fn keep(&mut self);

    /// Emit a call to `callout` at the current point, after spilling a full
    /// CPU context (§6: "put_callout(fn, data, destroy)"). `destroy`, if
    /// given, is invoked when the owning block is discarded so the
    /// transformer can free `data`.
    fn put_callout(
        &mut self,
        callout: extern "C" fn(*mut CpuContext, *mut core::ffi::c_void),
        data: *mut core::ffi::c_void,
        destroy: Option<extern "C" fn(*mut core::ffi::c_void)>,
    );
}

/// Implementer-supplied code transformer (§6).
///
/// The engine calls `transform_block` once per compiled block and guarantees
/// `iterator.next()` yields original, in-order instructions until the block
/// terminates or space is exhausted.
pub trait Transformer: Send + Sync {
    fn transform_block(&self, iterator: &mut dyn InstructionIterator);
}

/// The identity transformer: `keep()`s every instruction unchanged. Used
/// when a caller passes no transformer of their own (§8 "execution
/// equivalence ... with a null transformer").
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransformer;

impl Transformer for NullTransformer {
    fn transform_block(&self, iterator: &mut dyn InstructionIterator) {
        while iterator.next().is_some() {
            iterator.keep();
        }
    }
}

/// Implementer-supplied event consumer (§6).
pub trait EventSink: Send + Sync {
    /// Bitset of event kinds this sink wants delivered.
    fn query_mask(&self) -> EventMask;
    fn start(&self) {}
    fn stop(&self) {}
    fn flush(&self) {}
    /// Deliver one event. `cpu_context` is `Some` only for events emitted
    /// from a Full-prolog context (probes, callouts); `Exec`/`Block` events
    /// from the lightweight per-instruction hook carry `None`.
    fn process(&self, event: Event, cpu_context: Option<&CpuContext>);
}

/// Named counters incremented at entry gates (§6 "Observer").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateCounter {
    CallImm,
    CallMem,
    CallReg,
    PostCallInvoke,
    ExcludedCallImm,
    RetSlowPath,
    JmpMem,
    JmpReg,
    JmpCondTaken,
    JmpCondNotTaken,
    JmpContinuation,
    SysenterSlowPath,
    Total,
}

/// Optional diagnostic observer (§6).
pub trait Observer: Send + Sync {
    /// Called whenever the backpatcher successfully rewrites a stub (§4.7).
    fn backpatch_notify(&self, descriptor: BackpatchDescriptor) {
        let _ = descriptor;
    }
    /// Called once per entry-gate invocation, plus once per invocation with
    /// [`GateCounter::Total`] (§6).
    fn count(&self, counter: GateCounter) {
        let _ = counter;
    }
}

/// A [`Transformer`]-visible call probe callback (§4.1 "add_call_probe").
pub trait CallProbe: Send + Sync {
    fn on_call(&self, context: &mut CpuContext, user_data: usize);
}

/// Platform hook for the single-step trap path used by opaque branches and
/// restartable syscalls (§4.6 "Opaque branches", SPEC_FULL §3 `[ADD]`).
/// Implemented by the `stalker` facade crate's platform layer, which owns
/// the OS-specific exception/signal handling machinery (§1: "sketched but
/// not specified bit-for-bit").
pub trait SingleStepHandler: Send + Sync {
    /// Arm single-stepping (set the trap flag) so that the next instruction
    /// boundary re-enters the engine.
    fn arm(&self);
    /// Called from the platform's trap handler once the single-stepped
    /// instruction has retired, with the address execution landed at.
    fn on_trap(&self, landed_at: usize);
}
