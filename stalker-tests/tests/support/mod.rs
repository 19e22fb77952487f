//! Shared scaffolding for the cross-crate integration scenarios (§8).
//!
//! Tests in this crate exercise the real block compiler, backpatcher, and
//! facade against hand-assembled x86-64 basic blocks. Since nothing here
//! ever jumps into the translated code (there is no in-process CPU driver
//! for the guest thread available to this workspace), "application" bytes
//! only need to be *readable*, not executable — a page-sized
//! [`stalker_core::slab::Slab`] (the same primitive the engine itself uses
//! for code/data regions) stands in for guest memory.

use std::sync::Arc;

use stalker_core::events::{Event, EventMask};
use stalker_core::slab::{CodeSlab, DataSlab, Slab};
use stalker_core::traits::{CallProbe, EventSink, NullTransformer, Observer, Transformer};
use stalker_core::{BackpatchDescriptor, CpuContext, ExecCtx, GateCounter, StalkerConfig};

use stalker_codegen::virtualizer::EntryGates;
use stalker_engine::compiler::{CompileGates, CompileQuery};
use stalker_engine::gates::GateTable;

/// `compiler::run_compile_loop` reads a full [`stalker_engine::compiler::MAX_SCAN_BYTES`]
/// window unconditionally, so every "application" region must be at least
/// that large regardless of how short the actual test routine is.
pub const APP_PAGE: usize = 4096;

/// A page of guest memory, pre-filled with `int3` (0xCC) past the routine
/// under test so an accidental over-decode lands on a byte `iced-x86`
/// classifies as an (opaque) single-byte instruction rather than running
/// off into garbage.
pub struct AppMemory {
    slab: Slab,
}

impl AppMemory {
    pub fn new(routine: &[u8]) -> Self {
        let slab = Slab::new(APP_PAGE).expect("mmap guest page");
        // SAFETY: freshly mapped, exclusively owned, PROT_READ|WRITE page.
        unsafe {
            std::ptr::write_bytes(slab.start(), 0xCC, slab.size());
            std::ptr::copy_nonoverlapping(routine.as_ptr(), slab.start(), routine.len());
        }
        Self { slab }
    }

    pub fn addr(&self) -> usize {
        self.slab.start() as usize
    }

    /// Overwrite one byte of the routine in place (§4.4 "self-modifying
    /// target" / snapshot-fidelity scenarios).
    pub fn poke(&self, offset: usize, byte: u8) {
        // SAFETY: offset is caller-checked to lie within the mapped page.
        unsafe { *self.slab.start().add(offset) = byte };
    }
}

/// No probes, nothing excluded — the common case for tests that aren't
/// specifically exercising §4.1 "exclude" or call probes.
pub struct PermissiveQuery;
impl CompileQuery for PermissiveQuery {
    fn has_probes(&self, _addr: usize) -> bool {
        false
    }
    fn is_excluded(&self, _addr: usize) -> bool {
        false
    }
}

/// A [`CompileQuery`] that treats one fixed address range as excluded
/// (§4.1 "exclude", §4.6 "Direct call ... excluded target").
pub struct ExcludingQuery {
    pub range: std::ops::Range<usize>,
}
impl CompileQuery for ExcludingQuery {
    fn has_probes(&self, _addr: usize) -> bool {
        false
    }
    fn is_excluded(&self, addr: usize) -> bool {
        self.range.contains(&addr)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn compile_count(&self, start: usize) -> usize {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Compile { start: s, .. } if *s == start))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn query_mask(&self) -> EventMask {
        EventMask::all()
    }
    fn process(&self, event: Event, _cpu_context: Option<&CpuContext>) {
        self.events.lock().unwrap().push(event);
    }
}

/// An [`Observer`] that records every backpatch and every gate-counter
/// increment (§6 "Observer"), used by the hot-loop and IC scenarios (§8
/// scenarios 1-3).
#[derive(Default)]
pub struct RecordingObserver {
    backpatches: std::sync::Mutex<Vec<BackpatchDescriptor>>,
    counts: std::sync::Mutex<std::collections::HashMap<&'static str, u32>>,
}

impl RecordingObserver {
    pub fn backpatches(&self) -> Vec<BackpatchDescriptor> {
        self.backpatches.lock().unwrap().clone()
    }
}

impl Observer for RecordingObserver {
    fn backpatch_notify(&self, descriptor: BackpatchDescriptor) {
        self.backpatches.lock().unwrap().push(descriptor);
    }
    fn count(&self, counter: GateCounter) {
        let key = match counter {
            GateCounter::CallImm => "call_imm",
            GateCounter::CallMem => "call_mem",
            GateCounter::CallReg => "call_reg",
            GateCounter::PostCallInvoke => "post_call_invoke",
            GateCounter::ExcludedCallImm => "excluded_call_imm",
            GateCounter::RetSlowPath => "ret_slow_path",
            GateCounter::JmpMem => "jmp_mem",
            GateCounter::JmpReg => "jmp_reg",
            GateCounter::JmpCondTaken => "jmp_cond_taken",
            GateCounter::JmpCondNotTaken => "jmp_cond_not_taken",
            GateCounter::JmpContinuation => "jmp_continuation",
            GateCounter::SysenterSlowPath => "sysenter_slow_path",
            GateCounter::Total => "total",
        };
        *self.counts.lock().unwrap().entry(key).or_insert(0) += 1;
    }
}

pub struct NoopProbe;
impl CallProbe for NoopProbe {
    fn on_call(&self, _context: &mut CpuContext, _user_data: usize) {}
}

/// Fixed, arbitrary-but-distinct fake gate addresses — sufficient for
/// compiling stubs (the compiler never calls through them in these tests,
/// it only emits direct-call-to-gate bytes referencing them).
pub fn compile_gates() -> CompileGates {
    fake_gates()
}

fn fake_gates() -> CompileGates {
    CompileGates {
        entry: EntryGates {
            call_imm: 0x7f00_1000_1000,
            call_mem: 0x7f00_1000_2000,
            call_reg: 0x7f00_1000_3000,
            jmp_mem: 0x7f00_1000_4000,
            jmp_reg: 0x7f00_1000_5000,
            jmp_continuation: 0x7f00_1000_6000,
            ret_slow_path: 0x7f00_1000_7000,
            sysenter_slow_path: 0x7f00_1000_8000,
            excluded_call_imm: 0x7f00_1000_9000,
            excluded_call_leave: 0x7f00_1000_a000,
            arm_single_step: 0x7f00_1000_b000,
        },
        probe_invoke: 0x7f00_1000_c000,
        stack_push: 0x7f00_1000_d000,
        stack_pop_and_go: 0x7f00_1000_e000,
        invalidate: 0x7f00_1000_f000,
        ic_entries: 4,
    }
}

pub fn gate_table(config: StalkerConfig) -> GateTable {
    GateTable {
        gates: fake_gates(),
        config,
    }
}

pub fn new_ctx(config: StalkerConfig, sink: Arc<dyn EventSink>, observer: Option<Arc<dyn Observer>>) -> ExecCtx {
    ExecCtx::new(
        1,
        CodeSlab::new(64 * 1024).expect("code slab"),
        DataSlab::new(64 * 1024).expect("data slab"),
        256,
        Arc::new(NullTransformer) as Arc<dyn Transformer>,
        sink,
        observer,
    )
    .expect("ExecCtx::new")
}
