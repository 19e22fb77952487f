//! The block compiler (§2 component 5, §4.2).
//!
//! Given an original address, produces an [`stalker_core::ExecBlock`] whose
//! translated code, when jumped to, behaves as the original instructions do
//! up to the first branch/return/system-entry, after which control returns
//! to the engine.

use stalker_core::block::{BlockFlags, BlockId, ExecBlock};
use stalker_core::cpu::CpuContext;
use stalker_core::ctx::{CodeState, ExecCtx, HelperAddrs};
use stalker_core::events::Event;
use stalker_core::insn::{BranchKind, Instruction, MAX_INSN_LEN};
use stalker_core::slab::{CodeSlab, CodeSlabWriter, DEFAULT_CODE_SLAB_SIZE};
use stalker_core::traits::InstructionIterator;
use stalker_core::{ProlKind, StalkerConfig};

use stalker_codegen::prolog::{build_epilog, build_prolog};
use stalker_codegen::relocator::Relocator;
use stalker_codegen::virtualizer;

pub use stalker_codegen::virtualizer::EntryGates as EntryGateAddrs;

/// Minimum reserved bytes a block must have room for before the compiler
/// will attempt to keep another instruction (§4.2 "Space policy"): enough
/// for a continuation stub, the snapshot of a large instruction, and a
/// worst-case inline-cache table.
pub const MIN_BLOCK_CAPACITY: usize = 96;

/// Upper bound on how far the compiler scans into application memory
/// looking for a block's terminator before giving up and emitting a
/// continuation (a defensive cap; real blocks terminate long before this).
const MAX_SCAN_BYTES: usize = 4096;

/// One `(real_start, code_start)` inline-cache slot's on-the-wire size,
/// mirrored from [`stalker_core::ic::IcTable`]'s layout.
const IC_SLOT_SIZE: usize = 2 * std::mem::size_of::<usize>();

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("code slab allocation failed: {0}")]
    SlabAlloc(#[from] std::io::Error),
    #[error("relocation failed: {0}")]
    Relocate(#[from] stalker_codegen::relocator::RelocateError),
    #[error("helper reachability could not be satisfied even with a fresh slab")]
    HelpersUnreachable,
}

/// Gate address bundle the virtualizer's stubs call into, plus the
/// probe-invoker trampoline and the helper gates used to (re)emit the
/// once-per-context helpers (§4.2 step 3, §4.3, §4.6).
pub struct CompileGates {
    pub entry: EntryGateAddrs,
    pub probe_invoke: u64,
    pub stack_push: u64,
    pub stack_pop_and_go: u64,
    pub invalidate: u64,
    /// Inline-cache table size to reserve for indirect call/jmp stubs,
    /// mirrored from [`StalkerConfig::ic_entries`].
    pub ic_entries: usize,
}

/// Per-call queries the compiler needs answered while walking a block
/// (§4.1 "exclude", §2 component 3 "call probes"): whether a call probe is
/// registered at an address, and whether an address falls in an excluded
/// range and so must not be virtualized (§4.6 "Direct call, excluded
/// target").
pub trait CompileQuery {
    fn has_probes(&self, addr: usize) -> bool;
    fn is_excluded(&self, addr: usize) -> bool;
}

/// Look up or compile the translation for `real_start`, applying the reuse
/// policy of §4.4. Returns the `code_start` address execution should jump
/// to.
pub fn obtain_block_for(
    ctx: &ExecCtx,
    real_start: usize,
    gates: &CompileGates,
    config: &StalkerConfig,
    query: &dyn CompileQuery,
) -> Result<usize, CompileError> {
    {
        let mut state = ctx.code_lock.lock();
        if let Some(&id) = state.block_map.get(&real_start) {
            if let Some(code_start) = reuse_or_recompile(ctx, &mut state, id, real_start, gates, config, query)? {
                return Ok(code_start);
            }
        }
    }
    compile_block(ctx, real_start, gates, config, query)
}

/// §4.4: decide whether an already-known block is up to date, recompiling
/// in place if not.
fn reuse_or_recompile(
    ctx: &ExecCtx,
    state: &mut CodeState,
    id: BlockId,
    real_start: usize,
    gates: &CompileGates,
    config: &StalkerConfig,
    query: &dyn CompileQuery,
) -> Result<Option<usize>, CompileError> {
    let up_to_date = {
        let block = state.arena.get(id);
        if !config.requires_snapshot_check(block.recycle_count) {
            true
        } else {
            // SAFETY: `real_start` is live application memory this thread
            // owns; the snapshot lives in this ExecCtx's own code slab.
            unsafe {
                let real = std::slice::from_raw_parts(real_start as *const u8, block.real_size as usize);
                let snap = std::slice::from_raw_parts(
                    (block.code_start + block.snapshot_offset() as usize) as *const u8,
                    block.real_size as usize,
                );
                real == snap
            }
        }
    };

    if up_to_date {
        let block = state.arena.get_mut(id);
        if config.trust_threshold > 0 {
            block.recycle_count += 1;
        }
        return Ok(Some(block.code_start));
    }

    recompile_in_place(ctx, state, id, real_start, gates, config, query).map(Some)
}

fn recompile_in_place(
    ctx: &ExecCtx,
    state: &mut CodeState,
    id: BlockId,
    real_start: usize,
    gates: &CompileGates,
    config: &StalkerConfig,
    query: &dyn CompileQuery,
) -> Result<usize, CompileError> {
    state.arena.get_mut(id).flags.insert(BlockFlags::RECOMPILING);

    let capacity = state.arena.get(id).capacity as usize;
    let code_start = state.arena.get(id).code_start;

    // Build the fresh translation in host memory first, addressed as if it
    // already lived at `code_start` (§4.4: "so that incoming backpatches
    // still land somewhere valid"), so a failure here never touches the
    // block's existing, still-live code. Only once it's complete do we
    // decide whether it fits back in place or must spill to a secondary
    // storage block.
    let fresh = run_compile_loop(ctx, &state.helpers, real_start, code_start, gates, config, query)?;

    if fresh.bytes.len() <= capacity {
        {
            let slab = &state.current_code_slab().slab;
            let mut writer = CodeSlabWriter::open(slab, code_start, capacity)?;
            writer.write_bytes(0, &fresh.bytes);
            if fresh.snapshot_len > 0 {
                unsafe {
                    std::ptr::copy_nonoverlapping(real_start as *const u8, writer.ptr_at(fresh.bytes.len()), fresh.snapshot_len);
                }
            }
        }
        let block = state.arena.get_mut(id);
        block.code_size = fresh.bytes.len() as u32;
        block.real_size = fresh.real_size as u32;
        block.recycle_count = 0;
        block.flags.remove(BlockFlags::RECOMPILING);
        ctx.sink.process(Event::Compile { start: real_start, size: fresh.bytes.len() as u32 }, None);
        return Ok(code_start);
    }

    // Overflow (§4.4, §7): allocate a secondary storage block at natural
    // size and overwrite the original with a single jump to it, preserving
    // the `real_start -> code_start` identity for already-installed
    // backpatches.
    tracing::warn!(real_start, "recompile exceeds reserved capacity, spilling to storage block");
    let storage_capacity = fresh.bytes.len() + fresh.snapshot_len;
    ensure_capacity(state, storage_capacity + MIN_BLOCK_CAPACITY)?;
    let storage_base = state
        .current_code_slab()
        .slab
        .try_reserve(storage_capacity)
        .expect("capacity just ensured") as usize;
    {
        let slab = &state.current_code_slab().slab;
        let mut writer = CodeSlabWriter::open(slab, storage_base, storage_capacity)?;
        writer.write_bytes(0, &fresh.bytes);
        if fresh.snapshot_len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(real_start as *const u8, writer.ptr_at(fresh.bytes.len()), fresh.snapshot_len);
            }
        }
    }
    let mut storage_block = ExecBlock::new(real_start, storage_base);
    storage_block.commit(fresh.bytes.len() as u32, fresh.real_size as u32, storage_capacity as u32);
    let storage_id = state.arena.insert(storage_block);

    {
        let slab = &state.current_code_slab().slab;
        let mut writer = CodeSlabWriter::open(slab, code_start, capacity.min(16))?;
        let jmp = stalker_codegen::asm::encode_one(64, code_start as u64, &stalker_codegen::asm::jmp_rel32(storage_base as u64));
        writer.write_bytes(0, &jmp);
    }
    let block = state.arena.get_mut(id);
    block.storage_block = Some(storage_id);
    block.flags.remove(BlockFlags::RECOMPILING);
    ctx.sink.process(Event::Compile { start: real_start, size: fresh.bytes.len() as u32 }, None);
    Ok(code_start)
}

/// Result of running the compile loop once, not yet committed to a
/// particular code-slab location.
struct Translation {
    bytes: Vec<u8>,
    real_size: usize,
    snapshot_len: usize,
}

/// A pull-style cursor over one basic block's original instructions,
/// implementing [`InstructionIterator`] (§6). Drives the block's
/// [`Relocator`] and the [`virtualizer`]'s terminator emission, assembling
/// the translated byte stream the transformer's `keep()`/`put_callout()`
/// calls accumulate into.
struct BlockIterator<'a> {
    relocator: Relocator<'a>,
    base_real: usize,
    emit_base: usize,
    out: Vec<u8>,
    pending: Option<(iced_x86::Instruction, Instruction)>,
    terminated: bool,
    consumed_real_bytes: usize,
    gates: &'a CompileGates,
    helpers: &'a HelperAddrs,
    query: &'a dyn CompileQuery,
}

impl<'a> BlockIterator<'a> {
    fn new(
        src: &'a [u8],
        real_start: usize,
        emit_base: usize,
        gates: &'a CompileGates,
        helpers: &'a HelperAddrs,
        query: &'a dyn CompileQuery,
    ) -> Self {
        Self {
            relocator: Relocator::new(64, src, real_start as u64),
            base_real: real_start,
            emit_base,
            out: Vec::new(),
            pending: None,
            terminated: false,
            consumed_real_bytes: 0,
            gates,
            helpers,
            query,
        }
    }

    fn cursor(&self) -> u64 {
        self.emit_base as u64 + self.out.len() as u64
    }
}

impl<'a> InstructionIterator for BlockIterator<'a> {
    fn next(&mut self) -> Option<Instruction> {
        if self.terminated {
            return None;
        }
        // Space policy (§4.2): stop pulling once remaining room can't hold
        // another instruction plus the trailer this block will need.
        if self.out.len() + MAX_INSN_LEN + MIN_BLOCK_CAPACITY > MAX_SCAN_BYTES {
            return None;
        }
        let (raw, classified) = self.relocator.decode_next()?;
        self.pending = Some((raw, classified));
        Some(classified)
    }

    fn keep(&mut self) {
        let Some((raw, classified)) = self.pending.take() else {
            return;
        };
        self.consumed_real_bytes = classified.end_address() - self.base_real;

        if classified.is_control_transfer() {
            self.emit_terminator(raw, classified);
            self.terminated = true;
            return;
        }

        match stalker_codegen::relocator::relocate_one(64, raw, self.cursor()) {
            Ok(bytes) => self.out.extend_from_slice(&bytes),
            // A well-formed non-branch instruction always relocates; a
            // failure here is a decoder/encoder invariant violation (§7
            // "impossible decoder state"), not a recoverable condition.
            Err(_) => unreachable!("relocator failed to re-encode a non-branch instruction"),
        }
    }

    fn put_callout(
        &mut self,
        callout: extern "C" fn(*mut CpuContext, *mut core::ffi::c_void),
        data: *mut core::ffi::c_void,
        _destroy: Option<extern "C" fn(*mut core::ffi::c_void)>,
    ) {
        let ip = self.cursor();
        self.out.extend_from_slice(&build_prolog(ProlKind::Full, 64, ip));
        let call_ip = self.cursor();
        let call = stalker_codegen::asm::encode_one(
            64,
            call_ip,
            &stalker_codegen::asm::call_rel32(callout as usize as u64),
        );
        self.out.extend_from_slice(&call);
        let _ = data; // passed to `callout` via the saved-context convention, not encoded here.
        self.out.extend_from_slice(&build_epilog(ProlKind::Full, 64, self.cursor()));
    }
}

impl<'a> BlockIterator<'a> {
    /// Hand off to the virtualizer for the terminating instruction (§4.2
    /// step 4 "invoke the virtualizer", §4.6).
    fn emit_terminator(&mut self, raw: iced_x86::Instruction, insn: Instruction) {
        let ip = self.cursor();
        let stub = match insn.branch_kind {
            BranchKind::CallImmediate => {
                let target = insn.immediate_target.expect("CallImmediate always carries a resolved target");
                if self.query.is_excluded(target) {
                    virtualizer::emit_excluded_call(64, ip, insn.encoded(), &self.gates.entry)
                } else {
                    let real_return = insn.end_address() as u64;
                    virtualizer::emit_call_immediate(64, ip, real_return, target as u64, &self.gates.entry)
                }
            }
            BranchKind::CallIndirect => {
                let operand = virtualizer::IndirectOperand::of(&raw);
                virtualizer::emit_inline_cache_dispatch(64, ip, self.gates.ic_entries, operand, self.gates.entry.call_reg)
            }
            BranchKind::JmpImmediate => {
                let target = insn.immediate_target.expect("JmpImmediate always carries a resolved target") as u64;
                virtualizer::emit_jmp_immediate(64, ip, target, self.gates.entry.jmp_mem)
            }
            BranchKind::JmpIndirect => {
                let operand = virtualizer::IndirectOperand::of(&raw);
                virtualizer::emit_inline_cache_dispatch(64, ip, self.gates.ic_entries, operand, self.gates.entry.jmp_reg)
            }
            BranchKind::JmpConditional => {
                let taken = insn.immediate_target.expect("JmpConditional always carries a resolved taken target") as u64;
                let not_taken = insn.end_address() as u64;
                virtualizer::emit_jmp_conditional(64, ip, raw.code(), self.gates.entry.jmp_mem, taken, not_taken)
            }
            BranchKind::Ret => virtualizer::emit_ret(64, ip, self.helpers.stack_pop_and_go.unwrap_or(0) as u64),
            BranchKind::SystemEntry => virtualizer::emit_sysenter(
                64,
                ip,
                self.gates.entry.sysenter_slow_path,
                self.gates.entry.jmp_continuation,
                insn.encoded(),
            ),
            BranchKind::Opaque => virtualizer::emit_single_step(64, ip, self.gates.entry.arm_single_step),
            BranchKind::None => unreachable!("emit_terminator called on a non-branch instruction"),
        };
        self.out.extend_from_slice(&stub.bytes);
    }
}

/// Drive the decode/transform/virtualize loop over `real_start`, producing
/// translated bytes addressed as if placed at `emit_base` (§4.2 steps 2-6
/// "generator context" through "trap at end"). Does not touch any slab —
/// the result is plain host memory the caller then reserves space for and
/// copies in.
fn run_compile_loop(
    ctx: &ExecCtx,
    helpers: &HelperAddrs,
    real_start: usize,
    emit_base: usize,
    gates: &CompileGates,
    config: &StalkerConfig,
    query: &dyn CompileQuery,
) -> Result<Translation, CompileError> {
    let has_probes = query.has_probes(real_start);
    let mut prelude = Vec::new();
    if has_probes {
        prelude.extend_from_slice(&build_prolog(ProlKind::Full, 64, emit_base as u64));
        let call_ip = emit_base as u64 + prelude.len() as u64;
        prelude.extend_from_slice(&stalker_codegen::asm::encode_one(
            64,
            call_ip,
            &stalker_codegen::asm::call_rel32(gates.probe_invoke),
        ));
        prelude.extend_from_slice(&build_epilog(ProlKind::Full, 64, emit_base as u64 + prelude.len() as u64));
    }

    let body_base = emit_base + prelude.len();
    // SAFETY: `real_start` addresses live application memory this thread
    // owns (§5: translated code for a thread runs on that thread's own
    // hardware thread, so the compiler never touches another thread's
    // address space concurrently).
    let src = unsafe { std::slice::from_raw_parts(real_start as *const u8, MAX_SCAN_BYTES) };
    let mut iter = BlockIterator::new(src, real_start, body_base, gates, helpers, query);
    ctx.transformer.transform_block(&mut iter);

    let terminated = iter.terminated;
    let real_size = iter.consumed_real_bytes;
    let mut body = iter.out;

    if !terminated {
        // Continuation (§4.2 step 5): an unconditional transfer back to the
        // engine so the address immediately following this block's scanned
        // window is compiled as a fresh block on next entry. Same shape as
        // the virtualizer's other gate-resolving stubs: minimal prolog,
        // call into the gate (returns the translated target in rax),
        // epilog, jump through it.
        let mut cursor = body_base as u64 + body.len() as u64;
        let prolog = build_prolog(ProlKind::Minimal, 64, cursor);
        cursor += prolog.len() as u64;
        body.extend_from_slice(&prolog);

        let call = stalker_codegen::asm::encode_one(64, cursor, &stalker_codegen::asm::call_rel32(gates.entry.jmp_continuation));
        cursor += call.len() as u64;
        body.extend_from_slice(&call);

        let epilog = build_epilog(ProlKind::Minimal, 64, cursor);
        cursor += epilog.len() as u64;
        body.extend_from_slice(&epilog);

        let jmp = stalker_codegen::asm::encode_one(64, cursor, &stalker_codegen::asm::jmp_reg(iced_x86::Register::RAX));
        body.extend_from_slice(&jmp);
    }

    let mut bytes = prelude;
    bytes.extend_from_slice(&body);
    bytes.push(0xCC); // trap at the true end (§4.2 step 6), should be unreachable.

    let snapshot_len = if config.trust_threshold != 0 { real_size } else { 0 };

    Ok(Translation { bytes, real_size, snapshot_len })
}

/// Compile a brand-new block for `real_start` and install it (§4.2 steps
/// 1-7).
pub fn compile_block(
    ctx: &ExecCtx,
    real_start: usize,
    gates: &CompileGates,
    config: &StalkerConfig,
    query: &dyn CompileQuery,
) -> Result<usize, CompileError> {
    let mut state = ctx.code_lock.lock();
    ensure_capacity(&mut state, MIN_BLOCK_CAPACITY)?;
    ensure_helpers(&mut state, gates)?;

    // `run_compile_loop` addresses every rel32 branch it emits relative to
    // `base`, so `base` must be the address the translation actually lands
    // at. Reserving the worst-case size up front before peeking the cursor
    // guarantees that: peeking first and ensuring capacity for the real
    // (larger) size afterward can push a fresh slab out from under the
    // peeked address.
    let ic_reserve = config.ic_entries * IC_SLOT_SIZE;
    let worst_case = 2 * MAX_SCAN_BYTES + 4 * MIN_BLOCK_CAPACITY + ic_reserve;
    ensure_capacity(&mut state, worst_case)?;

    let base = state.current_code_slab().slab.cursor() as usize;
    let translation = run_compile_loop(ctx, &state.helpers, real_start, base, gates, config, query)?;

    let capacity = translation.bytes.len() + translation.snapshot_len + ic_reserve;
    debug_assert!(capacity <= worst_case, "translation exceeded its pre-ensured worst case");
    let reserved = state
        .current_code_slab()
        .slab
        .try_reserve(capacity)
        .expect("capacity already ensured above, under code_lock, no concurrent reserver for this ctx");
    debug_assert_eq!(reserved as usize, base, "peeked cursor must match the reservation");

    {
        let slab = &state.current_code_slab().slab;
        let mut writer = CodeSlabWriter::open(slab, reserved as usize, capacity)?;
        writer.write_bytes(0, &translation.bytes);
        if translation.snapshot_len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(real_start as *const u8, writer.ptr_at(translation.bytes.len()), translation.snapshot_len);
            }
        }
    }

    let mut block = ExecBlock::new(real_start, base);
    block.commit(translation.bytes.len() as u32, translation.real_size as u32, capacity as u32);
    let id = state.arena.insert(block);
    state.block_map.insert(real_start, id);

    tracing::debug!(real_start, code_start = base, size = translation.bytes.len(), "block compiled");
    ctx.sink.process(Event::Compile { start: real_start, size: translation.bytes.len() as u32 }, None);

    Ok(base)
}

/// §4.2/§7: if the current code slab cannot hold `needed` more bytes,
/// allocate a new one.
fn ensure_capacity(state: &mut CodeState, needed: usize) -> Result<(), CompileError> {
    if state.current_code_slab().slab.available() >= needed {
        return Ok(());
    }
    let size = DEFAULT_CODE_SLAB_SIZE.max(needed);
    tracing::trace!(size, "code slab exhausted, allocating a fresh one");
    state.code_slabs.push(CodeSlab::new(size)?);
    Ok(())
}

/// §4.3: helpers are emitted once per `ExecCtx`, reachable by direct near
/// jump from every code slab that uses them; re-emit a local copy into the
/// current slab if the cached addresses have fallen out of range.
fn ensure_helpers(state: &mut CodeState, gates: &CompileGates) -> Result<(), CompileError> {
    let from = state.current_code_slab().slab.cursor() as usize;
    if state.helpers.is_complete() && stalker_codegen::helpers::all_reachable(&state.helpers, from) {
        return Ok(());
    }
    let needed = 4096;
    ensure_capacity(state, needed)?;
    let reserved = state
        .current_code_slab()
        .slab
        .try_reserve(needed)
        .ok_or(CompileError::HelpersUnreachable)?;
    let helpers = {
        let slab = &state.current_code_slab().slab;
        let mut writer = CodeSlabWriter::open(slab, reserved as usize, needed)?;
        let gate_addrs = stalker_codegen::helpers::GateAddrs {
            stack_push_gate: gates.stack_push,
            stack_pop_and_go_gate: gates.stack_pop_and_go,
            invalidate_gate: gates.invalidate,
        };
        stalker_codegen::helpers::emit_all(64, &mut writer, &gate_addrs)
    };
    if !stalker_codegen::helpers::all_reachable(&helpers, from) {
        return Err(CompileError::HelpersUnreachable);
    }
    state.helpers = helpers;
    Ok(())
}
