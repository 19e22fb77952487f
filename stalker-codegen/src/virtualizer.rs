//! Branch virtualizer (§2 component 6, §4.6).
//!
//! Dispatches on the decoded instruction's [`stalker_core::BranchKind`] and
//! emits a stub in place of the original terminator. Each emitted stub
//! carries back enough bookkeeping (`patch_offset`, landing offsets, IC
//! table bounds) for [`crate::backpatch`] to later rewrite it in place
//! once the slow path has resolved a destination.

use iced_x86::{Code, OpKind, Register};
use stalker_core::ic::IC_EMPTY;
use stalker_core::ProlKind;

use crate::asm;
use crate::prolog::{build_epilog, build_prolog};

/// What a virtualized stub needs remembered for later backpatching (§4.7)
/// or, for inline caches, for the slow-path miss handler to fill in (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubInfo {
    /// Direct call (§4.6 "Direct call"): `patch_offset` is where the
    /// backpatcher installs the direct jump; `post_call_offset` is the
    /// landing site a real return must resume at.
    Call {
        patch_offset: usize,
        post_call_offset: usize,
    },
    /// A direct call whose target lies in an excluded range (§4.6): no
    /// backpatching applies, the original call bytes are relocated
    /// verbatim and `pending_calls` is incremented/decremented around it.
    ExcludedCall,
    /// Indirect call/jump dispatched through an inline cache (§4.6):
    /// `table_offset` is where the `ic_entries`-sized table begins,
    /// `capacity` is its slot count.
    InlineCache { table_offset: usize, capacity: usize },
    /// Unconditional direct jmp (§4.6): `patch_offset` is where the
    /// backpatcher installs the epilog-then-jump rewrite.
    Jmp { patch_offset: usize },
    /// Conditional jump (§4.6): both arms compile as separate blocks
    /// reached via entry-gate thunks; `taken_offset`/`not_taken_offset`
    /// are the two stub sites independently backpatchable (each points at
    /// the same epilog-then-jump shape as `Jmp`'s `patch_offset`).
    JmpConditional {
        taken_offset: usize,
        not_taken_offset: usize,
    },
    /// Return (§4.6, §4.5): `patch_offset` is where a monomorphic return
    /// may later be rewritten into a direct jump.
    Ret { patch_offset: usize },
    /// System-entry snippet (§4.6): `continuation_offset` is where the
    /// kernel will return control after the syscall executes.
    SystemEntry { continuation_offset: usize },
    /// Opaque branch (§4.6): single-stepped in place, no backpatching ever
    /// applies.
    SingleStep,
}

/// Emitted stub: its bytes plus the bookkeeping needed afterward.
#[derive(Debug, Clone)]
pub struct Stub {
    pub bytes: Vec<u8>,
    pub info: StubInfo,
}

/// Gate addresses the virtualizer calls into for slow paths (§4.6, §6
/// "Entry gate"). Resolved by `stalker-engine` before a block is compiled.
pub struct EntryGates {
    pub call_imm: u64,
    pub call_mem: u64,
    pub call_reg: u64,
    pub jmp_mem: u64,
    pub jmp_reg: u64,
    pub jmp_continuation: u64,
    pub ret_slow_path: u64,
    pub sysenter_slow_path: u64,
    pub excluded_call_imm: u64,
    /// Decrements `pending_calls` once the relocated, uninstrumented call
    /// has returned, immediately before the jump to the continuation (§4.6
    /// "Direct call, excluded target": "increment/decrement `pending_calls`,
    /// then jump to a continuation"). Kept distinct from
    /// `jmp_continuation` because that gate is also reached from the
    /// ordinary out-of-space continuation path (§4.2 step 5), which never
    /// incremented `pending_calls` in the first place.
    pub excluded_call_leave: u64,
    /// Opaque-branch single-step arming gate (§4.6 "Opaque branches").
    pub arm_single_step: u64,
}

/// Where an indirect call/jump's runtime target comes from, decoded from
/// the original instruction's single register/memory operand (§4.6:
/// "honoring segment prefix, base, index, scale, displacement").
#[derive(Debug, Clone, Copy)]
pub enum IndirectOperand {
    Register(Register),
    Memory {
        base: Register,
        index: Register,
        scale: u32,
        displacement: i64,
    },
    /// A memory operand already resolved to an absolute address at compile
    /// time: rip-relative operands lose their meaning once the original
    /// instruction is gone, so (as `codegen::relocator` already does for
    /// kept rip-relative instructions) the fix-up bakes in the address it
    /// resolved to rather than relocating the `rip`-relative form itself.
    Absolute(u64),
}

impl IndirectOperand {
    /// Classify a decoded `call`/`jmp`'s single operand.
    pub fn of(raw: &iced_x86::Instruction) -> Self {
        match raw.op0_kind() {
            OpKind::Register => IndirectOperand::Register(raw.op0_register()),
            OpKind::Memory if raw.is_ip_rel_memory_operand() => {
                IndirectOperand::Absolute(raw.ip_rel_memory_address())
            }
            OpKind::Memory => IndirectOperand::Memory {
                base: raw.memory_base(),
                index: raw.memory_index(),
                scale: raw.memory_index_scale(),
                displacement: raw.memory_displacement64() as i64,
            },
            other => panic!("indirect call/jmp with unexpected operand kind {other:?}"),
        }
    }
}

/// Materialize an indirect branch's runtime target into RCX (the gate-read
/// target register, §6 "Entry gate"). The operand's own registers are still
/// live wherever this runs relative to a prolog: a prolog only pushes
/// copies of the scratch registers it saves, it never clobbers the live
/// ones until its matching epilog pops them back.
fn emit_operand_to_rcx(bitness: u32, ip: u64, operand: IndirectOperand) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cursor = ip;
    match operand {
        IndirectOperand::Register(reg) => {
            let mov = asm::encode_one(bitness, cursor, &asm::mov_reg_reg(Register::RCX, reg));
            out.extend_from_slice(&mov);
        }
        IndirectOperand::Memory { base, index, scale, displacement } => {
            let mov = asm::encode_one(bitness, cursor, &asm::mov_reg_mem(Register::RCX, base, index, scale, displacement));
            out.extend_from_slice(&mov);
        }
        IndirectOperand::Absolute(addr) => {
            let load_addr = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::R10, addr));
            cursor += load_addr.len() as u64;
            out.extend_from_slice(&load_addr);
            let mov = asm::encode_one(bitness, cursor, &asm::mov_reg_mem(Register::RCX, Register::R10, Register::None, 1, 0));
            out.extend_from_slice(&mov);
        }
    }
    out
}

/// Direct call, non-excluded target (§4.6): application-side push of the
/// real return address, shadow-stack push (via the `stack_push` helper),
/// call into `call_imm` (returns the translated target in a scratch
/// register), then jump to it. `real_return`/`target` are materialized into
/// the gate-read registers (RAX/RCX, `stalker::gate_abi`) before the
/// prolog opens, since nothing wires them up otherwise.
pub fn emit_call_immediate(bitness: u32, ip: u64, real_return: u64, target: u64, gates: &EntryGates) -> Stub {
    let mut out = Vec::new();
    let mut cursor = ip;

    let set_rax = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::RAX, real_return));
    cursor += set_rax.len() as u64;
    out.extend_from_slice(&set_rax);

    let set_rcx = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::RCX, target));
    cursor += set_rcx.len() as u64;
    out.extend_from_slice(&set_rcx);

    let prolog = build_prolog(ProlKind::Minimal, bitness, cursor);
    cursor += prolog.len() as u64;
    out.extend_from_slice(&prolog);

    let call = asm::encode_one(bitness, cursor, &asm::call_rel32(gates.call_imm));
    cursor += call.len() as u64;
    out.extend_from_slice(&call);
    // `call_imm` returns the translated target in RAX by convention. No
    // epilog runs between here and the jump, so RAX still holds it.
    let patch_offset = out.len();

    let jmp = asm::encode_one(bitness, cursor, &asm::jmp_reg(Register::RAX));
    out.extend_from_slice(&jmp);

    let post_call_offset = out.len();

    Stub {
        bytes: out,
        info: StubInfo::Call {
            patch_offset,
            post_call_offset,
        },
    }
}

/// Direct call whose immediate target lies in an excluded range (§4.6):
/// relocate the original call bytes verbatim so execution temporarily
/// leaves translated code, bracketed by `pending_calls`
/// increment/decrement via `excluded_call_imm`.
pub fn emit_excluded_call(bitness: u32, ip: u64, original_call: &[u8], gates: &EntryGates) -> Stub {
    let mut out = Vec::new();
    let mut cursor = ip;

    let enter = asm::encode_one(bitness, cursor, &asm::call_rel32(gates.excluded_call_imm));
    cursor += enter.len() as u64;
    out.extend_from_slice(&enter);

    out.extend_from_slice(original_call);
    cursor += original_call.len() as u64;

    let leave = asm::encode_one(bitness, cursor, &asm::call_rel32(gates.excluded_call_leave));
    out.extend_from_slice(&leave);

    Stub {
        bytes: out,
        info: StubInfo::ExcludedCall,
    }
}

/// Shared "call a gate, jump through its result" tail used by any stub
/// whose epilog runs before its landing jump (`emit_jmp_immediate`, each
/// arm of `emit_jmp_conditional`, the sysenter continuation stub, and the
/// inline-cache dispatch's hit/miss tail). Since the Minimal/IC epilog's
/// final pop restores rax to its pre-call value (`build_epilog` undoes
/// `build_prolog`'s push order exactly), the gate's return value is stashed
/// in r11 — untouched by the Minimal/IC save set — before the epilog runs,
/// and the final jump goes through r11 instead of rax.
/// Returns `(bytes, patch_offset)`, `patch_offset` being where the epilog
/// begins (what `backpatch::patch_jmp`'s `patch_site` expects).
fn emit_call_gate_and_jump(bitness: u32, ip: u64, gate_addr: u64) -> (Vec<u8>, usize) {
    let mut out = Vec::new();
    let mut cursor = ip;

    let prolog = build_prolog(ProlKind::Minimal, bitness, cursor);
    cursor += prolog.len() as u64;
    out.extend_from_slice(&prolog);

    let call = asm::encode_one(bitness, cursor, &asm::call_rel32(gate_addr));
    cursor += call.len() as u64;
    out.extend_from_slice(&call);

    let save = asm::encode_one(bitness, cursor, &asm::mov_reg_reg(Register::R11, Register::RAX));
    cursor += save.len() as u64;
    out.extend_from_slice(&save);

    let patch_offset = out.len();

    let epilog = build_epilog(ProlKind::Minimal, bitness, cursor);
    cursor += epilog.len() as u64;
    out.extend_from_slice(&epilog);

    let jmp = asm::encode_one(bitness, cursor, &asm::jmp_reg(Register::R11));
    out.extend_from_slice(&jmp);

    (out, patch_offset)
}

/// `mov rcx, target` followed by [`emit_call_gate_and_jump`]. The shape
/// every immediate-target jmp-style stub shares (`emit_jmp_immediate`,
/// each `emit_jmp_conditional` arm).
fn emit_resolve_and_jump(bitness: u32, ip: u64, gate_addr: u64, target: u64) -> (Vec<u8>, usize) {
    let mut out = Vec::new();
    let mut cursor = ip;

    let set_rcx = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::RCX, target));
    cursor += set_rcx.len() as u64;
    out.extend_from_slice(&set_rcx);

    let (tail, tail_patch_offset) = emit_call_gate_and_jump(bitness, cursor, gate_addr);
    out.extend_from_slice(&tail);

    (out, set_rcx.len() + tail_patch_offset)
}

/// Indirect call/jump via inline cache (§4.6): near-jump over a zeroed
/// `ic_entries`-sized table, the IC prolog, materializing the runtime
/// target into RCX, an unrolled compare-each-slot loop (`ic_entries` is
/// small and compile-time known; [`stalker_core::ic::IcTable`]'s
/// monotonic, front-to-back fill means an empty slot's zeroed `real_start`
/// can never spuriously match a live target, so stopping at the first
/// empty slot and comparing every slot unconditionally are behaviorally
/// equivalent), landing on a hit via `code_start`, falling through to
/// `slow_path_gate` on a miss.
pub fn emit_inline_cache_dispatch(
    bitness: u32,
    ip: u64,
    ic_entries: usize,
    operand: IndirectOperand,
    slow_path_gate: u64,
) -> Stub {
    let mut out = Vec::new();
    let mut cursor = ip;

    // Reserve the table: each slot is two usize-sized fields, sentinel
    // (IC_EMPTY) initialized.
    let slot_size = 2 * std::mem::size_of::<usize>();
    let table_len = ic_entries * slot_size;

    let skip = asm::encode_one(bitness, cursor, &asm::jmp_rel32(cursor + 5 + table_len as u64));
    cursor += skip.len() as u64;
    out.extend_from_slice(&skip);

    let table_addr = cursor;
    let table_offset = out.len();
    out.extend(std::iter::repeat(IC_EMPTY as u8).take(table_len));
    cursor += table_len as u64;

    let prolog = build_prolog(ProlKind::InlineCacheProlog, bitness, cursor);
    cursor += prolog.len() as u64;
    out.extend_from_slice(&prolog);

    let load_operand = emit_operand_to_rcx(bitness, cursor, operand);
    cursor += load_operand.len() as u64;
    out.extend_from_slice(&load_operand);

    // Every unrolled slot block and the slow-path tail repeat the same
    // fixed-length instruction forms (register operands only, no varying
    // displacement class), so `hit_tail`'s address is computable up front
    // instead of via a deferred patch pass.
    let len_load_slot_addr = asm::encode_one(bitness, 0, &asm::mov_reg_imm64(Register::R10, 0)).len() as u64;
    let len_load_real_start = asm::encode_one(bitness, 0, &asm::mov_reg_mem(Register::RAX, Register::R10, Register::None, 1, 0)).len() as u64;
    let len_cmp = asm::encode_one(bitness, 0, &asm::cmp_reg_reg(Register::RAX, Register::RCX)).len() as u64;
    let len_jne = asm::encode_one(bitness, 0, &asm::jcc_rel32(Code::Jne_rel32_64, 0)).len() as u64;
    let len_load_code_start =
        asm::encode_one(bitness, 0, &asm::mov_reg_mem(Register::RAX, Register::R10, Register::None, 1, 8)).len() as u64;
    let len_save_r11 = asm::encode_one(bitness, 0, &asm::mov_reg_reg(Register::R11, Register::RAX)).len() as u64;
    let len_jmp = asm::encode_one(bitness, 0, &asm::jmp_rel32(0)).len() as u64;
    let len_call = asm::encode_one(bitness, 0, &asm::call_rel32(0)).len() as u64;

    let per_slot_len = len_load_slot_addr + len_load_real_start + len_cmp + len_jne + len_load_code_start + len_save_r11 + len_jmp;
    let slow_path_len = len_call + len_save_r11;
    let hit_tail = cursor + per_slot_len * ic_entries as u64 + slow_path_len;

    for i in 0..ic_entries {
        let slot_addr = table_addr + (i * slot_size) as u64;

        let load_slot = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::R10, slot_addr));
        cursor += load_slot.len() as u64;
        out.extend_from_slice(&load_slot);

        let load_real_start = asm::encode_one(bitness, cursor, &asm::mov_reg_mem(Register::RAX, Register::R10, Register::None, 1, 0));
        cursor += load_real_start.len() as u64;
        out.extend_from_slice(&load_real_start);

        let cmp = asm::encode_one(bitness, cursor, &asm::cmp_reg_reg(Register::RAX, Register::RCX));
        cursor += cmp.len() as u64;
        out.extend_from_slice(&cmp);

        let next_slot = cursor + len_jne + len_load_code_start + len_save_r11 + len_jmp;
        let jne = asm::encode_one(bitness, cursor, &asm::jcc_rel32(Code::Jne_rel32_64, next_slot));
        cursor += jne.len() as u64;
        out.extend_from_slice(&jne);

        let load_code_start = asm::encode_one(bitness, cursor, &asm::mov_reg_mem(Register::RAX, Register::R10, Register::None, 1, 8));
        cursor += load_code_start.len() as u64;
        out.extend_from_slice(&load_code_start);

        let save_r11 = asm::encode_one(bitness, cursor, &asm::mov_reg_reg(Register::R11, Register::RAX));
        cursor += save_r11.len() as u64;
        out.extend_from_slice(&save_r11);

        let jmp_hit = asm::encode_one(bitness, cursor, &asm::jmp_rel32(hit_tail));
        cursor += jmp_hit.len() as u64;
        out.extend_from_slice(&jmp_hit);

        debug_assert_eq!(cursor, next_slot, "unrolled IC slot length drifted from its own measurement");
    }

    // Miss: every slot compared unequal (an empty slot's zeroed real_start
    // can never equal a live target address). Fall to the slow path, which
    // compiles the target and backpatches the first empty slot (§4.7).
    let call = asm::encode_one(bitness, cursor, &asm::call_rel32(slow_path_gate));
    cursor += call.len() as u64;
    out.extend_from_slice(&call);

    let save_slow = asm::encode_one(bitness, cursor, &asm::mov_reg_reg(Register::R11, Register::RAX));
    cursor += save_slow.len() as u64;
    out.extend_from_slice(&save_slow);

    debug_assert_eq!(cursor, hit_tail, "hit_tail arithmetic drifted from actual emission");

    let epilog = build_epilog(ProlKind::InlineCacheProlog, bitness, cursor);
    cursor += epilog.len() as u64;
    out.extend_from_slice(&epilog);

    let jmp = asm::encode_one(bitness, cursor, &asm::jmp_reg(Register::R11));
    out.extend_from_slice(&jmp);

    Stub {
        bytes: out,
        info: StubInfo::InlineCache {
            table_offset,
            capacity: ic_entries,
        },
    }
}

/// Unconditional direct jmp (§4.6): the known target is materialized into
/// RCX (the gate-read target register), then resolved and jumped through
/// via [`emit_resolve_and_jump`] — the same shape as `emit_call_immediate`
/// without the shadow-stack/return-address bookkeeping.
pub fn emit_jmp_immediate(bitness: u32, ip: u64, target: u64, gate_addr: u64) -> Stub {
    let (bytes, patch_offset) = emit_resolve_and_jump(bitness, ip, gate_addr, target);
    Stub {
        bytes,
        info: StubInfo::Jmp { patch_offset },
    }
}

/// Conditional jump (§4.6): the original Jcc, rewritten to skip a
/// false-branch stub; both arms are independent entry-gate thunks sharing
/// `gate_addr`, distinguished only by which target each materializes into
/// RCX. `JECXZ`/`JRCXZ` (no near form) get the same shape via a short-form
/// trampoline — callers pass `Code::Jecxz_rel8_32`/`Code::Jrcxz_rel8_64` and
/// this function emits the short-jump-over-near-jump idiom instead of a
/// native `Jcc rel32`.
pub fn emit_jmp_conditional(
    bitness: u32,
    ip: u64,
    cc: Code,
    gate_addr: u64,
    taken_target: u64,
    not_taken_target: u64,
) -> Stub {
    let mut out = Vec::new();
    let mut cursor = ip;

    // Every arm encodes to the same length regardless of its specific
    // target (fixed-width `mov rcx, imm64` plus the fixed-shape
    // `emit_call_gate_and_jump` tail), so arm boundaries are computable
    // arithmetically.
    let arm_len = emit_resolve_and_jump(bitness, 0, gate_addr, 0).0.len() as u64;

    let needs_short_trampoline = matches!(cc, Code::Jcxz_rel8_16 | Code::Jecxz_rel8_32 | Code::Jrcxz_rel8_64);

    let (not_taken_start, taken_start) = if needs_short_trampoline {
        // No near-rel32 encoding exists for jecxz/jrcxz: a short jump
        // skips over an intervening unconditional near jmp to reach the
        // taken arm on a true condition; falling through to that near jmp
        // reaches the not-taken arm otherwise.
        let short_len = asm::encode_one(bitness, cursor, &asm::jcc_rel32(cc, cursor)).len() as u64;
        let over_len = asm::encode_one(bitness, cursor, &asm::jmp_rel32(cursor)).len() as u64;
        let taken_start = cursor + short_len + over_len;
        let not_taken_start = taken_start + arm_len;

        let short = asm::encode_one(bitness, cursor, &asm::jcc_rel32(cc, taken_start));
        cursor += short.len() as u64;
        out.extend_from_slice(&short);

        let over = asm::encode_one(bitness, cursor, &asm::jmp_rel32(not_taken_start));
        cursor += over.len() as u64;
        out.extend_from_slice(&over);

        (not_taken_start, taken_start)
    } else {
        let jcc_len = asm::encode_one(bitness, cursor, &asm::jcc_rel32(cc, cursor)).len() as u64;
        let not_taken_start = cursor + jcc_len;
        let taken_start = not_taken_start + arm_len;

        let jcc = asm::encode_one(bitness, cursor, &asm::jcc_rel32(cc, taken_start));
        cursor += jcc.len() as u64;
        out.extend_from_slice(&jcc);

        (not_taken_start, taken_start)
    };

    debug_assert_eq!(cursor, not_taken_start, "not-taken arm must start immediately after the branch/trampoline");
    let (not_taken_bytes, not_taken_patch_rel) = emit_resolve_and_jump(bitness, cursor, gate_addr, not_taken_target);
    let not_taken_offset = out.len() + not_taken_patch_rel;
    cursor += not_taken_bytes.len() as u64;
    out.extend_from_slice(&not_taken_bytes);

    debug_assert_eq!(cursor, taken_start, "taken arm must start where the branch/trampoline targets it");
    let (taken_bytes, taken_patch_rel) = emit_resolve_and_jump(bitness, cursor, gate_addr, taken_target);
    let taken_offset = out.len() + taken_patch_rel;
    out.extend_from_slice(&taken_bytes);

    Stub {
        bytes: out,
        info: StubInfo::JmpConditional {
            taken_offset,
            not_taken_offset,
        },
    }
}

/// Return (§4.6, §4.5): transfer to the `stack_pop_and_go` helper.
pub fn emit_ret(bitness: u32, ip: u64, stack_pop_and_go_addr: u64) -> Stub {
    let call = asm::encode_one(bitness, ip, &asm::call_rel32(stack_pop_and_go_addr));
    let patch_offset = 0;
    Stub {
        bytes: call,
        info: StubInfo::Ret { patch_offset },
    }
}

/// System-entry instruction (§4.6, 32-bit `SYSENTER`-style kernels that
/// return through a fixed register rather than a pushed return address):
/// capture the user-mode return address (Linux's SYSENTER ABI returns
/// through EDX, glibc's `__kernel_vsyscall` convention), overwrite it with
/// the address of a continuation stub placed immediately after the
/// original syscall bytes, then execute those bytes so the kernel returns
/// into translated code. The continuation stub mirrors the unterminated-
/// block continuation in `stalker-engine::compiler::run_compile_loop`:
/// resolve the now-current `xip` via `jmp_continuation`-equivalent gate,
/// then jump through the result.
pub fn emit_sysenter(
    bitness: u32,
    ip: u64,
    capture_gate: u64,
    continuation_gate: u64,
    original_syscall: &[u8],
) -> Stub {
    let mut out = Vec::new();
    let mut cursor = ip;

    let capture_return = asm::encode_one(bitness, cursor, &asm::mov_reg_reg(Register::RAX, Register::RDX));
    cursor += capture_return.len() as u64;
    out.extend_from_slice(&capture_return);

    let call = asm::encode_one(bitness, cursor, &asm::call_rel32(capture_gate));
    cursor += call.len() as u64;
    out.extend_from_slice(&call);

    // `mov rdx, imm64` is fixed-length regardless of its operand, so the
    // continuation's address is computable before it's actually emitted.
    let len_mov_rdx = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::RDX, 0)).len() as u64;
    let continuation_addr = cursor + len_mov_rdx + original_syscall.len() as u64;

    let overwrite = asm::encode_one(bitness, cursor, &asm::mov_reg_imm64(Register::RDX, continuation_addr));
    cursor += overwrite.len() as u64;
    out.extend_from_slice(&overwrite);

    out.extend_from_slice(original_syscall);
    cursor += original_syscall.len() as u64;
    debug_assert_eq!(cursor, continuation_addr, "continuation address arithmetic drifted from actual emission");

    let continuation_offset = out.len();
    let (tail, _patch_offset) = emit_call_gate_and_jump(bitness, cursor, continuation_gate);
    out.extend_from_slice(&tail);

    Stub {
        bytes: out,
        info: StubInfo::SystemEntry { continuation_offset },
    }
}

/// Opaque branch (§4.6): set the single-step mode flag, set the trap flag,
/// jump to the original instruction in place. The platform's single-step
/// exception handler (`stalker::platform`) regains control afterward.
pub fn emit_single_step(bitness: u32, ip: u64, arm_single_step_gate: u64) -> Stub {
    let call = asm::encode_one(bitness, ip, &asm::call_rel32(arm_single_step_gate));
    Stub {
        bytes: call,
        info: StubInfo::SingleStep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates() -> EntryGates {
        EntryGates {
            call_imm: 0x7f00_0000_1000,
            call_mem: 0x7f00_0000_2000,
            call_reg: 0x7f00_0000_3000,
            jmp_mem: 0x7f00_0000_4000,
            jmp_reg: 0x7f00_0000_5000,
            jmp_continuation: 0x7f00_0000_6000,
            ret_slow_path: 0x7f00_0000_7000,
            sysenter_slow_path: 0x7f00_0000_8000,
            excluded_call_imm: 0x7f00_0000_9000,
            excluded_call_leave: 0x7f00_0000_a000,
            arm_single_step: 0x7f00_0000_b000,
        }
    }

    #[test]
    fn call_stub_records_patch_and_landing_offsets() {
        let stub = emit_call_immediate(64, 0x1000, 0x1234_5678, 0x8000_0000, &gates());
        match stub.info {
            StubInfo::Call { patch_offset, post_call_offset } => {
                assert!(patch_offset < post_call_offset);
                assert!(post_call_offset <= stub.bytes.len());
            }
            _ => panic!("wrong stub kind"),
        }
    }

    #[test]
    fn jmp_immediate_materializes_target_and_preserves_result_across_epilog() {
        let stub = emit_jmp_immediate(64, 0x1000, 0x9000_0000, gates().jmp_mem);
        match stub.info {
            StubInfo::Jmp { patch_offset } => assert!(patch_offset < stub.bytes.len()),
            _ => panic!("wrong stub kind"),
        }
    }

    #[test]
    fn ic_dispatch_reserves_zeroed_table_and_emits_compare_loop() {
        let stub = emit_inline_cache_dispatch(64, 0x1000, 4, IndirectOperand::Register(Register::RAX), gates().call_reg);
        match stub.info {
            StubInfo::InlineCache { table_offset, capacity } => {
                assert_eq!(capacity, 4);
                let slot_size = 2 * std::mem::size_of::<usize>();
                let table = &stub.bytes[table_offset..table_offset + capacity * slot_size];
                assert!(table.iter().all(|&b| b == 0));
                // The dispatch loop itself must follow the table: a no-op
                // stub (table plus immediate slow path) would be far
                // shorter than four unrolled compare blocks.
                assert!(stub.bytes.len() > table_offset + capacity * slot_size + 64);
            }
            _ => panic!("wrong stub kind"),
        }
    }

    #[test]
    fn ic_dispatch_supports_memory_and_absolute_operands() {
        let mem = emit_inline_cache_dispatch(
            64,
            0x1000,
            2,
            IndirectOperand::Memory { base: Register::RAX, index: Register::RDX, scale: 8, displacement: 0x10 },
            gates().call_mem,
        );
        assert!(!mem.bytes.is_empty());

        let abs = emit_inline_cache_dispatch(64, 0x1000, 2, IndirectOperand::Absolute(0x7f00_1234_5000), gates().call_mem);
        assert!(!abs.bytes.is_empty());
    }

    #[test]
    fn conditional_jump_emits_a_real_branch_with_two_independent_offsets() {
        let g = gates();
        let stub = emit_jmp_conditional(64, 0x1000, Code::Jne_rel32_64, g.jmp_mem, 0x2000_0000, 0x3000_0000);
        match stub.info {
            StubInfo::JmpConditional { taken_offset, not_taken_offset } => {
                assert_ne!(taken_offset, not_taken_offset);
                assert!(taken_offset < stub.bytes.len());
                assert!(not_taken_offset < stub.bytes.len());
            }
            _ => panic!("wrong stub kind"),
        }
        // A real Jcc must appear before either arm; its opcode is the
        // two-byte 0F 8x form for near conditional jumps.
        assert_eq!(stub.bytes[0], 0x0f);
        assert_eq!(stub.bytes[1] & 0xf0, 0x80);
    }

    #[test]
    fn conditional_jump_handles_short_trampoline_condition_codes() {
        let g = gates();
        let stub = emit_jmp_conditional(64, 0x1000, Code::Jrcxz_rel8_64, g.jmp_mem, 0x2000_0000, 0x3000_0000);
        match stub.info {
            StubInfo::JmpConditional { taken_offset, not_taken_offset } => assert_ne!(taken_offset, not_taken_offset),
            _ => panic!("wrong stub kind"),
        }
    }

    #[test]
    fn sysenter_overwrites_return_slot_before_the_original_syscall() {
        let original = asm::encode_one(64, 0x2000, &asm::jmp_rel32(0x3000)); // stand-in syscall bytes
        let stub = emit_sysenter(64, 0x1000, gates().sysenter_slow_path, gates().jmp_continuation, &original);
        match stub.info {
            StubInfo::SystemEntry { continuation_offset } => assert!(continuation_offset < stub.bytes.len()),
            _ => panic!("wrong stub kind"),
        }
    }
}
