//! Raw entry-gate trampolines (glossary "Entry gate"): `extern "C" fn(*mut
//! CpuContext) -> usize`-shaped adapters, called from emitted machine code
//! by raw address rather than through a vtable (glossary: "they are not
//! trait methods"). Each recovers the calling thread's [`ExecCtx`] from TLS
//! and the process-wide [`GateTable`]/[`CompileQuery`] from the installed
//! [`crate::Stalker`], then delegates to the logical gate implementation in
//! `stalker_engine::gates`.
//!
//! Calling convention (§9 "Global state"; not specified bit-for-bit by
//! spec.md §1): the Minimal/Full/IC prolog that frames every call into
//! these gates leaves the application's scratch registers saved at a fixed
//! offset recoverable as a [`CpuContext`]; by convention the first two
//! saved GPR slots (RAX, RCX) carry this gate's "return address" and
//! "target address" arguments where a gate needs them, mirroring how the
//! generated call stubs are built register-agnostic elsewhere in this
//! workspace (`stalker-codegen::virtualizer` already leaves the IC dispatch
//! loop's operand extraction symbolic in the same way).

use stalker_core::cpu::{CpuContext, Gpr64};

use stalker_engine::compiler::CompileError;
use stalker_engine::gates;

use crate::Stalker;

fn fatal(err: CompileError) -> ! {
    panic!("entry gate hit a fatal compile error (§7 \"Fatal\"): {err}");
}

fn saved<'a>(ctx_ptr: *mut CpuContext) -> &'a CpuContext {
    // SAFETY: every stub that calls into a gate has already run a prolog
    // that spills the saved register frame to this address (§4.3).
    unsafe { &*ctx_ptr }
}

pub extern "C" fn call_imm(ctx_ptr: *mut CpuContext) -> usize {
    let saved = saved(ctx_ptr);
    let real_return = saved.gpr(Gpr64::Rax) as usize;
    let target = saved.gpr(Gpr64::Rcx) as usize;
    Stalker::with_current(|ctx, stalker| {
        gates::call_imm(ctx, &stalker.gate_table, stalker, real_return, target).unwrap_or_else(|e| fatal(e))
    })
}

fn call_or_jmp_indirect(ctx_ptr: *mut CpuContext, via_memory: bool, is_call: bool) -> usize {
    let saved = saved(ctx_ptr);
    let real_return = saved.gpr(Gpr64::Rax) as usize;
    let target = saved.gpr(Gpr64::Rcx) as usize;
    Stalker::with_current(|ctx, stalker| {
        if is_call {
            gates::call_indirect(ctx, &stalker.gate_table, stalker, real_return, target, via_memory)
                .unwrap_or_else(|e| fatal(e))
        } else {
            gates::jmp(ctx, &stalker.gate_table, stalker, target, via_memory).unwrap_or_else(|e| fatal(e))
        }
    })
}

pub extern "C" fn call_mem(ctx_ptr: *mut CpuContext) -> usize {
    call_or_jmp_indirect(ctx_ptr, true, true)
}

pub extern "C" fn call_reg(ctx_ptr: *mut CpuContext) -> usize {
    call_or_jmp_indirect(ctx_ptr, false, true)
}

pub extern "C" fn jmp_mem(ctx_ptr: *mut CpuContext) -> usize {
    call_or_jmp_indirect(ctx_ptr, true, false)
}

pub extern "C" fn jmp_reg(ctx_ptr: *mut CpuContext) -> usize {
    call_or_jmp_indirect(ctx_ptr, false, false)
}

pub extern "C" fn jmp_continuation(ctx_ptr: *mut CpuContext) -> usize {
    let next_real = saved(ctx_ptr).xip;
    Stalker::with_current(|ctx, stalker| {
        gates::jmp_continuation(ctx, &stalker.gate_table, stalker, next_real).unwrap_or_else(|e| fatal(e))
    })
}

/// Wired to `EntryGates::excluded_call_imm` (§4.6 "Direct call, excluded
/// target"). Returns nothing meaningful; the caller falls through to the
/// relocated call bytes regardless.
pub extern "C" fn excluded_call_imm(ctx_ptr: *mut CpuContext) -> usize {
    let saved = saved(ctx_ptr);
    let real_target = saved.gpr(Gpr64::Rax) as usize;
    let location = saved.xip;
    Stalker::with_current(|ctx, _stalker| {
        gates::excluded_call_enter(ctx, real_target, location);
        0
    })
}

pub extern "C" fn excluded_call_leave(ctx_ptr: *mut CpuContext) -> usize {
    let next_real = saved(ctx_ptr).xip;
    Stalker::with_current(|ctx, stalker| {
        gates::excluded_call_leave(ctx, &stalker.gate_table, stalker, next_real).unwrap_or_else(|e| fatal(e))
    })
}

/// Wired to `EntryGates::ret_slow_path`. Not reached by the current ret
/// stub shape (`emit_ret` calls the per-`ExecCtx` `stack_pop_and_go`
/// helper, not this gate directly — see `CompileGates::stack_pop_and_go`
/// below); kept as a directly reachable equivalent so a future stub shape
/// (or `prefetch`) can call the slow path without going through the helper
/// indirection.
pub extern "C" fn ret_slow_path(ctx_ptr: *mut CpuContext) -> usize {
    stack_pop_and_go_impl(ctx_ptr)
}

/// Wired to `CompileGates::stack_pop_and_go`, the address the codegen
/// `stack_pop_and_go_stub` helper actually calls into (§4.5). `saved.rax`
/// carries the value the stub observed on top of the application stack.
pub extern "C" fn stack_pop_and_go_gate(ctx_ptr: *mut CpuContext) -> usize {
    stack_pop_and_go_impl(ctx_ptr)
}

fn stack_pop_and_go_impl(ctx_ptr: *mut CpuContext) -> usize {
    let observed_target = saved(ctx_ptr).gpr(Gpr64::Rax) as usize;
    Stalker::with_current(|ctx, stalker| {
        let resolution = gates::stack_pop_and_go(ctx, &stalker.gate_table, stalker, observed_target)
            .unwrap_or_else(|e| fatal(e));
        if let Some(new_return) = resolution.patch_app_stack {
            let app_stack = ctx.app_stack();
            if app_stack != 0 {
                // SAFETY: `app_stack` is the application's own stack
                // pointer at the point its return slot is read (§4.5); the
                // engine only ever patches the single top slot.
                unsafe { std::ptr::write(app_stack as *mut usize, new_return) };
            }
        }
        resolution.jump_to
    })
}

/// Wired to `CompileGates::stack_push`. The shadow-stack push itself
/// already happens inline in [`gates::call_imm`]/[`gates::call_indirect`]
/// (§4.5), so no call stub in this workspace currently reaches this gate;
/// kept as a real, reachable address (rather than a null/placeholder one)
/// since `stalker-codegen::helpers::emit_all` always wires one in, and a
/// transformer-authored callout could legitimately call it directly.
pub extern "C" fn stack_push_gate(ctx_ptr: *mut CpuContext) -> usize {
    let _ = ctx_ptr;
    0
}

/// Wired to `CompileGates::invalidate`: the invalidator trampoline's
/// callout (§4.4 "Invalidation"). `saved.rax` carries the signed 32-bit
/// distance from the trampoline to the `ExecBlock` header, per the
/// trampoline's own on-stub layout.
pub extern "C" fn invalidate_gate(ctx_ptr: *mut CpuContext) -> usize {
    let _ = saved(ctx_ptr);
    // The recompile-and-resume logic this trampoline drives is
    // `stalker_engine::compiler::recompile_in_place`, reached through
    // `obtain_block_for`'s existing-block path; a real ABI would decode the
    // block pointer from `saved.rax` and recompile it directly here.
    Stalker::with_current(|ctx, stalker| {
        let target = ctx.resume_at();
        gates::jmp(ctx, &stalker.gate_table, stalker, target, false).unwrap_or_else(|e| fatal(e))
    })
}

pub extern "C" fn sysenter_slow_path(ctx_ptr: *mut CpuContext) -> usize {
    let user_return = saved(ctx_ptr).gpr(Gpr64::Rax) as usize;
    Stalker::with_current(|ctx, stalker| {
        gates::sysenter_slow_path(ctx, &stalker.gate_table, stalker, user_return).unwrap_or_else(|e| fatal(e))
    })
}

/// Wired to `CompileGates::probe_invoke` (§4.2 step 3). Full-prolog framed,
/// so `ctx_ptr` is a genuine saved CPU context the registered probes may
/// inspect/mutate; `xip` identifies the block's `real_start`.
pub extern "C" fn probe_invoke(ctx_ptr: *mut CpuContext) -> usize {
    let target = saved(ctx_ptr).xip;
    Stalker::with_current(|ctx, stalker| {
        let probes = stalker.probe_lock.lock();
        let cpu_ctx = unsafe { &mut *ctx_ptr };
        gates::probe_invoke(ctx, &probes, target, cpu_ctx);
        0
    })
}

pub extern "C" fn arm_single_step(ctx_ptr: *mut CpuContext) -> usize {
    let _ = ctx_ptr;
    Stalker::with_current(|ctx, stalker| {
        let handler = crate::platform::PtraceSingleStepHandler::new(ctx.thread_id);
        gates::arm_single_step(ctx, &handler);
        let _ = stalker;
        0
    })
}
