//! Entry gates (§6 "Entry gate", §4.6): the named Rust functions translated
//! code calls into to resolve a target address, each incrementing the
//! matching [`GateCounter`] on the [`Observer`] if one is registered.
//!
//! Every gate is reached from a fixed-shape stub emitted by
//! [`stalker_codegen::virtualizer`]; translated code calls them with a
//! fixed calling convention baked into those stub bytes (§9 "Global
//! state"), so the calling thread's [`ExecCtx`] is recovered from the
//! thread-local handle rather than passed explicitly. [`GateTable`] bundles
//! everything a gate needs that does *not* vary per call: the resolved
//! helper/entry-gate addresses and the process-wide config.

use stalker_core::ctx::ExecCtx;
use stalker_core::events::Event;
use stalker_core::traits::GateCounter;
use stalker_core::StalkerConfig;

use crate::compiler::{obtain_block_for, CompileError, CompileGates, CompileQuery};

/// Everything an entry gate needs besides the calling thread's `ExecCtx`
/// (recovered from TLS) and the runtime values the emitted stub passes.
pub struct GateTable {
    pub gates: CompileGates,
    pub config: StalkerConfig,
}

#[inline]
fn count(ctx: &ExecCtx, counter: GateCounter) {
    if let Some(observer) = &ctx.observer {
        observer.count(counter);
        observer.count(GateCounter::Total);
    }
}

/// §4.6 "Direct call, non-excluded target": resolve both `target`'s and
/// `real_return`'s translated addresses and push a shadow frame for the
/// return, bracketed by `pending_calls` (§4.8) since this may recurse into
/// the compiler.
pub fn call_imm(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    real_return: usize,
    target: usize,
) -> Result<usize, CompileError> {
    count(ctx, GateCounter::CallImm);
    ctx.enter_callback();
    let result = (|| {
        let code_target = obtain_block_for(ctx, target, &table.gates, &table.config, query)?;
        let code_return = obtain_block_for(ctx, real_return, &table.gates, &table.config, query)?;
        ctx.frames.lock().push(real_return, code_return);
        if ctx.sink.query_mask().contains(stalker_core::events::EventMask::CALL) {
            ctx.sink.process(
                Event::Call {
                    location: real_return,
                    target,
                },
                None,
            );
        }
        Ok(code_target)
    })();
    ctx.leave_callback();
    result
}

/// §4.6 "Indirect call / jump (register or memory)": resolve an indirect
/// call whose runtime target the emitted stub has already loaded into a
/// scratch register (symbolically, via the IC prolog's scratch base,
/// §4.3). Shares the shadow-stack-push behavior of [`call_imm`]; the
/// caller distinguishes call-vs-jump by whether it pushes a frame
/// afterward.
pub fn call_indirect(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    real_return: usize,
    target: usize,
    via_memory: bool,
) -> Result<usize, CompileError> {
    count(ctx, if via_memory { GateCounter::CallMem } else { GateCounter::CallReg });
    ctx.enter_callback();
    let result = (|| {
        let code_target = obtain_block_for(ctx, target, &table.gates, &table.config, query)?;
        let code_return = obtain_block_for(ctx, real_return, &table.gates, &table.config, query)?;
        ctx.frames.lock().push(real_return, code_return);
        Ok(code_target)
    })();
    ctx.leave_callback();
    result
}

/// §4.6 "Unconditional jmp" / conditional-jump arms: resolve `target`'s
/// translated address with no shadow-stack interaction.
pub fn jmp(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    target: usize,
    via_memory: bool,
) -> Result<usize, CompileError> {
    count(ctx, if via_memory { GateCounter::JmpMem } else { GateCounter::JmpReg });
    ctx.enter_callback();
    let result = obtain_block_for(ctx, target, &table.gates, &table.config, query);
    ctx.leave_callback();
    result
}

/// §4.2 step 5 "continuation": the block ran out of code-slab space before
/// hitting a terminator; resolve the translated address for the next real
/// instruction so execution can keep going as a fresh block.
pub fn jmp_continuation(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    next_real: usize,
) -> Result<usize, CompileError> {
    count(ctx, GateCounter::JmpContinuation);
    ctx.enter_callback();
    let result = obtain_block_for(ctx, next_real, &table.gates, &table.config, query);
    ctx.leave_callback();
    result
}

/// §4.6 "Direct call, excluded target": entered immediately before the
/// relocated, uninstrumented call executes. Increments `pending_calls` so
/// `unfollow` cannot complete while the application is executing outside
/// translated code (§4.8).
pub fn excluded_call_enter(ctx: &ExecCtx, real_target: usize, location: usize) {
    count(ctx, GateCounter::ExcludedCallImm);
    ctx.enter_callback();
    if ctx.sink.query_mask().contains(stalker_core::events::EventMask::CALL) {
        ctx.sink.process(
            Event::Call {
                location,
                target: real_target,
            },
            None,
        );
    }
}

/// The matching `leave` half of [`excluded_call_enter`] (§4.6): decrements
/// `pending_calls` once the excluded call has returned, then resolves the
/// continuation the way [`jmp_continuation`] does.
pub fn excluded_call_leave(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    next_real: usize,
) -> Result<usize, CompileError> {
    ctx.leave_callback();
    obtain_block_for(ctx, next_real, &table.gates, &table.config, query)
}

/// §4.5 "stack_pop_and_go": the three-step return dispatch. `observed_target`
/// is the value the emitted stub read off the top of the application stack
/// (what the callee is about to return to). Returns the address execution
/// should jump to and, if the application stack's return slot must be
/// rewritten, the new value for it.
pub struct RetResolution {
    pub jump_to: usize,
    /// `Some(value)` if the application-visible return slot must be
    /// overwritten before resuming (§4.5 steps 1 and 3).
    pub patch_app_stack: Option<usize>,
}

pub fn stack_pop_and_go(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    observed_target: usize,
) -> Result<RetResolution, CompileError> {
    // Step 1: fast path (§4.5).
    {
        let mut frames = ctx.frames.lock();
        if let Some(real_return) = frames.fast_path_return(observed_target) {
            return Ok(RetResolution {
                jump_to: observed_target,
                patch_app_stack: Some(real_return),
            });
        }
    }

    // Step 2: mismatch — longjmp/unwind/tail-call trickery. Reset the ring
    // and check whether `observed_target` already lies in translated code.
    ctx.frames.lock().reset();
    let already_translated = {
        let state = ctx.code_lock.lock();
        state
            .code_slabs
            .iter()
            .any(|s| s.slab.contains_produced(observed_target))
    };
    if already_translated {
        return Ok(RetResolution {
            jump_to: observed_target,
            patch_app_stack: None,
        });
    }

    // Step 3: slow path — `observed_target` is a real address; compile and
    // patch the application stack to carry the translated address.
    count(ctx, GateCounter::RetSlowPath);
    ctx.enter_callback();
    let result = obtain_block_for(ctx, observed_target, &table.gates, &table.config, query);
    ctx.leave_callback();
    let code_target = result?;
    if ctx.sink.query_mask().contains(stalker_core::events::EventMask::RET) {
        ctx.sink.process(
            Event::Ret {
                location: observed_target,
                target: observed_target,
            },
            None,
        );
    }
    Ok(RetResolution {
        jump_to: code_target,
        patch_app_stack: Some(code_target),
    })
}

/// §4.6 "System-entry instruction": resolve the translated continuation
/// after a virtualized `sysenter`/`syscall` sequence, the same way
/// [`stack_pop_and_go`]'s slow path resolves an unknown real return.
pub fn sysenter_slow_path(
    ctx: &ExecCtx,
    table: &GateTable,
    query: &dyn CompileQuery,
    user_return: usize,
) -> Result<usize, CompileError> {
    count(ctx, GateCounter::SysenterSlowPath);
    ctx.enter_callback();
    let result = obtain_block_for(ctx, user_return, &table.gates, &table.config, query);
    ctx.leave_callback();
    result
}

/// §4.2 step 3: invoke every registered probe for the block this call-site
/// belongs to, via a Full-context callback (§4.3).
pub fn probe_invoke(ctx: &ExecCtx, probes: &stalker_core::ProbeTable, target: usize, context: &mut stalker_core::CpuContext) {
    ctx.enter_callback();
    for (callback, user_data) in probes.probes_for(target) {
        callback.on_call(context, user_data);
    }
    ctx.leave_callback();
}

/// §4.6 "Opaque branches": arm single-stepping so the platform's trap
/// handler regains control after the next instruction retires.
pub fn arm_single_step(ctx: &ExecCtx, handler: &dyn stalker_core::traits::SingleStepHandler) {
    ctx.set_mode(stalker_core::ctx::ExecMode::SingleSteppingOnCall);
    handler.arm();
}
