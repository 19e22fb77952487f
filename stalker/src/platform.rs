//! OS boundary (SPEC_FULL §2 "`[ADD]` 12. OS boundary"): thread
//! enumeration, remote suspend/resume, and register read/write, which
//! spec.md §1 explicitly lists as "assumed as OS-provided capabilities"
//! rather than specified.
//!
//! Kept behind the narrow [`ThreadControl`] trait so `stalker-engine` and
//! `stalker-codegen` never call `libc`/`nix` directly for thread control —
//! only this crate's [`follow`](crate::Stalker::follow)/[`unfollow`]
//! (crate::Stalker::unfollow) foreign-thread paths do. Implemented for
//! Linux via `ptrace` (through the `nix` crate), in the style of the
//! corpus's other ptrace-based tracers.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use stalker_core::{CpuContext, Gpr64};

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("thread {0} is not known to the OS")]
    NoSuchThread(u64),
    #[error("ptrace operation failed: {0}")]
    Ptrace(#[from] nix::Error),
}

/// Suspend/resume and register access for a foreign thread (SPEC_FULL §2
/// "remote register-read/write primitives"). `Stalker::follow`/`unfollow`
/// call through this for every thread that isn't the calling one; the
/// calling thread's own registers are always already in hand (it's the one
/// executing the `follow` call).
pub trait ThreadControl: Send + Sync {
    /// `true` if the OS still reports this thread as alive (used by
    /// `garbage_collect`, §4.1).
    fn is_alive(&self, thread_id: u64) -> bool;
    /// Suspend the thread and return its current instruction pointer.
    fn suspend(&self, thread_id: u64) -> Result<usize, PlatformError>;
    /// Redirect a suspended thread's instruction pointer and resume it.
    fn resume_at(&self, thread_id: u64, pc: usize) -> Result<(), PlatformError>;
    /// Read the suspended thread's full register file.
    fn read_registers(&self, thread_id: u64) -> Result<CpuContext, PlatformError>;
}

/// Linux `ptrace`-backed [`ThreadControl`]. Each OS thread id is the kernel
/// tid, used directly as the `ptrace` target pid (Linux threads are
/// processes sharing an address space).
#[derive(Debug, Default)]
pub struct LinuxPtraceThreadControl;

impl LinuxPtraceThreadControl {
    pub fn new() -> Self {
        Self
    }
}

impl ThreadControl for LinuxPtraceThreadControl {
    fn is_alive(&self, thread_id: u64) -> bool {
        // `/proc/<tid>` existing is the cheapest liveness probe available
        // without already holding a ptrace attachment; a `kill(tid, 0)`
        // would also work but races harder against pid reuse on exit.
        std::path::Path::new(&format!("/proc/{thread_id}")).exists()
    }

    fn suspend(&self, thread_id: u64) -> Result<usize, PlatformError> {
        let pid = Pid::from_raw(thread_id as i32);
        nix::sys::signal::kill(pid, Signal::SIGSTOP).map_err(PlatformError::Ptrace)?;
        waitpid(pid, None).map_err(PlatformError::Ptrace)?;
        let regs = ptrace::getregs(pid).map_err(PlatformError::Ptrace)?;
        Ok(regs.rip as usize)
    }

    fn resume_at(&self, thread_id: u64, pc: usize) -> Result<(), PlatformError> {
        let pid = Pid::from_raw(thread_id as i32);
        let mut regs = ptrace::getregs(pid).map_err(PlatformError::Ptrace)?;
        regs.rip = pc as u64;
        ptrace::setregs(pid, regs).map_err(PlatformError::Ptrace)?;
        nix::sys::signal::kill(pid, Signal::SIGCONT).map_err(PlatformError::Ptrace)?;
        Ok(())
    }

    fn read_registers(&self, thread_id: u64) -> Result<CpuContext, PlatformError> {
        let pid = Pid::from_raw(thread_id as i32);
        let regs = ptrace::getregs(pid).map_err(PlatformError::Ptrace)?;
        let mut ctx = CpuContext::zeroed();
        ctx.xip = regs.rip as usize;
        ctx.set_gpr(Gpr64::Rax, regs.rax);
        ctx.set_gpr(Gpr64::Rcx, regs.rcx);
        ctx.set_gpr(Gpr64::Rdx, regs.rdx);
        ctx.set_gpr(Gpr64::Rbx, regs.rbx);
        ctx.set_gpr(Gpr64::Rsp, regs.rsp);
        ctx.set_gpr(Gpr64::Rbp, regs.rbp);
        ctx.set_gpr(Gpr64::Rsi, regs.rsi);
        ctx.set_gpr(Gpr64::Rdi, regs.rdi);
        ctx.flags = regs.eflags;
        Ok(ctx)
    }
}

/// `SingleStepHandler` (§4.6 "Opaque branches", SPEC_FULL §3 `[ADD]`) via
/// the Linux trap-flag + `SIGTRAP` mechanism: arming sets `EFLAGS.TF` on the
/// next resume, and the process's `SIGTRAP` handler (installed by the host
/// application, not this crate — §1 "sketched but not specified bit-for-bit")
/// calls [`PtraceSingleStepHandler::on_trap`] once the instruction retires.
pub struct PtraceSingleStepHandler {
    thread_id: u64,
}

impl PtraceSingleStepHandler {
    pub fn new(thread_id: u64) -> Self {
        Self { thread_id }
    }
}

impl stalker_core::SingleStepHandler for PtraceSingleStepHandler {
    fn arm(&self) {
        let pid = Pid::from_raw(self.thread_id as i32);
        // PTRACE_SINGLESTEP both sets TF and resumes; callers invoke `arm`
        // only while the thread is already stopped (inside the trap
        // handler that is single-stepping it).
        let _ = ptrace::step(pid, None);
    }

    fn on_trap(&self, landed_at: usize) {
        tracing::trace!(thread_id = self.thread_id, landed_at, "single-step trap");
    }
}
