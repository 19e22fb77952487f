//! The CPU context record left on the engine stack by a Full prolog (§4.3).
//!
//! Event callbacks, probes, and transformer-installed callouts are all
//! handed a pointer to one of these. The `xip` field is patched by the
//! specific emitter of the event to reflect the original instruction's
//! address (§4.3: "The XIP field in that record is patched by the emitter
//! of the specific event to reflect the original instruction's address").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    /// General-purpose registers, in the fixed order the Full prolog saves
    /// them (rax/eax first, ... r15 on 64-bit).
    pub gprs: [u64; 16],
    /// RFLAGS/EFLAGS at the point of the event.
    pub flags: u64,
    /// Original instruction pointer this context describes (patched per
    /// §4.3; not necessarily the engine's own resume address).
    pub xip: usize,
}

/// Register indices into [`CpuContext::gprs`] on 64-bit targets, matching
/// the order the x86-64 System V / Win64 prolog saves them in.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr64 {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            gprs: [0; 16],
            flags: 0,
            xip: 0,
        }
    }

    #[inline]
    pub fn gpr(&self, reg: Gpr64) -> u64 {
        self.gprs[reg as usize]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr64, value: u64) {
        self.gprs[reg as usize] = value;
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::zeroed()
    }
}
