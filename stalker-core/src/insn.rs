//! The instruction view handed to a [`crate::traits::Transformer`] (§6).
//!
//! Decoding itself is out of scope (§1): `stalker-codegen`'s relocator,
//! which does own a real x86 decoder, constructs these from its decoder's
//! output. Keeping the type in `stalker-core` (rather than re-exporting the
//! decoder crate's own instruction type) is what lets the data model crate
//! stay free of the `iced-x86` dependency, per SPEC_FULL §1.

/// Maximum length of an x86/x86-64 instruction encoding.
pub const MAX_INSN_LEN: usize = 15;

/// Control-transfer classification of a decoded instruction, enough for the
/// virtualizer's opcode dispatch (§4.6) without requiring callers to hold a
/// live decoder handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Not a control transfer; relocate and continue.
    None,
    /// `call` with an immediate (relative) target.
    CallImmediate,
    /// `call` through a register or memory operand.
    CallIndirect,
    /// Unconditional `jmp`, immediate target.
    JmpImmediate,
    /// Unconditional `jmp`, register or memory operand.
    JmpIndirect,
    /// Conditional jump (`Jcc`, including `JECXZ`/`JRCXZ`).
    JmpConditional,
    /// `ret` (with or without an immediate stack-adjust operand).
    Ret,
    /// A system-entry instruction (`syscall`/`sysenter`/`int 0x80`).
    SystemEntry,
    /// An opaque branch the virtualizer cannot safely emit a stub for
    /// (§4.6: "Opaque branches"); must be single-stepped.
    Opaque,
}

/// One decoded instruction, as pulled from
/// [`crate::traits::InstructionIterator::next`].
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    /// Original (application) address of this instruction.
    pub address: usize,
    /// Encoded length in bytes.
    pub length: u8,
    /// Raw encoded bytes, left-aligned; only the first `length` bytes are
    /// meaningful.
    pub bytes: [u8; MAX_INSN_LEN],
    pub branch_kind: BranchKind,
    /// For `CallImmediate`/`JmpImmediate`/`JmpConditional`, the resolved
    /// absolute target address; `None` for indirect/opaque/ret/non-branch
    /// instructions whose target isn't known until runtime.
    pub immediate_target: Option<usize>,
}

impl Instruction {
    pub fn encoded(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    #[inline]
    pub fn is_control_transfer(&self) -> bool {
        !matches!(self.branch_kind, BranchKind::None)
    }

    #[inline]
    pub fn end_address(&self) -> usize {
        self.address + self.length as usize
    }
}
