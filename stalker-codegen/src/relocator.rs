//! Decoder + relocating re-encoder wrapper around `iced-x86` (SPEC_FULL §1,
//! §4.2 "the current relocator").
//!
//! Deliberately the only module (together with [`crate::asm`]) in this
//! workspace that imports `iced_x86` directly: everything upstream of these
//! two modules speaks [`stalker_core::Instruction`], a decoder-agnostic
//! view (SPEC_FULL §1).

use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, FlowControl, InstructionBlock};
use stalker_core::insn::{BranchKind, Instruction, MAX_INSN_LEN};

/// Decodes original bytes starting at `address`, one instruction at a time,
/// classifying each for the virtualizer (§4.6) and re-encoding "kept"
/// instructions at a new address with RIP-relative fixups applied.
pub struct Relocator<'a> {
    decoder: Decoder<'a>,
    bitness: u32,
}

impl<'a> Relocator<'a> {
    /// `bytes` must be readable application memory starting at `address`;
    /// the caller (the block compiler) is responsible for mapping/pinning
    /// that range for the duration of decoding.
    pub fn new(bitness: u32, bytes: &'a [u8], address: u64) -> Self {
        let decoder = Decoder::with_ip(bitness, bytes, address, DecoderOptions::NONE);
        Self { decoder, bitness }
    }

    #[inline]
    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    /// Decode the next instruction, or `None` at end of buffer.
    ///
    /// The returned [`Instruction`]'s `bytes` field is left zeroed: raw
    /// bytes are available to the caller directly from the original
    /// application-memory slice at `[address, address+length)`, which is
    /// cheaper than re-deriving them from the decoder here.
    pub fn decode_next(&mut self) -> Option<(iced_x86::Instruction, Instruction)> {
        if !self.decoder.can_decode() {
            return None;
        }
        let raw = self.decoder.decode();
        if raw.is_invalid() {
            return None;
        }
        let classified = classify(&raw);
        Some((raw, classified))
    }
}

fn classify(instr: &iced_x86::Instruction) -> Instruction {
    let branch_kind = if matches!(instr.code(), Code::Syscall | Code::Sysenter) {
        // §4.6: system-entry instructions get their own inlined snippet
        // regardless of how the decoder classifies their flow control.
        BranchKind::SystemEntry
    } else {
        match instr.flow_control() {
            FlowControl::Next => BranchKind::None,
            FlowControl::Call => BranchKind::CallImmediate,
            FlowControl::IndirectCall => BranchKind::CallIndirect,
            FlowControl::UnconditionalBranch => BranchKind::JmpImmediate,
            FlowControl::IndirectBranch => BranchKind::JmpIndirect,
            FlowControl::ConditionalBranch => BranchKind::JmpConditional,
            FlowControl::Return => BranchKind::Ret,
            FlowControl::Interrupt | FlowControl::XbeginXabortXend | FlowControl::Exception => {
                BranchKind::Opaque
            }
        }
    };

    let immediate_target = match branch_kind {
        BranchKind::CallImmediate | BranchKind::JmpImmediate | BranchKind::JmpConditional => {
            Some(instr.near_branch_target() as usize)
        }
        _ => None,
    };

    let bytes = [0u8; MAX_INSN_LEN];

    Instruction {
        address: instr.ip() as usize,
        length: instr.len() as u8,
        bytes,
        branch_kind,
        immediate_target,
    }
}

/// Relocate a single "kept" instruction to `new_ip`, applying RIP-relative
/// fixups via `iced-x86`'s `BlockEncoder` (the same approach the corpus's
/// inline-hook trampoline builder uses for exactly this problem: encode a
/// one-instruction `InstructionBlock` at the new address and let the
/// encoder rewrite any IP-relative operand).
pub fn relocate_one(bitness: u32, instr: iced_x86::Instruction, new_ip: u64) -> Result<Vec<u8>, RelocateError> {
    let block = InstructionBlock::new(std::slice::from_ref(&instr), new_ip);
    let result = BlockEncoder::encode(bitness, block, BlockEncoderOptions::NONE)
        .map_err(|_| RelocateError::EncodingFailed)?;
    Ok(result.code_buffer)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelocateError {
    #[error("relocation failed to encode the instruction at its new address")]
    EncodingFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_simple_nop() {
        let bytes = [0x90u8]; // nop
        let mut r = Relocator::new(64, &bytes, 0x1000);
        let (_, classified) = r.decode_next().unwrap();
        assert_eq!(classified.branch_kind, BranchKind::None);
        assert_eq!(classified.address, 0x1000);
        assert_eq!(classified.length, 1);
    }

    #[test]
    fn classifies_unconditional_jmp() {
        // jmp rel8 +2 (eb 02)
        let bytes = [0xebu8, 0x02];
        let mut r = Relocator::new(64, &bytes, 0x1000);
        let (_, classified) = r.decode_next().unwrap();
        assert_eq!(classified.branch_kind, BranchKind::JmpImmediate);
        assert_eq!(classified.immediate_target, Some(0x1004));
    }

    #[test]
    fn classifies_ret() {
        let bytes = [0xc3u8]; // ret
        let mut r = Relocator::new(64, &bytes, 0x2000);
        let (_, classified) = r.decode_next().unwrap();
        assert_eq!(classified.branch_kind, BranchKind::Ret);
    }
}
