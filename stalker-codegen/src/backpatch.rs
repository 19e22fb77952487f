//! Backpatch rewrites (§4.7): the four ways an already-emitted stub can be
//! rewritten in place once a destination is known and trusted.
//!
//! All rewrites happen while the caller holds `code_lock` and have already
//! opened a [`CodeSlabWriter`] over the patch-site region (thaw on
//! construction, freeze + icache flush on drop, §9 Design Note 2). The
//! region is always sized so the patch fits within the original stub's
//! reserved bytes: ≤128 bytes for Jmp/Ret, Call is sized by the caller at
//! emit time (§4.7).

use iced_x86::Register;
use stalker_core::ic::IC_EMPTY;
use stalker_core::ProlKind;

use crate::asm;
use crate::prolog::build_epilog;

/// Maximum bytes a Jmp/Ret backpatch may occupy (§4.7).
pub const MAX_JMP_RET_PATCH_LEN: usize = 128;

/// `Call`: replace the stub with a shadow-stack push (direct args) then a
/// direct jump to `target`. The shadow-stack push itself is the Rust-side
/// `ShadowStack::push` call already wired into the `stack_push` helper;
/// here we only need to encode the direct jump that replaces the
/// call-into-`call_imm`-then-jmp-rax sequence.
pub fn patch_call(bitness: u32, patch_site: u64, target: u64) -> Vec<u8> {
    asm::encode_one(bitness, patch_site, &asm::jmp_rel32(target))
}

/// `Jmp`: replace the stub with an epilog (if a prolog was opened) then a
/// direct jump to `target`.
pub fn patch_jmp(bitness: u32, patch_site: u64, target: u64, prolog_was_open: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cursor = patch_site;
    if prolog_was_open {
        let epilog = build_epilog(ProlKind::Minimal, bitness, cursor);
        cursor += epilog.len() as u64;
        out.extend_from_slice(&epilog);
    }
    out.extend_from_slice(&asm::encode_one(bitness, cursor, &asm::jmp_rel32(target)));
    out
}

/// `Ret`: replace the ret stub with a direct jump to `target` (monomorphic
/// return, §4.5 "the ret stub itself may be backpatched").
pub fn patch_ret(bitness: u32, patch_site: u64, target: u64) -> Vec<u8> {
    asm::encode_one(bitness, patch_site, &asm::jmp_rel32(target))
}

/// `InlineCache`: the actual slot fill is a plain memory write of
/// `(real_start, code_start)` into the first empty slot
/// ([`stalker_core::ic::IcTable::fill_first_empty`]); no machine code is
/// rewritten. Exposed here only as the byte layout callers must write
/// through their `CodeSlabWriter`, to keep all four rewrite shapes
/// documented in one module.
pub fn ic_slot_bytes(real_start: usize, code_start: usize) -> [u8; 2 * std::mem::size_of::<usize>()] {
    debug_assert_ne!(real_start, IC_EMPTY, "never write the empty sentinel as a live entry");
    let mut out = [0u8; 2 * std::mem::size_of::<usize>()];
    out[..std::mem::size_of::<usize>()].copy_from_slice(&real_start.to_le_bytes());
    out[std::mem::size_of::<usize>()..].copy_from_slice(&code_start.to_le_bytes());
    out
}

/// Inline-cache dispatch-loop backpatch helper: the register that the IC
/// prolog guarantees points at the saved GPR block (§4.3), used by the
/// engine's dispatch-loop gate to read the guarded instruction's runtime
/// operand symbolically when a miss is resolved.
pub const IC_DISPATCH_SCRATCH: Register = crate::prolog::IC_SCRATCH_BASE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jmp_and_ret_patches_fit_budget() {
        let bytes = patch_jmp(64, 0x1000, 0x2000, true);
        assert!(bytes.len() <= MAX_JMP_RET_PATCH_LEN);
        let bytes = patch_ret(64, 0x1000, 0x2000);
        assert!(bytes.len() <= MAX_JMP_RET_PATCH_LEN);
    }

    #[test]
    fn ic_slot_bytes_round_trip() {
        let bytes = ic_slot_bytes(0x1234, 0x5678);
        let real = usize::from_le_bytes(bytes[..8].try_into().unwrap());
        let code = usize::from_le_bytes(bytes[8..].try_into().unwrap());
        assert_eq!(real, 0x1234);
        assert_eq!(code, 0x5678);
    }
}
