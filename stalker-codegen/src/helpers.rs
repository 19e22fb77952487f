//! Helper code emitter (§2 component 4, §4.3 "Helpers are emitted once per
//! ExecCtx").
//!
//! Produces the one-time routines every code slab dispatches into:
//! prolog/epilog pairs (minimal/full/IC), the shadow-stack push helper, the
//! stack-pop-and-resolve helper, and the invalidator trampoline. Reachability
//! from a new code slab is re-checked whenever one is added, re-emitting a
//! local copy if the existing helper has fallen out of near-jump range
//! (§4.3).

use stalker_core::slab::CodeSlabWriter;
use stalker_core::{HelperAddrs, ProlKind};

use crate::asm;
use crate::prolog::{build_epilog, build_prolog};

/// Near-jump/near-call displacements are signed 32-bit; a helper is
/// reachable from a call site iff the byte distance fits in that range
/// (§4.3: "re-checks reachability of each helper").
pub fn is_reachable(from: usize, to: usize) -> bool {
    let delta = (to as i64).wrapping_sub(from as i64);
    delta >= i32::MIN as i64 && delta <= i32::MAX as i64
}

/// The shadow-stack push helper (§4.5): called from every virtualized
/// call's stub after the application-side push of the real return address;
/// pushes `(real, translated)` onto `ExecCtx.frames`. Represented here as a
/// minimal-prolog-framed body; the engine supplies the actual ring-push
/// logic as a callout into `stalker-engine::gates` reached via `call`
/// inside this stub, matching how the rest of the virtualizer defers
/// symbolic bookkeeping to Rust-side gate functions rather than hand-coding
/// ring arithmetic in raw bytes.
pub fn stack_push_stub(bitness: u32, ip: u64, gate_addr: u64) -> Vec<u8> {
    let mut out = build_prolog(ProlKind::Minimal, bitness, ip);
    let call = asm::encode_one(bitness, ip + out.len() as u64, &asm::call_rel32(gate_addr));
    out.extend_from_slice(&call);
    out.extend_from_slice(&build_epilog(ProlKind::Minimal, bitness, ip + out.len() as u64));
    out
}

/// The stack-pop-and-resolve helper (§4.5 `stack_pop_and_go`): the three-step
/// fast-path/scan/slow-path dispatch is implemented in
/// `stalker-engine::gates::ret_slow_path` and the fast-path comparison in
/// [`stalker_core::shadow::ShadowStack::fast_path_return`]; this stub frames
/// the call into that gate with a minimal prolog, matching §4.3's "before
/// calls into engine helpers" rule for the Minimal prolog.
pub fn stack_pop_and_go_stub(bitness: u32, ip: u64, gate_addr: u64) -> Vec<u8> {
    stack_push_stub(bitness, ip, gate_addr)
}

/// The invalidator trampoline (§4.4 "Invalidation"): the target block's
/// first bytes are overwritten with `sub rsp, N`, a direct call here, and a
/// trailing signed 32-bit distance to the `ExecBlock` header. This routine
/// recomputes the block pointer from that distance (via the engine gate),
/// takes `code_lock`, recompiles, and returns via the standard epilog — all
/// of which is Rust-side logic in `stalker-engine::invalidate`; the
/// trampoline itself only frames the call with a full-context prolog
/// (recompilation may run arbitrary relocator/encoder code that clobbers
/// everything).
pub fn invalidator_stub(bitness: u32, ip: u64, gate_addr: u64) -> Vec<u8> {
    let mut out = build_prolog(ProlKind::Full, bitness, ip);
    let call = asm::encode_one(bitness, ip + out.len() as u64, &asm::call_rel32(gate_addr));
    out.extend_from_slice(&call);
    out.extend_from_slice(&build_epilog(ProlKind::Full, bitness, ip + out.len() as u64));
    out
}

/// Emits every helper routine into `writer` starting at `writer.base()`,
/// returning their absolute addresses (§4.3). `gates` supplies the absolute
/// address of each Rust-side entry-gate function this helper set frames
/// calls to (resolved by `stalker-engine` before emission, since the
/// addresses are ordinary Rust function pointers cast to `usize`).
pub struct GateAddrs {
    pub stack_push_gate: u64,
    pub stack_pop_and_go_gate: u64,
    pub invalidate_gate: u64,
}

fn place(writer: &mut CodeSlabWriter, offset: &mut usize, bytes: &[u8]) -> usize {
    let addr_offset = *offset;
    writer.write_bytes(*offset, bytes);
    *offset += bytes.len();
    addr_offset
}

pub fn emit_all(bitness: u32, writer: &mut CodeSlabWriter, gates: &GateAddrs) -> HelperAddrs {
    let base = writer.base() as u64;
    let mut offset: usize = 0;

    let prolog_minimal = build_prolog(ProlKind::Minimal, bitness, base);
    let off_prolog_minimal = place(writer, &mut offset, &prolog_minimal);
    let epilog_minimal = build_epilog(ProlKind::Minimal, bitness, base + offset as u64);
    let off_epilog_minimal = place(writer, &mut offset, &epilog_minimal);

    let prolog_full = build_prolog(ProlKind::Full, bitness, base + offset as u64);
    let off_prolog_full = place(writer, &mut offset, &prolog_full);
    let epilog_full = build_epilog(ProlKind::Full, bitness, base + offset as u64);
    let off_epilog_full = place(writer, &mut offset, &epilog_full);

    let prolog_ic = build_prolog(ProlKind::InlineCacheProlog, bitness, base + offset as u64);
    let off_prolog_ic = place(writer, &mut offset, &prolog_ic);
    let epilog_ic = build_epilog(ProlKind::InlineCacheProlog, bitness, base + offset as u64);
    let off_epilog_ic = place(writer, &mut offset, &epilog_ic);

    let push_stub = stack_push_stub(bitness, base + offset as u64, gates.stack_push_gate);
    let off_push = place(writer, &mut offset, &push_stub);

    let pop_stub = stack_pop_and_go_stub(bitness, base + offset as u64, gates.stack_pop_and_go_gate);
    let off_pop = place(writer, &mut offset, &pop_stub);

    let inval_stub = invalidator_stub(bitness, base + offset as u64, gates.invalidate_gate);
    let off_invalidator = place(writer, &mut offset, &inval_stub);

    HelperAddrs {
        prolog_minimal: Some(base as usize + off_prolog_minimal),
        epilog_minimal: Some(base as usize + off_epilog_minimal),
        prolog_full: Some(base as usize + off_prolog_full),
        epilog_full: Some(base as usize + off_epilog_full),
        prolog_ic: Some(base as usize + off_prolog_ic),
        epilog_ic: Some(base as usize + off_epilog_ic),
        stack_push: Some(base as usize + off_push),
        stack_pop_and_go: Some(base as usize + off_pop),
        invalidator: Some(base as usize + off_invalidator),
    }
}

/// `true` if every address in `helpers` remains near-reachable from a call
/// site at `from` (§4.3: re-checked whenever a new code slab is added).
pub fn all_reachable(helpers: &HelperAddrs, from: usize) -> bool {
    [
        helpers.prolog_minimal,
        helpers.epilog_minimal,
        helpers.prolog_full,
        helpers.epilog_full,
        helpers.prolog_ic,
        helpers.epilog_ic,
        helpers.stack_push,
        helpers.stack_pop_and_go,
        helpers.invalidator,
    ]
    .into_iter()
    .flatten()
    .all(|addr| is_reachable(from, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_respects_rel32_bounds() {
        assert!(is_reachable(0x1000, 0x2000));
        assert!(!is_reachable(0, usize::MAX / 2));
    }
}
