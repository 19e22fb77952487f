//! The backpatcher (§2 component 7, §4.7): rewrites an already-emitted
//! stub in place once a destination block is known and trusted.

use stalker_core::backpatch::{BackpatchDescriptor, BackpatchKind};
use stalker_core::ctx::ExecCtx;
use stalker_core::slab::CodeSlabWriter;
use stalker_core::StalkerConfig;

use stalker_codegen::backpatch::{ic_slot_bytes, patch_call, patch_jmp, patch_ret, MAX_JMP_RET_PATCH_LEN};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("backpatch target block for address {0:#x} is not yet compiled")]
    UnknownTarget(usize),
    #[error("backpatch source block for address {0:#x} is not yet compiled")]
    UnknownSource(usize),
    #[error("patch site does not lie within any of this context's code slabs")]
    SlabNotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// §4.7 eligibility: "permitted only when: the ExecCtx is still Active; the
/// target block does not carry the ActivationTarget flag; and the target's
/// recycle_count ≥ trust_threshold."
pub fn may_backpatch(ctx: &ExecCtx, target_recycle_count: u32, target_is_activation_target: bool, config: &StalkerConfig) -> bool {
    ctx.may_now_backpatch() && !target_is_activation_target && config.is_trusted(target_recycle_count)
}

/// Apply one of the four rewrites of §4.7 at `from`'s translated code,
/// `patch_offset` bytes into it, targeting `to`'s translated address.
/// Returns `Ok(false)` without touching any bytes if eligibility (§4.7)
/// fails — this is the normal, silent "stay on the slow path" outcome, not
/// an error.
pub fn apply_backpatch(
    ctx: &ExecCtx,
    config: &StalkerConfig,
    from: usize,
    to: usize,
    patch_offset: u32,
    kind: BackpatchKind,
) -> Result<bool, PatchError> {
    let mut state = ctx.code_lock.lock();

    let from_id = *state
        .block_map
        .get(&from)
        .ok_or(PatchError::UnknownSource(from))?;
    let to_id = *state.block_map.get(&to).ok_or(PatchError::UnknownTarget(to))?;

    let to_block = state.arena.get(to_id);
    if !may_backpatch(ctx, to_block.recycle_count, to_block.is_activation_target(), config) {
        return Ok(false);
    }
    let target_code_start = to_block.code_start as u64;

    let from_block = state.arena.get(from_id);
    let patch_site = from_block.code_start as u64 + patch_offset as u64;
    let patch_len = match kind {
        BackpatchKind::InlineCache => 2 * std::mem::size_of::<usize>(),
        _ => MAX_JMP_RET_PATCH_LEN,
    };

    let slab = find_owning_slab(&state, patch_site as usize).ok_or(PatchError::SlabNotFound)?;
    {
        let mut writer = CodeSlabWriter::open(slab, patch_site as usize, patch_len)?;
        let bytes = match kind {
            BackpatchKind::Call { .. } => patch_call(64, patch_site, target_code_start),
            BackpatchKind::Jmp => patch_jmp(64, patch_site, target_code_start, true),
            BackpatchKind::Ret => patch_ret(64, patch_site, target_code_start),
            BackpatchKind::InlineCache => ic_slot_bytes(to, target_code_start as usize).to_vec(),
        };
        writer.write_bytes(0, &bytes);
    }
    drop(state);

    if let Some(observer) = &ctx.observer {
        observer.backpatch_notify(BackpatchDescriptor {
            kind,
            from,
            to,
            patch_offset,
        });
    }

    Ok(true)
}

fn find_owning_slab<'a>(
    state: &'a stalker_core::ctx::CodeState,
    addr: usize,
) -> Option<&'a stalker_core::slab::Slab> {
    state.code_slabs.iter().map(|c| &c.slab).find(|s| {
        let start = s.start() as usize;
        addr >= start && addr < start + s.size()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ineligible_target_skips_without_error() {
        let config = StalkerConfig::new(1, 4).unwrap();
        // recycle_count below trust_threshold, not yet warm.
        assert!(!may_backpatch(
            &dummy_ctx(),
            0,
            false,
            &config
        ));
    }

    #[test]
    fn activation_target_flag_blocks_eligibility() {
        let config = StalkerConfig::new(-1, 4).unwrap();
        assert!(!may_backpatch(&dummy_ctx(), 0, true, &config));
    }

    fn dummy_ctx() -> ExecCtx {
        use std::sync::Arc;
        use stalker_core::events::{Event, EventMask};
        use stalker_core::slab::{CodeSlab, DataSlab};
        use stalker_core::traits::{EventSink, NullTransformer};

        struct NullSink;
        impl EventSink for NullSink {
            fn query_mask(&self) -> EventMask {
                EventMask::empty()
            }
            fn process(&self, _event: Event, _cpu_context: Option<&stalker_core::CpuContext>) {}
        }

        ExecCtx::new(
            1,
            CodeSlab::new(4096).unwrap(),
            DataSlab::new(4096).unwrap(),
            64,
            Arc::new(NullTransformer),
            Arc::new(NullSink),
            None,
        )
        .unwrap()
    }
}
