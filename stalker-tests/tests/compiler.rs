//! §8 scenarios 1 and 4: hot-loop reuse, backpatch eligibility, and
//! self-modifying-code detection, driven directly against the block
//! compiler and backpatcher.

mod support;

use std::sync::Arc;

use stalker_core::backpatch::BackpatchKind;
use stalker_core::traits::Observer;
use stalker_core::StalkerConfig;
use stalker_engine::compiler::obtain_block_for;
use stalker_engine::patch::apply_backpatch;

use support::{compile_gates, new_ctx, AppMemory, ExcludingQuery, PermissiveQuery, RecordingObserver, RecordingSink};

#[test]
fn hot_loop_reuses_compiled_block_without_recompiling() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 4).unwrap();
    let ctx = new_ctx(config, sink.clone(), None);
    let gates = compile_gates();
    let query = PermissiveQuery;
    let app = AppMemory::new(&[0xc3]); // ret

    let first = obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();
    let second = obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();
    let third = obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(sink.compile_count(app.addr()), 1);
}

#[test]
fn self_modified_block_is_recompiled_on_next_reuse_attempt() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 4).unwrap();
    let ctx = new_ctx(config, sink.clone(), None);
    let gates = compile_gates();
    let query = PermissiveQuery;
    let app = AppMemory::new(&[0xb0, 0x01, 0xc3]); // mov al, 1; ret

    let first = obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();
    assert_eq!(sink.compile_count(app.addr()), 1);

    // Mutate the immediate operand in place without changing the
    // instruction's length or shape (§4.4 "self-modifying target").
    app.poke(1, 0x02);

    let second = obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();
    assert_eq!(sink.compile_count(app.addr()), 2, "snapshot mismatch must trigger a recompile");
    assert_eq!(first, second, "an in-place recompile keeps the same code_start");
}

#[test]
fn unmodified_block_stays_warm_across_repeated_snapshot_checks() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 4).unwrap();
    let ctx = new_ctx(config, sink.clone(), None);
    let gates = compile_gates();
    let query = PermissiveQuery;
    let app = AppMemory::new(&[0xb0, 0x01, 0xc3]);

    obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();
    obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();
    obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();

    assert_eq!(sink.compile_count(app.addr()), 1);
}

#[test]
fn backpatch_rewrites_a_trusted_return_site() {
    let sink = Arc::new(RecordingSink::default());
    let observer = Arc::new(RecordingObserver::default());
    // Negative threshold: always trusted, so eligibility hinges only on
    // ExecCtx state and the ActivationTarget flag (§4.7).
    let config = StalkerConfig::new(-1, 4).unwrap();
    let ctx = new_ctx(config, sink.clone(), Some(observer.clone() as Arc<dyn Observer>));
    let gates = compile_gates();
    let query = PermissiveQuery;

    let from = AppMemory::new(&[0xc3]);
    let to = AppMemory::new(&[0xc3]);
    obtain_block_for(&ctx, from.addr(), &gates, &config, &query).unwrap();
    obtain_block_for(&ctx, to.addr(), &gates, &config, &query).unwrap();

    // `emit_ret` (stalker-codegen) always places its patch site at offset 0
    // of the compiled stub.
    let applied = apply_backpatch(&ctx, &config, from.addr(), to.addr(), 0, BackpatchKind::Ret).unwrap();

    assert!(applied);
    let recorded = observer.backpatches();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].from, from.addr());
    assert_eq!(recorded[0].to, to.addr());
    assert_eq!(recorded[0].kind, BackpatchKind::Ret);
}

#[test]
fn backpatch_is_skipped_without_error_when_target_not_yet_trusted() {
    let sink = Arc::new(RecordingSink::default());
    let observer = Arc::new(RecordingObserver::default());
    let config = StalkerConfig::new(3, 4).unwrap();
    let ctx = new_ctx(config, sink.clone(), Some(observer.clone() as Arc<dyn Observer>));
    let gates = compile_gates();
    let query = PermissiveQuery;

    let from = AppMemory::new(&[0xc3]);
    let to = AppMemory::new(&[0xc3]);
    obtain_block_for(&ctx, from.addr(), &gates, &config, &query).unwrap();
    obtain_block_for(&ctx, to.addr(), &gates, &config, &query).unwrap();

    let applied = apply_backpatch(&ctx, &config, from.addr(), to.addr(), 0, BackpatchKind::Ret).unwrap();

    assert!(!applied);
    assert!(observer.backpatches().is_empty());
}

#[test]
fn excluded_call_target_relocates_original_bytes_instead_of_virtualizing() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 4).unwrap();
    let ctx = new_ctx(config, sink, None);
    let gates = compile_gates();

    let rel32: i32 = 0x100;
    let mut routine = vec![0xe8u8]; // call rel32
    routine.extend_from_slice(&rel32.to_le_bytes());

    let excluded_app = AppMemory::new(&routine);
    let target = excluded_app.addr() + 5 + rel32 as usize;
    let excluded_query = ExcludingQuery { range: target..target + 1 };
    obtain_block_for(&ctx, excluded_app.addr(), &gates, &config, &excluded_query).unwrap();

    let direct_app = AppMemory::new(&routine);
    obtain_block_for(&ctx, direct_app.addr(), &gates, &config, &PermissiveQuery).unwrap();

    let state = ctx.code_lock.lock();
    let excluded_id = *state.block_map.get(&excluded_app.addr()).unwrap();
    let direct_id = *state.block_map.get(&direct_app.addr()).unwrap();
    let excluded_size = state.arena.get(excluded_id).code_size;
    let direct_size = state.arena.get(direct_id).code_size;
    assert_ne!(excluded_size, direct_size, "excluded and direct call stubs have different shapes");
}

#[test]
fn backpatch_against_an_unknown_source_is_an_error() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(-1, 4).unwrap();
    let ctx = new_ctx(config, sink, None);

    let to = AppMemory::new(&[0xc3]);
    let gates = compile_gates();
    let query = PermissiveQuery;
    obtain_block_for(&ctx, to.addr(), &gates, &config, &query).unwrap();

    let result = apply_backpatch(&ctx, &config, 0xdead_beef, to.addr(), 0, BackpatchKind::Ret);
    assert!(matches!(result, Err(stalker_engine::patch::PatchError::UnknownSource(addr)) if addr == 0xdead_beef));
}
