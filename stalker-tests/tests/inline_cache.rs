//! §8 scenarios 2 and 3: monomorphic and polymorphic indirect dispatch,
//! exercised against inline-cache tables keyed by real compiled blocks.

mod support;

use std::sync::Arc;

use stalker_core::ic::IcTable;
use stalker_core::StalkerConfig;
use stalker_engine::compiler::obtain_block_for;

use support::{compile_gates, new_ctx, AppMemory, PermissiveQuery, RecordingSink};

const IC_SLOT_SIZE: usize = 2 * std::mem::size_of::<usize>();

#[test]
fn indirect_call_block_reserves_an_ic_table_sized_by_config() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 4).unwrap();
    let ctx = new_ctx(config, sink, None);
    let gates = compile_gates();
    let query = PermissiveQuery;
    let app = AppMemory::new(&[0xff, 0xd0]); // call rax

    let code_start = obtain_block_for(&ctx, app.addr(), &gates, &config, &query).unwrap();

    let state = ctx.code_lock.lock();
    let id = *state.block_map.get(&app.addr()).unwrap();
    let block = state.arena.get(id);
    assert_eq!(block.code_start, code_start);
    let reserved_extra = block.capacity as usize - block.code_size as usize - block.real_size as usize;
    assert_eq!(reserved_extra, config.ic_entries * IC_SLOT_SIZE);
}

#[test]
fn monomorphic_ic_resolves_repeated_target_without_filling_more_slots() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 4).unwrap();
    let ctx = new_ctx(config, sink, None);
    let gates = compile_gates();
    let query = PermissiveQuery;

    let target = AppMemory::new(&[0xc3]);
    let target_code = obtain_block_for(&ctx, target.addr(), &gates, &config, &query).unwrap();

    let mut ic = IcTable::new(config.ic_entries);
    for _ in 0..5 {
        if ic.lookup(target.addr()).is_none() {
            assert!(ic.fill_first_empty(target.addr(), target_code));
        }
    }

    assert_eq!(ic.entries().iter().filter(|e| !e.is_empty()).count(), 1);
    assert_eq!(ic.lookup(target.addr()), Some(target_code));
}

#[test]
fn polymorphic_ic_fills_distinct_slots_then_permanently_falls_to_slow_path() {
    let sink = Arc::new(RecordingSink::default());
    let config = StalkerConfig::new(1, 2).unwrap(); // ic_entries = 2, §8 scenario 3
    let ctx = new_ctx(config, sink, None);
    let gates = compile_gates();
    let query = PermissiveQuery;

    let targets: Vec<AppMemory> = (0..3).map(|_| AppMemory::new(&[0xc3])).collect();
    let codes: Vec<usize> = targets
        .iter()
        .map(|t| obtain_block_for(&ctx, t.addr(), &gates, &config, &query).unwrap())
        .collect();

    let mut ic = IcTable::new(config.ic_entries);
    let mut slow_path_hits = 0;
    for (t, c) in targets.iter().zip(codes.iter()).cycle().take(9) {
        if ic.lookup(t.addr()).is_some() {
            continue;
        }
        if !ic.fill_first_empty(t.addr(), *c) {
            slow_path_hits += 1;
        }
    }

    assert_eq!(ic.capacity(), 2);
    assert!(slow_path_hits > 0, "the third distinct target must never find a slot");
}
