//! §8 scenario 6 and the §4.1 public-API round trip: follow, probe
//! registration, invalidate-driven recompilation, activate/deactivate, and
//! the unfollow -> garbage_collect lifecycle, all through the `stalker`
//! facade crate's public surface.
//!
//! `Stalker::new`/`with_thread_control` installs a process-wide singleton
//! (`OnceLock`), so this file intentionally exercises the whole round trip
//! from a single `#[test]` rather than spreading it across many —
//! constructing a second `Stalker` in the same process would just return
//! the first one's `Arc` back out from under a differently-configured test.

mod support;

use std::sync::Arc;

use stalker::platform::{PlatformError, ThreadControl};
use stalker::Stalker;
use stalker_core::traits::{CallProbe, NullTransformer};
use stalker_core::{CpuContext, Range, StalkerConfig};

use support::{AppMemory, RecordingObserver, RecordingSink};

#[derive(Default)]
struct FakeThreadControl;

impl ThreadControl for FakeThreadControl {
    fn is_alive(&self, _thread_id: u64) -> bool {
        true
    }
    fn suspend(&self, _thread_id: u64) -> Result<usize, PlatformError> {
        Ok(0)
    }
    fn resume_at(&self, _thread_id: u64, _pc: usize) -> Result<(), PlatformError> {
        Ok(())
    }
    fn read_registers(&self, _thread_id: u64) -> Result<CpuContext, PlatformError> {
        Ok(CpuContext::zeroed())
    }
}

struct NoopProbe;
impl CallProbe for NoopProbe {
    fn on_call(&self, _context: &mut CpuContext, _user_data: usize) {}
}

fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[test]
fn follow_probe_invalidate_activate_and_unfollow_round_trip() {
    let stalker = Stalker::with_thread_control(StalkerConfig::new(1, 4).unwrap(), Arc::new(FakeThreadControl))
        .expect("only one Stalker may be installed per process");

    let tid = current_thread_id();
    let entry = AppMemory::new(&[0xc3]); // ret
    let sink = Arc::new(RecordingSink::default());
    let observer = Arc::new(RecordingObserver::default());

    let code_addr = stalker
        .follow(
            tid,
            entry.addr(),
            Arc::new(NullTransformer),
            sink.clone(),
            Some(observer.clone() as Arc<dyn stalker_core::traits::Observer>),
        )
        .expect("follow");
    assert_eq!(sink.compile_count(entry.addr()), 1);

    // §4.1 exclude: ranges are recorded process-wide regardless of thread.
    stalker.exclude(Range::new(0x9000_0000, 0x9000_1000));

    // §4.1 add_call_probe / remove_call_probe: registering and removing the
    // only probe at a target invalidates it both times; neither call errors.
    // A separate, never-compiled target is used here so this doesn't
    // perturb `entry`'s cached translation below.
    let probe_target = AppMemory::new(&[0xc3]);
    let probe_id = stalker.add_call_probe(probe_target.addr(), Arc::new(NoopProbe), 0);
    stalker.remove_call_probe(probe_id).expect("remove registered probe");
    assert!(matches!(
        stalker.remove_call_probe(probe_id),
        Err(stalker::StalkerError::UnknownProbe(_))
    ));

    // §6 prefetch: re-obtains the already-compiled block and seeds its
    // recycle counter without forcing a recompile.
    let prefetched = stalker.prefetch(tid, entry.addr(), 7).expect("prefetch");
    assert_eq!(prefetched, code_addr);
    assert_eq!(sink.compile_count(entry.addr()), 1, "prefetch of a live block must not recompile it");

    // §4.1 invalidate: drops the cached translation, so the next compile
    // attempt (simulated here via a second prefetch) is observably a fresh
    // Compile event rather than a cache hit.
    stalker.invalidate(entry.addr());
    stalker.prefetch(tid, entry.addr(), 0).expect("prefetch after invalidate");
    assert_eq!(sink.compile_count(entry.addr()), 2, "invalidate must force a recompile on next use");

    // §4.1 activate/deactivate: a target with no existing translation gets
    // compiled and deferred; deactivate hands back the deferred location.
    let activation_site = AppMemory::new(&[0xc3]);
    let redirect = stalker.activate(tid, activation_site.addr()).expect("activate");
    assert!(redirect.is_some(), "a not-yet-translated activation target must be compiled");
    let restored = stalker.deactivate(tid).expect("deactivate");
    assert_eq!(restored, Some(activation_site.addr()));

    // A second activate against the same real address resolves through the
    // same cached translation (§4.4), landing on the identical code address.
    let second_redirect = stalker.activate(tid, activation_site.addr()).expect("activate again");
    assert_eq!(second_redirect, redirect, "re-activating an already-compiled site reuses its translation");

    // §4.1/§4.8 unfollow + garbage_collect: the owning thread may complete
    // its own unfollow and self-collect without waiting on the grace period.
    stalker.unfollow(tid).expect("unfollow");
    let completed = stalker.try_complete_unfollow(tid, entry.addr()).expect("try_complete_unfollow");
    assert!(completed, "no pending_calls are in flight, so completion must succeed immediately");

    stalker.garbage_collect();
    assert!(
        matches!(stalker.activate(tid, entry.addr()), Err(stalker::StalkerError::UnknownThread(_))),
        "garbage_collect must have dropped the self-collected ExecCtx"
    );
}
