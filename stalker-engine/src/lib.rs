//! `stalker-engine` — the block compiler driving loop, entry gates, block
//! reuse/recompile, the backpatcher, and the `ExecCtx` controller state
//! machine (§2 components 5, 6 wiring, 7, 8; §4.2, §4.4, §4.7, §4.8).
//!
//! This is where `stalker-core`'s data model and `stalker-codegen`'s
//! byte-level stub writers meet: this crate drives the decode/transform/
//! virtualize loop over real application memory, decides when a cached
//! translation may be reused or must be recompiled, applies backpatches once
//! a slow path has resolved a destination, and owns the per-thread
//! follow/unfollow/garbage-collect lifecycle. Nothing above this crate
//! touches raw machine code; nothing below it knows what a thread is.

pub mod compiler;
pub mod controller;
pub mod gates;
pub mod gc;
pub mod patch;

pub use compiler::{compile_block, obtain_block_for, CompileError, EntryGateAddrs};
pub use controller::{activate, deactivate, try_complete_unfollow, ControllerError};
pub use gc::garbage_collect;
pub use patch::{apply_backpatch, may_backpatch, PatchError};
