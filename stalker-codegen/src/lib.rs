//! `stalker-codegen` — the x86/x86-64 "how".
//!
//! The mmap-backed code buffer and thaw/freeze protocol live in
//! `stalker-core::slab`; this crate owns everything that speaks raw
//! opcode bytes: the relocator/assembler wrapper around `iced-x86`,
//! prolog/epilog/helper emission, the branch virtualizer's stub writers,
//! and the four backpatch rewrites.

pub mod asm;
pub mod backpatch;
pub mod helpers;
pub mod prolog;
pub mod relocator;
pub mod virtualizer;

pub use relocator::{relocate_one, RelocateError, Relocator};
