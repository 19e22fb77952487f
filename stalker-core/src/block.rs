//! `ExecBlock` records and their arena (§2 component 2, §3 "ExecBlock").
//!
//! Blocks are fixed-size records living in data slabs (§2: "fixed-size
//! records living in data slabs; each describes one translated basic
//! block"). We model the arena as a `Vec<ExecBlock>` backed conceptually by
//! a [`crate::slab::DataSlab`] chain — the bump-pointer discipline of the
//! slab is mirrored by the arena only ever growing, never shrinking, until
//! the owning `ExecCtx` is torn down (see [`crate::ctx::ExecCtx`]).

use bitflags::bitflags;

bitflags! {
    /// Flag bits carried by an [`ExecBlock`] (§3: "flag bits (notably
    /// ActivationTarget)").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Set on the block that is the target of a pending `activate()`
        /// call (§4.1). Backpatching is forbidden against a block carrying
        /// this flag (§4.7).
        const ACTIVATION_TARGET = 1 << 0;
        /// Set while this block's translation is mid-recompile (§4.4), to
        /// keep concurrent readers from treating a half-written `code_size`
        /// as final.
        const RECOMPILING = 1 << 1;
    }
}

/// Opaque handle to a block within one `ExecCtx`'s arena. Never valid across
/// `ExecCtx`s and never outlives the owning context (§9 "Pointer graphs").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// One translated basic block (§3 "ExecBlock").
///
/// Invariant (§3): after [`ExecBlock::commit`], the first `real_size` bytes
/// stored immediately after `code_start + code_size` are a verbatim snapshot
/// of the original instructions, used by [`crate::config::StalkerConfig`]-driven
/// reuse (§4.4) to detect code changes.
#[derive(Debug)]
pub struct ExecBlock {
    /// Source (original, application) address this block translates.
    pub real_start: usize,
    /// Number of original bytes this block covers.
    pub real_size: u32,
    /// Address of the translated code, in the owning code slab.
    pub code_start: usize,
    /// Length of the translated code, in bytes, not including the snapshot.
    pub code_size: u32,
    /// Reserved bytes in the code slab for this block: `code_size +
    /// snapshot + inline-cache table`, possibly larger than `code_size`
    /// alone (§3).
    pub capacity: u32,
    /// Number of times this block has been observed up to date on reuse
    /// (§4.4); compared against `trust_threshold`.
    pub recycle_count: u32,
    pub flags: BlockFlags,
    /// Linked-list head (offset within the code slab) of per-block callout
    /// entries installed by `Iterator::put_callout` (§6).
    pub last_callout_offset: Option<u32>,
    /// Secondary block used when an in-place recompile would exceed
    /// `capacity` (§4.4). The original block's code is overwritten with a
    /// single jump to `storage_block`'s `code_start`, preserving the
    /// `real_start → code_start` identity for already-installed backpatches.
    pub storage_block: Option<BlockId>,
}

impl ExecBlock {
    /// A freshly allocated, not-yet-committed block (§4.2 step "allocate a
    /// new ExecBlock"). `code_start`/`code_size` are filled in once the
    /// compiler finishes emitting (§4.2 step 7, [`ExecBlock::commit`]).
    pub fn new(real_start: usize, code_start: usize) -> Self {
        Self {
            real_start,
            real_size: 0,
            code_start,
            code_size: 0,
            capacity: 0,
            recycle_count: 0,
            flags: BlockFlags::empty(),
            last_callout_offset: None,
            storage_block: None,
        }
    }

    /// Offset from `code_start` at which the verbatim snapshot of original
    /// bytes begins (§3: "immediately after `code_start + code_size`").
    #[inline]
    pub fn snapshot_offset(&self) -> u32 {
        self.code_size
    }

    /// Write the final sizes into the block (§4.2 step 7).
    pub fn commit(&mut self, code_size: u32, real_size: u32, capacity: u32) {
        self.code_size = code_size;
        self.real_size = real_size;
        self.capacity = capacity;
    }

    #[inline]
    pub fn is_activation_target(&self) -> bool {
        self.flags.contains(BlockFlags::ACTIVATION_TARGET)
    }
}

/// Arena of [`ExecBlock`]s owned by one `ExecCtx` (§2 component 2).
///
/// Indices are stable for the lifetime of the arena: blocks are never
/// removed individually (only the whole arena is dropped, with the owning
/// `ExecCtx`), so a [`BlockId`] handed out once remains valid until then.
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: Vec<ExecBlock>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn insert(&mut self, block: ExecBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    pub fn get(&self, id: BlockId) -> &ExecBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut ExecBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_sets_snapshot_offset_to_code_size() {
        let mut b = ExecBlock::new(0x1000, 0x7f00_0000);
        b.commit(64, 5, 64 + 5 + 32);
        assert_eq!(b.snapshot_offset(), 64);
        assert_eq!(b.capacity, 101);
    }

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = BlockArena::new();
        let a = arena.insert(ExecBlock::new(0x1000, 0x2000));
        let b = arena.insert(ExecBlock::new(0x1100, 0x2100));
        assert_eq!(arena.get(a).real_start, 0x1000);
        assert_eq!(arena.get(b).real_start, 0x1100);
        arena.get_mut(a).recycle_count += 1;
        assert_eq!(arena.get(a).recycle_count, 1);
        assert_eq!(arena.get(b).recycle_count, 0);
    }

    #[test]
    fn activation_target_flag_blocks_backpatch_eligibility() {
        let mut b = ExecBlock::new(0x1000, 0x2000);
        assert!(!b.is_activation_target());
        b.flags.insert(BlockFlags::ACTIVATION_TARGET);
        assert!(b.is_activation_target());
    }
}
