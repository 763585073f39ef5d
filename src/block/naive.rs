//! Free-list block allocator for a single device tier.
//!
//! No content addressing: every allocation takes a fresh slot off the
//! free list and every refcount-zero free returns it. Sharing only
//! happens through [`fork`](NaiveBlockAllocator::fork), which is undone
//! by copy-on-write at the first append.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use crate::block::arena::{BlockArena, BlockData, BlockHandle, BlockVariant};
use crate::block::refcount::RefCounter;
use crate::block::{BlockError, CowTracker, SlotId, TokenId};

#[derive(Debug)]
pub struct NaiveBlockAllocator {
    block_size: usize,
    free_list: VecDeque<SlotId>,
    refcounter: RefCounter,
    cows: CowTracker,
}

impl NaiveBlockAllocator {
    /// Create an allocator owning the slot range `slots`.
    pub fn new(block_size: usize, slots: Range<SlotId>) -> Self {
        Self {
            block_size,
            free_list: slots.clone().collect(),
            refcounter: RefCounter::new(slots),
            cows: CowTracker::new(),
        }
    }

    /// Allocate an empty, appendable block backed by a fresh slot.
    pub fn allocate_mutable(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
    ) -> Result<BlockHandle, BlockError> {
        let slot = self.allocate_slot()?;
        Ok(arena.insert(BlockData::new(prev, self.block_size, slot, BlockVariant::Naive)))
    }

    /// Allocate a block and fill it with `token_ids` in one shot.
    pub fn allocate_immutable(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
    ) -> Result<BlockHandle, BlockError> {
        let handle = self.allocate_mutable(arena, prev)?;
        arena.get_mut(handle).append_token_ids(token_ids);
        Ok(handle)
    }

    /// Bind a new logical block to an already-referenced slot, bumping
    /// its refcount. Used when planning swaps that fan one physical copy
    /// out to several sequences.
    pub fn share_slot(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
        slot: SlotId,
    ) -> BlockHandle {
        let refcount = self.refcounter.incr(slot);
        assert!(refcount >= 2, "sharing an unreferenced slot");
        let handle = arena.insert(BlockData::new(prev, self.block_size, slot, BlockVariant::Naive));
        arena.get_mut(handle).append_token_ids(token_ids);
        handle
    }

    /// Release a logical block: detach its slot, drop the reference, and
    /// return the slot to the free list once unreferenced.
    pub fn free(&mut self, arena: &mut BlockArena, handle: BlockHandle) {
        let mut data = arena.remove(handle);
        let slot = data.slot().expect("freeing a block with no slot");
        data.set_slot(None);
        self.free_slot(slot);
    }

    /// Duplicate the chain ending at `last`: the new chain shares every
    /// slot and each shared slot gains one reference.
    pub fn fork(&mut self, arena: &mut BlockArena, last: BlockHandle) -> Vec<BlockHandle> {
        let source = arena.chain(last);
        let mut forked = Vec::with_capacity(source.len());
        let mut prev = None;
        for handle in source {
            let (slot, token_ids) = {
                let data = arena.get(handle);
                (data.slot().expect("forking a block with no slot"), data.token_ids().to_vec())
            };
            let refcount = self.refcounter.incr(slot);
            assert!(refcount >= 2, "cannot fork a freed block");

            let new_handle =
                arena.insert(BlockData::new(prev, self.block_size, slot, BlockVariant::Naive));
            arena.get_mut(new_handle).append_token_ids(&token_ids);
            forked.push(new_handle);
            prev = Some(new_handle);
        }
        forked
    }

    /// Append token ids to a block, copy-on-writing its slot first if the
    /// slot is shared.
    pub fn append_token_ids(
        &mut self,
        arena: &mut BlockArena,
        handle: BlockHandle,
        token_ids: &[TokenId],
    ) -> Result<(), BlockError> {
        let slot = arena.get(handle).slot().expect("appending to a block with no slot");
        let writable = self.cow_if_not_appendable(slot)?;
        let data = arena.get_mut(handle);
        data.set_slot(Some(writable));
        data.append_token_ids(token_ids);
        Ok(())
    }

    /// If `slot` is shared, move this holder onto a private copy and
    /// record the pending copy; otherwise return `slot` unchanged.
    pub fn cow_if_not_appendable(&mut self, slot: SlotId) -> Result<SlotId, BlockError> {
        let refcount = self.refcounter.get(slot);
        assert!(refcount > 0, "copy-on-write on an unreferenced slot");
        if refcount == 1 {
            return Ok(slot);
        }
        self.free_slot(slot);
        let dst = self.allocate_slot()?;
        self.cows.record(slot, dst);
        Ok(dst)
    }

    /// Drain the pending copy-on-write map.
    pub fn clear_cows(&mut self) -> HashMap<SlotId, Vec<SlotId>> {
        self.cows.clear_cows()
    }

    pub fn get_num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn refcount(&self, slot: SlotId) -> u32 {
        self.refcounter.get(slot)
    }

    fn allocate_slot(&mut self) -> Result<SlotId, BlockError> {
        let slot = self.free_list.pop_front().ok_or(BlockError::NoFreeBlocks)?;
        let refcount = self.refcounter.incr(slot);
        debug_assert_eq!(refcount, 1);
        Ok(slot)
    }

    fn free_slot(&mut self, slot: SlotId) {
        if self.refcounter.decr(slot) == 0 {
            self.free_list.push_back(slot);
        }
    }
}
