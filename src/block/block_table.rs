//! Per-sequence block chains.
//!
//! A block table owns the ordered logical blocks backing one sequence's
//! token stream. Every block except possibly the last is full, and
//! consecutive blocks are linked through their predecessor handles so
//! content hashing can see the whole prefix.

use crate::block::arena::BlockHandle;
use crate::block::cpu_gpu::CpuGpuBlockAllocator;
use crate::block::{BlockError, Device, SlotId, TokenId};

#[derive(Debug)]
pub struct BlockTable {
    block_size: usize,
    blocks: Vec<BlockHandle>,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Vec::new(),
        }
    }

    /// Blocks needed to hold `num_tokens` tokens.
    pub fn get_num_required_blocks(num_tokens: usize, block_size: usize) -> usize {
        num_tokens.div_ceil(block_size)
    }

    /// Allocate blocks for a fresh token stream on `device`.
    ///
    /// Full chunks are requested as immutable blocks (so prefix caching
    /// can reuse them); a trailing partial chunk gets a mutable block.
    pub fn allocate(
        &mut self,
        allocator: &mut CpuGpuBlockAllocator,
        token_ids: &[TokenId],
        device: Device,
    ) -> Result<(), BlockError> {
        assert!(self.blocks.is_empty(), "block table already allocated");
        let mut prev = None;
        for chunk in token_ids.chunks(self.block_size) {
            let handle = if chunk.len() == self.block_size {
                allocator.allocate_immutable(prev, chunk, device)?
            } else {
                let handle = allocator.allocate_mutable(prev, device)?;
                allocator.append_token_ids(handle, chunk)?;
                handle
            };
            self.blocks.push(handle);
            prev = Some(handle);
        }
        Ok(())
    }

    /// Append newly generated tokens, filling the trailing block and
    /// growing the chain with GPU blocks as needed.
    pub fn append_token_ids(
        &mut self,
        allocator: &mut CpuGpuBlockAllocator,
        token_ids: &[TokenId],
    ) -> Result<(), BlockError> {
        assert!(!self.blocks.is_empty(), "appending to an unallocated block table");
        let mut remaining = token_ids;
        while !remaining.is_empty() {
            let last = *self.blocks.last().expect("non-empty table");
            let empty_slots = allocator.arena().get(last).num_empty_slots();
            if empty_slots == 0 {
                let fresh = allocator.allocate_mutable(Some(last), Device::Gpu)?;
                self.blocks.push(fresh);
                continue;
            }
            let take = empty_slots.min(remaining.len());
            allocator.append_token_ids(last, &remaining[..take])?;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Duplicate this table: the copy shares every slot and bumps each
    /// slot's refcount by one.
    pub fn fork(&self, allocator: &mut CpuGpuBlockAllocator) -> BlockTable {
        let last = *self.blocks.last().expect("forking an empty block table");
        BlockTable {
            block_size: self.block_size,
            blocks: allocator.fork(last),
        }
    }

    /// Free every block, in reverse chain order.
    pub fn free(&mut self, allocator: &mut CpuGpuBlockAllocator) {
        for handle in self.blocks.drain(..).rev() {
            allocator.free(handle);
        }
    }

    pub fn physical_block_ids(&self, allocator: &CpuGpuBlockAllocator) -> Vec<SlotId> {
        self.blocks.iter().map(|h| allocator.block_slot(*h)).collect()
    }

    /// Total token slots currently filled across the table.
    pub fn num_full_slots(&self, allocator: &CpuGpuBlockAllocator) -> usize {
        self.blocks
            .iter()
            .map(|h| allocator.arena().get(*h).token_ids().len())
            .sum()
    }

    pub fn handles(&self) -> &[BlockHandle] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Rebuild this table from pre-allocated handles (used by swaps).
    pub fn replace_blocks(&mut self, blocks: Vec<BlockHandle>) {
        self.blocks = blocks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cpu_gpu::AllocatorKind;

    fn allocator(kind: AllocatorKind, block_size: usize) -> CpuGpuBlockAllocator {
        CpuGpuBlockAllocator::new(kind, block_size, 16, 16)
    }

    #[test]
    fn test_num_required_blocks() {
        assert_eq!(BlockTable::get_num_required_blocks(0, 4), 0);
        assert_eq!(BlockTable::get_num_required_blocks(1, 4), 1);
        assert_eq!(BlockTable::get_num_required_blocks(4, 4), 1);
        assert_eq!(BlockTable::get_num_required_blocks(5, 4), 2);
    }

    #[test]
    fn test_allocate_partitions_tokens() {
        for kind in [AllocatorKind::Naive, AllocatorKind::PrefixCaching] {
            let mut alloc = allocator(kind, 4);
            let mut table = BlockTable::new(4);
            let tokens: Vec<TokenId> = (0..10).collect();
            table.allocate(&mut alloc, &tokens, Device::Gpu).unwrap();

            // 10 tokens at block size 4: two full blocks plus one partial.
            assert_eq!(table.len(), 3);
            assert_eq!(table.num_full_slots(&alloc), 10);
            assert_eq!(alloc.get_num_free_blocks(Device::Gpu), 13);

            let ids = table.physical_block_ids(&alloc);
            assert_eq!(ids.len(), 3);
        }
    }

    #[test]
    fn test_append_crosses_block_boundary() {
        let mut alloc = allocator(AllocatorKind::Naive, 4);
        let mut table = BlockTable::new(4);
        table.allocate(&mut alloc, &[0, 1, 2], Device::Gpu).unwrap();
        assert_eq!(table.len(), 1);

        table.append_token_ids(&mut alloc, &[3, 4]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.num_full_slots(&alloc), 5);

        // Concatenated token ids equal the sequence's token stream.
        let all: Vec<TokenId> = table
            .handles()
            .iter()
            .flat_map(|h| alloc.arena().get(*h).token_ids().to_vec())
            .collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fork_then_free_restores_refcounts() {
        let mut alloc = allocator(AllocatorKind::Naive, 4);
        let mut table = BlockTable::new(4);
        table.allocate(&mut alloc, &[0, 1, 2, 3, 4], Device::Gpu).unwrap();
        let slots = table.physical_block_ids(&alloc);

        let mut child = table.fork(&mut alloc);
        for slot in &slots {
            assert_eq!(alloc.refcount(*slot), 2);
        }

        child.free(&mut alloc);
        for slot in &slots {
            assert_eq!(alloc.refcount(*slot), 1);
        }

        table.free(&mut alloc);
        assert_eq!(alloc.get_num_free_blocks(Device::Gpu), 16);
    }

    #[test]
    fn test_free_is_reusable() {
        let mut alloc = allocator(AllocatorKind::Naive, 4);
        let mut table = BlockTable::new(4);
        table.allocate(&mut alloc, &[1, 2, 3, 4], Device::Gpu).unwrap();
        table.free(&mut alloc);
        assert!(table.is_empty());
        assert_eq!(alloc.get_num_free_blocks(Device::Gpu), 16);
    }
}
