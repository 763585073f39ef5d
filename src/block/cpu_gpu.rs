//! Two-tier (GPU + CPU) allocator facade.
//!
//! Holds one allocator per device over disjoint slot ranges — GPU owns
//! `[0, G)`, CPU owns `[G, G + C)` — so any slot id identifies its device
//! and operations on existing blocks route themselves. All logical blocks
//! of both tiers live in a single shared [`BlockArena`].

use std::collections::HashMap;
use std::ops::Range;

use crate::block::arena::{BlockArena, BlockHandle};
use crate::block::naive::NaiveBlockAllocator;
use crate::block::prefix_caching::PrefixCachingBlockAllocator;
use crate::block::{BlockError, Device, SlotId, TokenId};

/// Which allocator flavor backs both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Naive,
    PrefixCaching,
}

#[derive(Debug)]
enum DeviceAllocator {
    Naive(NaiveBlockAllocator),
    Prefix(PrefixCachingBlockAllocator),
}

impl DeviceAllocator {
    fn new(kind: AllocatorKind, block_size: usize, slots: Range<SlotId>) -> Self {
        match kind {
            AllocatorKind::Naive => Self::Naive(NaiveBlockAllocator::new(block_size, slots)),
            AllocatorKind::PrefixCaching => {
                Self::Prefix(PrefixCachingBlockAllocator::new(block_size, slots))
            }
        }
    }

    fn allocate_mutable(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
    ) -> Result<BlockHandle, BlockError> {
        match self {
            Self::Naive(a) => a.allocate_mutable(arena, prev),
            Self::Prefix(a) => a.allocate_mutable(arena, prev),
        }
    }

    fn allocate_immutable(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
    ) -> Result<BlockHandle, BlockError> {
        match self {
            Self::Naive(a) => a.allocate_immutable(arena, prev, token_ids),
            Self::Prefix(a) => a.allocate_immutable(arena, prev, token_ids),
        }
    }

    fn share_slot(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
        slot: SlotId,
    ) -> BlockHandle {
        match self {
            Self::Naive(a) => a.share_slot(arena, prev, token_ids, slot),
            Self::Prefix(a) => a.share_slot(arena, prev, token_ids, slot),
        }
    }

    fn free(&mut self, arena: &mut BlockArena, handle: BlockHandle) {
        match self {
            Self::Naive(a) => a.free(arena, handle),
            Self::Prefix(a) => a.free(arena, handle),
        }
    }

    fn fork(&mut self, arena: &mut BlockArena, last: BlockHandle) -> Vec<BlockHandle> {
        match self {
            Self::Naive(a) => a.fork(arena, last),
            Self::Prefix(a) => a.fork(arena, last),
        }
    }

    fn append_token_ids(
        &mut self,
        arena: &mut BlockArena,
        handle: BlockHandle,
        token_ids: &[TokenId],
    ) -> Result<(), BlockError> {
        match self {
            Self::Naive(a) => a.append_token_ids(arena, handle, token_ids),
            Self::Prefix(a) => a.append_token_ids(arena, handle, token_ids),
        }
    }

    fn clear_cows(&mut self) -> HashMap<SlotId, Vec<SlotId>> {
        match self {
            Self::Naive(a) => a.clear_cows(),
            Self::Prefix(a) => a.clear_cows(),
        }
    }

    fn get_num_free_blocks(&self) -> usize {
        match self {
            Self::Naive(a) => a.get_num_free_blocks(),
            Self::Prefix(a) => a.get_num_free_blocks(),
        }
    }

    fn refcount(&self, slot: SlotId) -> u32 {
        match self {
            Self::Naive(a) => a.refcount(slot),
            Self::Prefix(a) => a.refcount(slot),
        }
    }

    fn mark_accessed(&mut self, slots: &[SlotId], now: u64) {
        if let Self::Prefix(a) = self {
            a.mark_accessed(slots, now);
        }
    }

    fn mark_computed(&mut self, slot: SlotId) {
        if let Self::Prefix(a) = self {
            a.mark_computed(slot);
        }
    }

    fn common_computed_block_ids(&self, seq_slot_lists: &[Vec<SlotId>]) -> Vec<SlotId> {
        match self {
            // Only meaningful with prefix caching.
            Self::Naive(_) => Vec::new(),
            Self::Prefix(a) => a.common_computed_block_ids(seq_slot_lists),
        }
    }
}

#[derive(Debug)]
pub struct CpuGpuBlockAllocator {
    arena: BlockArena,
    gpu: DeviceAllocator,
    cpu: DeviceAllocator,
    num_gpu_blocks: usize,
}

impl CpuGpuBlockAllocator {
    pub fn new(
        kind: AllocatorKind,
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
    ) -> Self {
        let gpu_slots = 0..num_gpu_blocks as SlotId;
        let cpu_slots = num_gpu_blocks as SlotId..(num_gpu_blocks + num_cpu_blocks) as SlotId;
        Self {
            arena: BlockArena::new(),
            gpu: DeviceAllocator::new(kind, block_size, gpu_slots),
            cpu: DeviceAllocator::new(kind, block_size, cpu_slots),
            num_gpu_blocks,
        }
    }

    pub fn device_of_slot(&self, slot: SlotId) -> Device {
        if (slot as usize) < self.num_gpu_blocks {
            Device::Gpu
        } else {
            Device::Cpu
        }
    }

    fn allocator(&mut self, device: Device) -> &mut DeviceAllocator {
        match device {
            Device::Gpu => &mut self.gpu,
            Device::Cpu => &mut self.cpu,
        }
    }

    fn allocator_of_handle(&mut self, handle: BlockHandle) -> (&mut DeviceAllocator, &mut BlockArena) {
        let slot = self.arena.get(handle).slot().expect("block has no slot");
        let allocator = if (slot as usize) < self.num_gpu_blocks {
            &mut self.gpu
        } else {
            &mut self.cpu
        };
        (allocator, &mut self.arena)
    }

    pub fn allocate_mutable(
        &mut self,
        prev: Option<BlockHandle>,
        device: Device,
    ) -> Result<BlockHandle, BlockError> {
        match device {
            Device::Gpu => self.gpu.allocate_mutable(&mut self.arena, prev),
            Device::Cpu => self.cpu.allocate_mutable(&mut self.arena, prev),
        }
    }

    pub fn allocate_immutable(
        &mut self,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
        device: Device,
    ) -> Result<BlockHandle, BlockError> {
        match device {
            Device::Gpu => self.gpu.allocate_immutable(&mut self.arena, prev, token_ids),
            Device::Cpu => self.cpu.allocate_immutable(&mut self.arena, prev, token_ids),
        }
    }

    /// Bind a new logical block to an already-referenced slot on whichever
    /// device owns it.
    pub fn share_slot(
        &mut self,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
        slot: SlotId,
    ) -> BlockHandle {
        match self.device_of_slot(slot) {
            Device::Gpu => self.gpu.share_slot(&mut self.arena, prev, token_ids, slot),
            Device::Cpu => self.cpu.share_slot(&mut self.arena, prev, token_ids, slot),
        }
    }

    /// Free a block, routed by its slot id.
    pub fn free(&mut self, handle: BlockHandle) {
        let (allocator, arena) = self.allocator_of_handle(handle);
        allocator.free(arena, handle);
    }

    /// Fork the chain ending at `last` on the device owning it.
    pub fn fork(&mut self, last: BlockHandle) -> Vec<BlockHandle> {
        let (allocator, arena) = self.allocator_of_handle(last);
        allocator.fork(arena, last)
    }

    pub fn append_token_ids(
        &mut self,
        handle: BlockHandle,
        token_ids: &[TokenId],
    ) -> Result<(), BlockError> {
        let (allocator, arena) = self.allocator_of_handle(handle);
        allocator.append_token_ids(arena, handle, token_ids)
    }

    /// Drain pending copy-on-write mappings from both tiers.
    pub fn clear_cows(&mut self) -> HashMap<SlotId, Vec<SlotId>> {
        let mut cows = self.gpu.clear_cows();
        for (src, dsts) in self.cpu.clear_cows() {
            cows.entry(src).or_default().extend(dsts);
        }
        cows
    }

    pub fn get_num_free_blocks(&self, device: Device) -> usize {
        match device {
            Device::Gpu => self.gpu.get_num_free_blocks(),
            Device::Cpu => self.cpu.get_num_free_blocks(),
        }
    }

    pub fn refcount(&self, slot: SlotId) -> u32 {
        match self.device_of_slot(slot) {
            Device::Gpu => self.gpu.refcount(slot),
            Device::Cpu => self.cpu.refcount(slot),
        }
    }

    /// Longest common computed prefix across per-sequence GPU slot lists.
    pub fn get_common_computed_block_ids(&self, seq_slot_lists: &[Vec<SlotId>]) -> Vec<SlotId> {
        self.gpu.common_computed_block_ids(seq_slot_lists)
    }

    pub fn mark_computed(&mut self, slot: SlotId) {
        let device = self.device_of_slot(slot);
        self.allocator(device).mark_computed(slot);
    }

    pub fn mark_accessed(&mut self, slots: &[SlotId], now: u64) {
        // Access stamps only matter on the GPU tier, where eviction runs.
        self.gpu.mark_accessed(slots, now);
    }

    pub fn arena(&self) -> &BlockArena {
        &self.arena
    }

    /// The physical slot currently backing `handle`.
    pub fn block_slot(&self, handle: BlockHandle) -> SlotId {
        self.arena.get(handle).slot().expect("block has no slot")
    }

    pub fn block_token_ids(&self, handle: BlockHandle) -> &[TokenId] {
        self.arena.get(handle).token_ids()
    }
}
