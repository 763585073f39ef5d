//! Mapping between sequences and physical KV blocks.
//!
//! The block space manager is the surface the scheduler talks to: it
//! answers admission questions (`can_allocate`, `can_append_slot`,
//! `can_swap_*`), mutates per-sequence block tables, and plans the swap
//! and copy work the executor must perform before the next model step.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::block::block_table::BlockTable;
use crate::block::cpu_gpu::{AllocatorKind, CpuGpuBlockAllocator};
use crate::block::{BlockError, Device, SlotId};
use crate::config::CacheConfig;
use crate::sequence::{SeqId, Sequence, SequenceGroup, SequenceStatus};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// The group fits right now.
    Ok,
    /// The group fits on an empty device but not at the moment.
    Later,
    /// The group can never fit; reject it.
    Never,
}

#[derive(Debug)]
pub struct BlockSpaceManager {
    block_size: usize,
    num_total_gpu_blocks: usize,
    watermark_blocks: usize,
    block_sliding_window: Option<usize>,
    enable_caching: bool,
    allocator: CpuGpuBlockAllocator,
    block_tables: HashMap<SeqId, BlockTable>,
}

impl BlockSpaceManager {
    pub fn new(cache_config: &CacheConfig) -> Self {
        let block_size = cache_config.block_size;
        let block_sliding_window = cache_config.sliding_window.map(|window| {
            assert_eq!(window % block_size, 0, "sliding window must align to block size");
            window / block_size
        });
        let kind = if cache_config.enable_prefix_caching {
            AllocatorKind::PrefixCaching
        } else {
            AllocatorKind::Naive
        };
        Self {
            block_size,
            num_total_gpu_blocks: cache_config.num_gpu_blocks,
            watermark_blocks: cache_config.watermark_blocks(),
            block_sliding_window,
            enable_caching: cache_config.enable_prefix_caching,
            allocator: CpuGpuBlockAllocator::new(
                kind,
                block_size,
                cache_config.num_gpu_blocks,
                cache_config.num_cpu_blocks,
            ),
            block_tables: HashMap::new(),
        }
    }

    /// Admission check for a waiting group's prompt.
    pub fn can_allocate(&self, seq_group: &SequenceGroup) -> AllocStatus {
        // All sequences in a waiting group share the prompt, so the first
        // one determines the requirement.
        let seq = seq_group.get_seqs(Some(SequenceStatus::Waiting))[0];
        let mut num_required =
            BlockTable::get_num_required_blocks(seq.get_len(), self.block_size);
        if let Some(window_blocks) = self.block_sliding_window {
            num_required = num_required.min(window_blocks);
        }

        let num_free = self.allocator.get_num_free_blocks(Device::Gpu);
        // The watermark keeps a reserve so admission does not immediately
        // thrash the prefix cache.
        if self.num_total_gpu_blocks < num_required + self.watermark_blocks {
            AllocStatus::Never
        } else if num_free >= num_required + self.watermark_blocks {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Allocate block tables for every waiting sequence of the group: one
    /// real allocation, the rest are forks sharing the same slots.
    pub fn allocate(&mut self, seq_group: &SequenceGroup) -> Result<(), BlockError> {
        let waiting = seq_group.get_seqs(Some(SequenceStatus::Waiting));
        for seq in &waiting {
            assert!(
                !self.block_tables.contains_key(&seq.seq_id),
                "block table already exists for seq {}",
                seq.seq_id
            );
        }

        let first = waiting[0];
        let mut table = BlockTable::new(self.block_size);
        table.allocate(&mut self.allocator, &first.data.get_token_ids(), Device::Gpu)?;
        for seq in &waiting[1..] {
            let forked = table.fork(&mut self.allocator);
            self.block_tables.insert(seq.seq_id, forked);
        }
        self.block_tables.insert(first.seq_id, table);
        debug!(
            request_id = %seq_group.request_id,
            num_seqs = waiting.len(),
            "allocated block tables"
        );
        Ok(())
    }

    pub fn has_block_table(&self, seq_id: SeqId) -> bool {
        self.block_tables.contains_key(&seq_id)
    }

    /// One free block per running sequence is enough for a decode step.
    pub fn can_append_slot(&self, seq_group: &SequenceGroup) -> bool {
        let num_seqs = seq_group.num_seqs(Some(SequenceStatus::Running));
        num_seqs <= self.allocator.get_num_free_blocks(Device::Gpu)
    }

    /// Make room for the sequence's newly sampled token.
    ///
    /// Returns a `(src, dst)` copy hint when the append had to
    /// copy-on-write a shared slot, or when filling the last block
    /// promoted it onto an already-cached slot.
    pub fn append_slot(&mut self, seq: &Sequence) -> Result<Option<(SlotId, SlotId)>, BlockError> {
        let table = self
            .block_tables
            .get_mut(&seq.seq_id)
            .expect("appending to a sequence with no block table");
        let stored = table.num_full_slots(&self.allocator);
        let token_ids = seq.data.get_token_ids();
        if stored == token_ids.len() {
            // No sampled token has landed since the last append.
            return Ok(None);
        }

        table.append_token_ids(&mut self.allocator, &token_ids[stored..])?;

        let mut pairs: Vec<(SlotId, SlotId)> = self
            .allocator
            .clear_cows()
            .into_iter()
            .flat_map(|(src, dsts)| dsts.into_iter().map(move |dst| (src, dst)))
            .collect();
        Ok(match pairs.len() {
            0 => None,
            1 => Some(pairs[0]),
            _ => {
                // A copy-on-write immediately followed by a promotion
                // redirect chains two copies; collapse to source-to-final.
                pairs.sort_unstable();
                let (a, b) = (pairs[0], pairs[1]);
                if a.1 == b.0 {
                    Some((a.0, b.1))
                } else if b.1 == a.0 {
                    Some((b.0, a.1))
                } else {
                    Some(a)
                }
            }
        })
    }

    /// Duplicate the parent's block table for a forked child sequence.
    pub fn fork(&mut self, parent_seq_id: SeqId, child_seq_id: SeqId) {
        let forked = self
            .block_tables
            .get(&parent_seq_id)
            .expect("forking a sequence with no block table")
            .fork(&mut self.allocator);
        let previous = self.block_tables.insert(child_seq_id, forked);
        assert!(previous.is_none(), "child sequence already had a block table");
    }

    /// Unique physical slots currently held by the group's live sequences.
    fn get_physical_slots(&self, seq_group: &SequenceGroup) -> Vec<SlotId> {
        let mut slots = HashSet::new();
        for seq in seq_group.get_seqs(None) {
            if seq.is_finished() {
                continue;
            }
            if let Some(table) = self.block_tables.get(&seq.seq_id) {
                slots.extend(table.physical_block_ids(&self.allocator));
            }
        }
        slots.into_iter().collect()
    }

    pub fn can_swap_in(&self, seq_group: &SequenceGroup) -> bool {
        let blocks = self.get_physical_slots(seq_group);
        let num_swapped = seq_group.num_seqs(Some(SequenceStatus::Swapped));
        // Every swapped sequence allocates at least one block right after
        // swap-in; mirror can_append_slot.
        let num_required = blocks.len() + num_swapped;
        self.allocator.get_num_free_blocks(Device::Gpu) >= num_required + self.watermark_blocks
    }

    /// Move the group's blocks CPU -> GPU. Returns the slot mapping the
    /// executor must copy.
    pub fn swap_in(&mut self, seq_group: &SequenceGroup) -> Result<HashMap<SlotId, SlotId>, BlockError> {
        self.swap(seq_group, SequenceStatus::Swapped, Device::Gpu)
    }

    pub fn can_swap_out(&self, seq_group: &SequenceGroup) -> bool {
        let blocks = self.get_physical_slots(seq_group);
        blocks.len() <= self.allocator.get_num_free_blocks(Device::Cpu)
    }

    /// Move the group's blocks GPU -> CPU. Returns the slot mapping the
    /// executor must copy.
    pub fn swap_out(&mut self, seq_group: &SequenceGroup) -> Result<HashMap<SlotId, SlotId>, BlockError> {
        self.swap(seq_group, SequenceStatus::Running, Device::Cpu)
    }

    fn swap(
        &mut self,
        seq_group: &SequenceGroup,
        from_status: SequenceStatus,
        to_device: Device,
    ) -> Result<HashMap<SlotId, SlotId>, BlockError> {
        let mut mapping: HashMap<SlotId, SlotId> = HashMap::new();
        let seq_ids: Vec<SeqId> = seq_group
            .get_seqs(Some(from_status))
            .iter()
            .map(|s| s.seq_id)
            .collect();

        for seq_id in seq_ids {
            let table = self
                .block_tables
                .get_mut(&seq_id)
                .expect("swapping a sequence with no block table");
            let old_handles = table.handles().to_vec();
            let mut new_handles = Vec::with_capacity(old_handles.len());
            let mut prev = None;

            for handle in old_handles {
                let src_slot = self.allocator.block_slot(handle);
                let token_ids = self.allocator.block_token_ids(handle).to_vec();

                let new_handle = if let Some(&dst_slot) = mapping.get(&src_slot) {
                    // Sibling sequences sharing a slot keep sharing the
                    // swapped copy.
                    self.allocator.share_slot(prev, &token_ids, dst_slot)
                } else {
                    let handle = if token_ids.len() == self.block_size {
                        self.allocator.allocate_immutable(prev, &token_ids, to_device)?
                    } else {
                        let handle = self.allocator.allocate_mutable(prev, to_device)?;
                        self.allocator.append_token_ids(handle, &token_ids)?;
                        handle
                    };
                    mapping.insert(src_slot, self.allocator.block_slot(handle));
                    handle
                };

                self.allocator.free(handle);
                new_handles.push(new_handle);
                prev = Some(new_handle);
            }
            table.replace_blocks(new_handles);
        }

        debug!(
            request_id = %seq_group.request_id,
            num_blocks = mapping.len(),
            to = %to_device,
            "planned swap"
        );
        Ok(mapping)
    }

    /// Drop a sequence's block table. Idempotent.
    pub fn free(&mut self, seq_id: SeqId) {
        if let Some(mut table) = self.block_tables.remove(&seq_id) {
            table.free(&mut self.allocator);
        }
    }

    /// Physical slot list backing a sequence, in chain order.
    pub fn get_block_table(&self, seq_id: SeqId) -> Vec<SlotId> {
        self.block_tables
            .get(&seq_id)
            .expect("sequence has no block table")
            .physical_block_ids(&self.allocator)
    }

    /// Stamp last-access time on all of a sequence's slots.
    pub fn access_all_blocks_in_seq(&mut self, seq_id: SeqId, now: u64) {
        if let Some(table) = self.block_tables.get(&seq_id) {
            let slots = table.physical_block_ids(&self.allocator);
            self.allocator.mark_accessed(&slots, now);
        }
    }

    /// Lazily mark each sequence's deepest full block as computed; blocks
    /// before it are computed by construction.
    pub fn mark_blocks_as_computed(&mut self, seq_group: &SequenceGroup) {
        if !self.enable_caching {
            return;
        }
        for seq in seq_group.get_seqs(None) {
            let Some(table) = self.block_tables.get(&seq.seq_id) else {
                continue;
            };
            let num_full_blocks = seq.get_len() / self.block_size;
            if num_full_blocks == 0 {
                continue;
            }
            if let Some(handle) = table.handles().get(num_full_blocks - 1) {
                let slot = self.allocator.block_slot(*handle);
                self.allocator.mark_computed(slot);
            }
        }
    }

    /// Computed blocks shared by every sequence of the group; prefill can
    /// skip them. Empty unless prefix caching is enabled.
    pub fn get_common_computed_block_ids(&self, seq_group: &SequenceGroup) -> Vec<SlotId> {
        if !self.enable_caching {
            return Vec::new();
        }
        let lists: Vec<Vec<SlotId>> = seq_group
            .get_seqs(None)
            .iter()
            .filter_map(|seq| {
                self.block_tables
                    .get(&seq.seq_id)
                    .map(|t| t.physical_block_ids(&self.allocator))
            })
            .collect();
        self.allocator.get_common_computed_block_ids(&lists)
    }

    pub fn get_num_free_gpu_blocks(&self) -> usize {
        self.allocator.get_num_free_blocks(Device::Gpu)
    }

    pub fn get_num_free_cpu_blocks(&self) -> usize {
        self.allocator.get_num_free_blocks(Device::Cpu)
    }

    /// Read-only allocator access for invariant checks.
    pub fn allocator(&self) -> &CpuGpuBlockAllocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingParams;
    use std::time::Instant;

    fn manager(block_size: usize, num_gpu: usize, num_cpu: usize, watermark: f64) -> BlockSpaceManager {
        BlockSpaceManager::new(&CacheConfig {
            block_size,
            num_gpu_blocks: num_gpu,
            num_cpu_blocks: num_cpu,
            watermark,
            sliding_window: None,
            enable_prefix_caching: false,
        })
    }

    fn prompt_group(request_id: &str, seq_id: SeqId, prompt_len: usize, block_size: usize) -> SequenceGroup {
        let prompt: Vec<u32> = (0..prompt_len as u32).collect();
        SequenceGroup::new(
            request_id,
            "prompt",
            vec![Sequence::new(seq_id, prompt, block_size)],
            SamplingParams::default(),
            Instant::now(),
        )
    }

    #[test]
    fn test_can_allocate_watermark_sweep() {
        let num_gpu = 8;
        let watermark = 0.5;
        let mgr = manager(16, num_gpu, 16, watermark);
        let watermark_blocks = (watermark * num_gpu as f64) as usize;

        for num_prompt_blocks in 1..num_gpu {
            let group = prompt_group("r", num_prompt_blocks as SeqId, 16 * num_prompt_blocks, 16);
            let expected = if num_gpu < num_prompt_blocks + watermark_blocks {
                AllocStatus::Never
            } else {
                AllocStatus::Ok
            };
            assert_eq!(mgr.can_allocate(&group), expected, "blocks={num_prompt_blocks}");
        }
    }

    #[test]
    fn test_later_when_device_is_busy() {
        let mut mgr = manager(4, 4, 4, 0.0);
        let first = prompt_group("a", 0, 12, 4);
        assert_eq!(mgr.can_allocate(&first), AllocStatus::Ok);
        mgr.allocate(&first).unwrap();

        // 3 of 4 blocks taken: a 2-block prompt must wait, not die.
        let second = prompt_group("b", 1, 8, 4);
        assert_eq!(mgr.can_allocate(&second), AllocStatus::Later);
    }

    #[test]
    fn test_append_slot_consumes_block_on_boundary() {
        let mut mgr = manager(4, 8, 0, 0.0);
        let mut group = prompt_group("a", 0, 4, 4);
        mgr.allocate(&group).unwrap();
        group.seqs[0].status = SequenceStatus::Running;
        assert_eq!(mgr.get_num_free_gpu_blocks(), 7);

        // Token 5 starts a new logical block.
        group.seqs[0].append_token_id(99, HashMap::from([(99, 0.0)]));
        let hint = mgr.append_slot(&group.seqs[0]).unwrap();
        assert!(hint.is_none());
        assert_eq!(mgr.get_num_free_gpu_blocks(), 6);
        assert_eq!(mgr.get_block_table(0).len(), 2);
    }

    #[test]
    fn test_append_slot_cow_on_forked_sequence() {
        let mut mgr = manager(4, 8, 0, 0.0);
        let mut group = prompt_group("a", 0, 3, 4);
        mgr.allocate(&group).unwrap();
        group.seqs[0].status = SequenceStatus::Running;

        // Fork the child, then have the parent write into the shared
        // partial block.
        let child = group.seqs[0].fork(1);
        mgr.fork(0, 1);
        group.seqs.push(child);

        group.seqs[0].append_token_id(7, HashMap::new());
        let (src, dst) = mgr.append_slot(&group.seqs[0]).unwrap().expect("CoW expected");
        assert_ne!(src, dst);
        assert_eq!(mgr.get_block_table(1), vec![src]);
        assert_eq!(mgr.get_block_table(0), vec![dst]);
    }

    #[test]
    fn test_swap_out_and_back_in() {
        let mut mgr = manager(8, 4, 4, 0.0);
        let mut group = prompt_group("a", 0, 7, 8);
        mgr.allocate(&group).unwrap();
        group.seqs[0].status = SequenceStatus::Running;
        group.seqs[0].append_token_id(1, HashMap::new());
        mgr.append_slot(&group.seqs[0]).unwrap();

        let gpu_blocks = mgr.get_block_table(0);
        assert!(mgr.can_swap_out(&group));
        let before_free_gpu = mgr.get_num_free_gpu_blocks();
        let before_free_cpu = mgr.get_num_free_cpu_blocks();

        let mapping = mgr.swap_out(&group).unwrap();
        let mut keys: Vec<SlotId> = mapping.keys().copied().collect();
        keys.sort_unstable();
        let mut expected = gpu_blocks.clone();
        expected.sort_unstable();
        assert_eq!(keys, expected);
        assert_eq!(mgr.get_num_free_gpu_blocks(), before_free_gpu + gpu_blocks.len());
        assert_eq!(mgr.get_num_free_cpu_blocks(), before_free_cpu - gpu_blocks.len());

        group.seqs[0].status = SequenceStatus::Swapped;
        assert!(mgr.can_swap_in(&group));
        let mapping_back = mgr.swap_in(&group).unwrap();
        assert_eq!(mapping_back.len(), gpu_blocks.len());
        assert_eq!(mgr.get_num_free_cpu_blocks(), before_free_cpu);
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut mgr = manager(4, 4, 0, 0.0);
        let group = prompt_group("a", 0, 4, 4);
        mgr.allocate(&group).unwrap();
        assert_eq!(mgr.get_num_free_gpu_blocks(), 3);
        mgr.free(0);
        assert_eq!(mgr.get_num_free_gpu_blocks(), 4);
        mgr.free(0);
        assert_eq!(mgr.get_num_free_gpu_blocks(), 4);
    }
}
