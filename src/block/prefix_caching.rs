//! Content-addressed block allocator with prefix reuse.
//!
//! Full blocks are identified by a hash over their token ids and their
//! predecessor's hash, so identical prefixes across sequences bind to the
//! same physical slots. Slots whose refcount drops to zero keep their
//! content and are parked in the [`LruEvictor`]; an allocation with a
//! matching hash revives them for free, and the fallback path reclaims
//! them once the never-used free list runs out.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Range;

use tracing::trace;

use crate::block::arena::{BlockArena, BlockData, BlockHandle, BlockVariant};
use crate::block::evictor::LruEvictor;
use crate::block::refcount::RefCounter;
use crate::block::{BlockError, CowTracker, SlotId, TokenId};

/// Content hash of a full block.
///
/// Collisions are treated as identity, so the hash must be stable and
/// well-distributed; the default SipHash-backed hasher qualifies.
pub fn hash_block_tokens(is_first_block: bool, prev_block_hash: Option<u64>, token_ids: &[TokenId]) -> u64 {
    let mut hasher = DefaultHasher::new();
    is_first_block.hash(&mut hasher);
    prev_block_hash.hash(&mut hasher);
    token_ids.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
pub struct PrefixCachingBlockAllocator {
    block_size: usize,
    /// Slots that have never held cached content (or were recycled after
    /// losing it).
    free_list: VecDeque<SlotId>,
    refcounter: RefCounter,
    /// Content hash -> canonical slot. Every slot in here is either live
    /// (refcount > 0) or parked in the evictor.
    cached_blocks: HashMap<u64, SlotId>,
    evictor: LruEvictor,
    cows: CowTracker,
    /// Slots whose KV content the executor has already filled in.
    computed: HashSet<SlotId>,
    /// Last-access stamps. The scheduler's step clock is the only time
    /// source; a slot never scheduled since allocation reads as oldest.
    access_time: HashMap<SlotId, u64>,
}

impl PrefixCachingBlockAllocator {
    pub fn new(block_size: usize, slots: Range<SlotId>) -> Self {
        Self {
            block_size,
            free_list: slots.clone().collect(),
            refcounter: RefCounter::new(slots),
            cached_blocks: HashMap::new(),
            evictor: LruEvictor::new(),
            cows: CowTracker::new(),
            computed: HashSet::new(),
            access_time: HashMap::new(),
        }
    }

    /// Allocate an empty, appendable block. It stays hashless until it
    /// fills and gets promoted.
    pub fn allocate_mutable(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
    ) -> Result<BlockHandle, BlockError> {
        let slot = self.allocate_slot()?;
        Ok(arena.insert(BlockData::new(
            prev,
            self.block_size,
            slot,
            BlockVariant::PrefixAware { content_hash: None, num_hashed_tokens: 0 },
        )))
    }

    /// Allocate a full block, reusing a cached slot when one already holds
    /// identical content in an identical chain position.
    pub fn allocate_immutable(
        &mut self,
        arena: &mut BlockArena,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
    ) -> Result<BlockHandle, BlockError> {
        assert_eq!(token_ids.len(), self.block_size, "immutable blocks must be full");
        let (hash, num_hashed) = self.chain_hash(arena, prev, token_ids);

        let slot = if let Some(&cached) = self.cached_blocks.get(&hash) {
            if self.refcounter.get(cached) == 0 {
                self.evictor.remove(hash);
            }
            self.refcounter.incr(cached);
            trace!(hash, slot = cached, "prefix cache hit");
            cached
        } else {
            let slot = self.allocate_slot()?;
            self.cached_blocks.insert(hash, slot);
            slot
        };

        let handle = arena.insert(BlockData::new(
            prev,
            self.block_size,
            slot,
            BlockVariant::PrefixAware { content_hash: Some(hash), num_hashed_tokens: num_hashed },
        ));
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

        let variant = if token_ids.len() == self.block_size
            && prev.is_none_or(|p| arena.get(p).content_hash().is_some())
        {
            let (hash, num_hashed) = self.chain_hash(arena, prev, token_ids);
            BlockVariant::PrefixAware { content_hash: Some(hash), num_hashed_tokens: num_hashed }
        } else {
            BlockVariant::PrefixAware { content_hash: None, num_hashed_tokens: 0 }
        };

        let handle = arena.insert(BlockData::new(prev, self.block_size, slot, variant));
        arena.get_mut(handle).append_token_ids(token_ids);
        handle
    }

    /// Release a logical block. A hashed slot parks in the evictor when
    /// its last reference drops; a hashless one returns to the free list.
    pub fn free(&mut self, arena: &mut BlockArena, handle: BlockHandle) {
        let data = arena.remove(handle);
        let slot = data.slot().expect("freeing a block with no slot");
        let parked = data.content_hash().map(|h| (h, data.num_hashed_tokens()));
        self.release_slot(slot, parked);
    }

    /// Duplicate the chain ending at `last`, sharing every slot.
    pub fn fork(&mut self, arena: &mut BlockArena, last: BlockHandle) -> Vec<BlockHandle> {
        let source = arena.chain(last);
        let mut forked = Vec::with_capacity(source.len());
        let mut prev = None;
        for handle in source {
            let (slot, token_ids, variant) = {
                let data = arena.get(handle);
                (
                    data.slot().expect("forking a block with no slot"),
                    data.token_ids().to_vec(),
                    BlockVariant::PrefixAware {
                        content_hash: data.content_hash(),
                        num_hashed_tokens: data.num_hashed_tokens(),
                    },
                )
            };
            let refcount = self.refcounter.incr(slot);
            assert!(refcount >= 2, "cannot fork a freed block");

            let new_handle = arena.insert(BlockData::new(prev, self.block_size, slot, variant));
            arena.get_mut(new_handle).append_token_ids(&token_ids);
            forked.push(new_handle);
            prev = Some(new_handle);
        }
        forked
    }

    /// Append token ids to a block: copy-on-write first when its slot is
    /// shared, then promote the block into the cache if it just filled.
    pub fn append_token_ids(
        &mut self,
        arena: &mut BlockArena,
        handle: BlockHandle,
        token_ids: &[TokenId],
    ) -> Result<(), BlockError> {
        let slot = arena.get(handle).slot().expect("appending to a block with no slot");
        let writable = self.cow_if_not_appendable(slot)?;
        {
            let data = arena.get_mut(handle);
            data.set_slot(Some(writable));
            data.append_token_ids(token_ids);
        }
        if arena.get(handle).is_full() {
            self.promote_if_full(arena, handle);
        }
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
        // Shared partial slots carry no hash, so the source stays live
        // for the other holders and never parks here.
        self.refcounter.decr(slot);
        let dst = self.allocate_slot()?;
        self.cows.record(slot, dst);
        Ok(dst)
    }

    /// Hash a block that just became full and register it in the cache.
    ///
    /// If the cache already binds the hash to a different live slot, this
    /// holder is redirected onto the canonical slot, its private slot is
    /// released, and the `(old, canonical)` copy is recorded.
    pub fn promote_if_full(&mut self, arena: &mut BlockArena, handle: BlockHandle) -> Option<(SlotId, SlotId)> {
        let (prev, token_ids, my_slot) = {
            let data = arena.get(handle);
            assert!(data.is_full(), "promoting a block that is not full");
            (data.prev(), data.token_ids().to_vec(), data.slot().expect("promoting a slotless block"))
        };
        let (hash, num_hashed) = self.chain_hash(arena, prev, &token_ids);
        arena.get_mut(handle).set_content_hash(hash, num_hashed);

        match self.cached_blocks.get(&hash).copied() {
            Some(cached) if cached != my_slot => {
                if self.refcounter.get(cached) == 0 {
                    self.evictor.remove(hash);
                }
                self.refcounter.incr(cached);
                arena.get_mut(handle).set_slot(Some(cached));
                // The appender's slot was private (post-CoW), so this
                // release returns it to the free list.
                self.release_slot(my_slot, None);
                self.cows.record(my_slot, cached);
                trace!(hash, old = my_slot, slot = cached, "promoted block redirected to cached slot");
                Some((my_slot, cached))
            }
            Some(_) => None,
            None => {
                self.cached_blocks.insert(hash, my_slot);
                None
            }
        }
    }

    /// Drain the pending copy-on-write map.
    pub fn clear_cows(&mut self) -> HashMap<SlotId, Vec<SlotId>> {
        self.cows.clear_cows()
    }

    /// Free capacity counts parked slots: they are reclaimable on demand.
    pub fn get_num_free_blocks(&self) -> usize {
        self.free_list.len() + self.evictor.num_blocks()
    }

    pub fn refcount(&self, slot: SlotId) -> u32 {
        self.refcounter.get(slot)
    }

    /// Stamp the last-access time of `slots` with the scheduler's step
    /// clock. This is the sole writer of access stamps, so stamps from
    /// allocation and from decode steps stay comparable.
    pub fn mark_accessed(&mut self, slots: &[SlotId], now: u64) {
        for &slot in slots {
            self.access_time.insert(slot, now);
        }
    }

    /// Record that the executor has filled in the KV content of `slot`.
    pub fn mark_computed(&mut self, slot: SlotId) {
        self.computed.insert(slot);
    }

    pub fn is_computed(&self, slot: SlotId) -> bool {
        self.computed.contains(&slot)
    }

    /// Longest common prefix of the given per-sequence slot lists,
    /// restricted to slots already marked computed.
    ///
    /// Marking is lazy (only the last full block per sequence is
    /// stamped), so each list is first truncated at its last computed
    /// slot, everything before which is computed by construction.
    pub fn common_computed_block_ids(&self, seq_slot_lists: &[Vec<SlotId>]) -> Vec<SlotId> {
        let truncated: Vec<&[SlotId]> = seq_slot_lists
            .iter()
            .map(|slots| {
                match slots.iter().rposition(|s| self.is_computed(*s)) {
                    Some(last) => &slots[..=last],
                    None => &slots[..0],
                }
            })
            .filter(|slots| !slots.is_empty())
            .collect();

        let Some(first) = truncated.first() else {
            return Vec::new();
        };
        let mut common = first.len();
        for other in &truncated[1..] {
            let matched = first
                .iter()
                .zip(other.iter())
                .take_while(|(a, b)| a == b)
                .count();
            common = common.min(matched);
        }
        first[..common].to_vec()
    }

    fn chain_hash(
        &self,
        arena: &BlockArena,
        prev: Option<BlockHandle>,
        token_ids: &[TokenId],
    ) -> (u64, usize) {
        let (is_first, prev_hash, prev_hashed) = match prev {
            None => (true, None, 0),
            Some(p) => {
                let data = arena.get(p);
                let hash = data.content_hash().expect("predecessor has no content hash");
                (false, Some(hash), data.num_hashed_tokens())
            }
        };
        (
            hash_block_tokens(is_first, prev_hash, token_ids),
            prev_hashed + token_ids.len(),
        )
    }

    /// Find a physical slot for novel content: the free list first, then
    /// the evictor, otherwise fail.
    fn allocate_slot(&mut self) -> Result<SlotId, BlockError> {
        let slot = if let Some(slot) = self.free_list.pop_front() {
            slot
        } else if let Some(stale_hash) = self.evictor.evict() {
            let slot = self
                .cached_blocks
                .remove(&stale_hash)
                .expect("evicted hash missing from prefix cache index");
            self.computed.remove(&slot);
            trace!(hash = stale_hash, slot, "evicted cached block");
            slot
        } else {
            return Err(BlockError::NoFreeBlocks);
        };
        let refcount = self.refcounter.incr(slot);
        debug_assert_eq!(refcount, 1);
        // The slot starts a new life; any stamp from its previous content
        // no longer applies.
        self.access_time.remove(&slot);
        Ok(slot)
    }

    fn release_slot(&mut self, slot: SlotId, parked: Option<(u64, usize)>) {
        if self.refcounter.decr(slot) > 0 {
            return;
        }
        match parked {
            Some((hash, num_hashed)) if self.cached_blocks.get(&hash) == Some(&slot) => {
                let last_access = self.access_time.get(&slot).copied().unwrap_or(0);
                self.evictor.add(hash, num_hashed, last_access);
            }
            _ => {
                self.computed.remove(&slot);
                self.free_list.push_back(slot);
            }
        }
    }
}
