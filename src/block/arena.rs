//! Logical block storage.
//!
//! Logical blocks form predecessor chains (each block points at the block
//! holding the tokens immediately before it). Instead of reference-counted
//! parent pointers, all blocks live in one owning arena and refer to each
//! other through opaque [`BlockHandle`]s: an index plus a generation
//! counter that invalidates handles to freed entries. Walking a chain is
//! a series of arena lookups.

use crate::block::{SlotId, TokenId};

/// Opaque handle to a logical block inside a [`BlockArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: u32,
    generation: u32,
}

/// Distinguishes the two block flavors the allocators produce.
///
/// Prefix-aware blocks additionally carry their content hash once full;
/// naive blocks never hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVariant {
    Naive,
    PrefixAware {
        /// Hash over (first-in-chain, predecessor hash, token ids).
        /// Defined only once the block is full and its predecessor (if
        /// any) has a hash of its own.
        content_hash: Option<u64>,
        /// Tokens covered by the chain up to and including this block.
        num_hashed_tokens: usize,
    },
}

/// One logical block: up to `block_size` token ids, a predecessor link,
/// and (while physically present) the slot backing it.
#[derive(Debug, Clone)]
pub struct BlockData {
    prev: Option<BlockHandle>,
    token_ids: Vec<TokenId>,
    block_size: usize,
    slot: Option<SlotId>,
    variant: BlockVariant,
}

impl BlockData {
    pub fn new(
        prev: Option<BlockHandle>,
        block_size: usize,
        slot: SlotId,
        variant: BlockVariant,
    ) -> Self {
        Self {
            prev,
            token_ids: Vec::with_capacity(block_size),
            block_size,
            slot: Some(slot),
            variant,
        }
    }

    pub fn prev(&self) -> Option<BlockHandle> {
        self.prev
    }

    pub fn token_ids(&self) -> &[TokenId] {
        &self.token_ids
    }

    pub fn num_empty_slots(&self) -> usize {
        self.block_size - self.token_ids.len()
    }

    pub fn is_full(&self) -> bool {
        self.num_empty_slots() == 0
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub fn set_slot(&mut self, slot: Option<SlotId>) {
        self.slot = slot;
    }

    pub fn content_hash(&self) -> Option<u64> {
        match self.variant {
            BlockVariant::Naive => None,
            BlockVariant::PrefixAware { content_hash, .. } => content_hash,
        }
    }

    pub fn num_hashed_tokens(&self) -> usize {
        match self.variant {
            BlockVariant::Naive => 0,
            BlockVariant::PrefixAware { num_hashed_tokens, .. } => num_hashed_tokens,
        }
    }

    /// Stamp the content hash on a prefix-aware block once it fills.
    pub fn set_content_hash(&mut self, hash: u64, hashed_tokens: usize) {
        assert!(self.is_full(), "hashing a block that is not full");
        match &mut self.variant {
            BlockVariant::Naive => panic!("naive blocks do not hash"),
            BlockVariant::PrefixAware {
                content_hash,
                num_hashed_tokens,
            } => {
                *content_hash = Some(hash);
                *num_hashed_tokens = hashed_tokens;
            }
        }
    }

    /// Append token ids without any allocator interaction. The caller is
    /// responsible for copy-on-write and promotion.
    pub fn append_token_ids(&mut self, token_ids: &[TokenId]) {
        assert!(
            token_ids.len() <= self.num_empty_slots(),
            "appending {} tokens into {} empty slots",
            token_ids.len(),
            self.num_empty_slots()
        );
        self.token_ids.extend_from_slice(token_ids);
    }
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    data: Option<BlockData>,
}

/// Owning arena for all logical blocks of one allocator facade.
#[derive(Debug, Default)]
pub struct BlockArena {
    entries: Vec<Entry>,
    vacant: Vec<u32>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: BlockData) -> BlockHandle {
        if let Some(index) = self.vacant.pop() {
            let entry = &mut self.entries[index as usize];
            entry.data = Some(data);
            BlockHandle {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                data: Some(data),
            });
            BlockHandle { index, generation: 0 }
        }
    }

    /// Remove a block, invalidating its handle.
    pub fn remove(&mut self, handle: BlockHandle) -> BlockData {
        let entry = &mut self.entries[handle.index as usize];
        assert_eq!(entry.generation, handle.generation, "stale block handle");
        let data = entry.data.take().expect("removing vacant block entry");
        entry.generation += 1;
        self.vacant.push(handle.index);
        data
    }

    pub fn get(&self, handle: BlockHandle) -> &BlockData {
        let entry = &self.entries[handle.index as usize];
        assert_eq!(entry.generation, handle.generation, "stale block handle");
        entry.data.as_ref().expect("reading vacant block entry")
    }

    pub fn get_mut(&mut self, handle: BlockHandle) -> &mut BlockData {
        let entry = &mut self.entries[handle.index as usize];
        assert_eq!(entry.generation, handle.generation, "stale block handle");
        entry.data.as_mut().expect("reading vacant block entry")
    }

    pub fn contains(&self, handle: BlockHandle) -> bool {
        self.entries
            .get(handle.index as usize)
            .is_some_and(|e| e.generation == handle.generation && e.data.is_some())
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.entries.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the predecessor chain ending at `last`, returned first-to-last.
    pub fn chain(&self, last: BlockHandle) -> Vec<BlockHandle> {
        let mut blocks = vec![last];
        let mut cursor = self.get(last).prev();
        while let Some(handle) = cursor {
            blocks.push(handle);
            cursor = self.get(handle).prev();
        }
        blocks.reverse();
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_block(arena: &mut BlockArena, prev: Option<BlockHandle>, slot: SlotId) -> BlockHandle {
        arena.insert(BlockData::new(prev, 4, slot, BlockVariant::Naive))
    }

    #[test]
    fn test_insert_get_remove() {
        let mut arena = BlockArena::new();
        let handle = naive_block(&mut arena, None, 3);
        assert_eq!(arena.get(handle).slot(), Some(3));
        assert_eq!(arena.len(), 1);

        let data = arena.remove(handle);
        assert_eq!(data.slot(), Some(3));
        assert!(arena.is_empty());
        assert!(!arena.contains(handle));
    }

    #[test]
    #[should_panic(expected = "stale block handle")]
    fn test_stale_handle_is_fault() {
        let mut arena = BlockArena::new();
        let handle = naive_block(&mut arena, None, 0);
        arena.remove(handle);
        // Slot index gets reused with a bumped generation.
        let _replacement = naive_block(&mut arena, None, 1);
        arena.get(handle);
    }

    #[test]
    fn test_chain_walk() {
        let mut arena = BlockArena::new();
        let a = naive_block(&mut arena, None, 0);
        let b = naive_block(&mut arena, Some(a), 1);
        let c = naive_block(&mut arena, Some(b), 2);

        assert_eq!(arena.chain(c), vec![a, b, c]);
        assert_eq!(arena.chain(a), vec![a]);
    }

    #[test]
    fn test_append_and_fill() {
        let mut arena = BlockArena::new();
        let handle = naive_block(&mut arena, None, 0);
        arena.get_mut(handle).append_token_ids(&[1, 2, 3]);
        assert!(!arena.get(handle).is_full());
        arena.get_mut(handle).append_token_ids(&[4]);
        assert!(arena.get(handle).is_full());
        assert_eq!(arena.get(handle).token_ids(), &[1, 2, 3, 4]);
    }
}
