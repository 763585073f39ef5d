//! Eviction policy for cached-but-unreferenced slots.
//!
//! When prefix caching is enabled, a slot whose refcount drops to zero is
//! not returned to the free list: it keeps its content and is parked here
//! so an identical prefix can revive it. The evictor reclaims one slot at
//! a time when the allocator runs dry; the prefix cache index maps the
//! returned content hash back to the physical slot.

/// A parked block, keyed by its content hash.
#[derive(Debug, Clone)]
struct Candidate {
    content_hash: u64,
    num_hashed_tokens: usize,
    last_access: u64,
}

/// Least-recently-used evictor with a deterministic tiebreak.
///
/// Among candidates sharing the minimum `last_access`, the one with the
/// most hashed tokens is evicted first; remaining ties fall back to
/// insertion order. Deeper chain blocks bind to ever more specific
/// prefixes, so they are the least likely to be revived.
#[derive(Debug, Default)]
pub struct LruEvictor {
    // Insertion-ordered. Blocks park here at free time, not access time,
    // so stamps are not sorted and eviction scans the whole list.
    candidates: Vec<Candidate>,
}

impl LruEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a block, making it a candidate for eviction.
    pub fn add(&mut self, content_hash: u64, num_hashed_tokens: usize, last_access: u64) {
        assert!(
            !self.contains(content_hash),
            "hash {content_hash:#x} already parked in evictor"
        );
        self.candidates.push(Candidate {
            content_hash,
            num_hashed_tokens,
            last_access,
        });
    }

    /// Un-park the block for `content_hash` (it is being revived).
    pub fn remove(&mut self, content_hash: u64) {
        let pos = self
            .candidates
            .iter()
            .position(|c| c.content_hash == content_hash)
            .expect("removing a hash that is not in the evictor");
        self.candidates.remove(pos);
    }

    pub fn contains(&self, content_hash: u64) -> bool {
        self.candidates.iter().any(|c| c.content_hash == content_hash)
    }

    /// Pick and remove the eviction victim, returning its content hash,
    /// or `None` if nothing is parked.
    pub fn evict(&mut self) -> Option<u64> {
        if self.candidates.is_empty() {
            return None;
        }
        let mut best = 0;
        for (i, candidate) in self.candidates.iter().enumerate().skip(1) {
            let current = &self.candidates[best];
            if candidate.last_access < current.last_access
                || (candidate.last_access == current.last_access
                    && candidate.num_hashed_tokens > current.num_hashed_tokens)
            {
                best = i;
            }
        }
        Some(self.candidates.remove(best).content_hash)
    }

    pub fn num_blocks(&self) -> usize {
        self.candidates.len()
    }
}
