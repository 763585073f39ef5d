//! Paged KV-cache block management.
//!
//! This module contains the allocator stack, bottom-up:
//! - [`refcount`]: per-slot reference counting
//! - [`evictor`]: LRU eviction over cached-but-unreferenced slots
//! - [`arena`]: logical block storage and opaque block handles
//! - [`naive`]: free-list allocator for one device tier
//! - [`prefix_caching`]: content-addressed allocator with prefix reuse
//! - [`cpu_gpu`]: two-tier facade with copy-on-write tracking
//! - [`block_table`]: per-sequence block chains

pub mod arena;
pub mod block_table;
pub mod cpu_gpu;
pub mod evictor;
pub mod naive;
pub mod prefix_caching;
pub mod refcount;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A token id as produced by the tokenizer.
pub type TokenId = u32;

/// Index of a physical block (slot) on some device tier.
///
/// Slot ids are globally unique across tiers: the GPU tier owns
/// `[0, num_gpu_blocks)` and the CPU tier owns the range above it.
pub type SlotId = u32;

/// Identifies which device tier a slot resides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// GPU VRAM (hot, executes attention).
    Gpu,
    /// Host RAM (swap target).
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Gpu => write!(f, "GPU"),
            Device::Cpu => write!(f, "CPU"),
        }
    }
}

/// Errors surfaced by the allocator stack.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Both the free list and (where applicable) the evictor are empty.
    #[error("no free blocks left")]
    NoFreeBlocks,
}

/// Records pending copy-on-write operations as `src slot -> dst slots`.
///
/// A single source can fan out to several destinations within one step
/// when multiple forked sequences write to the same shared slot.
#[derive(Debug, Default)]
pub struct CowTracker {
    copies: HashMap<SlotId, Vec<SlotId>>,
}

impl CowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `src` must be copied into `dst` before the next step.
    pub fn record(&mut self, src: SlotId, dst: SlotId) {
        self.copies.entry(src).or_default().push(dst);
    }

    /// Drain the accumulated copy map.
    pub fn clear_cows(&mut self) -> HashMap<SlotId, Vec<SlotId>> {
        std::mem::take(&mut self.copies)
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }
}
