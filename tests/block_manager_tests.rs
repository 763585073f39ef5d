//! Integration tests for the block space manager.

use std::collections::HashMap;
use std::time::Instant;

use kv_block_sched::block_manager::{AllocStatus, BlockSpaceManager};
use kv_block_sched::config::CacheConfig;
use kv_block_sched::sampling::SamplingParams;
use kv_block_sched::sequence::{SeqId, Sequence, SequenceGroup, SequenceStatus};

fn cache_config(block_size: usize, num_gpu: usize, num_cpu: usize, watermark: f64) -> CacheConfig {
    CacheConfig {
        block_size,
        num_gpu_blocks: num_gpu,
        num_cpu_blocks: num_cpu,
        watermark,
        sliding_window: None,
        enable_prefix_caching: false,
    }
}

fn group_with_prompt(
    request_id: &str,
    seq_id: SeqId,
    prompt: Vec<u32>,
    block_size: usize,
) -> SequenceGroup {
    SequenceGroup::new(
        request_id,
        "prompt",
        vec![Sequence::new(seq_id, prompt, block_size)],
        SamplingParams::default(),
        Instant::now(),
    )
}

#[test]
fn test_can_allocate_never_later_ok() {
    let mut mgr = BlockSpaceManager::new(&cache_config(4, 4, 4, 0.25));
    // watermark_blocks = 1.

    // 4 blocks needed, 4 total, watermark 1: can never fit.
    let too_big = group_with_prompt("big", 0, (0..16).collect(), 4);
    assert_eq!(mgr.can_allocate(&too_big), AllocStatus::Never);

    // 3 blocks fit with the watermark spared.
    let fits = group_with_prompt("fits", 1, (0..12).collect(), 4);
    assert_eq!(mgr.can_allocate(&fits), AllocStatus::Ok);
    mgr.allocate(&fits).unwrap();

    // A one-block prompt now has to wait: 1 free - 1 required < 1 spare.
    let later = group_with_prompt("later", 2, (0..4).collect(), 4);
    assert_eq!(mgr.can_allocate(&later), AllocStatus::Later);
}

#[test]
fn test_allocate_forks_sibling_sequences() {
    let mut mgr = BlockSpaceManager::new(&cache_config(4, 8, 0, 0.0));
    let mut seqs = vec![
        Sequence::new(0, vec![1, 2, 3, 4, 5], 4),
        Sequence::new(1, vec![1, 2, 3, 4, 5], 4),
    ];
    for seq in &mut seqs {
        seq.status = SequenceStatus::Waiting;
    }
    let params = SamplingParams {
        n: 2,
        best_of: 2,
        ..Default::default()
    };
    let group = SequenceGroup::new("par", "p", seqs, params, Instant::now());

    mgr.allocate(&group).unwrap();
    // Two tables sharing the same two slots: only two blocks consumed.
    assert_eq!(mgr.get_num_free_gpu_blocks(), 6);
    assert_eq!(mgr.get_block_table(0), mgr.get_block_table(1));
    for slot in mgr.get_block_table(0) {
        assert_eq!(mgr.allocator().refcount(slot), 2);
    }
}

#[test]
fn test_swap_out_then_in_roundtrip() {
    // Mirrors a 7-token prompt on 8-token blocks: one partially filled
    // block that swaps as a unit.
    let block_size = 8;
    let mut mgr = BlockSpaceManager::new(&cache_config(block_size, 4, 4, 0.0));
    let mut group = group_with_prompt("1", 0, (0..7).collect(), block_size);
    mgr.allocate(&group).unwrap();
    group.seqs[0].status = SequenceStatus::Running;

    // Emulate one forward pass appending a single token.
    group.seqs[0].append_token_id(0, HashMap::from([(0, 0.0)]));
    mgr.append_slot(&group.seqs[0]).unwrap();

    let gpu_blocks = mgr.get_block_table(0);
    assert!(mgr.can_swap_out(&group));
    let before_cpu = mgr.get_num_free_cpu_blocks();
    let before_gpu = mgr.get_num_free_gpu_blocks();

    let mapping = mgr.swap_out(&group).unwrap();
    let mut keys: Vec<u32> = mapping.keys().copied().collect();
    keys.sort_unstable();
    let mut held = gpu_blocks.clone();
    held.sort_unstable();
    assert_eq!(keys, held, "swap-out keys are exactly the GPU slots held");
    assert_eq!(mapping.len(), gpu_blocks.len());
    assert_eq!(mgr.get_num_free_gpu_blocks(), before_gpu + gpu_blocks.len());
    assert_eq!(mgr.get_num_free_cpu_blocks(), before_cpu - gpu_blocks.len());
    group.seqs[0].status = SequenceStatus::Swapped;

    // And back.
    assert!(mgr.can_swap_in(&group));
    let before_cpu = mgr.get_num_free_cpu_blocks();
    let before_gpu = mgr.get_num_free_gpu_blocks();
    let mapping = mgr.swap_in(&group).unwrap();
    let cpu_blocks: Vec<u32> = mapping.keys().copied().collect();
    assert_eq!(cpu_blocks.len(), gpu_blocks.len());
    assert_eq!(mgr.get_num_free_gpu_blocks(), before_gpu - gpu_blocks.len());
    assert_eq!(mgr.get_num_free_cpu_blocks(), before_cpu + gpu_blocks.len());
}

#[test]
fn test_swap_shares_blocks_across_siblings() {
    let block_size = 4;
    let mut mgr = BlockSpaceManager::new(&cache_config(block_size, 8, 8, 0.0));
    let mut group = group_with_prompt("fork", 0, (0..4).collect(), block_size);
    mgr.allocate(&group).unwrap();
    group.seqs[0].status = SequenceStatus::Running;

    // Fork a sibling sharing the single full block.
    let child = group.seqs[0].fork(1);
    mgr.fork(0, 1);
    group.seqs.push(child);

    let before_free_cpu = mgr.get_num_free_cpu_blocks();
    let mapping = mgr.swap_out(&group).unwrap();
    // One physical block moved, even though two sequences reference it.
    assert_eq!(mapping.len(), 1);
    assert_eq!(mgr.get_num_free_cpu_blocks(), before_free_cpu - 1);

    let cpu_slot = mgr.get_block_table(0)[0];
    assert_eq!(mgr.get_block_table(1), vec![cpu_slot]);
    assert_eq!(mgr.allocator().refcount(cpu_slot), 2);
}

#[test]
fn test_prefix_caching_manager_reuses_common_prefix() {
    let block_size = 16;
    let mut cfg = cache_config(block_size, 8, 8, 0.0);
    cfg.enable_prefix_caching = true;
    let mut mgr = BlockSpaceManager::new(&cfg);

    // P1: four full blocks.
    let p1: Vec<u32> = (0..64).collect();
    let group1 = group_with_prompt("p1", 0, p1.clone(), block_size);
    mgr.allocate(&group1).unwrap();
    let free_after_p1 = mgr.get_num_free_gpu_blocks();
    assert_eq!(free_after_p1, 4);

    // P2 shares the first three blocks.
    let mut p2 = p1[..48].to_vec();
    p2.extend(500..516);
    let group2 = group_with_prompt("p2", 1, p2, block_size);
    mgr.allocate(&group2).unwrap();

    // Exactly one fresh block for the divergent tail.
    assert_eq!(mgr.get_num_free_gpu_blocks(), free_after_p1 - 1);
    let t1 = mgr.get_block_table(0);
    let t2 = mgr.get_block_table(1);
    assert_eq!(t1[..3], t2[..3]);
    assert_ne!(t1[3], t2[3]);
}

#[test]
fn test_common_computed_ids_empty_without_caching() {
    let mut mgr = BlockSpaceManager::new(&cache_config(4, 8, 0, 0.0));
    let group = group_with_prompt("a", 0, (0..8).collect(), 4);
    mgr.allocate(&group).unwrap();
    mgr.mark_blocks_as_computed(&group);
    assert!(mgr.get_common_computed_block_ids(&group).is_empty());
}

#[test]
fn test_common_computed_ids_with_caching() {
    let block_size = 4;
    let mut cfg = cache_config(block_size, 16, 0, 0.0);
    cfg.enable_prefix_caching = true;
    let mut mgr = BlockSpaceManager::new(&cfg);

    let prompt: Vec<u32> = (0..12).collect();
    let group = group_with_prompt("a", 0, prompt, block_size);
    mgr.allocate(&group).unwrap();

    assert!(mgr.get_common_computed_block_ids(&group).is_empty());
    mgr.mark_blocks_as_computed(&group);
    // All three blocks are full; the lazy mark covers them all.
    assert_eq!(mgr.get_common_computed_block_ids(&group), mgr.get_block_table(0));
}

#[test]
fn test_free_restores_all_blocks() {
    let mut mgr = BlockSpaceManager::new(&cache_config(4, 8, 0, 0.0));
    let group = group_with_prompt("a", 0, (0..13).collect(), 4);
    mgr.allocate(&group).unwrap();
    assert_eq!(mgr.get_num_free_gpu_blocks(), 4);

    mgr.free(0);
    assert_eq!(mgr.get_num_free_gpu_blocks(), 8);
    // Freeing again is a no-op.
    mgr.free(0);
    assert_eq!(mgr.get_num_free_gpu_blocks(), 8);
}
