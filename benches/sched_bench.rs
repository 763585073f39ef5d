//! Benchmarks for the allocator stack and scheduler.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kv_block_sched::block::arena::BlockArena;
use kv_block_sched::block::naive::NaiveBlockAllocator;
use kv_block_sched::block::prefix_caching::PrefixCachingBlockAllocator;
use kv_block_sched::config::{CacheConfig, SchedulerConfig};
use kv_block_sched::sampling::SamplingParams;
use kv_block_sched::scheduler::Scheduler;
use kv_block_sched::sequence::{Sequence, SequenceGroup};

fn bench_naive_allocate_free(c: &mut Criterion) {
    c.bench_function("naive_allocate_free_1k", |b| {
        b.iter(|| {
            let mut arena = BlockArena::new();
            let mut allocator = NaiveBlockAllocator::new(16, 0..1024);
            let blocks: Vec<_> = (0..1024)
                .map(|_| allocator.allocate_mutable(&mut arena, None).unwrap())
                .collect();
            for block in blocks {
                allocator.free(&mut arena, block);
            }
            black_box(allocator.get_num_free_blocks());
        })
    });
}

fn bench_prefix_cache_hit_chain(c: &mut Criterion) {
    let block_size = 16;
    let token_ids: Vec<u32> = (0..64 * block_size as u32).collect();

    c.bench_function("prefix_cache_warm_chain_64_blocks", |b| {
        let mut arena = BlockArena::new();
        let mut allocator = PrefixCachingBlockAllocator::new(block_size, 0..128);
        // Warm the cache once; the measured loop only takes hits.
        let mut prev = None;
        for chunk in token_ids.chunks(block_size) {
            prev = Some(allocator.allocate_immutable(&mut arena, prev, chunk).unwrap());
        }

        b.iter(|| {
            let mut prev = None;
            let mut blocks = Vec::with_capacity(64);
            for chunk in token_ids.chunks(block_size) {
                let handle = allocator.allocate_immutable(&mut arena, prev, chunk).unwrap();
                blocks.push(handle);
                prev = Some(handle);
            }
            for handle in blocks.into_iter().rev() {
                allocator.free(&mut arena, handle);
            }
        })
    });
}

fn bench_schedule_step(c: &mut Criterion) {
    c.bench_function("schedule_prefill_64_groups", |b| {
        b.iter(|| {
            let mut scheduler = Scheduler::new(
                SchedulerConfig {
                    max_num_batched_tokens: 8192,
                    max_num_seqs: 256,
                    max_paddings: 8192,
                    max_model_len: 2048,
                    ..Default::default()
                },
                &CacheConfig {
                    block_size: 16,
                    num_gpu_blocks: 512,
                    num_cpu_blocks: 0,
                    watermark: 0.0,
                    sliding_window: None,
                    enable_prefix_caching: false,
                },
            );
            for i in 0..64u64 {
                let prompt: Vec<u32> = (0..32).collect();
                scheduler.add_seq_group(SequenceGroup::new(
                    i.to_string(),
                    "bench",
                    vec![Sequence::new(i, prompt, 16)],
                    SamplingParams::default(),
                    std::time::Instant::now(),
                ));
            }
            let (metadata, outputs) = scheduler.schedule().unwrap();
            black_box((metadata.len(), outputs.num_batched_tokens));
        })
    });
}

criterion_group!(
    benches,
    bench_naive_allocate_free,
    bench_prefix_cache_hit_chain,
    bench_schedule_step
);
criterion_main!(benches);
