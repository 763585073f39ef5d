//! Prometheus metrics for the scheduling core.
//!
//! A snapshot of system state (queue depths, free blocks) plus cumulative
//! token and preemption counters, refreshed once per engine step.

use prometheus::{IntCounter, IntGauge, Registry};

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

pub struct EngineMetrics {
    pub num_waiting: IntGauge,
    pub num_running: IntGauge,
    pub num_swapped: IntGauge,
    pub free_gpu_blocks: IntGauge,
    pub free_cpu_blocks: IntGauge,
    pub prompt_tokens: IntCounter,
    pub generation_tokens: IntCounter,
    pub preemptions: IntCounter,
    pub ignored_requests: IntCounter,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            num_waiting: gauge(
                registry,
                "sched_num_waiting",
                "Sequence groups in the waiting queue",
            )?,
            num_running: gauge(
                registry,
                "sched_num_running",
                "Sequence groups in the running queue",
            )?,
            num_swapped: gauge(
                registry,
                "sched_num_swapped",
                "Sequence groups swapped out to CPU",
            )?,
            free_gpu_blocks: gauge(
                registry,
                "sched_free_gpu_blocks",
                "Free KV blocks on the GPU tier",
            )?,
            free_cpu_blocks: gauge(
                registry,
                "sched_free_cpu_blocks",
                "Free KV blocks on the CPU tier",
            )?,
            prompt_tokens: counter(
                registry,
                "sched_prompt_tokens_total",
                "Prompt tokens batched across all prefill steps",
            )?,
            generation_tokens: counter(
                registry,
                "sched_generation_tokens_total",
                "Tokens batched across all decode steps",
            )?,
            preemptions: counter(
                registry,
                "sched_preemptions_total",
                "Sequence group preemptions",
            )?,
            ignored_requests: counter(
                registry,
                "sched_ignored_requests_total",
                "Requests rejected at admission for exceeding limits",
            )?,
        })
    }
}
