//! kv-block-sched: paged KV-cache scheduling demo driver.
//!
//! Feeds a batch of synthetic generation requests through the engine
//! with a stub executor, exercising admission, batching, preemption, and
//! prefix caching end to end, and logs per-step scheduler state.

use clap::Parser;
use tracing::{debug, info};
use uuid::Uuid;

use kv_block_sched::config::{Cli, Config};
use kv_block_sched::engine::LlmEngine;
use kv_block_sched::executor::{EchoExecutor, IdDecoder};
use kv_block_sched::sampling::SamplingParams;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_block_sched=debug"
    } else {
        "kv_block_sched=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-block-sched v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    config.validate()?;
    info!(
        block_size = config.cache.block_size,
        num_gpu_blocks = config.cache.num_gpu_blocks,
        num_cpu_blocks = config.cache.num_cpu_blocks,
        max_num_seqs = config.scheduler.max_num_seqs,
        prefix_caching = config.cache.enable_prefix_caching,
        "Configuration loaded"
    );

    let mut engine = LlmEngine::new(config, EchoExecutor, IdDecoder)?;

    // Submit synthetic requests with varied prompt lengths. A shared
    // leading segment makes prefix caching observable when enabled.
    for i in 0..cli.num_requests {
        let prompt_len = 8 + (i * 13) % 48;
        let prompt_token_ids: Vec<u32> = (0..prompt_len as u32).map(|t| 100 + t).collect();
        let params = SamplingParams {
            max_tokens: 8 + (i % 4) * 4,
            ..Default::default()
        };
        let request_id = Uuid::new_v4().to_string();
        debug!(request_id = %request_id, prompt_len, "submitting request");
        engine.add_request(request_id, format!("synthetic prompt {i}"), prompt_token_ids, params)?;
    }

    let mut finished = 0usize;
    let mut steps = 0usize;
    while engine.has_unfinished_requests() && steps < cli.max_steps {
        for output in engine.step()? {
            if output.finished {
                finished += 1;
                info!(
                    request_id = %output.request_id,
                    completions = output.outputs.len(),
                    generated = output.outputs.first().map_or(0, |o| o.token_ids.len()),
                    "request finished"
                );
            }
        }
        steps += 1;
    }

    info!(finished, steps, "run complete");
    Ok(())
}
