//! Engine layer: the request API over the scheduling core.
//!
//! [`LlmEngine`] owns the scheduler and drives one step at a time:
//! schedule a batch, hand it to the executor, apply the sampled tokens,
//! check finish criteria, and surface [`RequestOutput`]s. It runs on a
//! single cooperative thread; each `step` is atomic from the caller's
//! perspective.

pub mod metrics;
pub mod outputs;

use std::time::Instant;

use prometheus::Registry;
use thiserror::Error;
use tracing::{debug, info};

use crate::block::TokenId;
use crate::config::{Config, ConfigError};
use crate::engine::metrics::EngineMetrics;
use crate::engine::outputs::RequestOutput;
use crate::executor::{ModelExecutor, SamplerOutput, TokenDecoder};
use crate::sampling::SamplingParams;
use crate::scheduler::{Scheduler, SchedulerError, SchedulerOutputs};
use crate::sequence::{SeqId, Sequence, SequenceGroup, SequenceStatus};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("duplicate request id {0}")]
    DuplicateRequest(String),
    #[error("invalid sampling params: {0}")]
    InvalidSamplingParams(String),
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub struct LlmEngine<E, D> {
    config: Config,
    pub scheduler: Scheduler,
    executor: E,
    decoder: D,
    metrics: EngineMetrics,
    registry: Registry,
    next_seq_id: SeqId,
    step_counter: u64,
    preemptions_reported: u64,
}

impl<E: ModelExecutor, D: TokenDecoder> LlmEngine<E, D> {
    pub fn new(config: Config, executor: E, decoder: D) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = Registry::new();
        let metrics = EngineMetrics::new(&registry)?;
        let scheduler = Scheduler::new(config.scheduler.clone(), &config.cache);
        info!(
            block_size = config.cache.block_size,
            num_gpu_blocks = config.cache.num_gpu_blocks,
            num_cpu_blocks = config.cache.num_cpu_blocks,
            prefix_caching = config.cache.enable_prefix_caching,
            "engine initialized"
        );
        Ok(Self {
            config,
            scheduler,
            executor,
            decoder,
            metrics,
            registry,
            next_seq_id: 0,
            step_counter: 0,
            preemptions_reported: 0,
        })
    }

    /// Metrics registry for scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Enqueue a generation request.
    pub fn add_request(
        &mut self,
        request_id: impl Into<String>,
        prompt: impl Into<String>,
        prompt_token_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
    ) -> Result<(), EngineError> {
        let request_id = request_id.into();
        if self.scheduler.get_group(&request_id).is_some() {
            return Err(EngineError::DuplicateRequest(request_id));
        }
        if prompt_token_ids.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        sampling_params
            .verify()
            .map_err(EngineError::InvalidSamplingParams)?;

        let seq_id = self.allocate_seq_id();
        let seq = Sequence::new(seq_id, prompt_token_ids, self.config.cache.block_size);
        debug!(request_id = %request_id, seq_id, prompt_len = seq.get_len(), "request added");
        self.scheduler.add_seq_group(SequenceGroup::new(
            request_id,
            prompt,
            vec![seq],
            sampling_params,
            Instant::now(),
        ));
        Ok(())
    }

    /// Abort requests by id. Unknown ids are silently ignored.
    pub fn abort_request(&mut self, request_ids: &[String]) {
        self.scheduler.abort_seq_group(request_ids);
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_seq_groups()
    }

    pub fn get_num_unfinished_requests(&self) -> usize {
        self.scheduler.get_num_unfinished_seq_groups()
    }

    /// Run one engine step: schedule, execute, apply samples, and collect
    /// per-request progress.
    pub fn step(&mut self) -> Result<Vec<RequestOutput>, EngineError> {
        let (batch_metadata, scheduler_outputs) = self.scheduler.schedule()?;
        self.step_counter += 1;

        if scheduler_outputs.is_empty() && scheduler_outputs.ignored_request_ids.is_empty() {
            self.refresh_metrics(&scheduler_outputs);
            return Ok(Vec::new());
        }

        let sampler_outputs = if batch_metadata.is_empty() {
            Vec::new()
        } else {
            self.executor.execute(&batch_metadata, &scheduler_outputs)
        };
        for sampler_output in &sampler_outputs {
            self.apply_sampler_output(sampler_output);
        }

        // The executor has filled the batched blocks; stamp the lazy
        // computed bits before anything gets freed below.
        for request_id in &scheduler_outputs.scheduled_request_ids {
            self.scheduler.mark_blocks_as_computed(request_id);
        }

        for request_id in &scheduler_outputs.scheduled_request_ids {
            self.check_finish(request_id);
        }

        let mut request_outputs = Vec::new();
        for request_id in &scheduler_outputs.scheduled_request_ids {
            let group = self
                .scheduler
                .get_group(request_id)
                .expect("scheduled group missing");
            request_outputs.push(RequestOutput::from_seq_group(group, &self.decoder));
        }
        for request_id in &scheduler_outputs.ignored_request_ids {
            if let Some(group) = self.scheduler.take_group(request_id) {
                request_outputs.push(RequestOutput::from_seq_group(&group, &self.decoder));
                self.metrics.ignored_requests.inc();
            }
        }

        self.scheduler.free_finished_seq_groups();
        self.refresh_metrics(&scheduler_outputs);
        Ok(request_outputs)
    }

    fn allocate_seq_id(&mut self) -> SeqId {
        let id = self.next_seq_id;
        self.next_seq_id += 1;
        id
    }

    /// Apply sampled tokens, forking new sequences where the sampler
    /// branched (beam search).
    fn apply_sampler_output(&mut self, sampler_output: &SamplerOutput) {
        let request_id = &sampler_output.request_id;
        for sample in &sampler_output.samples {
            if sample.parent_seq_id != sample.seq_id {
                let child = {
                    let group = self
                        .scheduler
                        .get_group(request_id)
                        .expect("sampler output for unknown group");
                    group
                        .find(sample.parent_seq_id)
                        .expect("fork parent missing")
                        .fork(sample.seq_id)
                };
                self.scheduler.fork_seq(sample.parent_seq_id, sample.seq_id);
                self.scheduler
                    .get_group_mut(request_id)
                    .expect("sampler output for unknown group")
                    .seqs
                    .push(child);
            }
            let group = self
                .scheduler
                .get_group_mut(request_id)
                .expect("sampler output for unknown group");
            if let Some(seq) = group.find_mut(sample.seq_id) {
                if seq.status == SequenceStatus::Running {
                    seq.append_token_id(sample.token_id, sample.logprobs.clone());
                }
            }
        }
    }

    /// Check stop conditions on every running sequence of a group and
    /// release the blocks of sequences that finished.
    fn check_finish(&mut self, request_id: &str) {
        let eos_token_id = self.config.engine.eos_token_id;
        let max_model_len = self.config.scheduler.max_model_len;
        let mut finished_seq_ids = Vec::new();

        if let Some(group) = self.scheduler.get_group_mut(request_id) {
            let params = group.sampling_params.clone();
            for seq in group.get_seqs_mut(Some(SequenceStatus::Running)) {
                let Some(last) = seq.data.output_token_ids.last().copied() else {
                    continue;
                };
                let status = if params.stop_token_ids.contains(&last) {
                    Some(SequenceStatus::FinishedStopped)
                } else if !params.ignore_eos && eos_token_id == Some(last) {
                    Some(SequenceStatus::FinishedStopped)
                } else if seq.get_output_len() >= params.max_tokens {
                    Some(SequenceStatus::FinishedLengthCapped)
                } else if seq.get_len() >= max_model_len {
                    Some(SequenceStatus::FinishedLengthCapped)
                } else {
                    None
                };
                if let Some(status) = status {
                    seq.status = status;
                    finished_seq_ids.push(seq.seq_id);
                }
            }
        }
        for seq_id in finished_seq_ids {
            self.scheduler.free_seq(seq_id);
        }
    }

    fn refresh_metrics(&mut self, outputs: &SchedulerOutputs) {
        self.metrics.num_waiting.set(self.scheduler.num_waiting() as i64);
        self.metrics.num_running.set(self.scheduler.num_running() as i64);
        self.metrics.num_swapped.set(self.scheduler.num_swapped() as i64);
        self.metrics
            .free_gpu_blocks
            .set(self.scheduler.block_manager.get_num_free_gpu_blocks() as i64);
        self.metrics
            .free_cpu_blocks
            .set(self.scheduler.block_manager.get_num_free_cpu_blocks() as i64);

        if outputs.prompt_run {
            self.metrics.prompt_tokens.inc_by(outputs.num_batched_tokens as u64);
        } else {
            self.metrics
                .generation_tokens
                .inc_by(outputs.num_batched_tokens as u64);
        }

        let preemptions = self.scheduler.num_cumulative_preemptions();
        self.metrics
            .preemptions
            .inc_by(preemptions - self.preemptions_reported);
        self.preemptions_reported = preemptions;

        if self.step_counter % self.config.engine.log_stats_interval as u64 == 0 {
            info!(
                step = self.step_counter,
                waiting = self.scheduler.num_waiting(),
                running = self.scheduler.num_running(),
                swapped = self.scheduler.num_swapped(),
                free_gpu_blocks = self.scheduler.block_manager.get_num_free_gpu_blocks(),
                free_cpu_blocks = self.scheduler.block_manager.get_num_free_cpu_blocks(),
                "scheduler state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{EchoExecutor, IdDecoder};

    fn engine(block_size: usize, num_gpu: usize, num_cpu: usize) -> LlmEngine<EchoExecutor, IdDecoder> {
        let mut config = Config::default();
        config.cache.block_size = block_size;
        config.cache.num_gpu_blocks = num_gpu;
        config.cache.num_cpu_blocks = num_cpu;
        config.cache.watermark = 0.0;
        config.engine.eos_token_id = None;
        LlmEngine::new(config, EchoExecutor, IdDecoder).unwrap()
    }

    #[test]
    fn test_generation_runs_to_max_tokens() {
        let mut engine = engine(16, 64, 64);
        let params = SamplingParams {
            max_tokens: 4,
            ..Default::default()
        };
        engine
            .add_request("req-0", "hello", vec![3, 4, 5], params)
            .unwrap();

        let mut final_output = None;
        for _ in 0..16 {
            if !engine.has_unfinished_requests() {
                break;
            }
            for out in engine.step().unwrap() {
                if out.finished {
                    final_output = Some(out);
                }
            }
        }

        let out = final_output.expect("request should finish");
        assert_eq!(out.outputs.len(), 1);
        // The echo executor replays the prompt.
        assert_eq!(out.outputs[0].token_ids, vec![3, 4, 5, 3]);
        assert_eq!(
            out.outputs[0].finish_reason,
            Some(crate::engine::outputs::FinishReason::Length)
        );
        assert_eq!(out.outputs[0].text, "3 4 5 3");
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn test_stop_token_finishes_early() {
        let mut engine = engine(16, 64, 64);
        let params = SamplingParams {
            max_tokens: 100,
            stop_token_ids: vec![4],
            ..Default::default()
        };
        // Echo replays 3, 4, ... so token 4 stops generation at step 2.
        engine.add_request("req-0", "", vec![3, 4, 5], params).unwrap();

        let mut outputs = Vec::new();
        while engine.has_unfinished_requests() {
            outputs.extend(engine.step().unwrap());
        }
        let last = outputs.last().unwrap();
        assert_eq!(last.outputs[0].token_ids, vec![3, 4]);
        assert_eq!(
            last.outputs[0].finish_reason,
            Some(crate::engine::outputs::FinishReason::Stop)
        );
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut engine = engine(16, 64, 64);
        engine
            .add_request("dup", "", vec![1], SamplingParams::default())
            .unwrap();
        let err = engine.add_request("dup", "", vec![1], SamplingParams::default());
        assert!(matches!(err, Err(EngineError::DuplicateRequest(_))));
    }

    #[test]
    fn test_too_long_prompt_surfaces_ignored_output() {
        let mut engine = engine(16, 64, 64);
        let prompt: Vec<u32> = (0..engine.config.scheduler.max_model_len as u32 + 1).collect();
        engine
            .add_request("big", "", prompt, SamplingParams::default())
            .unwrap();

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].request_id, "big");
        assert!(outputs[0].finished);
        assert!(outputs[0].outputs[0].token_ids.is_empty());
        assert_eq!(outputs[0].outputs[0].finish_reason, None);
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn test_abort_releases_blocks() {
        let mut engine = engine(4, 8, 8);
        engine
            .add_request("a", "", vec![1, 2, 3, 4], SamplingParams::default())
            .unwrap();
        engine.step().unwrap();
        assert!(engine.scheduler.block_manager.get_num_free_gpu_blocks() < 8);

        engine.abort_request(&["a".to_string()]);
        assert_eq!(engine.scheduler.block_manager.get_num_free_gpu_blocks(), 8);
        assert!(!engine.has_unfinished_requests());
    }
}
