//! Three-queue request scheduler.
//!
//! Sequence groups move between `waiting`, `running`, and `swapped`
//! queues. Each [`Scheduler::schedule`] call runs exactly one of two
//! modes: prefill admission from `waiting` (when nothing is swapped out),
//! or a decode step that reserves one token slot per running sequence,
//! preempting low-priority groups and swapping groups back in as capacity
//! allows. The queues hold request-id handles; the group records live in
//! one table keyed by request id.

pub mod policy;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::block::{BlockError, SlotId};
use crate::block_manager::{AllocStatus, BlockSpaceManager};
use crate::config::{CacheConfig, SchedulerConfig};
use crate::sampling::SamplingParams;
use crate::scheduler::policy::SchedulingPolicy;
use crate::sequence::{SeqId, SequenceData, SequenceGroup, SequenceStatus};

pub type RequestId = String;

/// How to reclaim a preempted group's GPU blocks.
///
/// Recompute drops the KV state and replays the prompt later; it is
/// cheaper than swapping but unsound when sibling sequences share state,
/// so multi-sequence groups swap instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    Swap,
    Recompute,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("CPU swap space exhausted; increase num_cpu_blocks to avoid this")]
    SwapSpaceExhausted,
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Per-step plan handed to the executor.
#[derive(Debug, Serialize)]
pub struct SchedulerOutputs {
    pub scheduled_request_ids: Vec<RequestId>,
    pub prompt_run: bool,
    pub num_batched_tokens: usize,
    pub blocks_to_swap_in: HashMap<SlotId, SlotId>,
    pub blocks_to_swap_out: HashMap<SlotId, SlotId>,
    pub blocks_to_copy: HashMap<SlotId, Vec<SlotId>>,
    pub ignored_request_ids: Vec<RequestId>,
}

impl SchedulerOutputs {
    fn new(
        scheduled_request_ids: Vec<RequestId>,
        prompt_run: bool,
        num_batched_tokens: usize,
        blocks_to_swap_in: HashMap<SlotId, SlotId>,
        blocks_to_swap_out: HashMap<SlotId, SlotId>,
        blocks_to_copy: HashMap<SlotId, Vec<SlotId>>,
        ignored_request_ids: Vec<RequestId>,
    ) -> Self {
        // Swap in and swap out should never happen at the same time.
        assert!(
            blocks_to_swap_in.is_empty() || blocks_to_swap_out.is_empty(),
            "swap-in and swap-out in the same step"
        );
        Self {
            scheduled_request_ids,
            prompt_run,
            num_batched_tokens,
            blocks_to_swap_in,
            blocks_to_swap_out,
            blocks_to_copy,
            ignored_request_ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        // Ignored groups are not considered.
        self.scheduled_request_ids.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }
}

/// Per-group record the model executor consumes.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetadata {
    pub request_id: RequestId,
    pub is_prompt: bool,
    /// Prompt run that leaves part of the prompt for a later step.
    pub is_chunked_prefill: bool,
    pub seq_data: HashMap<SeqId, SequenceData>,
    pub block_tables: HashMap<SeqId, Vec<SlotId>>,
    pub sampling_params: SamplingParams,
    /// Computed blocks shared by all sequences; prefill may skip them.
    pub computed_prefix_block_ids: Vec<SlotId>,
}

enum Admission {
    Admit { chunk: usize, num_new_seqs: usize },
    Ignore,
    Stop,
}

pub struct Scheduler {
    config: SchedulerConfig,
    prompt_limit: usize,
    policy: SchedulingPolicy,
    pub block_manager: BlockSpaceManager,
    groups: HashMap<RequestId, SequenceGroup>,
    waiting: VecDeque<RequestId>,
    running: VecDeque<RequestId>,
    swapped: VecDeque<RequestId>,
    /// Logical clock for last-access stamping, advanced per schedule call.
    clock: u64,
    num_cumulative_preemptions: u64,
}

impl Scheduler {
    pub fn new(scheduler_config: SchedulerConfig, cache_config: &CacheConfig) -> Self {
        let prompt_limit = scheduler_config
            .max_model_len
            .min(scheduler_config.max_num_batched_tokens);
        Self {
            config: scheduler_config,
            prompt_limit,
            policy: SchedulingPolicy::Fcfs,
            block_manager: BlockSpaceManager::new(cache_config),
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            clock: 0,
            num_cumulative_preemptions: 0,
        }
    }

    /// Enqueue a new group on the waiting queue.
    pub fn add_seq_group(&mut self, seq_group: SequenceGroup) {
        let request_id = seq_group.request_id.clone();
        let previous = self.groups.insert(request_id.clone(), seq_group);
        assert!(previous.is_none(), "duplicate request id {request_id}");
        self.waiting.push_back(request_id);
    }

    /// Abort the given requests wherever they are queued. Unknown ids are
    /// ignored; aborting twice is a no-op.
    pub fn abort_seq_group(&mut self, request_ids: &[RequestId]) {
        let targets: HashSet<&RequestId> = request_ids.iter().collect();
        let mut aborted: Vec<RequestId> = Vec::new();
        for queue in [&mut self.waiting, &mut self.running, &mut self.swapped] {
            queue.retain(|id| {
                if targets.contains(id) {
                    aborted.push(id.clone());
                    false
                } else {
                    true
                }
            });
        }
        for id in aborted {
            if let Some(mut group) = self.groups.remove(&id) {
                for seq in &mut group.seqs {
                    if seq.is_finished() {
                        continue;
                    }
                    seq.status = SequenceStatus::FinishedAborted;
                    self.block_manager.free(seq.seq_id);
                }
                debug!(request_id = %id, "aborted sequence group");
            }
        }
    }

    pub fn has_unfinished_seq_groups(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    pub fn get_num_unfinished_seq_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    pub fn num_cumulative_preemptions(&self) -> u64 {
        self.num_cumulative_preemptions
    }

    pub fn get_group(&self, request_id: &str) -> Option<&SequenceGroup> {
        self.groups.get(request_id)
    }

    pub fn get_group_mut(&mut self, request_id: &str) -> Option<&mut SequenceGroup> {
        self.groups.get_mut(request_id)
    }

    /// Remove a group record entirely (used for ignored requests once
    /// their final output has been assembled).
    pub fn take_group(&mut self, request_id: &str) -> Option<SequenceGroup> {
        self.groups.remove(request_id)
    }

    /// Register a forked child sequence: clone the parent's block table.
    pub fn fork_seq(&mut self, parent_seq_id: SeqId, child_seq_id: SeqId) {
        self.block_manager.fork(parent_seq_id, child_seq_id);
    }

    /// Release a finished sequence's blocks.
    pub fn free_seq(&mut self, seq_id: SeqId) {
        self.block_manager.free(seq_id);
    }

    /// Drop groups whose every sequence has finished.
    pub fn free_finished_seq_groups(&mut self) {
        let finished: Vec<RequestId> = self
            .running
            .iter()
            .filter(|id| self.groups[*id].is_finished())
            .cloned()
            .collect();
        self.running.retain(|id| !self.groups[id].is_finished());
        for id in finished {
            self.groups.remove(&id);
            debug!(request_id = %id, "finished sequence group released");
        }
    }

    /// Stamp computed bits for a scheduled group after the executor ran.
    pub fn mark_blocks_as_computed(&mut self, request_id: &str) {
        if let Some(group) = self.groups.get(request_id) {
            self.block_manager.mark_blocks_as_computed(group);
        }
    }

    /// Run one scheduling step and assemble the batch descriptors.
    pub fn schedule(&mut self) -> Result<(Vec<BatchMetadata>, SchedulerOutputs), SchedulerError> {
        let outputs = self.schedule_inner()?;

        self.clock += 1;
        let now = self.clock;

        let mut metadata_list = Vec::with_capacity(outputs.scheduled_request_ids.len());
        for request_id in &outputs.scheduled_request_ids {
            let group = self.groups.get(request_id).expect("scheduled group missing");

            let mut seq_data = HashMap::new();
            let mut block_tables = HashMap::new();
            let mut seq_ids = Vec::new();
            for seq in group.get_seqs(None) {
                let included = if outputs.prompt_run {
                    !seq.is_finished()
                } else {
                    seq.status == SequenceStatus::Running
                };
                if !included {
                    continue;
                }
                seq_data.insert(seq.seq_id, seq.data.clone());
                block_tables.insert(seq.seq_id, self.block_manager.get_block_table(seq.seq_id));
                seq_ids.push(seq.seq_id);
            }

            let is_chunked_prefill = outputs.prompt_run
                && group.get_seqs(None).iter().any(|s| s.get_num_unprefilled() > 0);

            metadata_list.push(BatchMetadata {
                request_id: request_id.clone(),
                is_prompt: outputs.prompt_run,
                is_chunked_prefill,
                seq_data,
                block_tables,
                sampling_params: group.sampling_params.clone(),
                computed_prefix_block_ids: self.block_manager.get_common_computed_block_ids(group),
            });

            for seq_id in seq_ids {
                self.block_manager.access_all_blocks_in_seq(seq_id, now);
            }
        }
        Ok((metadata_list, outputs))
    }

    fn schedule_inner(&mut self) -> Result<SchedulerOutputs, SchedulerError> {
        let mut blocks_to_swap_in: HashMap<SlotId, SlotId> = HashMap::new();
        let mut blocks_to_swap_out: HashMap<SlotId, SlotId> = HashMap::new();
        let mut blocks_to_copy: HashMap<SlotId, Vec<SlotId>> = HashMap::new();

        // Join waiting sequences if nothing is swapped out: swapped groups
        // already hold KV state and take priority over fresh prompts.
        if self.swapped.is_empty() {
            let mut scheduled: Vec<RequestId> = Vec::new();
            let mut ignored: Vec<RequestId> = Vec::new();
            // Sequences on the fly, including the generation phase.
            let mut num_curr_seqs: usize = self
                .running
                .iter()
                .map(|id| self.groups[id].get_max_num_running_seqs())
                .sum();
            let mut seq_lens: Vec<usize> = Vec::new();
            let mut still_prefilling: Vec<RequestId> = Vec::new();
            let mut num_prompt_groups = 0usize;

            // The waiting queue is not sorted: preempted groups re-enter
            // at the front, new arrivals at the back.
            while let Some(front) = self.waiting.front().cloned() {
                let decision = self.admission_decision(
                    &front,
                    &seq_lens,
                    num_curr_seqs,
                    num_prompt_groups,
                );
                match decision {
                    Admission::Stop => break,
                    Admission::Ignore => {
                        self.waiting.pop_front();
                        let group = self.groups.get_mut(&front).expect("waiting group missing");
                        for seq in &mut group.seqs {
                            seq.status = SequenceStatus::FinishedIgnored;
                        }
                        ignored.push(front);
                    }
                    Admission::Admit { chunk, num_new_seqs } => {
                        self.waiting.pop_front();
                        let first_waiting_id = {
                            let group = &self.groups[&front];
                            group.get_seqs(Some(SequenceStatus::Waiting))[0].seq_id
                        };
                        if !self.block_manager.has_block_table(first_waiting_id) {
                            self.block_manager.allocate(&self.groups[&front])?;
                        }

                        let group = self.groups.get_mut(&front).expect("waiting group missing");
                        let fully_prefilled = {
                            let seq = group
                                .find_mut(first_waiting_id)
                                .expect("waiting sequence missing");
                            seq.advance_prefill(chunk);
                            seq.get_num_unprefilled() == 0
                        };
                        if fully_prefilled {
                            for seq in group.get_seqs_mut(Some(SequenceStatus::Waiting)) {
                                seq.status = SequenceStatus::Running;
                            }
                            self.running.push_back(front.clone());
                        } else {
                            still_prefilling.push(front.clone());
                        }

                        seq_lens.push(chunk);
                        num_curr_seqs += num_new_seqs;
                        num_prompt_groups += 1;
                        scheduled.push(front);
                    }
                }
            }

            // Partially-prefilled groups resume first next step.
            for id in still_prefilling.into_iter().rev() {
                self.waiting.push_front(id);
            }

            if !scheduled.is_empty() || !ignored.is_empty() {
                // Prompts are right-padded to the longest in the batch.
                let num_batched_tokens = seq_lens
                    .iter()
                    .max()
                    .map_or(0, |max_len| seq_lens.len() * max_len);
                return Ok(SchedulerOutputs::new(
                    scheduled,
                    true,
                    num_batched_tokens,
                    blocks_to_swap_in,
                    blocks_to_swap_out,
                    blocks_to_copy,
                    ignored,
                ));
            }
        }

        // Decode step. Preemption happens only when there is no slot left
        // to keep every running group growing.
        self.policy.sort_by_priority(&mut self.running, &self.groups);

        let mut running = std::mem::take(&mut self.running);
        let mut new_running: VecDeque<RequestId> = VecDeque::new();
        let mut preempted: Vec<RequestId> = Vec::new();
        while let Some(current) = running.pop_front() {
            let mut reserved = true;
            while !self.block_manager.can_append_slot(&self.groups[&current]) {
                if let Some(victim) = running.pop_back() {
                    // Preempt the lowest-priority running group.
                    self.preempt(&victim, &mut blocks_to_swap_out)?;
                    preempted.push(victim);
                } else {
                    // Nothing else to preempt: the current group yields.
                    self.preempt(&current, &mut blocks_to_swap_out)?;
                    preempted.push(current.clone());
                    reserved = false;
                    break;
                }
            }
            if reserved {
                self.append_slots(&current, &mut blocks_to_copy)?;
                new_running.push_back(current);
            }
        }
        self.running = new_running;

        // Swap groups back in, unless this step already had to preempt.
        self.policy.sort_by_priority(&mut self.swapped, &self.groups);
        if preempted.is_empty() {
            let mut num_curr_seqs: usize = self
                .running
                .iter()
                .map(|id| self.groups[id].get_max_num_running_seqs())
                .sum();
            while let Some(front) = self.swapped.front().cloned() {
                if !self.block_manager.can_swap_in(&self.groups[&front]) {
                    break;
                }
                let num_new_seqs = self.groups[&front].get_max_num_running_seqs();
                if num_curr_seqs + num_new_seqs > self.config.max_num_seqs {
                    break;
                }
                self.swapped.pop_front();

                let mapping = self.block_manager.swap_in(&self.groups[&front])?;
                blocks_to_swap_in.extend(mapping);
                let group = self.groups.get_mut(&front).expect("swapped group missing");
                for seq in group.get_seqs_mut(Some(SequenceStatus::Swapped)) {
                    seq.status = SequenceStatus::Running;
                }
                self.append_slots(&front, &mut blocks_to_copy)?;
                num_curr_seqs += num_new_seqs;
                self.running.push_back(front);
            }
        }

        // Each generating sequence takes exactly one token slot.
        let num_batched_tokens: usize = self
            .running
            .iter()
            .map(|id| self.groups[id].num_seqs(Some(SequenceStatus::Running)))
            .sum();

        Ok(SchedulerOutputs::new(
            self.running.iter().cloned().collect(),
            false,
            num_batched_tokens,
            blocks_to_swap_in,
            blocks_to_swap_out,
            blocks_to_copy,
            Vec::new(),
        ))
    }

    fn admission_decision(
        &self,
        request_id: &RequestId,
        seq_lens: &[usize],
        num_curr_seqs: usize,
        num_prompt_groups: usize,
    ) -> Admission {
        let group = &self.groups[request_id];
        let waiting_seqs = group.get_seqs(Some(SequenceStatus::Waiting));
        assert_eq!(
            waiting_seqs.len(),
            1,
            "waiting sequence group should have one prompt sequence"
        );
        let seq = waiting_seqs[0];
        let num_prompt_tokens = seq.get_len();

        if num_prompt_tokens > self.prompt_limit {
            warn!(
                request_id = %request_id,
                num_prompt_tokens,
                limit = self.prompt_limit,
                "input prompt is too long and exceeds the scheduler limit"
            );
            return Admission::Ignore;
        }

        // A resumed chunked prefill already holds its blocks.
        if !self.block_manager.has_block_table(seq.seq_id) {
            match self.block_manager.can_allocate(group) {
                AllocStatus::Later => return Admission::Stop,
                AllocStatus::Never => {
                    warn!(
                        request_id = %request_id,
                        num_prompt_tokens,
                        "input prompt is too long and exceeds the block manager capacity"
                    );
                    return Admission::Ignore;
                }
                AllocStatus::Ok => {}
            }
        }

        if self.config.max_chunked_prefill_len.is_some()
            && num_prompt_groups >= self.config.max_num_prompt_seqs
        {
            return Admission::Stop;
        }

        let chunk = seq
            .get_num_unprefilled()
            .min(self.config.max_chunked_prefill_len.unwrap_or(usize::MAX));

        let max_len = seq_lens.iter().copied().max().unwrap_or(0).max(chunk);
        let num_batched_tokens = (seq_lens.len() + 1) * max_len;
        if num_batched_tokens > self.config.max_num_batched_tokens {
            return Admission::Stop;
        }

        let num_new_seqs = group.get_max_num_running_seqs();
        if num_curr_seqs + num_new_seqs > self.config.max_num_seqs {
            return Admission::Stop;
        }

        let num_paddings = num_batched_tokens - (seq_lens.iter().sum::<usize>() + chunk);
        if num_paddings > self.config.max_paddings {
            return Admission::Stop;
        }

        Admission::Admit { chunk, num_new_seqs }
    }

    fn append_slots(
        &mut self,
        request_id: &RequestId,
        blocks_to_copy: &mut HashMap<SlotId, Vec<SlotId>>,
    ) -> Result<(), SchedulerError> {
        let seq_ids: Vec<SeqId> = self.groups[request_id]
            .get_seqs(Some(SequenceStatus::Running))
            .iter()
            .map(|s| s.seq_id)
            .collect();
        for seq_id in seq_ids {
            let hint = {
                let group = &self.groups[request_id];
                let seq = group.find(seq_id).expect("running sequence missing");
                self.block_manager.append_slot(seq)?
            };
            if let Some((src, dst)) = hint {
                blocks_to_copy.entry(src).or_default().push(dst);
            }
        }
        Ok(())
    }

    fn preempt(
        &mut self,
        request_id: &RequestId,
        blocks_to_swap_out: &mut HashMap<SlotId, SlotId>,
    ) -> Result<(), SchedulerError> {
        // Recomputation is cheaper than swapping, but discards KV state
        // shared between siblings, so multi-sequence groups must swap.
        let mode = self.config.preemption_mode.unwrap_or_else(|| {
            if self.groups[request_id].get_max_num_running_seqs() == 1 {
                PreemptionMode::Recompute
            } else {
                PreemptionMode::Swap
            }
        });
        self.num_cumulative_preemptions += 1;
        debug!(request_id = %request_id, ?mode, "preempting sequence group");
        match mode {
            PreemptionMode::Recompute => {
                let group = self.groups.get_mut(request_id).expect("preempting unknown group");
                let running: Vec<SeqId> = group
                    .get_seqs(Some(SequenceStatus::Running))
                    .iter()
                    .map(|s| s.seq_id)
                    .collect();
                assert_eq!(running.len(), 1, "recompute preemption needs a single sequence");
                for seq in group.get_seqs_mut(Some(SequenceStatus::Running)) {
                    seq.status = SequenceStatus::Waiting;
                    seq.reset_prefill();
                }
                for seq_id in running {
                    self.block_manager.free(seq_id);
                }
                // FCFS: the preempted group goes to the front.
                self.waiting.push_front(request_id.clone());
            }
            PreemptionMode::Swap => {
                if !self.block_manager.can_swap_out(&self.groups[request_id]) {
                    return Err(SchedulerError::SwapSpaceExhausted);
                }
                let mapping = self.block_manager.swap_out(&self.groups[request_id])?;
                blocks_to_swap_out.extend(mapping);
                let group = self.groups.get_mut(request_id).expect("preempting unknown group");
                for seq in group.get_seqs_mut(Some(SequenceStatus::Running)) {
                    seq.status = SequenceStatus::Swapped;
                }
                self.swapped.push_back(request_id.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;
    use std::time::Instant;

    fn test_scheduler(
        block_size: usize,
        num_gpu: usize,
        num_cpu: usize,
        max_num_seqs: usize,
    ) -> Scheduler {
        Scheduler::new(
            SchedulerConfig {
                max_num_batched_tokens: 64,
                max_num_seqs,
                max_paddings: 1024,
                max_model_len: 16,
                ..Default::default()
            },
            &CacheConfig {
                block_size,
                num_gpu_blocks: num_gpu,
                num_cpu_blocks: num_cpu,
                watermark: 0.0,
                sliding_window: None,
                enable_prefix_caching: false,
            },
        )
    }

    fn dummy_group(request_id: &str, seq_id: SeqId, prompt_len: usize, block_size: usize) -> SequenceGroup {
        let prompt: Vec<u32> = (0..prompt_len as u32).collect();
        SequenceGroup::new(
            request_id,
            "dummy",
            vec![Sequence::new(seq_id, prompt, block_size)],
            SamplingParams::default(),
            Instant::now(),
        )
    }

    #[test]
    fn test_add_seq_group_counts() {
        let mut scheduler = test_scheduler(4, 4, 4, 100);
        for i in 0..4u64 {
            scheduler.add_seq_group(dummy_group(&i.to_string(), i, 4, 4));
            assert_eq!(scheduler.get_num_unfinished_seq_groups(), i as usize + 1);
        }
    }

    #[test]
    fn test_abort_restores_queues() {
        let mut scheduler = test_scheduler(4, 4, 4, 100);
        let ids: Vec<RequestId> = (0..4u64)
            .map(|i| {
                scheduler.add_seq_group(dummy_group(&i.to_string(), i, 4, 4));
                i.to_string()
            })
            .collect();
        assert_eq!(scheduler.get_num_unfinished_seq_groups(), 4);
        scheduler.abort_seq_group(&ids);
        assert_eq!(scheduler.get_num_unfinished_seq_groups(), 0);
        assert!(!scheduler.has_unfinished_seq_groups());
    }

    #[test]
    fn test_abort_unknown_id_is_noop() {
        let mut scheduler = test_scheduler(4, 4, 4, 100);
        scheduler.add_seq_group(dummy_group("0", 0, 4, 4));
        scheduler.abort_seq_group(&["no-such-request".to_string()]);
        assert_eq!(scheduler.get_num_unfinished_seq_groups(), 1);
    }

    #[test]
    fn test_prompt_exceeding_limit_is_ignored() {
        let mut scheduler = test_scheduler(4, 32, 32, 100);
        // max_model_len is 16.
        scheduler.add_seq_group(dummy_group("long", 0, 17, 4));
        let (metadata, out) = scheduler.schedule().unwrap();
        assert!(metadata.is_empty());
        assert!(out.prompt_run);
        assert_eq!(out.ignored_request_ids, vec!["long".to_string()]);
        let group = scheduler.get_group("long").unwrap();
        assert_eq!(group.seqs[0].status, SequenceStatus::FinishedIgnored);
        assert_eq!(scheduler.get_num_unfinished_seq_groups(), 0);
    }

    #[test]
    fn test_batched_token_cap_defers_admission() {
        // max_num_batched_tokens is 64: five 16-token prompts exceed it.
        let mut scheduler = test_scheduler(4, 64, 0, 100);
        for i in 0..5u64 {
            scheduler.add_seq_group(dummy_group(&i.to_string(), i, 16, 4));
        }
        let (_, out) = scheduler.schedule().unwrap();
        assert_eq!(out.scheduled_request_ids.len(), 4);
        assert_eq!(out.num_batched_tokens, 64);
        // The fifth is still waiting, not lost.
        assert_eq!(scheduler.num_waiting(), 1);
    }

    #[test]
    fn test_max_num_seqs_cap() {
        let mut scheduler = test_scheduler(4, 32, 32, 2);
        scheduler.add_seq_group(dummy_group("0", 0, 4, 4));
        let (_, out) = scheduler.schedule().unwrap();
        assert_eq!(out.scheduled_request_ids, vec!["0".to_string()]);

        let (_, out) = scheduler.schedule().unwrap();
        assert!(!out.prompt_run);
        assert_eq!(out.scheduled_request_ids, vec!["0".to_string()]);

        scheduler.add_seq_group(dummy_group("1", 1, 4, 4));
        scheduler.add_seq_group(dummy_group("2", 2, 4, 4));
        // Only one more fits under max_num_seqs=2.
        let (_, out) = scheduler.schedule().unwrap();
        assert_eq!(out.scheduled_request_ids, vec!["1".to_string()]);
    }
}
