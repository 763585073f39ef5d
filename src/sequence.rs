//! Sequences and sequence groups.
//!
//! A [`Sequence`] is the token stream of one generation; a
//! [`SequenceGroup`] bundles the sibling sequences of a request (parallel
//! sampling or beam search) that share the same prompt. The scheduler
//! manipulates groups; the block manager maps sequences to physical
//! slots.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::block::TokenId;
use crate::sampling::SamplingParams;

pub type SeqId = u64;

/// Lifecycle of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Swapped,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
    FinishedIgnored,
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SequenceStatus::FinishedStopped
                | SequenceStatus::FinishedLengthCapped
                | SequenceStatus::FinishedAborted
                | SequenceStatus::FinishedIgnored
        )
    }
}

/// Token-level payload of a sequence, snapshotted into batch metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceData {
    pub prompt_token_ids: Vec<TokenId>,
    pub output_token_ids: Vec<TokenId>,
    pub cumulative_logprob: f32,
}

impl SequenceData {
    pub fn new(prompt_token_ids: Vec<TokenId>) -> Self {
        Self {
            prompt_token_ids,
            output_token_ids: Vec::new(),
            cumulative_logprob: 0.0,
        }
    }

    pub fn get_len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    /// The full token stream, prompt then outputs.
    pub fn get_token_ids(&self) -> Vec<TokenId> {
        let mut ids = self.prompt_token_ids.clone();
        ids.extend_from_slice(&self.output_token_ids);
        ids
    }

    pub fn last_token_id(&self) -> Option<TokenId> {
        self.output_token_ids
            .last()
            .or(self.prompt_token_ids.last())
            .copied()
    }
}

#[derive(Debug, Clone)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub data: SequenceData,
    pub status: SequenceStatus,
    /// Per-output-token logprob maps, parallel to `data.output_token_ids`.
    pub output_logprobs: Vec<HashMap<TokenId, f32>>,
    block_size: usize,
    /// Tokens whose KV content has been computed. Only consulted while
    /// the sequence is WAITING (chunked prefill admission); reset when a
    /// recompute-preemption discards the KV state.
    num_prefilled_tokens: usize,
}

impl Sequence {
    pub fn new(seq_id: SeqId, prompt_token_ids: Vec<TokenId>, block_size: usize) -> Self {
        Self {
            seq_id,
            data: SequenceData::new(prompt_token_ids),
            status: SequenceStatus::Waiting,
            output_logprobs: Vec::new(),
            block_size,
            num_prefilled_tokens: 0,
        }
    }

    pub fn get_len(&self) -> usize {
        self.data.get_len()
    }

    pub fn get_output_len(&self) -> usize {
        self.data.output_token_ids.len()
    }

    pub fn num_logical_blocks(&self) -> usize {
        self.get_len().div_ceil(self.block_size)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Record one sampled token and its logprobs.
    pub fn append_token_id(&mut self, token_id: TokenId, logprobs: HashMap<TokenId, f32>) {
        if let Some(lp) = logprobs.get(&token_id) {
            self.data.cumulative_logprob += lp;
        }
        self.data.output_token_ids.push(token_id);
        self.output_logprobs.push(logprobs);
    }

    pub fn get_num_unprefilled(&self) -> usize {
        self.get_len() - self.num_prefilled_tokens
    }

    pub fn advance_prefill(&mut self, num_tokens: usize) {
        self.num_prefilled_tokens += num_tokens;
        assert!(self.num_prefilled_tokens <= self.get_len());
    }

    /// Discarded KV state must be recomputed from scratch.
    pub fn reset_prefill(&mut self) {
        self.num_prefilled_tokens = 0;
    }

    /// Clone this sequence under a new id (beam/parallel-sampling fork).
    pub fn fork(&self, new_seq_id: SeqId) -> Sequence {
        let mut child = self.clone();
        child.seq_id = new_seq_id;
        child
    }
}

/// All sibling sequences of one request.
#[derive(Debug)]
pub struct SequenceGroup {
    pub request_id: String,
    pub prompt: String,
    pub seqs: Vec<Sequence>,
    pub sampling_params: SamplingParams,
    pub arrival_time: Instant,
}

impl SequenceGroup {
    pub fn new(
        request_id: impl Into<String>,
        prompt: impl Into<String>,
        seqs: Vec<Sequence>,
        sampling_params: SamplingParams,
        arrival_time: Instant,
    ) -> Self {
        assert!(!seqs.is_empty(), "sequence group needs at least one sequence");
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            seqs,
            sampling_params,
            arrival_time,
        }
    }

    pub fn get_seqs(&self, status: Option<SequenceStatus>) -> Vec<&Sequence> {
        self.seqs
            .iter()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .collect()
    }

    pub fn get_seqs_mut(&mut self, status: Option<SequenceStatus>) -> Vec<&mut Sequence> {
        self.seqs
            .iter_mut()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .collect()
    }

    pub fn num_seqs(&self, status: Option<SequenceStatus>) -> usize {
        self.get_seqs(status).len()
    }

    pub fn find(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id == seq_id)
    }

    pub fn find_mut(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id == seq_id)
    }

    /// Upper bound on sequences this group may run at once; the scheduler
    /// budgets `max_num_seqs` against it.
    pub fn get_max_num_running_seqs(&self) -> usize {
        let params = &self.sampling_params;
        if params.use_beam_search {
            // Beam width stays constant over the generation.
            return params.best_of;
        }
        if params.best_of > self.seqs.len() {
            // Prompt stage: the generation stage will fan out to best_of.
            return params.best_of;
        }
        self.seqs.iter().filter(|s| !s.is_finished()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(|s| s.is_finished())
    }
}
