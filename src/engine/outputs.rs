//! Request-level outputs returned from [`LlmEngine::step`].
//!
//! [`LlmEngine::step`]: crate::engine::LlmEngine::step

use std::collections::HashMap;

use serde::Serialize;

use crate::block::TokenId;
use crate::executor::TokenDecoder;
use crate::sequence::{SequenceGroup, SequenceStatus};

/// Why a completion stopped, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// EOS or a stop token was sampled.
    Stop,
    /// `max_tokens` or the model context length was reached.
    Length,
}

/// One completed (or in-progress) generation of a request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutput {
    /// Index of this completion within the request.
    pub index: usize,
    /// Decoded text. Filled in once the sequence finishes; the tokenizer
    /// is not consulted while the sequence is still running.
    pub text: String,
    pub token_ids: Vec<TokenId>,
    pub cumulative_logprob: f32,
    pub logprobs: Vec<HashMap<TokenId, f32>>,
    pub finish_reason: Option<FinishReason>,
}

impl CompletionOutput {
    pub fn finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Per-step view of one request's progress.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutput {
    pub request_id: String,
    pub prompt: String,
    pub prompt_token_ids: Vec<TokenId>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
}

impl RequestOutput {
    /// Snapshot the top-`n` sequences of a group, ranked by cumulative
    /// logprob.
    pub fn from_seq_group(seq_group: &SequenceGroup, decoder: &dyn TokenDecoder) -> Self {
        let n = seq_group.sampling_params.n;
        let mut ranked: Vec<usize> = (0..seq_group.seqs.len()).collect();
        ranked.sort_by(|a, b| {
            let la = seq_group.seqs[*a].data.cumulative_logprob;
            let lb = seq_group.seqs[*b].data.cumulative_logprob;
            lb.partial_cmp(&la).unwrap_or(std::cmp::Ordering::Equal)
        });

        let outputs = ranked
            .into_iter()
            .take(n)
            .map(|index| {
                let seq = &seq_group.seqs[index];
                let finish_reason = match seq.status {
                    SequenceStatus::FinishedStopped => Some(FinishReason::Stop),
                    SequenceStatus::FinishedLengthCapped => Some(FinishReason::Length),
                    _ => None,
                };
                let text = if seq.is_finished() {
                    decoder.decode(&seq.data.output_token_ids, true)
                } else {
                    String::new()
                };
                // Sampled-token logprobs are always tracked internally;
                // only surface them when the request asked.
                let logprobs = if seq_group.sampling_params.logprobs.is_some() {
                    seq.output_logprobs.clone()
                } else {
                    Vec::new()
                };
                CompletionOutput {
                    index,
                    text,
                    token_ids: seq.data.output_token_ids.clone(),
                    cumulative_logprob: seq.data.cumulative_logprob,
                    logprobs,
                    finish_reason,
                }
            })
            .collect();

        Self {
            request_id: seq_group.request_id.clone(),
            prompt: seq_group.prompt.clone(),
            prompt_token_ids: seq_group.seqs[0].data.prompt_token_ids.clone(),
            outputs,
            finished: seq_group.is_finished(),
        }
    }
}
