//! External collaborator interfaces.
//!
//! The core never touches model math or tensors: it hands the executor a
//! batch plan ([`BatchMetadata`] + [`SchedulerOutputs`]) and gets back
//! one sampled token per running sequence. The tokenizer is only
//! consulted at request boundaries, never inside a step.

use std::collections::HashMap;

use crate::block::TokenId;
use crate::scheduler::{BatchMetadata, RequestId, SchedulerOutputs};
use crate::sequence::SeqId;

/// One sampled token for one sequence.
///
/// `parent_seq_id` differs from `seq_id` when the sampler forked a new
/// sequence off an existing one (beam search); the engine then clones the
/// parent's state and block table before applying the token.
#[derive(Debug, Clone)]
pub struct SequenceSample {
    pub seq_id: SeqId,
    pub parent_seq_id: SeqId,
    pub token_id: TokenId,
    pub logprobs: HashMap<TokenId, f32>,
}

/// Sampler results for one scheduled group.
#[derive(Debug, Clone)]
pub struct SamplerOutput {
    pub request_id: RequestId,
    pub samples: Vec<SequenceSample>,
}

/// Runs the model over a scheduled batch.
///
/// The executor must perform the swap and copy plans in
/// [`SchedulerOutputs`] before computing, and must return exactly one
/// sample per running sequence of every scheduled group.
pub trait ModelExecutor {
    fn execute(&mut self, batch: &[BatchMetadata], outputs: &SchedulerOutputs) -> Vec<SamplerOutput>;
}

/// Turns token ids back into text. Only invoked at request boundaries.
pub trait TokenDecoder {
    fn decode(&self, token_ids: &[TokenId], skip_special_tokens: bool) -> String;
}

/// Deterministic stand-in executor for tests and the demo driver: each
/// sequence "generates" its own prompt again, token by token.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

impl ModelExecutor for EchoExecutor {
    fn execute(&mut self, batch: &[BatchMetadata], _outputs: &SchedulerOutputs) -> Vec<SamplerOutput> {
        let mut results = Vec::with_capacity(batch.len());
        for metadata in batch {
            let mut seq_ids: Vec<SeqId> = metadata.seq_data.keys().copied().collect();
            seq_ids.sort_unstable();

            let samples = seq_ids
                .into_iter()
                .map(|seq_id| {
                    let data = &metadata.seq_data[&seq_id];
                    let prompt = &data.prompt_token_ids;
                    let token_id = prompt[data.output_token_ids.len() % prompt.len()];
                    SequenceSample {
                        seq_id,
                        parent_seq_id: seq_id,
                        token_id,
                        logprobs: HashMap::from([(token_id, -0.1)]),
                    }
                })
                .collect();
            results.push(SamplerOutput {
                request_id: metadata.request_id.clone(),
                samples,
            });
        }
        results
    }
}

/// Decoder that renders token ids as space-separated numbers.
#[derive(Debug, Clone, Default)]
pub struct IdDecoder;

impl TokenDecoder for IdDecoder {
    fn decode(&self, token_ids: &[TokenId], _skip_special_tokens: bool) -> String {
        token_ids
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
