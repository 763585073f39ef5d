//! Sampling parameters attached to a request.
//!
//! Only `n`, `best_of`, `max_tokens`, and `use_beam_search` influence
//! scheduling and block accounting; everything else is carried through
//! verbatim for the model executor.

use serde::{Deserialize, Serialize};

use crate::block::TokenId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of completions to return.
    pub n: usize,
    /// Number of sequences generated before picking the top `n`.
    pub best_of: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub repetition_penalty: f32,
    /// Maximum generated tokens per sequence.
    pub max_tokens: usize,
    /// Stop strings, matched by the caller against decoded text.
    pub stop: Vec<String>,
    /// Token ids that terminate generation when sampled.
    pub stop_token_ids: Vec<TokenId>,
    pub ignore_eos: bool,
    /// Number of logprobs to return per token, if any.
    pub logprobs: Option<usize>,
    pub use_beam_search: bool,
    pub length_penalty: f32,
    pub early_stopping: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            best_of: 1,
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_penalty: 1.0,
            max_tokens: 16,
            stop: Vec::new(),
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            logprobs: None,
            use_beam_search: false,
            length_penalty: 1.0,
            early_stopping: false,
        }
    }
}

impl SamplingParams {
    /// Check the fields the scheduler depends on.
    pub fn verify(&self) -> Result<(), String> {
        if self.n == 0 {
            return Err("n must be at least 1".into());
        }
        if self.best_of < self.n {
            return Err(format!("best_of ({}) must be >= n ({})", self.best_of, self.n));
        }
        if self.use_beam_search && self.best_of == 1 {
            return Err("beam search requires best_of > 1".into());
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be at least 1".into());
        }
        Ok(())
    }
}
