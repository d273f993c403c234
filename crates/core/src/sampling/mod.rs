//! Sampling orchestration: logit processing, probability computation, top-p
//! renormalization, and per-request RNG draws.

pub mod processor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;

use crate::model::Logits;
use crate::request::GenerationConfig;
use crate::state::RequestModelState;

/// A committed or draft token together with its probability info.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub token_id: i32,
    /// Probability of the token under the pre-top-p distribution.
    pub prob: f32,
    /// Top-k alternatives as `(token_id, logprob)`, empty unless requested.
    pub top_logprobs: Vec<(i32, f32)>,
}

#[derive(Serialize)]
struct LogprobEntry {
    token_id: i32,
    logprob: f32,
}

#[derive(Serialize)]
struct LogprobPayload {
    token_id: i32,
    logprob: f32,
    top_logprobs: Vec<LogprobEntry>,
}

impl SampleResult {
    pub fn new(token_id: i32, prob: f32) -> Self {
        Self {
            token_id,
            prob,
            top_logprobs: Vec::new(),
        }
    }

    /// Render this token's logprob info as the JSON string delivered through
    /// the stream callback.
    pub fn logprob_json(&self) -> String {
        let payload = LogprobPayload {
            token_id: self.token_id,
            logprob: self.prob.ln(),
            top_logprobs: self
                .top_logprobs
                .iter()
                .map(|&(token_id, logprob)| LogprobEntry { token_id, logprob })
                .collect(),
        };
        serde_json::to_string(&payload).expect("logprob payload serialization")
    }
}

/// Per-entry RNG. Seeded for reproducible branches, from entropy otherwise.
#[derive(Debug)]
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("NaN logits in row {row} (request {request_id})")]
    NanLogits { row: usize, request_id: String },
}

/// Run the full sampling pipeline over one batch of logits.
///
/// `row_*` slices describe the logits rows. `sample_indices` maps each
/// desired sample back to a row, so several samples (parallel completions)
/// can be drawn from a single row. `rngs` holds one RNG per sample.
///
/// Returns the pre-top-p probability rows (needed downstream for draft
/// verification) along with the sample results.
pub fn apply_logit_processor_and_sample(
    logits: &mut Logits,
    row_cfgs: &[&GenerationConfig],
    row_request_ids: &[&str],
    row_mstates: &[&RequestModelState],
    sample_indices: &[usize],
    rngs: &mut [SamplerState],
) -> Result<(Vec<Vec<f32>>, Vec<SampleResult>), SamplingError> {
    assert_eq!(logits.num_rows(), row_cfgs.len());
    assert_eq!(row_cfgs.len(), row_request_ids.len());
    assert_eq!(row_cfgs.len(), row_mstates.len());
    assert_eq!(sample_indices.len(), rngs.len());

    processor::update_logits_in_place(logits, row_cfgs, row_mstates);
    let probs = compute_probs(logits, row_cfgs, row_request_ids)?;
    let renormalized = renormalize_by_top_p(&probs, sample_indices, row_cfgs);

    let mut results = Vec::with_capacity(sample_indices.len());
    for (i, &row) in sample_indices.iter().enumerate() {
        let cfg = row_cfgs[row];
        let token_id = sample_from_probs(&renormalized[i], rngs[i].rng_mut());
        let mut result = SampleResult::new(token_id, probs[row][token_id as usize]);
        if cfg.logprobs > 0 {
            result.top_logprobs = extract_top_logprobs(&probs[row], cfg.logprobs);
        }
        results.push(result);
    }
    Ok((probs, results))
}

/// Turn logits rows into probability rows.
///
/// Temperature scaling followed by softmax; temperature zero short-circuits
/// to a one-hot argmax distribution. Non-finite logits fail the row.
pub fn compute_probs(
    logits: &Logits,
    row_cfgs: &[&GenerationConfig],
    row_request_ids: &[&str],
) -> Result<Vec<Vec<f32>>, SamplingError> {
    let mut probs = Vec::with_capacity(logits.num_rows());
    for row in 0..logits.num_rows() {
        let values = logits.row(row);
        // Negative infinity is a legitimate mask value; NaN is not.
        if values.iter().any(|v| v.is_nan()) {
            tracing::warn!(request_id = row_request_ids[row], row, "NaN logits");
            return Err(SamplingError::NanLogits {
                row,
                request_id: row_request_ids[row].to_string(),
            });
        }
        let cfg = row_cfgs[row];
        if cfg.is_greedy() {
            let mut one_hot = vec![0.0; values.len()];
            one_hot[argmax(values) as usize] = 1.0;
            probs.push(one_hot);
        } else {
            let inv_temp = 1.0 / cfg.temperature;
            let scaled: Vec<f32> = values.iter().map(|&v| v * inv_temp).collect();
            probs.push(softmax(&scaled));
        }
    }
    Ok(probs)
}

/// Gather probability rows by `sample_indices` and renormalize each gathered
/// row by its request's top-p.
pub fn renormalize_by_top_p(
    probs: &[Vec<f32>],
    sample_indices: &[usize],
    row_cfgs: &[&GenerationConfig],
) -> Vec<Vec<f32>> {
    sample_indices
        .iter()
        .map(|&row| {
            let mut renorm = probs[row].clone();
            let top_p = row_cfgs[row].top_p;
            if top_p < 1.0 && top_p > 0.0 {
                apply_top_p(&mut renorm, top_p);
            }
            let sum: f32 = renorm.iter().sum();
            if sum > 0.0 && sum != 1.0 {
                let inv_sum = 1.0 / sum;
                for p in renorm.iter_mut() {
                    *p *= inv_sum;
                }
            }
            renorm
        })
        .collect()
}

fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff_idx = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff_idx = i + 1;
            break;
        }
    }
    for &(idx, _) in &indexed[cutoff_idx..] {
        probs[idx] = 0.0;
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

pub(crate) fn argmax(values: &[f32]) -> i32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as i32)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> i32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as i32;
        }
    }
    probs.len() as i32 - 1
}

/// Top-k tokens of a probability row, as `(token_id, logprob)`.
fn extract_top_logprobs(probs: &[f32], k: usize) -> Vec<(i32, f32)> {
    let mut indexed: Vec<(i32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as i32, p.ln()))
        .collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}
