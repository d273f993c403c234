//! In-place logit updates applied before probability computation: repetition
//! and frequency/presence penalties, per-request logit bias, and grammar
//! bitmasks.

use crate::model::Logits;
use crate::request::GenerationConfig;
use crate::state::RequestModelState;

/// Apply every configured logit transform to each row. Ordering matters:
/// penalties first, then bias, then the grammar mask so a constraint can
/// never be overridden.
pub fn update_logits_in_place(
    logits: &mut Logits,
    row_cfgs: &[&GenerationConfig],
    row_mstates: &[&RequestModelState],
) {
    let vocab_size = logits.vocab_size();
    let mut bitmask = vec![0u32; vocab_size.div_ceil(32)];

    for row in 0..logits.num_rows() {
        let cfg = row_cfgs[row];
        let mstate = row_mstates[row];
        let values = logits.row_mut(row);

        if cfg.repetition_penalty != 1.0 {
            apply_repetition_penalty(values, mstate, cfg.repetition_penalty);
        }
        if cfg.frequency_penalty != 0.0 || cfg.presence_penalty != 0.0 {
            apply_frequency_presence_penalty(
                values,
                mstate,
                cfg.frequency_penalty,
                cfg.presence_penalty,
            );
        }
        if let Some(bias) = &cfg.logit_bias {
            apply_logit_bias(values, bias);
        }
        if let Some(matcher) = &mstate.grammar_matcher {
            if matcher.requires_bitmask() {
                matcher.fill_next_token_bitmask(&mut bitmask, vocab_size);
                apply_bitmask(values, &bitmask);
            }
        }
    }
}

fn apply_repetition_penalty(logits: &mut [f32], mstate: &RequestModelState, penalty: f32) {
    for &token_id in mstate.appeared_token_ids.keys() {
        let idx = token_id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

/// OpenAI convention: `logit -= frequency_penalty * count + presence_penalty`.
fn apply_frequency_presence_penalty(
    logits: &mut [f32],
    mstate: &RequestModelState,
    frequency_penalty: f32,
    presence_penalty: f32,
) {
    for (&token_id, &count) in &mstate.appeared_token_ids {
        let idx = token_id as usize;
        if idx < logits.len() && count > 0 {
            logits[idx] -= frequency_penalty * count as f32 + presence_penalty;
        }
    }
}

fn apply_logit_bias(logits: &mut [f32], bias: &[(i32, f32)]) {
    for &(token_id, value) in bias {
        let idx = token_id as usize;
        if idx < logits.len() {
            logits[idx] += value;
        }
    }
}

fn apply_bitmask(logits: &mut [f32], bitmask: &[u32]) {
    for (idx, logit) in logits.iter_mut().enumerate() {
        if bitmask[idx / 32] & (1 << (idx % 32)) == 0 {
            *logit = f32::NEG_INFINITY;
        }
    }
}
