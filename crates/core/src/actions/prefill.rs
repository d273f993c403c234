//! New-request and resumed-entry prefill: admission from the waiting queue,
//! prefix-cache fan-in, chunked input feeding, branch fan-out, and first
//! token sampling.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::draft::DraftTokenWorkspace;
use crate::engine_state::EngineState;
use crate::model::{ModelHandle, PrefillInput};
use crate::request::{Data, FinishReason, RequestId};
use crate::sampling::{apply_logit_processor_and_sample, SamplerState};
use crate::state::RequestStateStatus;
use crate::stream::RequestStreamCallback;

use super::abort_request;

/// Run one prefill step for the request at the front of the waiting queue.
///
/// A request enters the running queue when its first chunk lands but stays
/// in the waiting queue until every entry's inputs drain, which is what lets
/// preemption distinguish a straddling request. Returns the request ids that
/// took part, for the post-step reconciler.
pub fn prefill_step(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    config: &EngineConfig,
    callback: &mut RequestStreamCallback<'_>,
    mut draft_ws: Option<&mut DraftTokenWorkspace>,
) -> Vec<RequestId> {
    let Some(rid) = estate.waiting_queue.front().cloned() else {
        return Vec::new();
    };
    let already_running = estate.running_queue.contains(&rid);
    if !already_running && estate.running_queue.len() >= config.max_num_sequence {
        // Out of capacity. Not an error: the scheduler may preempt and retry.
        tracing::debug!(request_id = %rid, "prefill deferred, running queue full");
        return Vec::new();
    }

    // Pick the first entry owing prefill whose parent, if any, is fully
    // prefilled (a child forks off the parent's final prefill position).
    let Some(entry_idx) = ({
        let rstate = estate.request_state(&rid);
        rstate.entries.iter().position(|e| {
            e.status != RequestStateStatus::Finished
                && !e.mstates[0].inputs.is_empty()
                && e.parent_idx.map_or(true, |p| {
                    let parent = &rstate.entries[p];
                    parent.status == RequestStateStatus::Alive
                        && parent.mstates[0].inputs.is_empty()
                })
        })
    }) else {
        // Nothing left to prefill for this request.
        estate.waiting_queue.pop_front();
        return Vec::new();
    };

    let request = Arc::clone(&estate.request_state(&rid).request);
    ensure_resident(estate, models, config, &rid, entry_idx, already_running);

    // Take one chunk of inputs, identically from every model state.
    let chunk = {
        let entry = &mut estate.request_state_mut(&rid).entries[entry_idx];
        let chunk = take_prefill_chunk(&mut entry.mstates[0].inputs, config.prefill_chunk_size);
        for ms in entry.mstates[1..].iter_mut() {
            let mirrored = take_prefill_chunk(&mut ms.inputs, config.prefill_chunk_size);
            debug_assert_eq!(
                mirrored.iter().map(Data::len).sum::<usize>(),
                chunk.iter().map(Data::len).sum::<usize>()
            );
        }
        chunk
    };
    let chunk_len: usize = chunk.iter().map(Data::len).sum();
    let seq_id = estate.request_state(&rid).entries[entry_idx].mstates[0].internal_id;

    let mut logits = None;
    for m in 0..models.len() {
        let batch = [PrefillInput {
            seq_id,
            inputs: chunk.clone(),
        }];
        match models[m].prefill(&batch) {
            Ok(l) => {
                if m == 0 {
                    logits = Some(l);
                }
            }
            Err(e) => {
                tracing::error!(request_id = %rid, model = m, error = %e, "prefill failed");
                let _ = abort_request(
                    estate,
                    models,
                    &rid,
                    FinishReason::Error,
                    &mut *callback,
                    draft_ws.as_deref_mut(),
                );
                return Vec::new();
            }
        }
    }
    let mut logits = logits.expect("engine requires at least one model");

    let prefill_done = {
        let entry = &mut estate.request_state_mut(&rid).entries[entry_idx];
        for ms in &mut entry.mstates {
            ms.num_prefilled_tokens += chunk_len;
            ms.prefilled_inputs.extend(chunk.iter().cloned());
        }
        let done = entry.mstates[0].inputs.is_empty();
        if done {
            // Any committed tokens were just re-prefilled as inputs, so the
            // cache learns them through `prefilled_inputs`; the committed
            // watermark must not announce them a second time.
            for ms in &mut entry.mstates {
                ms.cached_committed_tokens = ms.committed_tokens.len();
            }
        }
        done
    };
    if !prefill_done {
        return vec![rid];
    }

    // This entry's prefill is complete.
    let now = std::time::Instant::now();
    let n = request.generation_cfg.n;
    let sample_targets: Vec<usize> = {
        let rstate = estate.request_state_mut(&rid);
        rstate.entries[entry_idx].tprefill_finish = now;

        if entry_idx == 0 && n > 1 {
            // Fan the shared prefix out to any branch that has never run.
            // Branches resumed after preemption carry their own inputs and
            // go through the child prefill path instead.
            let root_id = rstate.entries[0].mstates[0].internal_id;
            let prefix_len = rstate.entries[0].mstates[0].num_prefilled_tokens;
            let fresh: Vec<usize> = rstate.entries[0]
                .child_indices
                .clone()
                .into_iter()
                .filter(|&c| {
                    let child = &rstate.entries[c];
                    child.status == RequestStateStatus::Pending
                        && child.mstates[0].committed_tokens.is_empty()
                        && child.mstates[0].inputs.is_empty()
                })
                .collect();
            for &c in &fresh {
                let child = &mut rstate.entries[c];
                let child_id = child.mstates[0].internal_id;
                for model in models.iter_mut() {
                    model.fork_sequence(root_id, child_id, prefix_len);
                }
                child.status = RequestStateStatus::Alive;
                child.tprefill_finish = now;
                for ms in &mut child.mstates {
                    ms.num_prefilled_tokens = prefix_len;
                }
            }
            fresh
        } else {
            vec![entry_idx]
        }
    };

    // Once no entry owes prefill, the request is purely running.
    let still_straddling = estate.request_state(&rid).entries.iter().any(|e| {
        e.status != RequestStateStatus::Finished && !e.mstates[0].inputs.is_empty()
    });
    if !still_straddling {
        estate.waiting_queue.retain(|id| id != &rid);
    }

    // Sample the next token for each target branch from the prefill logits
    // row. Several branches draw from the same row with their own RNGs.
    if !sample_targets.is_empty() {
        let mut rngs: Vec<SamplerState> = {
            let rstate = estate.request_state_mut(&rid);
            sample_targets
                .iter()
                .map(|&t| std::mem::replace(&mut rstate.entries[t].rng, SamplerState::new(Some(0))))
                .collect()
        };
        let sample_indices = vec![0usize; sample_targets.len()];
        let cfg = &request.generation_cfg;
        let result = {
            let row_mstate = &estate.request_state(&rid).entries[entry_idx].mstates[0];
            apply_logit_processor_and_sample(
                &mut logits,
                &[cfg],
                &[rid.as_str()],
                &[row_mstate],
                &sample_indices,
                &mut rngs,
            )
        };
        match result {
            Ok((_probs, samples)) => {
                let rstate = estate.request_state_mut(&rid);
                for (i, &t) in sample_targets.iter().enumerate() {
                    let entry = &mut rstate.entries[t];
                    std::mem::swap(&mut entry.rng, &mut rngs[i]);
                    for ms in &mut entry.mstates {
                        ms.commit_token(samples[i].clone());
                    }
                }
            }
            Err(e) => {
                tracing::error!(request_id = %rid, error = %e, "sampling failed after prefill");
                let _ = abort_request(
                    estate,
                    models,
                    &rid,
                    FinishReason::Error,
                    &mut *callback,
                    draft_ws.as_deref_mut(),
                );
                return Vec::new();
            }
        }
    }

    vec![rid]
}

/// Give a pending entry KV residency: fork from its parent, fork from a
/// prefix-cache hit, or start an empty sequence.
fn ensure_resident(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    config: &EngineConfig,
    rid: &RequestId,
    entry_idx: usize,
    already_running: bool,
) {
    let EngineState {
        request_states,
        prefix_cache,
        running_queue,
        ..
    } = estate;
    let rstate = request_states
        .get_mut(rid.as_str())
        .unwrap_or_else(|| panic!("no state for request {rid:?}"));
    if rstate.entries[entry_idx].status != RequestStateStatus::Pending {
        return;
    }
    let seq_id = rstate.entries[entry_idx].mstates[0].internal_id;

    if let Some(p) = rstate.entries[entry_idx].parent_idx {
        // Child resuming after preemption: the prefix lives in the parent.
        let parent_id = rstate.entries[p].mstates[0].internal_id;
        let fork_pos = rstate.entries[p].mstates[0].num_prefilled_tokens;
        for model in models.iter_mut() {
            model.fork_sequence(parent_id, seq_id, fork_pos);
        }
        for ms in &mut rstate.entries[entry_idx].mstates {
            ms.num_prefilled_tokens = fork_pos;
        }
    } else {
        let entry = &mut rstate.entries[entry_idx];
        let mut forked = false;
        if config.enable_prefix_cache {
            if let Some(prompt) = flatten_token_inputs(&entry.mstates[0].inputs) {
                // Leave at least one token to prefill so the model produces
                // a logits row for the first sample.
                if let Some(hit) = prefix_cache.match_prefix(&prompt) {
                    let matched = hit.matched_len.min(prompt.len() - 1);
                    if matched > 0 {
                        tracing::debug!(
                            request_id = %rid,
                            parent = hit.seq_id,
                            matched,
                            "prefix cache hit"
                        );
                        for model in models.iter_mut() {
                            model.fork_sequence(hit.seq_id, seq_id, matched);
                        }
                        prefix_cache.fork(hit.seq_id, seq_id, matched);
                        for ms in &mut entry.mstates {
                            strip_leading_tokens(&mut ms.inputs, matched);
                            ms.num_prefilled_tokens = matched;
                        }
                        forked = true;
                    }
                }
                if !forked {
                    for model in models.iter_mut() {
                        model.add_sequence(seq_id);
                    }
                    prefix_cache.insert(seq_id, Vec::new());
                    forked = true;
                }
            }
        }
        if !forked {
            // Cache disabled or multimodal prompt: plain KV residency.
            for model in models.iter_mut() {
                model.add_sequence(seq_id);
            }
        }
    }

    rstate.entries[entry_idx].status = RequestStateStatus::Alive;
    if !already_running && !running_queue.contains(rid) {
        running_queue.push_back(rid.clone());
    }
}

fn flatten_token_inputs(inputs: &[Data]) -> Option<Vec<i32>> {
    let mut out = Vec::new();
    for data in inputs {
        out.extend_from_slice(&data.as_token()?.token_ids);
    }
    Some(out)
}

/// Remove the first `n` token positions from the front of `inputs`.
fn strip_leading_tokens(inputs: &mut Vec<Data>, mut n: usize) {
    while n > 0 {
        let block_len = inputs[0].len();
        if block_len <= n {
            n -= block_len;
            inputs.remove(0);
        } else {
            match &mut inputs[0] {
                Data::Token(t) => {
                    t.token_ids.drain(..n);
                }
                _ => unreachable!("strip inside non-token block"),
            }
            n = 0;
        }
    }
}

/// Split up to `budget` positions off the front of `inputs`. Token blocks
/// split at any position; other modalities are taken whole, or alone when
/// they exceed the budget by themselves.
fn take_prefill_chunk(inputs: &mut Vec<Data>, budget: usize) -> Vec<Data> {
    let mut chunk = Vec::new();
    let mut taken = 0usize;
    while !inputs.is_empty() && taken < budget {
        let remaining = budget - taken;
        let block_len = inputs[0].len();
        if block_len <= remaining {
            taken += block_len;
            chunk.push(inputs.remove(0));
        } else {
            match &mut inputs[0] {
                Data::Token(t) => {
                    let head: Vec<i32> = t.token_ids.drain(..remaining).collect();
                    taken += remaining;
                    chunk.push(Data::token(head));
                }
                _ => {
                    if taken == 0 {
                        chunk.push(inputs.remove(0));
                    }
                    break;
                }
            }
        }
    }
    chunk
}
