//! Post-step reconciliation: account prefilled data, feed the prefix cache,
//! collect and deliver deltas, and finalize finished entries.

use std::sync::Arc;
use std::time::Instant;

use crate::draft::DraftTokenWorkspace;
use crate::engine_state::EngineState;
use crate::model::ModelHandle;
use crate::request::RequestId;
use crate::state::RequestStateStatus;
use crate::stream::{RequestStreamCallback, RequestStreamOutput};
use crate::tokenizer::TokenizerView;

use super::release_sequence;

/// Reconcile engine state after one step, for the requests that took part.
///
/// Order matters: prefill statistics are taken before `prefilled_inputs`
/// drains into the prefix cache, deltas are collected before the callback
/// fires, and the callback fires before any finished entry is finalized, so
/// every finish is reported before its request disappears.
pub fn step_post_process(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    tokenizer: &dyn TokenizerView,
    requests: &[RequestId],
    callback: &mut RequestStreamCallback<'_>,
    max_single_sequence_length: usize,
    draft_ws: Option<&mut DraftTokenWorkspace>,
) {
    // Newly prefilled data is counted exactly once: the cache update below
    // drains `prefilled_inputs`.
    let mut prefill_len = 0u64;
    for rid in requests {
        for entry in &estate.request_state(rid).entries {
            for data in &entry.mstates[0].prefilled_inputs {
                prefill_len += data.len() as u64;
            }
        }
    }
    estate.stats.total_prefill_length += prefill_len;

    update_prefix_cache(estate, requests);

    // Collect deltas per generation branch and pack one stream output per
    // request that produced anything.
    let mut finished_rsentries: Vec<(RequestId, usize)> = Vec::new();
    let mut callback_batch: Vec<RequestStreamOutput> = Vec::new();
    for rid in requests {
        let rstate = estate.request_state_mut(rid);
        let request = Arc::clone(&rstate.request);
        let cfg = &request.generation_cfg;

        let mut group_delta_token_ids = Vec::with_capacity(cfg.n);
        let mut group_delta_logprob_json_strs = Vec::with_capacity(cfg.n);
        let mut group_finish_reason = Vec::with_capacity(cfg.n);
        let mut invoke_callback = false;

        for idx in rstate.generation_entry_indices() {
            // Branches already finalized in an earlier step, and branches
            // not yet resident (pending prefill or preempted), owe nothing.
            if rstate.entries[idx].status != RequestStateStatus::Alive {
                group_delta_token_ids.push(Vec::new());
                group_delta_logprob_json_strs.push(Vec::new());
                group_finish_reason.push(None);
                continue;
            }
            let ret = rstate.entries[idx].get_return_token_ids(
                &request,
                tokenizer,
                max_single_sequence_length,
            );
            if ret.finish_reason.is_some() {
                finished_rsentries.push((rid.clone(), idx));
                invoke_callback = true;
            }
            if !ret.delta_token_ids.is_empty() {
                invoke_callback = true;
            }
            group_delta_token_ids.push(ret.delta_token_ids);
            group_delta_logprob_json_strs.push(ret.delta_logprob_json_strs);
            group_finish_reason.push(ret.finish_reason);
        }

        if invoke_callback {
            callback_batch.push(RequestStreamOutput {
                request_id: rid.clone(),
                group_delta_token_ids,
                group_delta_logprob_json_strs: (cfg.logprobs > 0)
                    .then_some(group_delta_logprob_json_strs),
                group_finish_reason,
            });
        }
    }

    callback(callback_batch);

    process_finished_request_state_entries(estate, models, &finished_rsentries, draft_ws);
}

/// Announce newly resident tokens to the prefix cache: freshly prefilled
/// input blocks first, then committed tokens up to but excluding the newest
/// one, which has not entered the KV cache yet.
fn update_prefix_cache(estate: &mut EngineState, requests: &[RequestId]) {
    let EngineState {
        request_states,
        prefix_cache,
        ..
    } = estate;
    for rid in requests {
        let rstate = request_states
            .get_mut(rid.as_str())
            .unwrap_or_else(|| panic!("no state for request {rid:?}"));
        for entry in &mut rstate.entries {
            let mstate = &mut entry.mstates[0];
            let in_cache = prefix_cache.has_sequence(mstate.internal_id);

            if !mstate.prefilled_inputs.is_empty() {
                if in_cache {
                    for data in &mstate.prefilled_inputs {
                        if let Some(token_data) = data.as_token() {
                            prefix_cache.extend_sequence(mstate.internal_id, &token_data.token_ids);
                        }
                    }
                }
                mstate.prefilled_inputs.clear();
            }

            // Committed tokens only reach the cache once the entry is fully
            // prefilled; mid-chunk they would land out of position order.
            let num_committed = mstate.committed_tokens.len();
            if in_cache
                && mstate.inputs.is_empty()
                && num_committed > 0
                && mstate.cached_committed_tokens < num_committed - 1
            {
                let tokens: Vec<i32> = mstate.committed_tokens
                    [mstate.cached_committed_tokens..num_committed - 1]
                    .iter()
                    .map(|s| s.token_id)
                    .collect();
                prefix_cache.extend_sequence(mstate.internal_id, &tokens);
                mstate.cached_committed_tokens = num_committed - 1;
            }
        }
    }
}

/// Finalize finished leaf entries: release their resources, propagate the
/// finish upward through parents whose children are all done, and retire the
/// whole request once the root is passed.
fn process_finished_request_state_entries(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    finished: &[(RequestId, usize)],
    mut draft_ws: Option<&mut DraftTokenWorkspace>,
) {
    for (rid, leaf_idx) in finished {
        let mut release_list: Vec<i64> = Vec::new();
        let mut freed_slots: Vec<i32> = Vec::new();
        let mut retire = false;
        let pinned;
        {
            let rstate = estate.request_state_mut(rid);
            pinned = rstate.request.generation_cfg.debug.pinned_system_prompt;
            let entry = &mut rstate.entries[*leaf_idx];
            assert!(entry.child_indices.is_empty(), "finished entry must be a leaf");
            entry.status = RequestStateStatus::Finished;
            for ms in &mut entry.mstates {
                ms.remove_all_draft_tokens(&mut freed_slots);
            }
            release_list.push(entry.mstates[0].internal_id);

            let mut parent_idx = entry.parent_idx;
            loop {
                let Some(p) = parent_idx else {
                    retire = true;
                    break;
                };
                let all_children_finished = rstate.entries[p]
                    .child_indices
                    .iter()
                    .all(|&c| rstate.entries[c].status == RequestStateStatus::Finished);
                if !all_children_finished {
                    break;
                }
                let parent = &mut rstate.entries[p];
                parent.status = RequestStateStatus::Finished;
                for ms in &mut parent.mstates {
                    ms.remove_all_draft_tokens(&mut freed_slots);
                }
                release_list.push(parent.mstates[0].internal_id);
                parent_idx = parent.parent_idx;
            }
        }

        if let Some(ws) = draft_ws.as_deref_mut() {
            ws.free(&freed_slots);
        }
        for seq_id in release_list {
            release_sequence(estate, models, seq_id, pinned);
        }

        if retire {
            retire_request(estate, rid);
        }
    }
}

fn retire_request(estate: &mut EngineState, rid: &RequestId) {
    let now = Instant::now();
    let (prefill_time, decode_time, decode_len) = {
        let rstate = estate.request_state(rid);
        let root = &rstate.entries[0];
        let committed_total: u64 = rstate
            .entries
            .iter()
            .map(|e| e.mstates[0].committed_tokens.len() as u64)
            .sum();
        // The first token of each branch comes out of prefill, not decode.
        let n = rstate.request.generation_cfg.n as u64;
        (
            root.tprefill_finish.duration_since(root.tadd).as_secs_f64(),
            now.duration_since(root.tprefill_finish).as_secs_f64(),
            committed_total.saturating_sub(n),
        )
    };
    estate.stats.request_total_prefill_time += prefill_time;
    estate.stats.request_total_decode_time += decode_time;
    estate.stats.total_decode_length += decode_len;

    let pos = estate
        .running_queue
        .iter()
        .position(|id| id == rid)
        .expect("retired request missing from running queue");
    estate.running_queue.remove(pos);
    estate.request_states.remove(rid.as_str());
    tracing::debug!(request_id = %rid, "request retired");
}
