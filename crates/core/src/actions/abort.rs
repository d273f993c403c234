//! External cancellation and internal failure both leave through this hook:
//! one final callback, then the standard reclamation path.

use std::time::Instant;

use crate::draft::DraftTokenWorkspace;
use crate::engine_state::EngineState;
use crate::error::EngineError;
use crate::model::ModelHandle;
use crate::request::FinishReason;
use crate::state::RequestStateStatus;
use crate::stream::{RequestStreamCallback, RequestStreamOutput};

use super::release_sequence;

/// Terminate a request with the given finish reason (`Cancel` from the
/// abort hook, `Error` from model or sampling failure).
///
/// Branches that already finished naturally keep their reported reason;
/// every other branch is reported with `reason` in one final callback, after
/// which the request's resources are released and it is erased.
pub fn abort_request(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    request_id: &str,
    reason: FinishReason,
    callback: &mut RequestStreamCallback<'_>,
    mut draft_ws: Option<&mut DraftTokenWorkspace>,
) -> Result<(), EngineError> {
    debug_assert!(matches!(reason, FinishReason::Cancel | FinishReason::Error));
    if !estate.request_states.contains_key(request_id) {
        return Err(EngineError::UnknownRequest(request_id.to_string()));
    }
    tracing::debug!(request_id, %reason, "aborting request");

    // Build the final stream output and collect what must be released.
    // Entries are walked in reverse topological order so children release
    // before their parents.
    let mut resident: Vec<i64> = Vec::new();
    let mut unplaced: Vec<i64> = Vec::new();
    let mut freed_slots: Vec<i32> = Vec::new();
    let output;
    let pinned;
    let committed_total;
    let n;
    let tadd;
    let tprefill_finish;
    {
        let rstate = estate.request_state_mut(request_id);
        let cfg = &rstate.request.generation_cfg;
        pinned = cfg.debug.pinned_system_prompt;
        n = cfg.n as u64;
        let logprobs = cfg.logprobs > 0;

        let gen_indices = rstate.generation_entry_indices();
        let mut group_finish_reason = Vec::with_capacity(gen_indices.len());
        for idx in gen_indices.clone() {
            if rstate.entries[idx].status == RequestStateStatus::Finished {
                group_finish_reason.push(None);
            } else {
                group_finish_reason.push(Some(reason));
            }
        }
        output = RequestStreamOutput {
            request_id: request_id.to_string(),
            group_delta_token_ids: vec![Vec::new(); gen_indices.len()],
            group_delta_logprob_json_strs: logprobs.then(|| vec![Vec::new(); gen_indices.len()]),
            group_finish_reason,
        };

        for entry in rstate.entries.iter_mut().rev() {
            match entry.status {
                RequestStateStatus::Finished => continue,
                RequestStateStatus::Alive => resident.push(entry.mstates[0].internal_id),
                // Pending entries hold an id but no KV residency.
                RequestStateStatus::Pending => unplaced.push(entry.mstates[0].internal_id),
            }
            entry.status = RequestStateStatus::Finished;
            for ms in &mut entry.mstates {
                ms.remove_all_draft_tokens(&mut freed_slots);
            }
        }

        committed_total = rstate
            .entries
            .iter()
            .map(|e| e.mstates[0].committed_tokens.len() as u64)
            .sum::<u64>();
        tadd = rstate.entries[0].tadd;
        tprefill_finish = rstate.entries[0].tprefill_finish;
    }

    // The finish is reported before the request is erased.
    callback(vec![output]);

    if let Some(ws) = draft_ws.as_deref_mut() {
        ws.free(&freed_slots);
    }
    for seq_id in resident {
        release_sequence(estate, models, seq_id, pinned);
    }
    for seq_id in unplaced {
        estate.id_manager.recycle(seq_id);
    }

    let now = Instant::now();
    estate.stats.request_total_prefill_time += tprefill_finish.duration_since(tadd).as_secs_f64();
    estate.stats.request_total_decode_time +=
        now.duration_since(tprefill_finish).as_secs_f64();
    estate.stats.total_decode_length += committed_total.saturating_sub(n);

    estate.remove_from_queues(request_id);
    estate.request_states.remove(request_id);
    Ok(())
}
