//! Batch decode: one token per alive generation branch per step.

use std::sync::Arc;

use crate::draft::DraftTokenWorkspace;
use crate::engine_state::EngineState;
use crate::model::{DecodeInput, Logits, ModelHandle};
use crate::request::{FinishReason, Request, RequestId};
use crate::sampling::{apply_logit_processor_and_sample, SamplerState};
use crate::state::RequestStateStatus;
use crate::stream::RequestStreamCallback;

use super::abort_request;

/// Decode one token for every alive, fully-prefilled generation branch of
/// every running request, in queue order.
///
/// A whole-batch kernel failure aborts every request in the batch; rows that
/// come back NaN abort only their own request, the rest of the batch decodes
/// normally. Returns the request ids that took part, for the post-step
/// reconciler.
pub fn decode_step(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    callback: &mut RequestStreamCallback<'_>,
    mut draft_ws: Option<&mut DraftTokenWorkspace>,
) -> Vec<RequestId> {
    // Collect decode rows: (request, entry index, seq id, last token).
    let mut rows: Vec<(RequestId, usize, i64, i32)> = Vec::new();
    let mut row_requests: Vec<Arc<Request>> = Vec::new();
    for rid in estate.running_queue.iter() {
        let rstate = estate.request_state(rid);
        for idx in rstate.generation_entry_indices() {
            let entry = &rstate.entries[idx];
            if entry.status != RequestStateStatus::Alive
                || !entry.mstates[0].inputs.is_empty()
                || entry.mstates[0].committed_tokens.is_empty()
            {
                continue;
            }
            let mstate = &entry.mstates[0];
            rows.push((
                rid.clone(),
                idx,
                mstate.internal_id,
                mstate.committed_tokens.last().unwrap().token_id,
            ));
            row_requests.push(Arc::clone(&rstate.request));
        }
    }
    if rows.is_empty() {
        return Vec::new();
    }

    let batch: Vec<DecodeInput> = rows
        .iter()
        .map(|&(_, _, seq_id, token_id)| DecodeInput { seq_id, token_id })
        .collect();

    let mut logits = None;
    for m in 0..models.len() {
        match models[m].decode(&batch) {
            Ok(l) => {
                if m == 0 {
                    logits = Some(l);
                }
            }
            Err(e) => {
                tracing::error!(model = m, error = %e, "decode failed, aborting batch");
                for rid in dedup_request_ids(&rows) {
                    let _ = abort_request(
                        estate,
                        models,
                        &rid,
                        FinishReason::Error,
                        &mut *callback,
                        draft_ws.as_deref_mut(),
                    );
                }
                return Vec::new();
            }
        }
    }
    let logits = logits.expect("engine requires at least one model");

    // NaN rows poison only their own request.
    let mut bad_requests: Vec<RequestId> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if logits.row(i).iter().any(|v| v.is_nan()) && !bad_requests.contains(&row.0) {
            bad_requests.push(row.0.clone());
        }
    }
    let (mut logits, rows, row_requests) = if bad_requests.is_empty() {
        (logits, rows, row_requests)
    } else {
        for rid in &bad_requests {
            tracing::error!(request_id = %rid, "NaN decode logits, aborting request");
            let _ = abort_request(
                estate,
                models,
                rid,
                FinishReason::Error,
                &mut *callback,
                draft_ws.as_deref_mut(),
            );
        }
        filter_rows(logits, rows, row_requests, &bad_requests)
    };
    if rows.is_empty() {
        return Vec::new();
    }

    // Sample one token per row with the row entry's own RNG. The RNGs are
    // moved out so the model states can be borrowed alongside them.
    let mut rngs: Vec<SamplerState> = rows
        .iter()
        .map(|(rid, idx, _, _)| {
            let entry = &mut estate.request_state_mut(rid).entries[*idx];
            std::mem::replace(&mut entry.rng, SamplerState::new(Some(0)))
        })
        .collect();
    let sample_indices: Vec<usize> = (0..rows.len()).collect();
    let row_cfgs: Vec<&crate::request::GenerationConfig> =
        row_requests.iter().map(|r| &r.generation_cfg).collect();
    let row_ids: Vec<&str> = rows.iter().map(|(rid, _, _, _)| rid.as_str()).collect();

    let result = {
        let row_mstates: Vec<&crate::state::RequestModelState> = rows
            .iter()
            .map(|(rid, idx, _, _)| &estate.request_state(rid).entries[*idx].mstates[0])
            .collect();
        apply_logit_processor_and_sample(
            &mut logits,
            &row_cfgs,
            &row_ids,
            &row_mstates,
            &sample_indices,
            &mut rngs,
        )
    };

    match result {
        Ok((_probs, samples)) => {
            for (i, (rid, idx, _, _)) in rows.iter().enumerate() {
                let entry = &mut estate.request_state_mut(rid).entries[*idx];
                std::mem::swap(&mut entry.rng, &mut rngs[i]);
                for ms in &mut entry.mstates {
                    ms.commit_token(samples[i].clone());
                }
            }
            dedup_request_ids(&rows)
        }
        Err(e) => {
            tracing::error!(error = %e, "sampling failed, aborting batch");
            for rid in dedup_request_ids(&rows) {
                let _ = abort_request(
                    estate,
                    models,
                    &rid,
                    FinishReason::Error,
                    &mut *callback,
                    draft_ws.as_deref_mut(),
                );
            }
            Vec::new()
        }
    }
}

fn dedup_request_ids(rows: &[(RequestId, usize, i64, i32)]) -> Vec<RequestId> {
    let mut out: Vec<RequestId> = Vec::new();
    for (rid, _, _, _) in rows {
        if !out.contains(rid) {
            out.push(rid.clone());
        }
    }
    out
}

/// Drop the rows of aborted requests, compacting the logits matrix.
fn filter_rows(
    logits: Logits,
    rows: Vec<(RequestId, usize, i64, i32)>,
    row_requests: Vec<Arc<Request>>,
    bad_requests: &[RequestId],
) -> (Logits, Vec<(RequestId, usize, i64, i32)>, Vec<Arc<Request>>) {
    let vocab_size = logits.vocab_size();
    let mut kept_data = Vec::new();
    let mut kept_rows = Vec::new();
    let mut kept_requests = Vec::new();
    for (i, (row, request)) in rows.into_iter().zip(row_requests).enumerate() {
        if bad_requests.contains(&row.0) {
            continue;
        }
        kept_data.extend_from_slice(logits.row(i));
        kept_rows.push(row);
        kept_requests.push(request);
    }
    (
        Logits::new(kept_rows.len(), vocab_size, kept_data),
        kept_rows,
        kept_requests,
    )
}
