//! Preemption: demote the most recent running generation back to pending
//! without losing committed tokens.

use std::sync::Arc;

use crate::draft::DraftTokenWorkspace;
use crate::engine_state::EngineState;
use crate::model::ModelHandle;
use crate::request::RequestId;
use crate::state::{rebuild_inputs_after_preemption, RequestStateStatus};

use super::remove_sequence_from_models;

/// Preempt the last alive entry of the last running request.
///
/// The entry's committed tokens are folded back into its pending inputs so a
/// later prefill reproduces the exact sequence, its KV residency is released
/// eagerly (the contents are about to diverge, so there is nothing worth
/// keeping in the prefix cache), and a fresh internal id is stamped.
///
/// Queue rules: preempting the root removes the request from the running
/// queue tail; a fully-prefilled last entry re-queues the request at the
/// front of the waiting queue. An entry that still owed prefill was
/// straddling the waiting/running boundary and its request never left the
/// waiting queue, so no re-queue happens.
///
/// Returns the preempted request id and entry index.
pub fn preempt_last_running_entry(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    mut draft_ws: Option<&mut DraftTokenWorkspace>,
) -> (RequestId, usize) {
    assert!(
        !estate.running_queue.is_empty(),
        "preemption requires a non-empty running queue"
    );
    let rid = estate.running_queue.back().unwrap().clone();

    let old_seq_id;
    let k;
    let last_idx;
    let partially_alive;
    {
        let rstate = estate.request_state_mut(&rid);
        let request = Arc::clone(&rstate.request);
        last_idx = rstate.entries.len() - 1;
        k = rstate
            .entries
            .iter()
            .rposition(|e| e.status == RequestStateStatus::Alive)
            .expect("running request has no alive entry to preempt");
        let entry = &mut rstate.entries[k];
        let is_root = entry.parent_idx.is_none();
        partially_alive = !entry.mstates[0].inputs.is_empty();
        old_seq_id = entry.mstates[0].internal_id;
        tracing::warn!(request_id = %rid, entry = k, partially_alive, "preempting");

        entry.status = RequestStateStatus::Pending;
        let mut freed_slots = Vec::new();
        for ms in &mut entry.mstates {
            ms.remove_all_draft_tokens(&mut freed_slots);
            let committed_ids = ms.committed_token_ids();
            ms.num_prefilled_tokens = 0;
            ms.inputs = rebuild_inputs_after_preemption(&request, is_root, committed_ids);
            ms.prefilled_inputs.clear();
            ms.cached_committed_tokens = 0;
        }
        if let Some(ws) = draft_ws.as_deref_mut() {
            ws.free(&freed_slots);
        }
    }

    // Allocate the replacement id before recycling the old one so the entry
    // can never come back under the same id.
    let new_seq_id = estate.id_manager.new_id();

    if estate.prefix_cache.has_sequence(old_seq_id) {
        for freed in estate.prefix_cache.recycle_sequence(old_seq_id, false) {
            remove_sequence_from_models(models, freed);
            estate.id_manager.recycle(freed);
        }
    } else {
        remove_sequence_from_models(models, old_seq_id);
        estate.id_manager.recycle(old_seq_id);
    }

    let rstate = estate.request_state_mut(&rid);
    for ms in &mut rstate.entries[k].mstates {
        ms.internal_id = new_seq_id;
    }

    if k == 0 {
        let popped = estate.running_queue.pop_back().unwrap();
        debug_assert_eq!(popped, rid);
    }
    if !partially_alive && k == last_idx {
        estate.waiting_queue.push_front(rid.clone());
    } else if partially_alive {
        // A straddling request is still queued for prefill; re-queueing it
        // here would duplicate it.
        debug_assert!(
            estate.waiting_queue.contains(&rid),
            "partially alive entry whose request left the waiting queue"
        );
    }
    (rid, k)
}
