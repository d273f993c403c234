use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ids::IdManager;
use crate::prefix_cache::PrefixCache;
use crate::request::{Request, RequestId};
use crate::state::RequestState;

/// Monotonic engine counters. Written only when a whole request retires
/// (times, decode length) or when prefilled data is accounted once per step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub total_prefill_length: u64,
    pub total_decode_length: u64,
    pub request_total_prefill_time: f64,
    pub request_total_decode_time: f64,
}

impl EngineStats {
    /// Copy for external telemetry; the live counters keep accumulating.
    pub fn snapshot(&self) -> EngineStats {
        self.clone()
    }
}

/// The single mutable root of the engine. All queues, request states, the id
/// manager and the prefix cache hang off this struct and are only touched
/// from the engine thread.
pub struct EngineState {
    /// FIFO of requests still owing prefill. Preemption re-inserts at the
    /// front; a chunk-prefilling request stays here until its inputs drain.
    pub waiting_queue: VecDeque<RequestId>,
    /// FIFO of requests with resident sequences.
    pub running_queue: VecDeque<RequestId>,
    pub request_states: HashMap<RequestId, RequestState>,
    pub id_manager: IdManager,
    pub prefix_cache: PrefixCache,
    pub stats: EngineStats,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            waiting_queue: VecDeque::new(),
            running_queue: VecDeque::new(),
            request_states: HashMap::new(),
            id_manager: IdManager::new(),
            prefix_cache: PrefixCache::new(config.prefix_cache_max_tokens),
            stats: EngineStats::default(),
        }
    }

    /// Admit a request: build its state tree, stamp one internal id per
    /// entry, and queue it for prefill.
    pub fn add_request(&mut self, request: Request, num_models: usize) -> Result<(), EngineError> {
        if self.request_states.contains_key(&request.id) {
            return Err(EngineError::DuplicateRequest(request.id));
        }
        let n = request.generation_cfg.n;
        let num_entries = if n == 1 { 1 } else { n + 1 };
        let internal_ids: Vec<i64> = (0..num_entries).map(|_| self.id_manager.new_id()).collect();

        let request = Arc::new(request);
        let rstate = RequestState::new(Arc::clone(&request), num_models, &internal_ids);
        tracing::debug!(request_id = %request.id, n, "request admitted");
        self.waiting_queue.push_back(request.id.clone());
        self.request_states.insert(request.id.clone(), rstate);
        Ok(())
    }

    /// Fail-fast lookup; a missing state for a tracked id means corruption.
    pub fn request_state(&self, request_id: &str) -> &RequestState {
        self.request_states
            .get(request_id)
            .unwrap_or_else(|| panic!("no state for request {request_id:?}"))
    }

    pub fn request_state_mut(&mut self, request_id: &str) -> &mut RequestState {
        self.request_states
            .get_mut(request_id)
            .unwrap_or_else(|| panic!("no state for request {request_id:?}"))
    }

    /// Drop a request id from both queues.
    pub fn remove_from_queues(&mut self, request_id: &str) {
        self.waiting_queue.retain(|id| id != request_id);
        self.running_queue.retain(|id| id != request_id);
    }
}
