use crate::request::{FinishReason, RequestId};

/// Per-request payload of one stream-callback batch.
///
/// Group vectors hold one element per generation branch, in branch order.
#[derive(Debug, Clone)]
pub struct RequestStreamOutput {
    pub request_id: RequestId,
    pub group_delta_token_ids: Vec<Vec<i32>>,
    /// Present only when the request asked for logprobs.
    pub group_delta_logprob_json_strs: Option<Vec<Vec<String>>>,
    pub group_finish_reason: Vec<Option<FinishReason>>,
}

/// Callback invoked once per engine step with every request that produced
/// output. Must not call back into the engine's mutating APIs.
pub type RequestStreamCallback<'a> = dyn FnMut(Vec<RequestStreamOutput>) + 'a;
