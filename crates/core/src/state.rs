//! Per-request generation state: the entry tree and its per-model states.
//!
//! A request with `n` parallel completions is tracked as a small tree. For
//! `n == 1` a single entry is both the prompt holder and the generation; for
//! `n > 1` entry 0 holds the shared prompt prefix and entries `1..=n` are the
//! generation branches. Entries are stored in topological order, root first,
//! and link to each other by index only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::grammar::{GrammarMatcher, GrammarSpec};
use crate::request::{Data, FinishReason, Request, TokenData};
use crate::sampling::{SampleResult, SamplerState};
use crate::stop::StopStringHandler;
use crate::tokenizer::TokenizerView;

/// State of one request on one model.
#[derive(Debug)]
pub struct RequestModelState {
    pub model_id: usize,
    /// KV-cache sequence id. Stamped fresh at admission and again after
    /// every preemption.
    pub internal_id: i64,
    /// Sampled tokens that will never be revised. Survives preemption.
    pub committed_tokens: Vec<SampleResult>,
    /// Input blocks still to be prefilled.
    pub inputs: Vec<Data>,
    /// Input blocks prefilled this step but not yet announced to the prefix
    /// cache. Drained by the post-step reconciler.
    pub prefilled_inputs: Vec<Data>,
    /// High-watermark of committed tokens already pushed into the prefix
    /// cache. Always at most `committed_tokens.len() - 1`: the newest token
    /// is not in the KV cache yet.
    pub cached_committed_tokens: usize,
    /// Cumulative tokens prefilled so far. Reset by preemption.
    pub num_prefilled_tokens: usize,
    /// Speculative tokens awaiting verification.
    pub draft_output_tokens: Vec<SampleResult>,
    /// Workspace slots backing the draft tokens.
    pub draft_token_slots: Vec<i32>,
    /// Occurrence counts of committed and draft tokens, for repetition
    /// penalties.
    pub appeared_token_ids: HashMap<i32, i32>,
    pub grammar_matcher: Option<GrammarMatcher>,
}

impl RequestModelState {
    pub fn new(
        model_id: usize,
        internal_id: i64,
        inputs: Vec<Data>,
        grammar: Option<&GrammarSpec>,
    ) -> Self {
        Self {
            model_id,
            internal_id,
            committed_tokens: Vec::new(),
            inputs,
            prefilled_inputs: Vec::new(),
            cached_committed_tokens: 0,
            num_prefilled_tokens: 0,
            draft_output_tokens: Vec::new(),
            draft_token_slots: Vec::new(),
            appeared_token_ids: HashMap::new(),
            grammar_matcher: grammar.map(GrammarMatcher::new),
        }
    }

    /// Remaining input length in model positions.
    pub fn input_len(&self) -> usize {
        self.inputs.iter().map(Data::len).sum()
    }

    pub fn committed_token_ids(&self) -> Vec<i32> {
        self.committed_tokens.iter().map(|s| s.token_id).collect()
    }

    /// Append a committed token, updating the appeared histogram and the
    /// grammar state.
    pub fn commit_token(&mut self, sample: SampleResult) {
        *self.appeared_token_ids.entry(sample.token_id).or_insert(0) += 1;
        if let Some(matcher) = &mut self.grammar_matcher {
            let accepted = matcher.accept_token(sample.token_id);
            debug_assert!(accepted, "committed token rejected by grammar");
        }
        self.committed_tokens.push(sample);
    }

    /// Record a draft token and the workspace slot holding its state.
    pub fn add_draft_token(&mut self, sample: SampleResult, slot: i32) {
        *self.appeared_token_ids.entry(sample.token_id).or_insert(0) += 1;
        if let Some(matcher) = &mut self.grammar_matcher {
            matcher.accept_token(sample.token_id);
        }
        self.draft_output_tokens.push(sample);
        self.draft_token_slots.push(slot);
    }

    /// Drop every draft token, undoing histogram and grammar effects.
    /// The freed slot ids are appended to `removed_slots`.
    pub fn remove_all_draft_tokens(&mut self, removed_slots: &mut Vec<i32>) {
        if let Some(matcher) = &mut self.grammar_matcher {
            matcher.rollback(self.draft_output_tokens.len());
        }
        for sample in self.draft_output_tokens.drain(..) {
            let count = self
                .appeared_token_ids
                .get_mut(&sample.token_id)
                .expect("draft token missing from appeared histogram");
            *count -= 1;
            if *count == 0 {
                self.appeared_token_ids.remove(&sample.token_id);
            }
        }
        removed_slots.extend(self.draft_token_slots.drain(..));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStateStatus {
    /// Not resident in any model; waiting for (re-)prefill.
    Pending,
    /// Resident and generating.
    Alive,
    Finished,
}

/// Delta handed to the stream callback for one generation branch.
#[derive(Debug, Default)]
pub struct DeltaRequestReturn {
    pub delta_token_ids: Vec<i32>,
    pub delta_logprob_json_strs: Vec<String>,
    pub finish_reason: Option<FinishReason>,
}

/// One node of a request's generation tree.
#[derive(Debug)]
pub struct RequestStateEntry {
    pub status: RequestStateStatus,
    /// Index of the parent entry, None for the root.
    pub parent_idx: Option<usize>,
    pub child_indices: Vec<usize>,
    /// One state per model, main model first.
    pub mstates: Vec<RequestModelState>,
    pub rng: SamplerState,
    pub stop_handler: StopStringHandler,
    /// Start position of the committed tokens for the next callback.
    pub next_callback_token_pos: usize,
    pub tadd: Instant,
    pub tprefill_finish: Instant,
}

impl RequestStateEntry {
    pub fn new(
        request: &Request,
        num_models: usize,
        internal_id: i64,
        seed: Option<u64>,
        parent_idx: Option<usize>,
    ) -> Self {
        // Children inherit the prompt through a KV-cache fork, so only the
        // root carries the request inputs.
        let inputs = if parent_idx.is_none() {
            request.inputs.clone()
        } else {
            Vec::new()
        };
        let grammar = request.generation_cfg.grammar.as_ref();
        let mstates = (0..num_models)
            .map(|model_id| {
                RequestModelState::new(model_id, internal_id, inputs.clone(), grammar)
            })
            .collect();
        let now = Instant::now();
        Self {
            status: RequestStateStatus::Pending,
            parent_idx,
            child_indices: Vec::new(),
            mstates,
            rng: SamplerState::new(seed),
            stop_handler: StopStringHandler::new(request.generation_cfg.stop_strings.clone()),
            next_callback_token_pos: 0,
            tadd: now,
            tprefill_finish: now,
        }
    }

    /// Collect the releasable delta since the last call and decide whether
    /// this branch is finished.
    ///
    /// Finish rules, first match wins: a detected stop phrase, then the
    /// length caps (per-request `max_tokens` and the engine-wide single
    /// sequence ceiling), then a committed EOS when `ignore_eos` is off.
    pub fn get_return_token_ids(
        &mut self,
        request: &Request,
        tokenizer: &dyn TokenizerView,
        max_single_sequence_length: usize,
    ) -> DeltaRequestReturn {
        let cfg = &request.generation_cfg;
        let num_committed = self.mstates[0].committed_tokens.len();
        assert!(
            self.next_callback_token_pos <= num_committed,
            "callback position ahead of committed tokens"
        );

        let mut delta = DeltaRequestReturn::default();
        let mut eos_seen = false;

        while self.next_callback_token_pos < num_committed {
            let sample = self.mstates[0].committed_tokens[self.next_callback_token_pos].clone();
            self.next_callback_token_pos += 1;

            if !cfg.ignore_eos && tokenizer.is_eos(sample.token_id) {
                // EOS terminates the stream and is never delivered.
                eos_seen = true;
                break;
            }
            self.stop_handler
                .put(sample.token_id, tokenizer, &mut delta.delta_token_ids);
            if cfg.logprobs > 0 {
                delta.delta_logprob_json_strs.push(sample.logprob_json());
            }
            if self.stop_handler.stop_triggered() {
                delta.finish_reason = Some(FinishReason::Stop);
                break;
            }
        }

        if delta.finish_reason.is_none() {
            let total_len = request.input_total_len() + num_committed;
            if num_committed >= cfg.max_tokens || total_len >= max_single_sequence_length {
                delta.finish_reason = Some(FinishReason::Length);
            } else if eos_seen {
                delta.finish_reason = Some(FinishReason::Stop);
            }
        }

        // A finish that was not a stop-phrase match releases whatever the
        // stop handler was still holding back.
        if delta.finish_reason.is_some() && !self.stop_handler.stop_triggered() {
            self.stop_handler.finish(&mut delta.delta_token_ids);
        }
        delta
    }
}

/// All state entries of one request, root at index 0.
#[derive(Debug)]
pub struct RequestState {
    pub request: Arc<Request>,
    pub entries: Vec<RequestStateEntry>,
}

impl RequestState {
    /// Build the entry tree for a request. `internal_ids` supplies one
    /// sequence id per entry: a single id for `n == 1`, otherwise `n + 1`.
    pub fn new(request: Arc<Request>, num_models: usize, internal_ids: &[i64]) -> Self {
        let n = request.generation_cfg.n;
        assert!(n >= 1, "generation count must be at least 1");
        let seed = request.generation_cfg.seed;
        let entry_seed = |i: usize| seed.map(|s| s.wrapping_add(i as u64));

        if n == 1 {
            assert_eq!(internal_ids.len(), 1);
            let root =
                RequestStateEntry::new(&request, num_models, internal_ids[0], entry_seed(0), None);
            return Self {
                request,
                entries: vec![root],
            };
        }

        assert_eq!(internal_ids.len(), n + 1);
        let mut entries = Vec::with_capacity(n + 1);
        let mut root =
            RequestStateEntry::new(&request, num_models, internal_ids[0], entry_seed(0), None);
        root.child_indices = (1..=n).collect();
        entries.push(root);
        for i in 1..=n {
            entries.push(RequestStateEntry::new(
                &request,
                num_models,
                internal_ids[i],
                entry_seed(i),
                Some(0),
            ));
        }
        Self { request, entries }
    }

    /// Indices of the generation entries, in branch order: the root when
    /// `n == 1`, otherwise the children.
    pub fn generation_entry_indices(&self) -> std::ops::Range<usize> {
        if self.request.generation_cfg.n == 1 {
            0..1
        } else {
            1..self.entries.len()
        }
    }
}

/// Rebuild an entry's pending inputs from its preserved committed tokens.
///
/// Used at preemption: the root starts over from the request inputs with the
/// committed ids appended (merged into a trailing token block when possible,
/// so a single embedding lookup covers both); a child entry only carries its
/// own committed ids since the prefix lives in the parent.
pub fn rebuild_inputs_after_preemption(
    request: &Request,
    is_root: bool,
    committed_token_ids: Vec<i32>,
) -> Vec<Data> {
    if !is_root {
        if committed_token_ids.is_empty() {
            return Vec::new();
        }
        return vec![Data::token(committed_token_ids)];
    }

    let mut inputs = request.inputs.clone();
    match inputs.last_mut() {
        Some(Data::Token(TokenData { token_ids })) => {
            token_ids.extend(committed_token_ids);
        }
        _ => {
            if !committed_token_ids.is_empty() {
                inputs.push(Data::token(committed_token_ids));
            }
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::GenerationConfig;

    struct MapTokenizer {
        eos: Vec<i32>,
    }

    impl TokenizerView for MapTokenizer {
        fn decode(&self, token_ids: &[i32]) -> String {
            token_ids.iter().map(|id| format!("<{id}>")).collect()
        }

        fn eos_token_ids(&self) -> &[i32] {
            &self.eos
        }
    }

    fn request(cfg: GenerationConfig) -> Arc<Request> {
        Arc::new(Request::new("req-0", vec![Data::token(vec![1, 2, 3])], cfg))
    }

    fn alive_entry(request: &Request) -> RequestStateEntry {
        let mut entry = RequestStateEntry::new(request, 1, 0, Some(0), None);
        entry.status = RequestStateStatus::Alive;
        entry
    }

    #[test]
    fn single_generation_has_one_entry() {
        let rstate = RequestState::new(request(GenerationConfig::default()), 1, &[4]);
        assert_eq!(rstate.entries.len(), 1);
        assert_eq!(rstate.entries[0].parent_idx, None);
        assert!(rstate.entries[0].child_indices.is_empty());
        assert_eq!(rstate.generation_entry_indices(), 0..1);
        assert_eq!(rstate.entries[0].mstates[0].internal_id, 4);
    }

    #[test]
    fn parallel_generation_builds_tree() {
        let cfg = GenerationConfig {
            n: 3,
            ..Default::default()
        };
        let rstate = RequestState::new(request(cfg), 2, &[0, 1, 2, 3]);
        assert_eq!(rstate.entries.len(), 4);
        assert_eq!(rstate.entries[0].child_indices, vec![1, 2, 3]);
        for i in 1..=3 {
            assert_eq!(rstate.entries[i].parent_idx, Some(0));
            // Children inherit the prefix through a fork, not through inputs.
            assert!(rstate.entries[i].mstates[0].inputs.is_empty());
            assert_eq!(rstate.entries[i].mstates.len(), 2);
        }
        assert_eq!(rstate.entries[0].mstates[0].input_len(), 3);
        assert_eq!(rstate.generation_entry_indices(), 1..4);
    }

    #[test]
    fn commit_token_updates_histogram() {
        let mut ms = RequestModelState::new(0, 0, vec![], None);
        ms.commit_token(SampleResult::new(5, 1.0));
        ms.commit_token(SampleResult::new(5, 1.0));
        ms.commit_token(SampleResult::new(7, 1.0));
        assert_eq!(ms.appeared_token_ids[&5], 2);
        assert_eq!(ms.appeared_token_ids[&7], 1);
        assert_eq!(ms.committed_token_ids(), vec![5, 5, 7]);
    }

    #[test]
    fn draft_tokens_roundtrip_histogram_and_slots() {
        let mut ms = RequestModelState::new(0, 0, vec![], None);
        ms.commit_token(SampleResult::new(5, 1.0));
        ms.add_draft_token(SampleResult::new(5, 0.5), 11);
        ms.add_draft_token(SampleResult::new(9, 0.5), 12);
        assert_eq!(ms.appeared_token_ids[&5], 2);

        let mut slots = Vec::new();
        ms.remove_all_draft_tokens(&mut slots);
        assert_eq!(slots, vec![11, 12]);
        assert_eq!(ms.appeared_token_ids[&5], 1);
        assert!(!ms.appeared_token_ids.contains_key(&9));
        assert!(ms.draft_output_tokens.is_empty());
        assert!(ms.draft_token_slots.is_empty());
    }

    #[test]
    fn delta_returns_new_tokens_without_finish() {
        let req = request(GenerationConfig {
            max_tokens: 10,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 1.0));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.delta_token_ids, vec![7]);
        assert_eq!(ret.finish_reason, None);
        // Second call yields nothing new.
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert!(ret.delta_token_ids.is_empty());
        assert_eq!(ret.finish_reason, None);
    }

    #[test]
    fn delta_finishes_on_max_tokens() {
        let req = request(GenerationConfig {
            max_tokens: 2,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 1.0));
        entry.mstates[0].commit_token(SampleResult::new(8, 1.0));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.delta_token_ids, vec![7, 8]);
        assert_eq!(ret.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn delta_finishes_on_eos_without_streaming_it() {
        let req = request(GenerationConfig {
            max_tokens: 10,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 1.0));
        entry.mstates[0].commit_token(SampleResult::new(99, 1.0));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.delta_token_ids, vec![7]);
        assert_eq!(ret.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn ignore_eos_keeps_generating() {
        let req = request(GenerationConfig {
            max_tokens: 10,
            ignore_eos: true,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(99, 1.0));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.delta_token_ids, vec![99]);
        assert_eq!(ret.finish_reason, None);
    }

    #[test]
    fn length_beats_eos_when_both_hit() {
        let req = request(GenerationConfig {
            max_tokens: 2,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 1.0));
        entry.mstates[0].commit_token(SampleResult::new(99, 1.0));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn max_single_sequence_length_caps_total() {
        let req = request(GenerationConfig {
            max_tokens: 100,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 1.0));
        // Prompt is 3 tokens; 3 + 1 committed reaches the ceiling of 4.
        let ret = entry.get_return_token_ids(&req, &tok, 4);
        assert_eq!(ret.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn stop_phrase_trims_and_finishes() {
        let mut cfg = GenerationConfig {
            max_tokens: 10,
            ..Default::default()
        };
        cfg.stop_strings = vec!["<42>".to_string()];
        let req = request(cfg);
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 1.0));
        entry.mstates[0].commit_token(SampleResult::new(42, 1.0));
        entry.mstates[0].commit_token(SampleResult::new(8, 1.0));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.delta_token_ids, vec![7]);
        assert_eq!(ret.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn logprob_strings_follow_committed_tokens() {
        let req = request(GenerationConfig {
            max_tokens: 10,
            logprobs: 1,
            ..Default::default()
        });
        let tok = MapTokenizer { eos: vec![99] };
        let mut entry = alive_entry(&req);
        entry.mstates[0].commit_token(SampleResult::new(7, 0.5));
        let ret = entry.get_return_token_ids(&req, &tok, 100);
        assert_eq!(ret.delta_logprob_json_strs.len(), 1);
        let parsed: serde_json::Value =
            serde_json::from_str(&ret.delta_logprob_json_strs[0]).unwrap();
        assert_eq!(parsed["token_id"], 7);
    }

    #[test]
    fn preemption_inputs_merge_into_trailing_token_block() {
        let req = Request::new(
            "r",
            vec![Data::token(vec![1, 2]), Data::token(vec![41, 42])],
            GenerationConfig::default(),
        );
        let rebuilt = rebuild_inputs_after_preemption(&req, true, vec![7, 8, 9]);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(
            rebuilt[1],
            Data::token(vec![41, 42, 7, 8, 9]),
        );
    }

    #[test]
    fn preemption_inputs_append_after_non_token_block() {
        let req = Request::new(
            "r",
            vec![Data::Image(crate::request::ImageData { embed_len: 4 })],
            GenerationConfig::default(),
        );
        let rebuilt = rebuild_inputs_after_preemption(&req, true, vec![7]);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt[1], Data::token(vec![7]));
    }

    #[test]
    fn preemption_inputs_for_child_entry() {
        let req = request(GenerationConfig::default());
        let rebuilt = rebuild_inputs_after_preemption(&req, false, vec![7, 8]);
        assert_eq!(rebuilt, vec![Data::token(vec![7, 8])]);
        assert!(rebuild_inputs_after_preemption(&req, false, vec![]).is_empty());
    }
}
