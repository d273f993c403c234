use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::model::{DecodeInput, Logits, ModelError, ModelHandle, PrefillInput};
use crate::request::Data;

/// A mock model for engine tests. Tracks sequence residency exactly and
/// produces logits whose argmax follows a per-sequence script, so greedy
/// decoding yields predetermined tokens without any real computation.
///
/// Internal ids are allocated deterministically from zero, so tests can
/// script sequences by the ids the engine will assign.
pub struct MockModel {
    vocab_size: usize,
    default_token: i32,
    /// Resident sequences and their current lengths in positions.
    pub seq_lens: HashMap<i64, usize>,
    scripts: HashMap<i64, VecDeque<i32>>,
    /// Sequence ids whose next logits row comes back NaN.
    pub nan_seqs: HashSet<i64>,
    pub fail_next_prefill: bool,
    pub fail_next_decode: bool,
    /// Recorded operations, for assertions.
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
    pub forked: Vec<(i64, i64, usize)>,
}

impl MockModel {
    pub fn new(vocab_size: usize, default_token: i32) -> Self {
        Self {
            vocab_size,
            default_token,
            seq_lens: HashMap::new(),
            scripts: HashMap::new(),
            nan_seqs: HashSet::new(),
            fail_next_prefill: false,
            fail_next_decode: false,
            added: Vec::new(),
            removed: Vec::new(),
            forked: Vec::new(),
        }
    }

    /// Queue the argmax tokens this sequence's future logits rows will
    /// carry, one per prefill or decode call.
    pub fn script(&mut self, seq_id: i64, tokens: &[i32]) {
        self.scripts
            .entry(seq_id)
            .or_default()
            .extend(tokens.iter().copied());
    }

    pub fn is_resident(&self, seq_id: i64) -> bool {
        self.seq_lens.contains_key(&seq_id)
    }

    fn logits_row(&mut self, seq_id: i64) -> Vec<f32> {
        if self.nan_seqs.remove(&seq_id) {
            return vec![f32::NAN; self.vocab_size];
        }
        let token = self
            .scripts
            .get_mut(&seq_id)
            .and_then(|s| s.pop_front())
            .unwrap_or(self.default_token);
        let mut row = vec![0.0; self.vocab_size];
        row[token as usize] = 10.0;
        // A deterministic runner-up for top-logprob assertions.
        row[(token as usize + 1) % self.vocab_size] = 5.0;
        row
    }
}

/// Shared handle around a [`MockModel`] so a test can keep inspecting the
/// model after boxing it into the engine's model list.
#[derive(Clone)]
pub struct SharedMockModel(Rc<RefCell<MockModel>>);

impl SharedMockModel {
    pub fn new(vocab_size: usize, default_token: i32) -> Self {
        Self(Rc::new(RefCell::new(MockModel::new(vocab_size, default_token))))
    }

    pub fn handle(&self) -> Box<dyn ModelHandle> {
        Box::new(self.clone())
    }

    pub fn script(&self, seq_id: i64, tokens: &[i32]) {
        self.0.borrow_mut().script(seq_id, tokens);
    }

    pub fn with<R>(&self, f: impl FnOnce(&MockModel) -> R) -> R {
        f(&self.0.borrow())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut MockModel) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl ModelHandle for SharedMockModel {
    fn add_sequence(&mut self, seq_id: i64) {
        self.0.borrow_mut().add_sequence(seq_id);
    }

    fn fork_sequence(&mut self, parent_id: i64, child_id: i64, fork_pos: usize) {
        self.0.borrow_mut().fork_sequence(parent_id, child_id, fork_pos);
    }

    fn remove_sequence(&mut self, seq_id: i64) {
        self.0.borrow_mut().remove_sequence(seq_id);
    }

    fn prefill(&mut self, batch: &[PrefillInput]) -> Result<Logits, ModelError> {
        self.0.borrow_mut().prefill(batch)
    }

    fn decode(&mut self, batch: &[DecodeInput]) -> Result<Logits, ModelError> {
        self.0.borrow_mut().decode(batch)
    }
}

impl ModelHandle for MockModel {
    fn add_sequence(&mut self, seq_id: i64) {
        assert!(
            self.seq_lens.insert(seq_id, 0).is_none(),
            "sequence {seq_id} added twice"
        );
        self.added.push(seq_id);
    }

    fn fork_sequence(&mut self, parent_id: i64, child_id: i64, fork_pos: usize) {
        let parent_len = *self
            .seq_lens
            .get(&parent_id)
            .unwrap_or_else(|| panic!("fork from non-resident sequence {parent_id}"));
        assert!(fork_pos <= parent_len, "fork past parent length");
        assert!(
            self.seq_lens.insert(child_id, fork_pos).is_none(),
            "sequence {child_id} added twice"
        );
        self.forked.push((parent_id, child_id, fork_pos));
    }

    fn remove_sequence(&mut self, seq_id: i64) {
        assert!(
            self.seq_lens.remove(&seq_id).is_some(),
            "removing non-resident sequence {seq_id}"
        );
        self.removed.push(seq_id);
    }

    fn prefill(&mut self, batch: &[PrefillInput]) -> Result<Logits, ModelError> {
        if self.fail_next_prefill {
            self.fail_next_prefill = false;
            return Err(ModelError::Kernel("mock prefill failure".to_string()));
        }
        let mut data = Vec::with_capacity(batch.len() * self.vocab_size);
        for item in batch {
            let len: usize = item.inputs.iter().map(Data::len).sum();
            let seq_len = self
                .seq_lens
                .get_mut(&item.seq_id)
                .ok_or(ModelError::UnknownSequence(item.seq_id))?;
            *seq_len += len;
            data.extend(self.logits_row(item.seq_id));
        }
        Ok(Logits::new(batch.len(), self.vocab_size, data))
    }

    fn decode(&mut self, batch: &[DecodeInput]) -> Result<Logits, ModelError> {
        if self.fail_next_decode {
            self.fail_next_decode = false;
            return Err(ModelError::Kernel("mock decode failure".to_string()));
        }
        let mut data = Vec::with_capacity(batch.len() * self.vocab_size);
        for item in batch {
            let seq_len = self
                .seq_lens
                .get_mut(&item.seq_id)
                .ok_or(ModelError::UnknownSequence(item.seq_id))?;
            *seq_len += 1;
            data.extend(self.logits_row(item.seq_id));
        }
        Ok(Logits::new(batch.len(), self.vocab_size, data))
    }
}
