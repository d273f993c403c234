use thiserror::Error;

use crate::request::Data;

/// Host-side logits matrix, one row per batched sequence.
///
/// Row-major `num_rows x vocab_size`. This is the working representation for
/// everything downstream of the model call; the device tensor side of the
/// kernels stays behind the `ModelHandle` implementation.
#[derive(Debug, Clone)]
pub struct Logits {
    num_rows: usize,
    vocab_size: usize,
    data: Vec<f32>,
}

impl Logits {
    pub fn new(num_rows: usize, vocab_size: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), num_rows * vocab_size, "logits shape mismatch");
        Self {
            num_rows,
            vocab_size,
            data,
        }
    }

    pub fn zeros(num_rows: usize, vocab_size: usize) -> Self {
        Self::new(num_rows, vocab_size, vec![0.0; num_rows * vocab_size])
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.vocab_size..(i + 1) * self.vocab_size]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.vocab_size..(i + 1) * self.vocab_size]
    }
}

/// One sequence's share of a prefill batch.
#[derive(Debug, Clone)]
pub struct PrefillInput {
    pub seq_id: i64,
    /// Input blocks to feed, in order.
    pub inputs: Vec<Data>,
}

/// One sequence's share of a decode batch.
#[derive(Debug, Clone, Copy)]
pub struct DecodeInput {
    pub seq_id: i64,
    /// The token committed last step, to be fed at the next position.
    pub token_id: i32,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("kernel failure: {0}")]
    Kernel(String),

    #[error("model has no sequence {0}")]
    UnknownSequence(i64),
}

/// Narrow contract over one model's KV cache and compute.
///
/// The core never retries a failed call. A failure is fatal to the affected
/// sequences only, which are then evicted through the standard reclamation
/// path.
pub trait ModelHandle {
    /// Create an empty sequence in the KV cache.
    fn add_sequence(&mut self, seq_id: i64);

    /// Create `child_id` sharing `parent_id`'s cache contents up to
    /// `fork_pos` positions.
    fn fork_sequence(&mut self, parent_id: i64, child_id: i64, fork_pos: usize);

    /// Drop a sequence and release its KV cache slots.
    fn remove_sequence(&mut self, seq_id: i64);

    /// Run prefill for a batch. Returns one logits row per batch item, taken
    /// at each item's final position.
    fn prefill(&mut self, batch: &[PrefillInput]) -> Result<Logits, ModelError>;

    /// Run one decode step for a batch. Returns one logits row per item.
    fn decode(&mut self, batch: &[DecodeInput]) -> Result<Logits, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logits_row_access() {
        let mut logits = Logits::zeros(2, 4);
        logits.row_mut(1)[2] = 3.5;
        assert_eq!(logits.row(0), &[0.0; 4]);
        assert_eq!(logits.row(1), &[0.0, 0.0, 3.5, 0.0]);
        assert_eq!(logits.num_rows(), 2);
        assert_eq!(logits.vocab_size(), 4);
    }

    #[test]
    #[should_panic(expected = "logits shape mismatch")]
    fn logits_shape_checked() {
        let _ = Logits::new(2, 4, vec![0.0; 7]);
    }
}
