use std::collections::HashMap;

use crate::tokenizer::TokenizerView;

/// Table-driven tokenizer: each token id decodes to a fixed string,
/// `<id>` when the table has no entry.
pub struct MockTokenizer {
    table: HashMap<i32, String>,
    eos: Vec<i32>,
}

impl MockTokenizer {
    pub fn new(eos: Vec<i32>) -> Self {
        Self {
            table: HashMap::new(),
            eos,
        }
    }

    pub fn with_piece(mut self, token_id: i32, piece: &str) -> Self {
        self.table.insert(token_id, piece.to_string());
        self
    }
}

impl TokenizerView for MockTokenizer {
    fn decode(&self, token_ids: &[i32]) -> String {
        token_ids
            .iter()
            .map(|id| {
                self.table
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("<{id}>"))
            })
            .collect()
    }

    fn eos_token_ids(&self) -> &[i32] {
        &self.eos
    }
}
