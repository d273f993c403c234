use std::collections::HashSet;

use serde::Deserialize;

/// Declarative form of a generation constraint, carried on the request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarSpec {
    /// A fixed sequence of positions, each with its own allowed token set.
    /// Generation is unconstrained once all positions are consumed.
    TokenSets(Vec<Vec<i32>>),
}

/// Token-level constraint automaton for one generation branch.
///
/// Opaque to the rest of the engine: it accepts committed tokens, can roll
/// back draft tokens, and renders the next position's allowed set as a
/// bitmask over the vocabulary.
#[derive(Debug, Clone)]
pub struct GrammarMatcher {
    states: Vec<HashSet<i32>>,
    pos: usize,
    /// Position before each accepted token, for rollback.
    history: Vec<usize>,
}

impl GrammarMatcher {
    pub fn new(spec: &GrammarSpec) -> Self {
        let GrammarSpec::TokenSets(sets) = spec;
        Self {
            states: sets.iter().map(|s| s.iter().copied().collect()).collect(),
            pos: 0,
            history: Vec::new(),
        }
    }

    /// All constrained positions consumed; the tail is unconstrained.
    pub fn is_terminated(&self) -> bool {
        self.pos >= self.states.len()
    }

    /// Whether the next sampling step needs a vocabulary bitmask.
    pub fn requires_bitmask(&self) -> bool {
        !self.is_terminated()
    }

    /// Advance on a token. Returns false if the token is not allowed at the
    /// current position (the position does not advance in that case).
    pub fn accept_token(&mut self, token_id: i32) -> bool {
        if self.is_terminated() {
            self.history.push(self.pos);
            return true;
        }
        if !self.states[self.pos].contains(&token_id) {
            return false;
        }
        self.history.push(self.pos);
        self.pos += 1;
        true
    }

    /// Undo the last `n` accepted tokens. Used when draft tokens are thrown
    /// away.
    pub fn rollback(&mut self, n: usize) {
        assert!(n <= self.history.len(), "rollback past accepted history");
        for _ in 0..n {
            self.pos = self.history.pop().unwrap();
        }
    }

    /// Write the allowed-token bitmask for the next position. `bitmask` must
    /// hold `ceil(vocab_size / 32)` words; bit i set means token i is allowed.
    pub fn fill_next_token_bitmask(&self, bitmask: &mut [u32], vocab_size: usize) {
        assert!(bitmask.len() * 32 >= vocab_size, "bitmask too short for vocab");
        bitmask.fill(0);
        if self.is_terminated() {
            // Unconstrained tail: everything allowed.
            for word in bitmask.iter_mut() {
                *word = u32::MAX;
            }
            return;
        }
        for &token in &self.states[self.pos] {
            let token = token as usize;
            if token < vocab_size {
                bitmask[token / 32] |= 1 << (token % 32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(sets: Vec<Vec<i32>>) -> GrammarMatcher {
        GrammarMatcher::new(&GrammarSpec::TokenSets(sets))
    }

    #[test]
    fn accepts_allowed_tokens_in_order() {
        let mut m = matcher(vec![vec![1, 2], vec![3]]);
        assert!(!m.is_terminated());
        assert!(m.accept_token(2));
        assert!(m.accept_token(3));
        assert!(m.is_terminated());
        assert!(!m.requires_bitmask());
    }

    #[test]
    fn rejects_disallowed_token() {
        let mut m = matcher(vec![vec![1]]);
        assert!(!m.accept_token(9));
        assert!(!m.is_terminated());
        assert!(m.accept_token(1));
    }

    #[test]
    fn rollback_restores_position() {
        let mut m = matcher(vec![vec![1], vec![2], vec![3]]);
        assert!(m.accept_token(1));
        assert!(m.accept_token(2));
        m.rollback(1);
        assert!(!m.accept_token(3));
        assert!(m.accept_token(2));
    }

    #[test]
    fn rollback_through_unconstrained_tail() {
        let mut m = matcher(vec![vec![1]]);
        assert!(m.accept_token(1));
        assert!(m.is_terminated());
        assert!(m.accept_token(42));
        m.rollback(2);
        assert!(!m.is_terminated());
        assert!(m.accept_token(1));
    }

    #[test]
    fn bitmask_marks_allowed_tokens() {
        let m = matcher(vec![vec![0, 33]]);
        let mut mask = vec![0u32; 2];
        m.fill_next_token_bitmask(&mut mask, 64);
        assert_eq!(mask[0], 1);
        assert_eq!(mask[1], 1 << 1);
    }

    #[test]
    fn bitmask_all_ones_when_terminated() {
        let m = matcher(vec![]);
        let mut mask = vec![0u32; 1];
        m.fill_next_token_bitmask(&mut mask, 32);
        assert_eq!(mask[0], u32::MAX);
    }
}
