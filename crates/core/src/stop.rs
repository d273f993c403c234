use std::collections::VecDeque;

use crate::tokenizer::TokenizerView;

/// Incremental stop-phrase detector over the committed token stream.
///
/// Tokens are fed one at a time. The handler releases a token only once the
/// decoded text before it can no longer be part of a stop phrase, so a stop
/// string that spans several tokens is caught before any of it reaches the
/// client. When a stop phrase matches, tokens from the match onward are
/// dropped and `stop_triggered` flips.
#[derive(Debug)]
pub struct StopStringHandler {
    stop_strings: Vec<String>,
    /// Held-back tokens with the byte length each contributed to `pending_text`.
    pending: VecDeque<(i32, usize)>,
    pending_text: String,
    stop_triggered: bool,
}

impl StopStringHandler {
    pub fn new(stop_strings: Vec<String>) -> Self {
        Self {
            stop_strings,
            pending: VecDeque::new(),
            pending_text: String::new(),
            stop_triggered: false,
        }
    }

    pub fn stop_triggered(&self) -> bool {
        self.stop_triggered
    }

    /// Feed one committed token; releasable token ids are appended to `out`.
    pub fn put(&mut self, token_id: i32, tokenizer: &dyn TokenizerView, out: &mut Vec<i32>) {
        debug_assert!(!self.stop_triggered, "put after stop triggered");
        if self.stop_strings.is_empty() {
            out.push(token_id);
            return;
        }

        let piece = tokenizer.decode(&[token_id]);
        self.pending_text.push_str(&piece);
        self.pending.push_back((token_id, piece.len()));

        let mut earliest: Option<usize> = None;
        for stop in &self.stop_strings {
            if stop.is_empty() {
                continue;
            }
            if let Some(pos) = self.pending_text.find(stop.as_str()) {
                earliest = Some(earliest.map_or(pos, |e| e.min(pos)));
            }
        }

        if let Some(match_start) = earliest {
            self.stop_triggered = true;
            // Release whole tokens that end before the matched phrase, drop
            // the phrase itself and everything after it.
            let mut consumed = 0usize;
            while let Some(&(id, len)) = self.pending.front() {
                if consumed + len > match_start {
                    break;
                }
                out.push(id);
                consumed += len;
                self.pending.pop_front();
            }
            self.pending.clear();
            self.pending_text.clear();
            return;
        }

        // No match yet: keep only the suffix that could still grow into a
        // stop phrase.
        let hold = self.partial_suffix_len();
        let releasable = self.pending_text.len() - hold;
        let mut consumed = 0usize;
        while let Some(&(id, len)) = self.pending.front() {
            if consumed + len > releasable {
                break;
            }
            out.push(id);
            consumed += len;
            self.pending.pop_front();
        }
        self.pending_text.drain(..consumed);
    }

    /// Flush held-back tokens on a finish that was not caused by a stop
    /// phrase (length cap, EOS).
    pub fn finish(&mut self, out: &mut Vec<i32>) {
        for (id, _) in self.pending.drain(..) {
            out.push(id);
        }
        self.pending_text.clear();
    }

    /// Byte length of the longest suffix of `pending_text` that is a proper
    /// prefix of any stop string.
    fn partial_suffix_len(&self) -> usize {
        let text = &self.pending_text;
        let mut best = 0usize;
        for stop in &self.stop_strings {
            let mut k = stop.len().saturating_sub(1).min(text.len());
            while k > best {
                if stop.is_char_boundary(k)
                    && text.is_char_boundary(text.len() - k)
                    && text.ends_with(&stop[..k])
                {
                    best = k;
                    break;
                }
                k -= 1;
            }
        }
        best
    }
}
