use std::collections::HashMap;

/// Result of matching a prompt against cached sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMatch {
    pub seq_id: i64,
    pub matched_len: usize,
}

#[derive(Debug)]
struct CachedSeq {
    /// Token content known to be resident in the KV cache for this sequence.
    tokens: Vec<i32>,
    /// A reclaimable sequence keeps its KV slots until capacity pressure
    /// evicts it; until then it can seed new requests sharing its prefix.
    reclaimable: bool,
    /// Monotonic access stamp for LRU eviction.
    last_access: u64,
}

/// Content-addressed deduplication layer over KV-cache sequences.
///
/// The cache tracks, per internal sequence id, the token prefix that is
/// resident in the KV cache. New prompts are matched against that content at
/// token granularity and forked off the best hit inside the models. Finished
/// sequences are recycled lazily so their contents survive for future
/// requests; preempted sequences are recycled eagerly because their contents
/// are about to diverge.
#[derive(Debug)]
pub struct PrefixCache {
    seqs: HashMap<i64, CachedSeq>,
    access_counter: u64,
    /// Token capacity across all cached sequences. 0 disables the cap.
    max_cached_tokens: usize,
    total_tokens: usize,
}

impl PrefixCache {
    pub fn new(max_cached_tokens: usize) -> Self {
        Self {
            seqs: HashMap::new(),
            access_counter: 0,
            max_cached_tokens,
            total_tokens: 0,
        }
    }

    pub fn has_sequence(&self, seq_id: i64) -> bool {
        self.seqs.contains_key(&seq_id)
    }

    pub fn num_sequences(&self) -> usize {
        self.seqs.len()
    }

    pub fn num_reclaimable(&self) -> usize {
        self.seqs.values().filter(|s| s.reclaimable).count()
    }

    pub fn cached_tokens(&self) -> usize {
        self.total_tokens
    }

    fn touch(&mut self, seq_id: i64) {
        self.access_counter += 1;
        let stamp = self.access_counter;
        if let Some(seq) = self.seqs.get_mut(&seq_id) {
            seq.last_access = stamp;
        }
    }

    /// Begin tracking a sequence. `tokens` is whatever prefix is already in
    /// the KV cache (empty for a fresh sequence).
    pub fn insert(&mut self, seq_id: i64, tokens: Vec<i32>) {
        assert!(
            !self.seqs.contains_key(&seq_id),
            "sequence {seq_id} already in prefix cache"
        );
        self.access_counter += 1;
        self.total_tokens += tokens.len();
        self.seqs.insert(
            seq_id,
            CachedSeq {
                tokens,
                reclaimable: false,
                last_access: self.access_counter,
            },
        );
    }

    /// Track `child_id` as a fork of `parent_id` at `fork_pos`. The caller
    /// performs the matching fork inside the models.
    pub fn fork(&mut self, parent_id: i64, child_id: i64, fork_pos: usize) {
        let parent = self
            .seqs
            .get(&parent_id)
            .unwrap_or_else(|| panic!("fork from unknown sequence {parent_id}"));
        assert!(fork_pos <= parent.tokens.len(), "fork past cached content");
        let tokens = parent.tokens[..fork_pos].to_vec();
        self.touch(parent_id);
        self.insert(child_id, tokens);
    }

    /// Append tokens known to be resident in the KV cache.
    pub fn extend_sequence(&mut self, seq_id: i64, tokens: &[i32]) {
        let seq = self
            .seqs
            .get_mut(&seq_id)
            .unwrap_or_else(|| panic!("extend of unknown sequence {seq_id}"));
        seq.tokens.extend_from_slice(tokens);
        self.total_tokens += tokens.len();
        self.touch(seq_id);
    }

    /// Release a sequence. Returns the ids whose KV-cache slots must now be
    /// freed by the caller (removed from every model, id recycled).
    ///
    /// Eager recycling frees the sequence immediately. Lazy recycling marks
    /// it reclaimable and keeps the contents for prefix reuse, though
    /// capacity pressure may evict it (or another reclaimable sequence) as
    /// part of this call.
    pub fn recycle_sequence(&mut self, seq_id: i64, lazy: bool) -> Vec<i64> {
        assert!(
            self.seqs.contains_key(&seq_id),
            "recycle of unknown sequence {seq_id}"
        );
        if !lazy {
            let seq = self.seqs.remove(&seq_id).unwrap();
            self.total_tokens -= seq.tokens.len();
            return vec![seq_id];
        }
        if let Some(seq) = self.seqs.get_mut(&seq_id) {
            seq.reclaimable = true;
        }
        self.touch(seq_id);
        self.enforce_capacity()
    }

    /// Longest-common-prefix match of a prompt against cached content.
    /// Refreshes the hit's LRU stamp.
    pub fn match_prefix(&mut self, tokens: &[i32]) -> Option<PrefixMatch> {
        let mut best: Option<PrefixMatch> = None;
        for (&seq_id, seq) in &self.seqs {
            let matched_len = seq
                .tokens
                .iter()
                .zip(tokens.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if matched_len > 0 && best.map_or(true, |b| matched_len > b.matched_len) {
                best = Some(PrefixMatch { seq_id, matched_len });
            }
        }
        if let Some(m) = best {
            self.touch(m.seq_id);
        }
        best
    }

    /// Evict up to `count` reclaimable sequences in LRU order, regardless of
    /// capacity. Returns the ids to free.
    pub fn evict_reclaimable(&mut self, count: usize) -> Vec<i64> {
        let mut victims: Vec<(u64, i64)> = self
            .seqs
            .iter()
            .filter(|(_, s)| s.reclaimable)
            .map(|(&id, s)| (s.last_access, id))
            .collect();
        victims.sort_unstable();
        let mut freed = Vec::new();
        for (_, id) in victims.into_iter().take(count) {
            let seq = self.seqs.remove(&id).unwrap();
            self.total_tokens -= seq.tokens.len();
            tracing::debug!(seq_id = id, tokens = seq.tokens.len(), "evicted cached prefix");
            freed.push(id);
        }
        freed
    }

    fn enforce_capacity(&mut self) -> Vec<i64> {
        let mut freed = Vec::new();
        if self.max_cached_tokens == 0 {
            return freed;
        }
        while self.total_tokens > self.max_cached_tokens {
            let mut evicted = self.evict_reclaimable(1);
            if evicted.is_empty() {
                break;
            }
            freed.append(&mut evicted);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_match() {
        let mut cache = PrefixCache::new(0);
        cache.insert(7, vec![1, 2, 3, 4]);
        let m = cache.match_prefix(&[1, 2, 3, 9]).unwrap();
        assert_eq!(m.seq_id, 7);
        assert_eq!(m.matched_len, 3);
    }

    #[test]
    fn no_match_on_disjoint_prompt() {
        let mut cache = PrefixCache::new(0);
        cache.insert(7, vec![1, 2, 3]);
        assert!(cache.match_prefix(&[9, 9]).is_none());
    }

    #[test]
    fn longest_match_wins() {
        let mut cache = PrefixCache::new(0);
        cache.insert(1, vec![5, 5]);
        cache.insert(2, vec![5, 5, 5, 8]);
        let m = cache.match_prefix(&[5, 5, 5, 6]).unwrap();
        assert_eq!(m.seq_id, 2);
        assert_eq!(m.matched_len, 3);
    }

    #[test]
    fn extend_grows_content() {
        let mut cache = PrefixCache::new(0);
        cache.insert(1, vec![1]);
        cache.extend_sequence(1, &[2, 3]);
        let m = cache.match_prefix(&[1, 2, 3]).unwrap();
        assert_eq!(m.matched_len, 3);
        assert_eq!(cache.cached_tokens(), 3);
    }

    #[test]
    fn eager_recycle_frees_immediately() {
        let mut cache = PrefixCache::new(0);
        cache.insert(1, vec![1, 2]);
        let freed = cache.recycle_sequence(1, false);
        assert_eq!(freed, vec![1]);
        assert!(!cache.has_sequence(1));
        assert_eq!(cache.cached_tokens(), 0);
    }

    #[test]
    fn lazy_recycle_keeps_content_for_reuse() {
        let mut cache = PrefixCache::new(0);
        cache.insert(1, vec![1, 2, 3]);
        let freed = cache.recycle_sequence(1, true);
        assert!(freed.is_empty());
        assert!(cache.has_sequence(1));
        assert_eq!(cache.num_reclaimable(), 1);
        let m = cache.match_prefix(&[1, 2, 3]).unwrap();
        assert_eq!(m.seq_id, 1);
    }

    #[test]
    fn fork_copies_prefix() {
        let mut cache = PrefixCache::new(0);
        cache.insert(1, vec![1, 2, 3, 4]);
        cache.fork(1, 2, 2);
        assert!(cache.has_sequence(2));
        cache.extend_sequence(2, &[9]);
        let m = cache.match_prefix(&[1, 2, 9]).unwrap();
        assert_eq!(m.seq_id, 2);
        assert_eq!(m.matched_len, 3);
    }

    #[test]
    fn capacity_evicts_lru_reclaimable() {
        let mut cache = PrefixCache::new(5);
        cache.insert(1, vec![1, 1, 1]);
        cache.insert(2, vec![2, 2, 2]);
        // Sequence 1 becomes reclaimable first, so it is the LRU victim once
        // sequence 2 is also recycled and capacity (6 > 5) forces eviction.
        let freed = cache.recycle_sequence(1, true);
        assert_eq!(freed, vec![1]);
        assert!(!cache.has_sequence(1));
        assert!(cache.has_sequence(2));
    }

    #[test]
    fn active_sequences_are_never_evicted() {
        let mut cache = PrefixCache::new(2);
        cache.insert(1, vec![1, 1, 1]);
        assert!(cache.evict_reclaimable(1).is_empty());
        assert!(cache.has_sequence(1));
    }

    #[test]
    fn evict_reclaimable_in_lru_order() {
        let mut cache = PrefixCache::new(0);
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        cache.recycle_sequence(1, true);
        cache.recycle_sequence(2, true);
        // Matching refreshes sequence 1, making 2 the LRU victim.
        cache.match_prefix(&[1]);
        assert_eq!(cache.evict_reclaimable(1), vec![2]);
        assert!(cache.has_sequence(1));
    }
}
