use serde::Deserialize;

/// Engine-level knobs consumed by the request lifecycle core.
///
/// Everything here has a usable default so a config file only needs to name
/// the fields it overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on prompt plus generated tokens for any single sequence.
    #[serde(default = "default_max_single_sequence_length")]
    pub max_single_sequence_length: usize,

    /// Maximum number of requests admitted to the running queue at once.
    #[serde(default = "default_max_num_sequence")]
    pub max_num_sequence: usize,

    /// Number of prompt tokens prefilled per engine step. Prompts longer than
    /// this straddle the waiting/running boundary across several steps.
    #[serde(default = "default_prefill_chunk_size")]
    pub prefill_chunk_size: usize,

    /// Whether root sequences of token-only prompts are deduplicated through
    /// the prefix cache.
    #[serde(default = "default_true")]
    pub enable_prefix_cache: bool,

    /// Token capacity of the prefix cache before reclaimable sequences are
    /// evicted in LRU order. 0 disables the cap.
    #[serde(default)]
    pub prefix_cache_max_tokens: usize,

    /// Slot count of the draft-token workspace used by speculative decoding.
    /// 0 disables the workspace.
    #[serde(default)]
    pub spec_draft_slots: usize,
}

fn default_max_single_sequence_length() -> usize {
    4096
}

fn default_max_num_sequence() -> usize {
    64
}

fn default_prefill_chunk_size() -> usize {
    512
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_single_sequence_length: default_max_single_sequence_length(),
            max_num_sequence: default_max_num_sequence(),
            prefill_chunk_size: default_prefill_chunk_size(),
            enable_prefix_cache: true,
            prefix_cache_max_tokens: 0,
            spec_draft_slots: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("failed to parse config");
        assert_eq!(config.max_single_sequence_length, 4096);
        assert_eq!(config.max_num_sequence, 64);
        assert_eq!(config.prefill_chunk_size, 512);
        assert!(config.enable_prefix_cache);
        assert_eq!(config.prefix_cache_max_tokens, 0);
        assert_eq!(config.spec_draft_slots, 0);
    }

    #[test]
    fn partial_config_overrides() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "max_single_sequence_length": 8192,
                "prefill_chunk_size": 128,
                "enable_prefix_cache": false
            }"#,
        )
        .expect("failed to parse config");
        assert_eq!(config.max_single_sequence_length, 8192);
        assert_eq!(config.prefill_chunk_size, 128);
        assert!(!config.enable_prefix_cache);
        assert_eq!(config.max_num_sequence, 64);
    }
}
