use serde::{Deserialize, Serialize};

use crate::grammar::GrammarSpec;

pub type RequestId = String;

/// One block of request input. Token blocks are transparent to the core;
/// other modalities only expose their embedding length.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Token(TokenData),
    Image(ImageData),
    Audio(AudioData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub token_ids: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    /// Number of embedding positions this image occupies after projection.
    pub embed_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub embed_len: usize,
}

impl Data {
    pub fn token(token_ids: Vec<i32>) -> Self {
        Self::Token(TokenData { token_ids })
    }

    /// Length of this block in model positions.
    pub fn len(&self) -> usize {
        match self {
            Self::Token(t) => t.token_ids.len(),
            Self::Image(i) => i.embed_len,
            Self::Audio(a) => a.embed_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_token(&self) -> Option<&TokenData> {
        match self {
            Self::Token(t) => Some(t),
            _ => None,
        }
    }
}

/// Why a generation branch stopped. Serialized forms are the wire strings
/// delivered through the stream callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Cancel,
    Error,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Cancel => "cancel",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugConfig {
    /// Keep this request's root sequence resident in the prefix cache and the
    /// KV cache after it finishes. Used for long-lived system prompts.
    #[serde(default)]
    pub pinned_system_prompt: bool,
}

/// Per-request generation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Number of parallel completions.
    #[serde(default = "default_n")]
    pub n: usize,
    /// Emit top-k logprobs per token when greater than zero.
    #[serde(default)]
    pub logprobs: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Multiplicative penalty on already-seen tokens. 1.0 disables.
    #[serde(default = "default_one")]
    pub repetition_penalty: f32,
    /// OpenAI-convention frequency penalty. 0.0 disables.
    #[serde(default)]
    pub frequency_penalty: f32,
    /// OpenAI-convention presence penalty. 0.0 disables.
    #[serde(default)]
    pub presence_penalty: f32,
    /// Additive per-token logit adjustments.
    #[serde(default)]
    pub logit_bias: Option<Vec<(i32, f32)>>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stop_strings: Vec<String>,
    /// Constrained-generation grammar, if any.
    #[serde(default)]
    pub grammar: Option<GrammarSpec>,
    #[serde(default)]
    pub debug: DebugConfig,
}

fn default_n() -> usize {
    1
}

fn default_max_tokens() -> usize {
    128
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_one() -> f32 {
    1.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            n: 1,
            logprobs: 0,
            max_tokens: default_max_tokens(),
            ignore_eos: false,
            temperature: 1.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            logit_bias: None,
            seed: None,
            stop_strings: Vec::new(),
            grammar: None,
            debug: DebugConfig::default(),
        }
    }
}

impl GenerationConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

/// A user request as handed to the engine. Immutable once admitted.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub inputs: Vec<Data>,
    pub generation_cfg: GenerationConfig,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, inputs: Vec<Data>, generation_cfg: GenerationConfig) -> Self {
        Self {
            id: id.into(),
            inputs,
            generation_cfg,
        }
    }

    /// Total input length in model positions, across all modalities.
    pub fn input_total_len(&self) -> usize {
        self.inputs.iter().map(Data::len).sum()
    }

    /// Flattened prompt token ids, or None if any block is non-token.
    pub fn prompt_token_ids(&self) -> Option<Vec<i32>> {
        let mut out = Vec::with_capacity(self.input_total_len());
        for data in &self.inputs {
            out.extend_from_slice(&data.as_token()?.token_ids);
        }
        Some(out)
    }
}
