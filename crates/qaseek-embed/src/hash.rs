//! Deterministic feature-hashing embedder.
//!
//! This module provides a [`HashEmbedder`] that maps text to a fixed-length
//! vector without any model files:
//!
//! 1. Lowercase the text and split it into alphanumeric words
//! 2. Hash each word, and each character trigram of `#word#`, with FNV-1a
//! 3. Add a signed weight to bucket `hash % dimension`
//! 4. L2-normalize
//!
//! Texts sharing words and word fragments land close together under cosine
//! similarity, which is enough for offline runs and tests.

use async_trait::async_trait;
use qaseek_core::{EmbedError, Embedder, EmbeddingConfig, EmbeddingOutput};

/// Model name reported by [`HashEmbedder`].
pub const HASH_MODEL_NAME: &str = "hash";

/// Default dimension, matching MiniLM.
pub const DEFAULT_DIMENSION: usize = 384;

/// Default limit on words per input.
pub const DEFAULT_MAX_TOKENS: usize = 2048;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Feature-hashing embedder.
///
/// # Example
///
/// ```rust
/// use qaseek_embed::HashEmbedder;
/// use qaseek_core::{Embedder, EmbeddingConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let embedder = HashEmbedder::new();
/// let vector = embedder.embed("gaming on windows", &EmbeddingConfig::default()).await?;
/// assert_eq!(vector.len(), 384);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    max_tokens: usize,
}

impl HashEmbedder {
    /// Embedder with the default dimension (384).
    #[must_use]
    pub fn new() -> Self {
        Self::with_dimension(DEFAULT_DIMENSION)
    }

    /// Embedder with a custom dimension.
    #[must_use]
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign * weight;
    }

    fn encode(&self, text: &str, normalize: bool) -> Result<EmbeddingOutput, EmbedError> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if words.is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        if words.len() > self.max_tokens {
            return Err(EmbedError::InputTooLong {
                tokens: words.len(),
                max: self.max_tokens,
            });
        }

        let mut vector = vec![0.0f32; self.dimension];
        for word in &words {
            self.add_feature(&mut vector, word.as_bytes(), WORD_WEIGHT);

            let padded: Vec<char> = std::iter::once('#')
                .chain(word.chars())
                .chain(std::iter::once('#'))
                .collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, trigram.as_bytes(), TRIGRAM_WEIGHT);
            }
        }

        if normalize {
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
        }

        Ok(EmbeddingOutput {
            embedding: vector,
            token_count: words.len(),
        })
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        HASH_MODEL_NAME
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    async fn embed_text(
        &self,
        texts: &[&str],
        config: &EmbeddingConfig,
    ) -> Result<Vec<EmbeddingOutput>, EmbedError> {
        texts
            .iter()
            .map(|text| self.encode(text, config.normalize))
            .collect()
    }
}
