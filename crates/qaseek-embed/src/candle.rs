//! Sentence-transformer embedder using Candle.
//!
//! Defaults to `sentence-transformers/all-MiniLM-L6-v2`:
//! - 384 dimensions
//! - 256 max word pieces
//! - BERT architecture, mean pooling

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use hf_hub::{api::tokio::ApiBuilder, Repo, RepoType};
use qaseek_core::{EmbedError, Embedder, EmbeddingConfig, EmbeddingOutput};
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Default model on the HuggingFace Hub.
pub const DEFAULT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Maximum sequence length accepted by MiniLM.
const MAX_TOKENS: usize = 256;

struct LoadedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

/// Transformer embedder backed by Candle.
///
/// The model is loaded once by [`CandleEmbedder::load`]; a failed load is
/// returned to the caller. Inference runs on the blocking thread pool and is
/// reported as single-flight through [`Embedder::max_concurrency`].
pub struct CandleEmbedder {
    model_id: String,
    inner: Arc<LoadedModel>,
}

impl CandleEmbedder {
    /// Download (if needed) and load a model.
    pub async fn load(model_id: &str, cache_dir: Option<PathBuf>) -> Result<Self, EmbedError> {
        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        info!("Loading embedding model {} on {:?}", model_id, device);

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder
            .build()
            .map_err(|e| EmbedError::ModelLoad(format!("failed to create HF API: {e}")))?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| EmbedError::ModelLoad(format!("failed to fetch tokenizer: {e}")))?;
        let config_path = repo
            .get("config.json")
            .await
            .map_err(|e| EmbedError::ModelLoad(format!("failed to fetch config: {e}")))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|e| EmbedError::ModelLoad(format!("failed to fetch weights: {e}")))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EmbedError::ModelLoad(format!("failed to load tokenizer: {e}")))?;

        let config_str = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| EmbedError::ModelLoad(format!("failed to read config: {e}")))?;
        let config: Config = serde_json::from_str(&config_str)
            .map_err(|e| EmbedError::ModelLoad(format!("failed to parse config: {e}")))?;
        let dimension = config.hidden_size;

        // SAFETY: weights come from the local HF cache and are only read.
        #[allow(unsafe_code)]
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                .map_err(|e| EmbedError::ModelLoad(format!("failed to map weights: {e}")))?
        };
        let model = BertModel::load(vb, &config)
            .map_err(|e| EmbedError::ModelLoad(format!("failed to build BERT model: {e}")))?;

        info!("Embedding model {} ready ({} dimensions)", model_id, dimension);

        Ok(Self {
            model_id: model_id.to_string(),
            inner: Arc::new(LoadedModel {
                model,
                tokenizer,
                device,
                dimension,
            }),
        })
    }
}

impl LoadedModel {
    fn encode_batch(
        &self,
        texts: &[String],
        normalize: bool,
    ) -> Result<Vec<EmbeddingOutput>, EmbedError> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbedError::Inference(format!("tokenization failed: {e}")))?;

        for encoding in &encodings {
            if encoding.len() > MAX_TOKENS {
                return Err(EmbedError::InputTooLong {
                    tokens: encoding.len(),
                    max: MAX_TOKENS,
                });
            }
        }

        let batch_size = encodings.len();
        let max_len = encodings.iter().map(|e| e.len()).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * max_len);
        let mut attention_mask = Vec::with_capacity(batch_size * max_len);
        let mut token_counts = Vec::with_capacity(batch_size);

        for encoding in &encodings {
            let ids = encoding.get_ids();
            token_counts.push(ids.len());
            input_ids.extend_from_slice(ids);
            attention_mask.extend(std::iter::repeat(1u32).take(ids.len()));
            let pad = max_len - ids.len();
            input_ids.extend(std::iter::repeat(0u32).take(pad));
            attention_mask.extend(std::iter::repeat(0u32).take(pad));
        }

        let inference = |e: candle_core::Error| EmbedError::Inference(e.to_string());

        let input_ids =
            Tensor::from_vec(input_ids, (batch_size, max_len), &self.device).map_err(inference)?;
        let attention_mask = Tensor::from_vec(attention_mask, (batch_size, max_len), &self.device)
            .map_err(inference)?;
        let token_type_ids = input_ids.zeros_like().map_err(inference)?;

        let output = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .map_err(inference)?;

        let pooled = mean_pooling(&output, &attention_mask).map_err(inference)?;
        let pooled = if normalize {
            l2_normalize(&pooled).map_err(inference)?
        } else {
            pooled
        };

        let rows = pooled.to_vec2::<f32>().map_err(inference)?;
        Ok(rows
            .into_iter()
            .zip(token_counts)
            .map(|(embedding, token_count)| EmbeddingOutput {
                embedding,
                token_count,
            })
            .collect())
    }
}

fn mean_pooling(hidden: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
    let mask = attention_mask
        .to_dtype(DType::F32)?
        .unsqueeze(2)?
        .broadcast_as(hidden.shape())?;
    let summed = hidden.mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    summed.div(&counts)
}

fn l2_normalize(embeddings: &Tensor) -> candle_core::Result<Tensor> {
    let norm = embeddings
        .sqr()?
        .sum_keepdim(1)?
        .sqrt()?
        .clamp(1e-12, f64::MAX)?;
    embeddings.broadcast_div(&norm)
}

#[async_trait]
impl Embedder for CandleEmbedder {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }

    fn max_tokens(&self) -> usize {
        MAX_TOKENS
    }

    fn max_concurrency(&self) -> Option<usize> {
        Some(1)
    }

    async fn embed_text(
        &self,
        texts: &[&str],
        config: &EmbeddingConfig,
    ) -> Result<Vec<EmbeddingOutput>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbedError::EmptyInput);
        }

        debug!("Embedding {} texts with batch_size {}", texts.len(), config.batch_size);

        let mut results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(config.batch_size.max(1)) {
            let owned: Vec<String> = chunk.iter().map(|t| (*t).to_string()).collect();
            let inner = Arc::clone(&self.inner);
            let normalize = config.normalize;
            let batch = tokio::task::spawn_blocking(move || inner.encode_batch(&owned, normalize))
                .await
                .map_err(|e| EmbedError::Inference(format!("inference task failed: {e}")))??;
            results.extend(batch);
        }

        Ok(results)
    }
}
