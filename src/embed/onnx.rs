use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context};
use ndarray::Array2;
use ort::{inputs, session::Session, value::Value};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::{normalize, Embedder};
use crate::error::{Error, Result};
use crate::types::{EmbeddingVector, EMBEDDING_DIM};

const MODEL_FILE: &str = "model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const MAX_SEQ_LEN: usize = 512;

/// Download locations for the built-in model
fn model_urls(model: &str) -> Option<(&'static str, &'static str)> {
    match model {
        "all-MiniLM-L6-v2" => Some((
            "https://huggingface.co/Xenova/all-MiniLM-L6-v2/resolve/main/onnx/model_quantized.onnx",
            "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json",
        )),
        _ => None,
    }
}

/// all-MiniLM-L6-v2 through ONNX Runtime
pub struct OnnxEmbedder {
    // `Session::run` needs exclusive access
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    batch_size: usize,
}

impl OnnxEmbedder {
    /// Load model and tokenizer from a directory produced by [`ensure_model`]
    pub fn load(model_dir: &Path) -> Result<Self> {
        Self::load_inner(model_dir).map_err(|e| Error::Model(format!("{e:#}")))
    }

    fn load_inner(model_dir: &Path) -> anyhow::Result<Self> {
        let model_path = model_dir.join(MODEL_FILE);
        let tokenizer_path = model_dir.join(TOKENIZER_FILE);

        let session = Session::builder()
            .context("Failed to create ONNX session builder")?
            .with_intra_threads(num_cpus::get())
            .context("Failed to configure ONNX threads")?
            .commit_from_file(&model_path)
            .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure truncation: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            batch_size: 32,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One padded forward pass over a slice of texts
    fn run_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Tokenization failed: {e}"))?;

        let batch = encodings.len();
        let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for enc in &encodings {
            ids.extend(enc.get_ids().iter().map(|&x| i64::from(x)));
            mask.extend(enc.get_attention_mask().iter().map(|&x| i64::from(x)));
        }
        let type_ids = vec![0i64; batch * seq_len];

        let ids_array = Array2::from_shape_vec((batch, seq_len), ids)?;
        let mask_array = Array2::from_shape_vec((batch, seq_len), mask.clone())?;
        let type_array = Array2::from_shape_vec((batch, seq_len), type_ids)?;

        let hidden = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
            let outputs = session
                .run(inputs![
                    "input_ids" => Value::from_array(ids_array)?,
                    "attention_mask" => Value::from_array(mask_array)?,
                    "token_type_ids" => Value::from_array(type_array)?
                ])
                .context("ONNX inference failed")?;

            let (shape, data) = outputs["last_hidden_state"]
                .try_extract_tensor::<f32>()
                .context("Failed to extract last_hidden_state tensor")?;
            let dims = shape.as_ref();
            if dims.len() != 3 || dims[2] as usize != EMBEDDING_DIM {
                bail!("Unexpected output shape: {dims:?}");
            }
            data.to_vec()
        };

        let mut vectors = Vec::with_capacity(batch);
        for b in 0..batch {
            let row_mask = &mask[b * seq_len..(b + 1) * seq_len];
            let mut pooled = mean_pool(&hidden[b * seq_len * EMBEDDING_DIM..], row_mask);
            normalize(&mut pooled);
            vectors.push(pooled);
        }
        Ok(vectors)
    }
}

/// Average token vectors where the attention mask is set
fn mean_pool(tokens: &[f32], mask: &[i64]) -> Vec<f32> {
    let mut pooled = vec![0.0f32; EMBEDDING_DIM];
    let mut count = 0.0f32;
    for (i, &m) in mask.iter().enumerate() {
        if m == 0 {
            continue;
        }
        let row = &tokens[i * EMBEDDING_DIM..(i + 1) * EMBEDDING_DIM];
        for (acc, v) in pooled.iter_mut().zip(row) {
            *acc += v;
        }
        count += 1.0;
    }
    if count > 0.0 {
        for v in &mut pooled {
            *v /= count;
        }
    }
    pooled
}

impl Embedder for OnnxEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let vectors = self
                .run_batch(chunk)
                .map_err(|e| Error::Model(format!("{e:#}")))?;
            for v in vectors {
                out.push(EmbeddingVector::new(v)?);
            }
        }
        Ok(out)
    }
}

/// Make sure model files exist under `cache_dir/<model>`, downloading them if not
pub async fn ensure_model(model: &str, cache_dir: &Path) -> Result<PathBuf> {
    let model_dir = cache_dir.join(model);
    let model_path = model_dir.join(MODEL_FILE);
    let tokenizer_path = model_dir.join(TOKENIZER_FILE);

    if model_path.exists() && tokenizer_path.exists() {
        return Ok(model_dir);
    }

    let (model_url, tokenizer_url) = model_urls(model)
        .ok_or_else(|| Error::Model(format!("unknown model '{model}' and no files in {}", model_dir.display())))?;

    tokio::fs::create_dir_all(&model_dir)
        .await
        .map_err(|e| Error::Model(format!("Failed to create {}: {e}", model_dir.display())))?;

    let client = reqwest::Client::new();
    for (url, path) in [(model_url, &model_path), (tokenizer_url, &tokenizer_path)] {
        if path.exists() {
            continue;
        }
        tracing::info!("Downloading {url}");
        download(&client, url, path)
            .await
            .map_err(|e| Error::Model(format!("{e:#}")))?;
    }

    Ok(model_dir)
}

async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {url}"))?;
    if !response.status().is_success() {
        bail!("Download of {url} failed with status {}", response.status());
    }
    let bytes = response.bytes().await.context("Failed to read download body")?;

    // Write then rename so an interrupted download never looks complete
    let partial = dest.with_extension("part");
    tokio::fs::write(&partial, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", partial.display()))?;
    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("Failed to move {} into place", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool_respects_mask() {
        let mut tokens = vec![0.0f32; EMBEDDING_DIM * 3];
        tokens[0] = 2.0;
        tokens[EMBEDDING_DIM] = 4.0;
        tokens[2 * EMBEDDING_DIM] = 100.0;
        let pooled = mean_pool(&tokens, &[1, 1, 0]);
        assert!((pooled[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_all_masked() {
        let tokens = vec![1.0f32; EMBEDDING_DIM];
        let pooled = mean_pool(&tokens, &[0]);
        assert!(pooled.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_known_model_urls() {
        assert!(model_urls("all-MiniLM-L6-v2").is_some());
        assert!(model_urls("something-else").is_none());
    }

    #[tokio::test]
    async fn test_ensure_model_uses_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("custom");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join(MODEL_FILE), b"x").unwrap();
        std::fs::write(model_dir.join(TOKENIZER_FILE), b"{}").unwrap();

        let found = ensure_model("custom", dir.path()).await.unwrap();
        assert_eq!(found, model_dir);
    }

    #[tokio::test]
    async fn test_ensure_model_unknown_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_model("custom", dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Model(_)));
    }
}
