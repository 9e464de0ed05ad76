//! Text embedding backends.
//!
//! Embedders are synchronous and CPU-bound. Async callers go through
//! [`embed_text`] and [`embed_texts`], which move the work onto tokio's
//! blocking pool.

mod hashing;
mod onnx;

pub use hashing::HashingEmbedder;
pub use onnx::{ensure_model, OnnxEmbedder};

use std::path::Path;
use std::sync::Arc;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{Error, Result};
use crate::types::EmbeddingVector;

/// Turns text into fixed-dimension vectors
pub trait Embedder: Send + Sync {
    /// Embed texts, returning vectors in input order. All or nothing.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>>;

    fn embed(&self, text: &str) -> Result<EmbeddingVector> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Model("embedder returned no vector".into()))
    }
}

pub type SharedEmbedder = Arc<dyn Embedder>;

/// Embed one text on the blocking pool
pub async fn embed_text(embedder: &SharedEmbedder, text: String) -> Result<EmbeddingVector> {
    let embedder = Arc::clone(embedder);
    tokio::task::spawn_blocking(move || embedder.embed(&text))
        .await
        .map_err(|e| Error::Model(format!("embedding task failed: {e}")))?
}

/// Embed many texts on the blocking pool
pub async fn embed_texts(
    embedder: &SharedEmbedder,
    texts: Vec<String>,
) -> Result<Vec<EmbeddingVector>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let embedder = Arc::clone(embedder);
    tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
        .await
        .map_err(|e| Error::Model(format!("embedding task failed: {e}")))?
}

/// Build the configured embedder, downloading model files on first use
pub async fn from_config(config: &EmbeddingConfig, cache_dir: &Path) -> Result<SharedEmbedder> {
    match config.backend {
        EmbeddingBackend::Hashing => Ok(Arc::new(HashingEmbedder::new())),
        EmbeddingBackend::Onnx => {
            let model_dir = ensure_model(&config.model, cache_dir).await?;
            let embedder = tokio::task::spawn_blocking(move || OnnxEmbedder::load(&model_dir))
                .await
                .map_err(|e| Error::Model(format!("model load task failed: {e}")))??;
            let embedder = embedder.with_batch_size(config.batch_size);
            Ok(Arc::new(embedder))
        }
    }
}

/// L2 normalize in place; zero vectors are left as-is
pub(crate) fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0; 4];
        normalize(&mut zero);
        assert!(zero.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_blank_texts_embed_in_batch() {
        let embedder: SharedEmbedder = Arc::new(HashingEmbedder::new());
        let texts = vec!["ok".to_string(), "   ".to_string(), String::new()];
        let vectors = embed_texts(&embedder, texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.as_slice().len() == EMBEDDING_DIM));
    }

    #[tokio::test]
    async fn test_async_helpers_preserve_order() {
        let embedder: SharedEmbedder = Arc::new(HashingEmbedder::new());
        let texts = vec!["alpha bug".to_string(), "beta crash".to_string()];
        let batch = embed_texts(&embedder, texts.clone()).await.unwrap();
        let single = embed_text(&embedder, texts[1].clone()).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], single);
        assert!(embed_texts(&embedder, Vec::new()).await.unwrap().is_empty());
    }
}
