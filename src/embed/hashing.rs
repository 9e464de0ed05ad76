use std::collections::BTreeMap;
use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{normalize, Embedder};
use crate::error::Result;
use crate::types::{EmbeddingVector, EMBEDDING_DIM};

/// Offline embedder using signed feature hashing of word unigrams and bigrams.
///
/// Needs no model files and gives identical vectors on every platform, so it
/// backs tests and air-gapped installs. Scores are lexical, not semantic.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingEmbedder;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("Invalid regex"));

impl HashingEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn embed_one(&self, text: &str) -> Result<EmbeddingVector> {
        let lower = text.to_lowercase();
        let words: Vec<&str> = WORD.find_iter(&lower).map(|m| m.as_str()).collect();

        // Ordered map keeps the float summation order fixed
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for word in &words {
            *counts.entry((*word).to_string()).or_default() += 1;
        }
        for pair in words.windows(2) {
            *counts.entry(format!("{} {}", pair[0], pair[1])).or_default() += 1;
        }

        let mut values = vec![0.0f32; EMBEDDING_DIM];
        for (feature, count) in &counts {
            let (bucket, sign) = bucket_of(feature);
            values[bucket] += sign * (1.0 + (*count as f32).ln());
        }
        normalize(&mut values);
        EmbeddingVector::new(values)
    }
}

impl Embedder for HashingEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        texts.par_iter().map(|t| self.embed_one(t)).collect()
    }
}

fn bucket_of(feature: &str) -> (usize, f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let h = u64::from_le_bytes(head);
    let bucket = (h % EMBEDDING_DIM as u64) as usize;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}
