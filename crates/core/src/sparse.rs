//! In-memory Okapi BM25 keyword index.
//!
//! Built once from the full chunk corpus. Scores follow
//! `Σ IDF(q) · f(q,D)·(k1+1) / (f(q,D) + k1·(1 - b + b·|D|/avgdl))` with
//! `IDF(q) = ln((N - n(q) + 0.5) / (n(q) + 0.5) + 1)`, which stays positive.

use crate::models::{PdfChunk, RetrievalSignal, RetrievedChunk};
use crate::traits::SparseIndex;
use std::collections::HashMap;

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Bm25Index {
    chunks: Vec<PdfChunk>,
    term_freqs: Vec<HashMap<String, usize>>,
    lengths: Vec<usize>,
    document_freqs: HashMap<String, usize>,
    average_length: f64,
    k1: f64,
    b: f64,
}

impl Bm25Index {
    pub fn from_chunks(chunks: Vec<PdfChunk>) -> Self {
        let mut term_freqs = Vec::with_capacity(chunks.len());
        let mut lengths = Vec::with_capacity(chunks.len());
        let mut document_freqs: HashMap<String, usize> = HashMap::new();

        for chunk in &chunks {
            let tokens = tokenize(&chunk.text);
            lengths.push(tokens.len());

            let mut frequencies: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *frequencies.entry(token).or_insert(0) += 1;
            }
            for term in frequencies.keys() {
                *document_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(frequencies);
        }

        let average_length = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
        };

        Self {
            chunks,
            term_freqs,
            lengths,
            document_freqs,
            average_length,
            k1: 1.5,
            b: 0.75,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let total = self.chunks.len() as f64;
        let containing = self.document_freqs.get(term).copied().unwrap_or(0) as f64;
        ((total - containing + 0.5) / (containing + 0.5) + 1.0).ln()
    }

    fn score(&self, position: usize, query_terms: &[String]) -> f64 {
        let frequencies = &self.term_freqs[position];
        let length_ratio = if self.average_length > 0.0 {
            self.lengths[position] as f64 / self.average_length
        } else {
            0.0
        };

        query_terms
            .iter()
            .filter_map(|term| frequencies.get(term).map(|tf| (term, *tf as f64)))
            .map(|(term, tf)| {
                let denominator = tf + self.k1 * (1.0 - self.b + self.b * length_ratio);
                self.idf(term) * tf * (self.k1 + 1.0) / denominator
            })
            .sum()
    }
}

impl SparseIndex for Bm25Index {
    /// Chunks sharing no term with the query are never returned; equal
    /// scores keep corpus order.
    fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedChunk> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = (0..self.chunks.len())
            .map(|position| (position, self.score(position, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1));

        scored
            .into_iter()
            .take(k)
            .map(|(position, score)| RetrievedChunk {
                chunk: self.chunks[position].clone(),
                score,
                signal: RetrievalSignal::Sparse,
            })
            .collect()
    }
}
