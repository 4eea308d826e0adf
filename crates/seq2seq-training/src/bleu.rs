use crate::backend::BleuScorer;
use std::collections::HashMap;

const MAX_ORDER: usize = 4;

/// Sentence-level BLEU-4 over characters.
///
/// Decoded text has its separator spaces removed before scoring, so
/// characters are the natural unit. Orders above 1 use add-one smoothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentenceBleu4;

fn ngram_counts(chars: &[char], n: usize) -> HashMap<&[char], usize> {
    let mut counts = HashMap::new();
    if chars.len() >= n {
        for gram in chars.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

impl BleuScorer for SentenceBleu4 {
    fn score(&self, reference: &str, candidate: &str) -> f64 {
        let reference: Vec<char> = reference.chars().collect();
        let candidate: Vec<char> = candidate.chars().collect();
        if candidate.is_empty() || reference.is_empty() {
            return 0.0;
        }

        let mut log_precision_sum = 0.0;
        for n in 1..=MAX_ORDER {
            let cand = ngram_counts(&candidate, n);
            let refs = ngram_counts(&reference, n);

            let total: usize = cand.values().sum();
            let matched: usize = cand
                .iter()
                .map(|(gram, &count)| count.min(refs.get(gram).copied().unwrap_or(0)))
                .sum();

            let precision = if n == 1 {
                if matched == 0 {
                    return 0.0;
                }
                matched as f64 / total as f64
            } else {
                (matched as f64 + 1.0) / (total as f64 + 1.0)
            };
            log_precision_sum += precision.ln();
        }

        let c = candidate.len() as f64;
        let r = reference.len() as f64;
        let brevity_penalty = if c > r { 1.0 } else { (1.0 - r / c).exp() };

        (brevity_penalty * (log_precision_sum / MAX_ORDER as f64).exp()).clamp(0.0, 1.0)
    }
}

/// Arithmetic mean; an empty slice averages to exactly `0.0`.
#[must_use]
pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
