use serde::{Deserialize, Serialize};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// A 2-D matrix of token ids, one row per sample.
///
/// `padded_rows` counts trailing rows that only exist to even out the final
/// distributed batch. They take part in compute but are dropped when
/// results are gathered for metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenBatch {
    pub rows: Vec<Vec<i64>>,
    #[serde(default)]
    pub padded_rows: usize,
}

impl TokenBatch {
    #[must_use]
    pub fn new(rows: Vec<Vec<i64>>) -> Self {
        Self { rows, padded_rows: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows that carry real samples.
    #[must_use]
    pub fn valid_rows(&self) -> &[Vec<i64>] {
        let keep = self.rows.len().saturating_sub(self.padded_rows);
        &self.rows[..keep]
    }

    /// Copy with every element equal to `token_id` replaced by [`IGNORE_INDEX`].
    #[must_use]
    pub fn masked(&self, token_id: i64) -> Self {
        let rows = self
            .rows
            .iter()
            .map(|row| row.iter().map(|&id| if id == token_id { IGNORE_INDEX } else { id }).collect())
            .collect();
        Self { rows, padded_rows: self.padded_rows }
    }
}

/// One collated unit consumed per training or evaluation step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchRecord {
    pub input_ids: TokenBatch,
    pub input_mask: TokenBatch,
    pub target_ids: TokenBatch,
}

impl BatchRecord {
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Training labels: targets with the pad/decoder-start id set to [`IGNORE_INDEX`].
    #[must_use]
    pub fn masked_labels(&self, pad_token_id: u32) -> TokenBatch {
        self.target_ids.masked(i64::from(pad_token_id))
    }

    pub(crate) fn set_padded_rows(&mut self, padded_rows: usize) {
        self.input_ids.padded_rows = padded_rows;
        self.input_mask.padded_rows = padded_rows;
        self.target_ids.padded_rows = padded_rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_replaces_only_pad_ids() {
        let batch = TokenBatch::new(vec![vec![5, 0, 7, 0], vec![0, 3, 3, 9]]);
        let masked = batch.masked(0);

        for (orig_row, new_row) in batch.rows.iter().zip(&masked.rows) {
            for (&orig, &new) in orig_row.iter().zip(new_row) {
                if orig == 0 {
                    assert_eq!(new, IGNORE_INDEX);
                } else {
                    assert_eq!(new, orig);
                }
            }
        }
    }

    #[test]
    fn test_masked_labels_leave_record_untouched() {
        let record = BatchRecord {
            input_ids: TokenBatch::new(vec![vec![4, 5]]),
            input_mask: TokenBatch::new(vec![vec![1, 1]]),
            target_ids: TokenBatch::new(vec![vec![6, 0]]),
        };
        let labels = record.masked_labels(0);
        assert_eq!(labels.rows, vec![vec![6, IGNORE_INDEX]]);
        assert_eq!(record.target_ids.rows, vec![vec![6, 0]]);
    }

    #[test]
    fn test_valid_rows_drop_padding() {
        let mut batch = TokenBatch::new(vec![vec![1], vec![2], vec![3]]);
        batch.padded_rows = 2;
        assert_eq!(batch.valid_rows(), &[vec![1]]);
    }
}
