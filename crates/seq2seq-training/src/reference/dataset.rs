use super::tokenizer::CharTokenizer;
use crate::backend::{Dataset, DatasetOptions};
use crate::batch::{BatchRecord, TokenBatch};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One line of a JSONL dataset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone)]
struct Encoded {
    input: Vec<i64>,
    target: Vec<i64>,
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<Encoded>),
    /// Every non-empty line; samples are re-read on collate.
    Streamed { path: PathBuf, lines: Vec<LineRef> },
}

#[derive(Debug, Clone, Copy)]
struct LineRef {
    offset: u64,
    line_no: usize,
}

/// Prompt/response pairs read from a JSONL file.
#[derive(Debug)]
pub struct JsonlDataset {
    tokenizer: CharTokenizer,
    storage: Storage,
    max_seq_len: usize,
}

impl JsonlDataset {
    pub fn open(options: &DatasetOptions) -> TrainingResult<Self> {
        let tokenizer = CharTokenizer::from_file(&options.tokenizer_file)?;
        Self::with_tokenizer(tokenizer, options)
    }

    pub fn with_tokenizer(tokenizer: CharTokenizer, options: &DatasetOptions) -> TrainingResult<Self> {
        if options.max_seq_len < 2 {
            return Err(TrainingError::InvalidConfig("max_seq_len must leave room for EOS".to_string()));
        }

        let file = File::open(&options.path)
            .map_err(|e| TrainingError::Dataset(format!("cannot open {}: {e}", options.path.display())))?;
        let mut reader = BufReader::new(file);

        let mut samples = Vec::new();
        let mut lines = Vec::new();
        let mut offset = 0u64;
        let mut line = String::new();
        let mut line_no = 0usize;
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if !line.trim().is_empty() {
                let sample = parse_line(&line, &options.path, line_no)?;
                if options.keep_in_memory {
                    samples.push(encode(&tokenizer, &sample, options.max_seq_len));
                } else {
                    lines.push(LineRef { offset, line_no });
                }
            }
            offset += read as u64;
        }

        let storage = if options.keep_in_memory {
            Storage::Memory(samples)
        } else {
            Storage::Streamed { path: options.path.clone(), lines }
        };
        Ok(Self { tokenizer, storage, max_seq_len: options.max_seq_len })
    }

    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    fn samples(&self, indices: &[usize]) -> TrainingResult<Vec<Encoded>> {
        match &self.storage {
            Storage::Memory(samples) => indices
                .iter()
                .map(|&i| samples.get(i).cloned().ok_or_else(|| out_of_range(i, samples.len())))
                .collect(),
            Storage::Streamed { path, lines } => {
                let mut reader = BufReader::new(File::open(path)?);
                let mut line = String::new();
                indices
                    .iter()
                    .map(|&i| -> TrainingResult<Encoded> {
                        let at = *lines.get(i).ok_or_else(|| out_of_range(i, lines.len()))?;
                        reader.seek(SeekFrom::Start(at.offset))?;
                        line.clear();
                        reader.read_line(&mut line)?;
                        let sample = parse_line(&line, path, at.line_no)?;
                        Ok(encode(&self.tokenizer, &sample, self.max_seq_len))
                    })
                    .collect()
            }
        }
    }
}

fn out_of_range(index: usize, len: usize) -> TrainingError {
    TrainingError::Dataset(format!("sample {index} out of range for dataset of {len}"))
}

fn parse_line(line: &str, path: &Path, line_no: usize) -> TrainingResult<PromptResponse> {
    serde_json::from_str(line.trim())
        .map_err(|e| TrainingError::Dataset(format!("{}:{line_no}: {e}", path.display())))
}

/// Truncate to `max_seq_len - 1` ids and append EOS.
fn encode_text(tokenizer: &CharTokenizer, text: &str, max_seq_len: usize) -> Vec<i64> {
    let mut ids: Vec<i64> = tokenizer.encode(text).into_iter().take(max_seq_len - 1).map(i64::from).collect();
    ids.push(i64::from(tokenizer.eos_id()));
    ids
}

fn encode(tokenizer: &CharTokenizer, sample: &PromptResponse, max_seq_len: usize) -> Encoded {
    Encoded {
        input: encode_text(tokenizer, &sample.prompt, max_seq_len),
        target: encode_text(tokenizer, &sample.response, max_seq_len),
    }
}

fn pad_rows(rows: Vec<Vec<i64>>, pad: i64) -> TokenBatch {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    TokenBatch::new(
        rows.into_iter()
            .map(|mut row| {
                row.resize(width, pad);
                row
            })
            .collect(),
    )
}

impl Dataset for JsonlDataset {
    type Tokenizer = CharTokenizer;

    fn len(&self) -> usize {
        match &self.storage {
            Storage::Memory(samples) => samples.len(),
            Storage::Streamed { lines, .. } => lines.len(),
        }
    }

    fn collate(&self, indices: &[usize]) -> TrainingResult<BatchRecord> {
        let samples = self.samples(indices)?;
        let pad = i64::from(self.tokenizer.pad_id());

        let masks = samples.iter().map(|s| vec![1; s.input.len()]).collect();
        let (inputs, targets): (Vec<_>, Vec<_>) = samples.into_iter().map(|s| (s.input, s.target)).unzip();

        Ok(BatchRecord {
            input_ids: pad_rows(inputs, pad),
            input_mask: pad_rows(masks, 0),
            target_ids: pad_rows(targets, pad),
        })
    }

    fn tokenizer(&self) -> &CharTokenizer {
        &self.tokenizer
    }
}
