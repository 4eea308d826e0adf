use crate::backend::Tokenizer;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

pub const PAD_TOKEN: &str = "[PAD]";
pub const EOS_TOKEN: &str = "[EOS]";
pub const UNK_TOKEN: &str = "[UNK]";

/// Fixed id of [`EOS_TOKEN`] in every [`CharTokenizer`] vocabulary.
pub const EOS_ID: u32 = 1;

const SPECIAL_TOKENS: [&str; 3] = [PAD_TOKEN, EOS_TOKEN, UNK_TOKEN];

#[derive(Debug, Serialize, Deserialize)]
struct VocabFile {
    tokens: Vec<String>,
}

/// One token per character. Ids 0, 1 and 2 are `[PAD]`, `[EOS]` and `[UNK]`.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
}

impl CharTokenizer {
    /// Build from a token list; special tokens are moved to the front.
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let mut ordered: Vec<String> = SPECIAL_TOKENS.iter().map(|t| (*t).to_string()).collect();
        for token in tokens {
            if !ordered.contains(&token) {
                ordered.push(token);
            }
        }
        let ids = ordered.iter().enumerate().map(|(id, t)| (t.clone(), id as u32)).collect();
        Self { tokens: ordered, ids }
    }

    /// Vocabulary of every non-whitespace character in `texts`, sorted.
    pub fn from_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let chars: BTreeSet<char> = texts.into_iter().flat_map(str::chars).filter(|c| !c.is_whitespace()).collect();
        Self::new(chars.into_iter().map(String::from))
    }

    pub fn from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrainingError::Dataset(format!("cannot read tokenizer {}: {e}", path.display())))?;
        let vocab: VocabFile = serde_json::from_str(&content)?;
        Ok(Self::new(vocab.tokens))
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&VocabFile { tokens: self.tokens.clone() })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    #[must_use]
    pub fn pad_id(&self) -> u32 {
        0
    }

    #[must_use]
    pub fn eos_id(&self) -> u32 {
        EOS_ID
    }

    #[must_use]
    pub fn unk_id(&self) -> u32 {
        2
    }

    /// Whitespace separates nothing at character level and is dropped.
    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut buf = [0u8; 4];
        text.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| self.ids.get(c.encode_utf8(&mut buf) as &str).copied().unwrap_or(self.unk_id()))
            .collect()
    }

    fn is_special(id: usize) -> bool {
        id < SPECIAL_TOKENS.len()
    }
}

impl Tokenizer for CharTokenizer {
    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn decode_batch(&self, ids: &[Vec<i64>], skip_special_tokens: bool) -> Vec<String> {
        ids.iter()
            .map(|row| {
                row.iter()
                    .filter_map(|&id| usize::try_from(id).ok())
                    .filter(|&id| !(skip_special_tokens && Self::is_special(id)))
                    .map(|id| self.tokens.get(id).map_or(UNK_TOKEN, String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_special_ids_are_fixed() {
        let tok = CharTokenizer::from_texts(["ba", "ab"]);
        assert_eq!(tok.token_to_id(PAD_TOKEN), Some(0));
        assert_eq!(tok.token_to_id(EOS_TOKEN), Some(1));
        assert_eq!(tok.token_to_id(UNK_TOKEN), Some(2));
        assert_eq!(tok.token_to_id("a"), Some(3));
        assert_eq!(tok.vocab_size(), 5);
    }

    #[test]
    fn test_unknown_chars_map_to_unk() {
        let tok = CharTokenizer::from_texts(["ab"]);
        assert_eq!(tok.encode("a z b"), vec![3, 2, 4]);
    }

    #[test]
    fn test_decode_skips_specials_and_negative_ids() {
        let tok = CharTokenizer::from_texts(["你好"]);
        let hello: Vec<i64> = tok.encode("你好").into_iter().map(i64::from).collect();
        let row = [vec![0], hello, vec![1, -100]].concat();

        assert_eq!(tok.decode_batch(&[row.clone()], true), vec!["你 好"]);
        assert_eq!(tok.decode_batch(&[row], false), vec!["[PAD] 你 好 [EOS]"]);
    }

    #[test]
    fn test_vocab_file_keeps_ids() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokenizer.json");
        let tok = CharTokenizer::from_texts(["hello"]);
        tok.save(&path).unwrap();

        let loaded = CharTokenizer::from_file(&path).unwrap();
        assert_eq!(loaded.encode("hello"), tok.encode("hello"));
        assert_eq!(loaded.vocab_size(), tok.vocab_size());
    }
}
