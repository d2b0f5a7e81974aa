//! Byte-level BPE tokenizer for the CLIP text encoder.
//!
//! Parses the Hugging Face `tokenizer.json` shipped with
//! Xenova/clip-vit-base-patch32 and reproduces the pretraining convention:
//! lowercased input, GPT-2 style word splitting, byte-to-unicode mapping
//! with a `</w>` end-of-word marker, and rank-ordered merges.
//!
//! Output is a fixed [1, 77] sequence: BOS, up to 75 content tokens, EOS,
//! zero padding, with a parallel attention mask.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

pub const BOS_TOKEN_ID: i64 = 49406;
pub const EOS_TOKEN_ID: i64 = 49407;
pub const PAD_TOKEN_ID: i64 = 0;
/// Sequence length including BOS and EOS.
pub const MAX_LENGTH: usize = 77;

/// Word-splitting pattern: contractions, alphabetic runs, digit runs, and
/// single non-alphanumeric characters.
const SPLIT_PATTERN: &str = r"'s|'t|'re|'ve|'m|'ll|'d|[a-zA-Z]+|[0-9]+|[^\s\w]";

/// Fixed-length tokenization result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutput {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

/// Immutable tokenizer state: vocabulary, merge ranks, byte table.
pub struct ClipTokenizer {
    vocab: HashMap<String, i64>,
    /// "left right" pair → merge rank; lower rank merges first.
    merges: HashMap<String, usize>,
    byte_encoder: [char; 256],
    splitter: Regex,
}

impl ClipTokenizer {
    /// Loads vocabulary and merge rules from a `tokenizer.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let root: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidInput(format!("Malformed tokenizer file: {}", e)))?;

        let vocab_node = root
            .pointer("/model/vocab")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::InvalidInput("tokenizer file has no model.vocab".to_string()))?;
        let mut vocab = HashMap::with_capacity(vocab_node.len());
        for (token, id) in vocab_node {
            if let Some(id) = id.as_i64() {
                vocab.insert(token.clone(), id);
            }
        }

        let merges_node = root
            .pointer("/model/merges")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::InvalidInput("tokenizer file has no model.merges".to_string()))?;
        let mut merges = HashMap::with_capacity(merges_node.len());
        for (rank, entry) in merges_node.iter().enumerate() {
            // Merges appear either as "left right" strings or [left, right] pairs.
            let pair = match entry {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Array(parts) if parts.len() == 2 => format!(
                    "{} {}",
                    parts[0].as_str().unwrap_or(""),
                    parts[1].as_str().unwrap_or("")
                ),
                _ => continue,
            };
            merges.insert(pair, rank);
        }

        if vocab.is_empty() || merges.is_empty() {
            return Err(Error::InvalidInput(
                "tokenizer file has an empty vocabulary or merge table".to_string(),
            ));
        }

        tracing::info!(
            "Tokenizer loaded: {} vocab entries, {} merge rules",
            vocab.len(),
            merges.len()
        );

        Ok(Self {
            vocab,
            merges,
            byte_encoder: build_byte_encoder(),
            splitter: Regex::new(SPLIT_PATTERN).map_err(|e| Error::Internal(e.to_string()))?,
        })
    }

    /// Tokenizes text into `(input_ids, attention_mask)`, both of length
    /// [`MAX_LENGTH`].
    pub fn tokenize(&self, text: &str) -> TokenOutput {
        let text = text.trim().to_lowercase();

        let mut token_ids: Vec<i64> = Vec::new();
        for word in self.splitter.find_iter(&text) {
            let mut parts = self.word_to_byte_tokens(word.as_str());
            if let Some(last) = parts.last_mut() {
                last.push_str("</w>");
            }
            for token in self.apply_bpe(parts) {
                // Tokens absent from the vocabulary are dropped.
                if let Some(&id) = self.vocab.get(&token) {
                    token_ids.push(id);
                }
            }
        }

        let mut input_ids = vec![PAD_TOKEN_ID; MAX_LENGTH];
        let mut attention_mask = vec![0i64; MAX_LENGTH];

        input_ids[0] = BOS_TOKEN_ID;
        attention_mask[0] = 1;

        let content_len = token_ids.len().min(MAX_LENGTH - 2);
        for (i, &id) in token_ids.iter().take(content_len).enumerate() {
            input_ids[i + 1] = id;
            attention_mask[i + 1] = 1;
        }
        input_ids[content_len + 1] = EOS_TOKEN_ID;
        attention_mask[content_len + 1] = 1;

        TokenOutput {
            input_ids,
            attention_mask,
        }
    }

    /// Maps each UTF-8 byte of a word through the byte-to-unicode table,
    /// one single-character token per byte.
    fn word_to_byte_tokens(&self, word: &str) -> Vec<String> {
        word.bytes()
            .map(|b| self.byte_encoder[b as usize].to_string())
            .collect()
    }

    /// Repeatedly merges the lowest-ranked adjacent pair until none remains.
    fn apply_bpe(&self, mut tokens: Vec<String>) -> Vec<String> {
        if tokens.len() <= 1 {
            return tokens;
        }
        loop {
            let mut best_rank = usize::MAX;
            let mut best_idx = None;
            for i in 0..tokens.len() - 1 {
                let pair = format!("{} {}", tokens[i], tokens[i + 1]);
                if let Some(&rank) = self.merges.get(&pair) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_idx = Some(i);
                    }
                }
            }
            let Some(i) = best_idx else { break };
            let merged = format!("{}{}", tokens[i], tokens[i + 1]);
            tokens[i] = merged;
            tokens.remove(i + 1);
        }
        tokens
    }
}

/// GPT-2/CLIP byte-to-unicode table: printable ASCII and the Latin-1
/// printable ranges pass through, the remaining 68 byte values map to
/// U+0100…U+0143.
fn build_byte_encoder() -> [char; 256] {
    let mut table = ['\0'; 256];
    let passthrough = (b'!'..=b'~')
        .chain(161..=172u8)
        .chain(174..=255u8);
    for b in passthrough {
        table[b as usize] = b as u8 as char;
    }
    let mut n = 0u32;
    for b in 0..256usize {
        if table[b] == '\0' {
            table[b] = char::from_u32(256 + n).unwrap_or('\0');
            n += 1;
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tiny_tokenizer(dir: &std::path::Path) -> std::path::PathBuf {
        let json = serde_json::json!({
            "model": {
                "vocab": {
                    "a": 5, "b": 6, "c": 9,
                    "b</w>": 7, "c</w>": 10, "a</w>": 11,
                    "ab</w>": 8
                },
                "merges": ["a b</w>"]
            }
        });
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_load_rejects_missing_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tokenizer.json");
        std::fs::write(&path, r#"{"model":{"vocab":{}}}"#).unwrap();
        assert!(ClipTokenizer::load(&path).is_err());
        assert!(ClipTokenizer::load(&tmp.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_merge_applies_by_rank() {
        let tmp = tempfile::tempdir().unwrap();
        let tok = ClipTokenizer::load(&write_tiny_tokenizer(tmp.path())).unwrap();

        // "ab" → ['a', 'b</w>'] → merged "ab</w>" → id 8
        let out = tok.tokenize("ab");
        assert_eq!(out.input_ids[0], BOS_TOKEN_ID);
        assert_eq!(out.input_ids[1], 8);
        assert_eq!(out.input_ids[2], EOS_TOKEN_ID);
        assert_eq!(out.input_ids[3], PAD_TOKEN_ID);

        // "abc" → ['a','b','c</w>']: the only merge rule wants 'b</w>',
        // so nothing merges and each byte token maps individually.
        let out = tok.tokenize("abc");
        assert_eq!(&out.input_ids[1..4], &[5, 6, 10]);
    }

    #[test]
    fn test_unknown_tokens_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let tok = ClipTokenizer::load(&write_tiny_tokenizer(tmp.path())).unwrap();
        let out = tok.tokenize("zzz");
        assert_eq!(out.input_ids[0], BOS_TOKEN_ID);
        assert_eq!(out.input_ids[1], EOS_TOKEN_ID);
        assert_eq!(out.attention_mask.iter().sum::<i64>(), 2);
    }

    #[test]
    fn test_deterministic_and_fixed_length() {
        let tmp = tempfile::tempdir().unwrap();
        let tok = ClipTokenizer::load(&write_tiny_tokenizer(tmp.path())).unwrap();
        let a = tok.tokenize("AB c ab");
        let b = tok.tokenize("AB c ab");
        assert_eq!(a, b);
        assert_eq!(a.input_ids.len(), MAX_LENGTH);
        assert_eq!(a.attention_mask.len(), MAX_LENGTH);
    }

    #[test]
    fn test_mask_is_prefix_of_ones_and_pad_follows_eos() {
        let tmp = tempfile::tempdir().unwrap();
        let tok = ClipTokenizer::load(&write_tiny_tokenizer(tmp.path())).unwrap();
        let out = tok.tokenize("ab c");

        let ones = out.attention_mask.iter().take_while(|&&m| m == 1).count();
        assert!(out.attention_mask[ones..].iter().all(|&m| m == 0));
        // Last attended position is EOS; the first PAD comes right after.
        assert_eq!(out.input_ids[ones - 1], EOS_TOKEN_ID);
        if ones < MAX_LENGTH {
            assert_eq!(out.input_ids[ones], PAD_TOKEN_ID);
        }
    }

    #[test]
    fn test_truncation_keeps_bos_and_eos() {
        let tmp = tempfile::tempdir().unwrap();
        let tok = ClipTokenizer::load(&write_tiny_tokenizer(tmp.path())).unwrap();
        // 200 known words overflow the 75 content-token positions.
        let long = vec!["ab"; 200].join(" ");
        let out = tok.tokenize(&long);
        assert_eq!(out.input_ids.len(), MAX_LENGTH);
        assert_eq!(out.input_ids[0], BOS_TOKEN_ID);
        assert_eq!(out.input_ids[MAX_LENGTH - 1], EOS_TOKEN_ID);
        assert!(out.attention_mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn test_byte_encoder_covers_all_bytes_distinctly() {
        let table = build_byte_encoder();
        let mut seen = std::collections::HashSet::new();
        for &c in table.iter() {
            assert_ne!(c, '\0');
            assert!(seen.insert(c), "duplicate mapping for {:?}", c);
        }
        // Printable ASCII passes through.
        assert_eq!(table[b'a' as usize], 'a');
        assert_eq!(table[b'!' as usize], '!');
        // Non-printable bytes land in the U+0100…U+0143 block.
        assert_eq!(table[0], '\u{0100}');
        assert!(('\u{0100}'..='\u{0143}').contains(&table[b' ' as usize]));
    }
}
