//! Byte-level BPE tokenizer compatible with the Qwen2 vocabulary.
//!
//! Follows the GPT-2 scheme: input bytes are remapped to printable unicode
//! codepoints, the remapped text is pre-split with the Qwen2 regex, and each
//! pre-token is reduced by repeatedly applying the lowest-ranked merge from
//! the model's merge list. Decoding inverts the byte remap.

use crate::gguf::GgufFile;
use anyhow::{Context, Result};
use fancy_regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// The tokenizer family this engine understands, as declared in metadata.
const TOKENIZER_MODEL: &str = "gpt2";

/// The first special token; everything at or after its index is special.
const END_OF_TEXT: &str = "<|endoftext|>";

/// Pre-tokenization split pattern: contractions, letter runs with an
/// optional leading symbol, single digits, punctuation runs, and several
/// whitespace shapes. The `\s+(?!\S)` branch needs lookahead support.
const PRETOKENIZE_PATTERN: &str = r"(?:'[sS]|'[tT]|'[rR][eE]|'[vV][eE]|'[mM]|'[lL][lL]|'[dD])|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

static BYTE_ENCODER: LazyLock<[char; 256]> = LazyLock::new(build_byte_encoder);

static BYTE_DECODER: LazyLock<HashMap<char, u8>> = LazyLock::new(|| {
    BYTE_ENCODER
        .iter()
        .enumerate()
        .map(|(byte, &cp)| (cp, byte as u8))
        .collect()
});

/// GPT-2 byte-to-unicode table. Printable ASCII and two Latin-1 ranges map
/// to themselves; the remaining 68 bytes take the codepoints from U+0100 up,
/// in byte order, so every byte gets a visible, merge-safe codepoint.
fn build_byte_encoder() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut next = 256u32;
    for byte in 0..=255u8 {
        let identity = (b'!'..=b'~').contains(&byte)
            || (0xA1..=0xAC).contains(&byte)
            || (0xAE..=0xFF).contains(&byte);
        table[byte as usize] = if identity {
            byte as char
        } else {
            let cp = char::from_u32(next).unwrap();
            next += 1;
            cp
        };
    }
    table
}

/// Remapped codepoint for one input byte.
pub fn byte_to_unicode(byte: u8) -> char {
    BYTE_ENCODER[byte as usize]
}

/// Token strings with an index for reverse lookup.
#[derive(Debug)]
pub struct Vocabulary {
    tokens: Vec<String>,
    scores: Option<Vec<f32>>,
    token_to_index: HashMap<String, usize>,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>, scores: Option<Vec<f32>>) -> Self {
        let token_to_index = tokens
            .iter()
            .enumerate()
            .map(|(index, token)| (token.clone(), index))
            .collect();
        Self { tokens, scores, token_to_index }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.token_to_index.get(token).copied()
    }

    pub fn score(&self, index: usize) -> Option<f32> {
        self.scores.as_ref().and_then(|scores| scores.get(index).copied())
    }
}

#[derive(Debug, Clone, Copy)]
struct MergeRule {
    rank: usize,
    merged: usize,
}

pub struct Tokenizer {
    vocab: Vocabulary,
    merges: HashMap<(usize, usize), MergeRule>,
    pattern: Regex,
    special_tokens: HashMap<String, usize>,
    first_special: usize,
    token_types: Vec<i32>,
}

impl Tokenizer {
    /// Builds the tokenizer from GGUF metadata: token strings, merge lines
    /// (`"<a> <b>"`), and per-token type codes.
    pub fn from_gguf(gguf: &GgufFile) -> Result<Self> {
        let model = gguf.require_str("tokenizer.ggml.model")?;
        if model != TOKENIZER_MODEL {
            anyhow::bail!("Expected tokenizer model '{TOKENIZER_MODEL}' but found '{model}'");
        }

        let tokens = gguf.require_str_array("tokenizer.ggml.tokens")?.to_vec();
        let scores = gguf
            .get("tokenizer.ggml.scores")
            .map(|_| gguf.require_f32_array("tokenizer.ggml.scores").map(<[f32]>::to_vec))
            .transpose()?;
        let merge_lines = gguf.require_str_array("tokenizer.ggml.merges")?;
        let token_types = gguf.require_i32_array("tokenizer.ggml.token_type")?.to_vec();

        Self::from_parts(tokens, scores, merge_lines, token_types)
    }

    pub fn from_parts(
        tokens: Vec<String>,
        scores: Option<Vec<f32>>,
        merge_lines: &[String],
        token_types: Vec<i32>,
    ) -> Result<Self> {
        let vocab = Vocabulary::new(tokens, scores);

        let mut merges = HashMap::with_capacity(merge_lines.len());
        for (rank, line) in merge_lines.iter().enumerate() {
            let (first, second) = line
                .split_once(' ')
                .with_context(|| format!("Malformed merge line '{line}'"))?;
            let first_id = vocab
                .index_of(first)
                .with_context(|| format!("Merge operand '{first}' is not in the vocabulary"))?;
            let second_id = vocab
                .index_of(second)
                .with_context(|| format!("Merge operand '{second}' is not in the vocabulary"))?;
            let merged = vocab
                .index_of(&format!("{first}{second}"))
                .with_context(|| format!("Merge result of '{line}' is not in the vocabulary"))?;
            merges.insert((first_id, second_id), MergeRule { rank, merged });
        }

        // Special tokens are the tail of the vocabulary.
        let first_special = vocab
            .index_of(END_OF_TEXT)
            .with_context(|| format!("Vocabulary has no '{END_OF_TEXT}' token"))?;
        let special_tokens = (first_special..vocab.size())
            .map(|index| (vocab.tokens[index].clone(), index))
            .collect();

        let pattern = Regex::new(PRETOKENIZE_PATTERN)
            .context("Failed to compile the pre-tokenization pattern")?;

        Ok(Self { vocab, merges, pattern, special_tokens, first_special, token_types })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn is_special(&self, token: usize) -> bool {
        token >= self.first_special && token < self.vocab.size()
    }

    pub fn special_id(&self, token: &str) -> Option<usize> {
        self.special_tokens.get(token).copied()
    }

    /// GGUF token type code (1 = normal, 6 = byte, others control/special).
    pub fn token_type(&self, token: usize) -> i32 {
        self.token_types.get(token).copied().unwrap_or(0)
    }

    /// Encodes text in which special-token literals are honored: each
    /// occurrence maps straight to its id, and the text between occurrences
    /// is encoded ordinarily.
    pub fn encode_with_specials(&self, text: &str) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let earliest = self
                .special_tokens
                .iter()
                .filter_map(|(token, &id)| rest.find(token.as_str()).map(|at| (at, token.len(), id)))
                .min_by_key(|&(at, len, _)| (at, std::cmp::Reverse(len)));
            match earliest {
                Some((at, len, id)) => {
                    ids.extend(self.encode_ordinary(&rest[..at]));
                    ids.push(id);
                    rest = &rest[at + len..];
                }
                None => {
                    ids.extend(self.encode_ordinary(rest));
                    break;
                }
            }
        }
        ids
    }

    /// Encodes text with no special-token handling.
    pub fn encode_ordinary(&self, text: &str) -> Vec<usize> {
        let remapped: String = text.bytes().map(byte_to_unicode).collect();
        let mut ids = Vec::new();
        for chunk in self.pattern.find_iter(&remapped).flatten() {
            self.encode_chunk(chunk.as_str(), &mut ids);
        }
        ids
    }

    fn encode_chunk(&self, chunk: &str, ids: &mut Vec<usize>) {
        let mut chunk_ids: Vec<usize> = chunk
            .chars()
            .filter_map(|cp| {
                let id = self.vocab.index_of(cp.encode_utf8(&mut [0u8; 4]));
                if id.is_none() {
                    log::warn!("Codepoint {cp:?} has no vocabulary entry, skipping");
                }
                id
            })
            .collect();

        // Apply the lowest-ranked merge until none is left. A single pass
        // rewrites every occurrence of the chosen pair, leftmost first.
        while chunk_ids.len() >= 2 {
            let best = chunk_ids
                .windows(2)
                .filter_map(|pair| {
                    self.merges
                        .get(&(pair[0], pair[1]))
                        .map(|rule| (rule.rank, (pair[0], pair[1]), rule.merged))
                })
                .min_by_key(|&(rank, _, _)| rank);
            let Some((_, pair, merged)) = best else { break };
            chunk_ids = merge_pass(&chunk_ids, pair, merged);
        }

        ids.extend(chunk_ids);
    }

    /// Concatenates the token strings and inverts the byte remap. Codepoints
    /// outside the byte table are dropped; partially decoded UTF-8 sequences
    /// come out as replacement characters.
    pub fn decode(&self, tokens: &[usize]) -> String {
        let joined: String = tokens
            .iter()
            .filter_map(|&token| self.vocab.token(token))
            .collect();
        let bytes: Vec<u8> = joined
            .chars()
            .filter_map(|cp| BYTE_DECODER.get(&cp).copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.size())
            .field("merges", &self.merges.len())
            .field("special_tokens", &self.special_tokens.len())
            .field("first_special", &self.first_special)
            .finish_non_exhaustive()
    }
}

/// Rewrites `ids` with every adjacent occurrence of `pair` replaced by
/// `merged`, scanning left to right.
fn merge_pass(ids: &[usize], pair: (usize, usize), merged: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(ids.len());
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && ids[i] == pair.0 && ids[i + 1] == pair.1 {
            out.push(merged);
            i += 2;
        } else {
            out.push(ids[i]);
            i += 1;
        }
    }
    out
}

/// Escapes control codepoints other than newline as `\uXXXX` so echoed
/// tokens cannot garble the terminal.
pub fn replace_control_characters(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for cp in text.chars() {
        if cp.is_control() && cp != '\n' {
            out.push_str(&format!("\\u{:04x}", cp as u32));
        } else {
            out.push(cp);
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn byte_level_tokenizer() -> Tokenizer {
    // All 256 byte codepoints, then the ChatML specials.
    let mut tokens: Vec<String> = (0..=255u8).map(|b| byte_to_unicode(b).to_string()).collect();
    tokens.push("<|endoftext|>".to_string());
    tokens.push("<|im_start|>".to_string());
    tokens.push("<|im_end|>".to_string());
    let mut token_types = vec![1; 256];
    token_types.extend([3, 3, 3]);
    Tokenizer::from_parts(tokens, None, &[], token_types).unwrap()
}
