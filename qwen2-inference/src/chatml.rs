//! ChatML prompt framing.
//!
//! Each conversation turn is delimited with the `<|im_start|>` and
//! `<|im_end|>` special tokens: start token, role name, newline, message
//! content, end token. A header-only encoding primes the assistant turn the
//! model is asked to complete.

use crate::tokenizer::Tokenizer;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

pub struct ChatMlFormat<'a> {
    tokenizer: &'a Tokenizer,
    im_start: usize,
    im_end: usize,
    end_of_text: usize,
}

impl<'a> ChatMlFormat<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Result<Self> {
        let special = |name: &str| {
            tokenizer
                .special_id(name)
                .with_context(|| format!("Vocabulary has no '{name}' special token"))
        };
        Ok(Self {
            tokenizer,
            im_start: special("<|im_start|>")?,
            im_end: special("<|im_end|>")?,
            end_of_text: special("<|endoftext|>")?,
        })
    }

    /// Tokens that terminate an assistant turn.
    pub fn stop_tokens(&self) -> Vec<usize> {
        vec![self.im_end, self.end_of_text]
    }

    /// `<|im_start|>` · role · `\n` with no content and no end token.
    pub fn encode_header(&self, message: &Message) -> Vec<usize> {
        let mut tokens = vec![self.im_start];
        tokens.extend(self.tokenizer.encode_ordinary(message.role.as_str()));
        tokens.extend(self.tokenizer.encode_ordinary("\n"));
        tokens
    }

    /// A complete turn: header, trimmed content, `<|im_end|>`.
    pub fn encode_message(&self, message: &Message) -> Vec<usize> {
        let mut tokens = self.encode_header(message);
        tokens.extend(self.tokenizer.encode_ordinary(message.content.trim()));
        tokens.push(self.im_end);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::byte_level_tokenizer;

    #[test]
    fn message_is_delimited_by_start_and_end_tokens() {
        let tokenizer = byte_level_tokenizer();
        let format = ChatMlFormat::new(&tokenizer).unwrap();
        let tokens = format.encode_message(&Message::new(Role::User, "Hi"));

        assert_eq!(tokens.first(), Some(&format.im_start));
        assert_eq!(tokens.last(), Some(&tokenizer.special_id("<|im_end|>").unwrap()));
        // Between the delimiters: "user", newline, then the content.
        let inner = tokenizer.decode(&tokens[1..tokens.len() - 1]);
        assert_eq!(inner, "user\nHi");
    }

    #[test]
    fn header_primes_a_turn_without_closing_it() {
        let tokenizer = byte_level_tokenizer();
        let format = ChatMlFormat::new(&tokenizer).unwrap();
        let tokens = format.encode_header(&Message::new(Role::Assistant, ""));

        assert_eq!(tokens.first(), Some(&format.im_start));
        assert_eq!(tokenizer.decode(&tokens[1..]), "assistant\n");
        assert!(!tokens.contains(&tokenizer.special_id("<|im_end|>").unwrap()));
    }

    #[test]
    fn content_is_trimmed() {
        let tokenizer = byte_level_tokenizer();
        let format = ChatMlFormat::new(&tokenizer).unwrap();
        let tokens = format.encode_message(&Message::new(Role::User, "  padded  \n"));
        let inner = tokenizer.decode(&tokens[1..tokens.len() - 1]);
        assert_eq!(inner, "user\npadded");
    }

    #[test]
    fn stop_tokens_cover_both_terminators() {
        let tokenizer = byte_level_tokenizer();
        let format = ChatMlFormat::new(&tokenizer).unwrap();
        let stops = format.stop_tokens();
        assert!(stops.contains(&tokenizer.special_id("<|im_end|>").unwrap()));
        assert!(stops.contains(&tokenizer.special_id("<|endoftext|>").unwrap()));
    }
}
