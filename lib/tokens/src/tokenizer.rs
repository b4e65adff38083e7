// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The tokenizer contract and streaming-safe detokenization.

use thiserror::Error;

use crate::TokenId;

/// Errors surfaced by tokenizer implementations.
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("unknown token: {0}")]
    UnknownToken(String),

    #[error("failed to encode text: {0}")]
    Encode(String),

    #[error("failed to decode ids: {0}")]
    Decode(String),
}

/// The contract between the runtime and a tokenizer implementation.
///
/// Construction (model files, vocab formats) is out of scope; the runtime
/// only consumes this surface. Implementations must be shareable across the
/// submission threads and the execution worker.
pub trait Tokenizer: Send + Sync {
    /// Convert text into a sequence of token ids.
    fn text_to_ids(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError>;

    /// Convert token ids back into text.
    ///
    /// Byte-piece vocabularies may produce replacement characters when `ids`
    /// splits a multi-byte code point; use [`DecodeStream`] when decoding
    /// incrementally.
    fn ids_to_text(&self, ids: &[TokenId]) -> Result<String, TokenizerError>;

    /// Look up the id of a single token piece.
    fn token_to_id(&self, piece: &str) -> Option<TokenId>;

    /// The full vocabulary, indexed by token id.
    fn all_tokens(&self) -> Vec<String>;
}

/// Incremental detokenizer that is safe across multi-byte UTF-8 fragments.
///
/// Byte-piece tokens can end mid-code-point; decoding them eagerly yields
/// U+FFFD replacement characters. The stream holds back ids whose decoded
/// text ends in a replacement character until a later token completes the
/// code point, then emits the assembled text in one piece.
#[derive(Debug, Default)]
pub struct DecodeStream {
    ids: Vec<TokenId>,
    /// Number of leading ids already emitted as text.
    emitted: usize,
}

impl DecodeStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token id; returns the newly completed text, if any.
    pub fn step(
        &mut self,
        tokenizer: &dyn Tokenizer,
        id: TokenId,
    ) -> Result<Option<String>, TokenizerError> {
        self.ids.push(id);
        let text = tokenizer.ids_to_text(&self.ids[self.emitted..])?;
        if text.ends_with('\u{FFFD}') {
            // Incomplete code point; wait for the next piece.
            return Ok(None);
        }
        self.emitted = self.ids.len();
        Ok(Some(text))
    }

    /// Emit whatever is buffered, replacement characters included. Call at
    /// end of generation so trailing malformed bytes are not lost silently.
    pub fn flush(&mut self, tokenizer: &dyn Tokenizer) -> Result<Option<String>, TokenizerError> {
        if self.emitted == self.ids.len() {
            return Ok(None);
        }
        let text = tokenizer.ids_to_text(&self.ids[self.emitted..])?;
        self.emitted = self.ids.len();
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-level tokenizer: token id i maps to the single byte i.
    struct ByteTokenizer;

    impl Tokenizer for ByteTokenizer {
        fn text_to_ids(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
            Ok(text.bytes().map(TokenId::from).collect())
        }

        fn ids_to_text(&self, ids: &[TokenId]) -> Result<String, TokenizerError> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn token_to_id(&self, piece: &str) -> Option<TokenId> {
            let mut bytes = piece.bytes();
            match (bytes.next(), bytes.next()) {
                (Some(b), None) => Some(TokenId::from(b)),
                _ => None,
            }
        }

        fn all_tokens(&self) -> Vec<String> {
            (0u8..=255).map(|b| (b as char).to_string()).collect()
        }
    }

    #[test]
    fn ascii_tokens_emit_immediately() {
        let tokenizer = ByteTokenizer;
        let mut stream = DecodeStream::new();
        assert_eq!(
            stream.step(&tokenizer, u32::from(b'h')).unwrap().as_deref(),
            Some("h")
        );
        assert_eq!(
            stream.step(&tokenizer, u32::from(b'i')).unwrap().as_deref(),
            Some("i")
        );
    }

    #[test]
    fn multibyte_code_point_is_buffered_until_complete() {
        let tokenizer = ByteTokenizer;
        let mut stream = DecodeStream::new();
        // U+00E9 is [0xC3, 0xA9] in UTF-8; split across two byte tokens.
        assert_eq!(stream.step(&tokenizer, 0xC3).unwrap(), None);
        assert_eq!(stream.step(&tokenizer, 0xA9).unwrap().as_deref(), Some("é"));
    }

    #[test]
    fn flush_emits_trailing_incomplete_bytes() {
        let tokenizer = ByteTokenizer;
        let mut stream = DecodeStream::new();
        assert_eq!(stream.step(&tokenizer, 0xC3).unwrap(), None);
        let tail = stream.flush(&tokenizer).unwrap().unwrap();
        assert_eq!(tail, "\u{FFFD}");
        assert_eq!(stream.flush(&tokenizer).unwrap(), None);
    }
}
