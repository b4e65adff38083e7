// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Processed-token views and prefix matching.

use serde::{Deserialize, Serialize};

use crate::TokenId;

/// The token sequence an executor has already absorbed into its KV cache.
///
/// The runtime never mutates this view directly; executors append to it
/// during prefill/decode and the context-switch layer reads it to compute
/// prefix overlap and clamp step positions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedTokens {
    tokens: Vec<TokenId>,
}

impl ProcessedTokens {
    pub fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    pub fn from_tokens(tokens: Vec<TokenId>) -> Self {
        Self { tokens }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Append freshly absorbed tokens. Executor-side only.
    pub fn extend(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// Drop every token at or beyond `len`. Executor-side only; used when a
    /// restored context is shorter than the resident one.
    pub fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
    }

    /// Length of the overlap between `input` and the processed tokens
    /// starting at `step`.
    ///
    /// This is the quantity the prefill fast path removes from its input:
    /// `input[..k]` is already absorbed at positions `step..step + k`.
    pub fn matching_prefix_len(&self, step: usize, input: &[TokenId]) -> usize {
        if step >= self.tokens.len() {
            return 0;
        }
        longest_common_prefix(&self.tokens[step..], input)
    }
}

/// Longest `k` such that `a[..k] == b[..k]`.
pub fn longest_common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_of_identical_slices_is_full_length() {
        assert_eq!(longest_common_prefix(&[1, 2, 3], &[1, 2, 3]), 3);
    }

    #[test]
    fn prefix_stops_at_first_mismatch() {
        assert_eq!(longest_common_prefix(&[1, 2, 3], &[1, 9, 3]), 1);
        assert_eq!(longest_common_prefix(&[5], &[1]), 0);
    }

    #[test]
    fn prefix_bounded_by_shorter_slice() {
        assert_eq!(longest_common_prefix(&[1, 2], &[1, 2, 3, 4]), 2);
        assert_eq!(longest_common_prefix(&[], &[1]), 0);
    }

    #[test]
    fn matching_prefix_respects_step_offset() {
        let processed = ProcessedTokens::from_tokens(vec![10, 20, 30, 40]);
        // Resident [30, 40] at step 2 vs input [30, 99]: one token matches.
        assert_eq!(processed.matching_prefix_len(2, &[30, 99]), 1);
        // Step beyond the resident sequence matches nothing.
        assert_eq!(processed.matching_prefix_len(7, &[10]), 0);
    }

    #[test]
    fn truncate_shrinks_view() {
        let mut processed = ProcessedTokens::from_tokens(vec![1, 2, 3]);
        processed.truncate(1);
        assert_eq!(processed.tokens(), &[1]);
        processed.truncate(5);
        assert_eq!(processed.token_count(), 1);
    }
}
