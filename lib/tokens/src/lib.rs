// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Token primitives for the ember runtime.
//!
//! This crate is the narrow waist between the execution core and anything
//! that produces or consumes tokens:
//! - [`TokenId`] and [`ProcessedTokens`], the read-only view of tokens
//!   already absorbed into an executor's KV cache
//! - prefix matching used by the context-switch fast path
//! - the [`Tokenizer`] contract and [`DecodeStream`], a streaming-safe
//!   detokenizer that buffers incomplete UTF-8 across byte-piece tokens

mod sequence;
mod tokenizer;

pub use sequence::{longest_common_prefix, ProcessedTokens};
pub use tokenizer::{DecodeStream, Tokenizer, TokenizerError};

/// Token id type. Logically non-negative; dense within a vocabulary.
pub type TokenId = u32;
