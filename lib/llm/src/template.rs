// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turn-structured prompt templates.
//!
//! A conversation turn is wrapped in markers: the first content chunk of a
//! user turn gets the user prefix (plus the BOS marker on the very first
//! turn), middle chunks pass through untouched, and the transition into
//! decoding flushes the user suffix plus the model prefix so the model
//! knows the user turn ended. Rendering engines for richer template formats
//! are out of scope; this covers the turn structure the session layer needs.

use serde::{Deserialize, Serialize};

/// Position of a content chunk within a templated turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Start of a user turn.
    First,
    /// Continuation within the same turn.
    Middle,
    /// End of the user turn, flushed right before decoding starts.
    Last,
    /// Templating disabled; content passes through untouched.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Emitted once, at the very start of the conversation.
    pub bos: String,
    pub user_prefix: String,
    pub user_suffix: String,
    pub model_prefix: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            bos: "<bos>".to_string(),
            user_prefix: "<start_of_turn>user\n".to_string(),
            user_suffix: "<end_of_turn>\n".to_string(),
            model_prefix: "<start_of_turn>model\n".to_string(),
        }
    }
}

impl PromptTemplate {
    /// Marker text inserted before the turn's content.
    pub fn turn_prefix(&self, content_type: ContentType, is_first_turn: bool) -> String {
        match content_type {
            ContentType::First if is_first_turn => format!("{}{}", self.bos, self.user_prefix),
            ContentType::First => self.user_prefix.clone(),
            ContentType::Middle | ContentType::Last | ContentType::Raw => String::new(),
        }
    }

    /// Marker text closing the user turn and opening the model turn.
    pub fn turn_suffix(&self, content_type: ContentType) -> String {
        match content_type {
            ContentType::Last => format!("{}{}", self.user_suffix, self.model_prefix),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_carries_bos() {
        let template = PromptTemplate::default();
        let prefix = template.turn_prefix(ContentType::First, true);
        assert!(prefix.starts_with("<bos>"));
        assert!(prefix.ends_with("user\n"));

        let later = template.turn_prefix(ContentType::First, false);
        assert!(!later.contains("<bos>"));
    }

    #[test]
    fn only_last_chunk_flushes_model_prefix() {
        let template = PromptTemplate::default();
        assert_eq!(template.turn_suffix(ContentType::First), "");
        assert_eq!(template.turn_suffix(ContentType::Middle), "");
        assert_eq!(
            template.turn_suffix(ContentType::Last),
            "<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn raw_content_is_untouched() {
        let template = PromptTemplate::default();
        assert_eq!(template.turn_prefix(ContentType::Raw, true), "");
        assert_eq!(template.turn_suffix(ContentType::Raw), "");
    }
}
