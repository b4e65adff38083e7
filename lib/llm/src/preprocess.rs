// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Input preprocessing: templating, tokenization, benchmark substitution.
//!
//! Runs on the submitting thread so the execution worker only ever sees
//! token payloads (plus raw image/audio data, which the worker encodes with
//! the modality executors it has exclusive access to).

use ember_runtime::{BenchmarkParams, InputData, Result};
use ember_tokens::{TokenId, Tokenizer};

use crate::template::{ContentType, PromptTemplate};

/// Wrap `contents` in the turn markers for `content_type`.
pub(crate) fn apply_prompt_templates(
    contents: Vec<InputData>,
    content_type: ContentType,
    template: &PromptTemplate,
    is_first_turn: bool,
) -> Vec<InputData> {
    if content_type == ContentType::Last {
        let suffix = template.turn_suffix(content_type);
        if suffix.is_empty() {
            return Vec::new();
        }
        return vec![InputData::Text(suffix)];
    }

    let prefix = template.turn_prefix(content_type, is_first_turn);
    if prefix.is_empty() {
        return contents;
    }
    let mut templated = Vec::with_capacity(contents.len() + 1);
    templated.push(InputData::Text(prefix));
    templated.extend(contents);
    templated
}

/// Tokenize text inputs; substitute synthetic tokens when benchmarking with
/// a fixed prefill length.
pub(crate) fn preprocess_contents(
    contents: Vec<InputData>,
    tokenizer: &dyn Tokenizer,
    benchmark: Option<BenchmarkParams>,
) -> Result<Vec<InputData>> {
    if let Some(params) = benchmark {
        if params.num_prefill_tokens > 0 {
            return Ok(vec![InputData::Tokens(synthetic_tokens(
                params.num_prefill_tokens,
            ))]);
        }
    }

    contents
        .into_iter()
        .map(|input| match input {
            InputData::Text(text) => Ok(InputData::Tokens(tokenizer.text_to_ids(&text)?)),
            other => Ok(other),
        })
        .collect()
}

fn synthetic_tokens(count: usize) -> Vec<TokenId> {
    (0..count).map(|i| (i % 97 + 1) as TokenId).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_runtime::testing::NumericTokenizer;

    fn numeric_template() -> PromptTemplate {
        PromptTemplate {
            bos: "100 ".to_string(),
            user_prefix: "101 ".to_string(),
            user_suffix: "102 ".to_string(),
            model_prefix: "103 ".to_string(),
        }
    }

    #[test]
    fn first_turn_prepends_markers_as_text() {
        let templated = apply_prompt_templates(
            vec![InputData::Text("1 2".to_string())],
            ContentType::First,
            &numeric_template(),
            true,
        );
        assert_eq!(templated.len(), 2);
        let InputData::Text(prefix) = &templated[0] else {
            panic!("expected text prefix");
        };
        assert_eq!(prefix, "100 101 ");
    }

    #[test]
    fn last_chunk_is_only_the_flush_markers() {
        let templated = apply_prompt_templates(
            vec![InputData::Text(String::new())],
            ContentType::Last,
            &numeric_template(),
            false,
        );
        assert_eq!(templated.len(), 1);
        let InputData::Text(flush) = &templated[0] else {
            panic!("expected text flush");
        };
        assert_eq!(flush, "102 103 ");
    }

    #[test]
    fn preprocess_tokenizes_text_inputs() {
        let processed = preprocess_contents(
            vec![
                InputData::Text("4 5".to_string()),
                InputData::Tokens(vec![9]),
            ],
            &NumericTokenizer,
            None,
        )
        .unwrap();
        assert!(matches!(&processed[0], InputData::Tokens(t) if t == &vec![4, 5]));
        assert!(matches!(&processed[1], InputData::Tokens(t) if t == &vec![9]));
    }

    #[test]
    fn benchmark_prefill_length_overrides_inputs() {
        let processed = preprocess_contents(
            vec![InputData::Text("1".to_string())],
            &NumericTokenizer,
            Some(BenchmarkParams {
                num_prefill_tokens: 5,
                num_decode_tokens: 0,
            }),
        )
        .unwrap();
        assert!(matches!(&processed[0], InputData::Tokens(t) if t.len() == 5));
    }
}
