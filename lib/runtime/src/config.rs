// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session and decode configuration.

use std::path::PathBuf;

use derive_builder::Builder;
use ember_tokens::TokenId;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::SamplerParams;

/// Immutable per-session configuration, fixed at registration.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct SessionConfig {
    /// Upper bound on tokens produced by a single decode task.
    #[builder(default = "256")]
    pub max_output_tokens: usize,

    /// Number of output candidates produced per decode step. Must be >= 1.
    #[builder(default = "1")]
    pub num_output_candidates: usize,

    /// Whether the session applies the prompt template to inputs (and
    /// inserts the tail flush before the first decode of a turn).
    #[builder(default = "false")]
    pub apply_prompt_template: bool,

    /// LoRA adapter referenced by path; sessions with the same path share
    /// the loaded adapter.
    #[builder(default)]
    pub lora_path: Option<String>,

    /// Single-use LoRA adapter provided as a scoped file.
    #[builder(default)]
    pub scoped_lora_file: Option<PathBuf>,

    /// Decode stops when the first output head samples one of these.
    #[builder(default)]
    pub stop_token_ids: Vec<TokenId>,

    #[builder(default)]
    pub sampler: SamplerParams,

    #[builder(default = "false")]
    pub audio_enabled: bool,

    #[builder(default = "false")]
    pub vision_enabled: bool,
}

impl SessionConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(candidates) = self.num_output_candidates {
            if candidates == 0 {
                return Err("num_output_candidates must be at least 1".to_string());
            }
        }
        if let Some(max) = self.max_output_tokens {
            if max == 0 {
                return Err("max_output_tokens must be at least 1".to_string());
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 256,
            num_output_candidates: 1,
            apply_prompt_template: false,
            lora_path: None,
            scoped_lora_file: None,
            stop_token_ids: Vec::new(),
            sampler: SamplerParams::default(),
            audio_enabled: false,
            vision_enabled: false,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Per-decode overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// `None` uses the session's `max_output_tokens`. `Some(0)` is an
    /// invalid argument. Values above the session maximum are clamped (with
    /// a warning).
    pub max_output_tokens: Option<usize>,
}

impl DecodeConfig {
    /// Resolve against the session maximum, applying the documented rule.
    pub fn effective_max_output_tokens(&self, session_max: usize) -> Result<usize> {
        match self.max_output_tokens {
            None => Ok(session_max),
            Some(0) => Err(Error::invalid_argument(
                "decode max_output_tokens must be at least 1 when set",
            )),
            Some(requested) if requested > session_max => {
                tracing::warn!(
                    requested,
                    session_max,
                    "decode max_output_tokens clamped to session maximum"
                );
                Ok(session_max)
            }
            Some(requested) => Ok(requested),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_zero_candidates() {
        let err = SessionConfig::builder()
            .num_output_candidates(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("num_output_candidates"));
    }

    #[test]
    fn decode_config_resolution_rule() {
        let unset = DecodeConfig::default();
        assert_eq!(unset.effective_max_output_tokens(64).unwrap(), 64);

        let zero = DecodeConfig {
            max_output_tokens: Some(0),
        };
        assert_eq!(
            zero.effective_max_output_tokens(64).unwrap_err().kind(),
            "InvalidArgument"
        );

        let oversized = DecodeConfig {
            max_output_tokens: Some(1000),
        };
        assert_eq!(oversized.effective_max_output_tokens(64).unwrap(), 64);

        let in_range = DecodeConfig {
            max_output_tokens: Some(8),
        };
        assert_eq!(in_range.effective_max_output_tokens(64).unwrap(), 8);
    }
}
