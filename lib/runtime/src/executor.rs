// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The executor contracts consumed by the runtime.
//!
//! An [`LlmExecutor`] is a stateful, single-threaded compute engine owning
//! the KV cache. Implementations are *not* required to be thread-safe; the
//! [`crate::resource::ResourceManager`] provides external exclusion, and the
//! [`crate::execution::ExecutionManager`] guarantees a single execution
//! thread. The numerical kernels behind prefill/decode are out of scope.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ember_tokens::{ProcessedTokens, TokenId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Static properties an executor advertises at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub backend_name: String,
    /// Number of threads the executor may run work on. The runtime refuses
    /// any value other than 1: prefix matching and copy-on-write read state
    /// out of the executor without further locking.
    pub num_threads: usize,
    /// Maximum number of tokens the KV cache can hold.
    pub max_context_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerKind {
    Greedy,
    TopK,
    TopP,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    pub kind: SamplerKind,
    pub k: u32,
    pub p: f32,
    pub temperature: f32,
    pub seed: u64,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            kind: SamplerKind::Greedy,
            k: 1,
            p: 1.0,
            temperature: 0.0,
            seed: 0,
        }
    }
}

/// Sampler and output-shape configuration resident in the executor while a
/// session is active; swapped with the session's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub sampler: SamplerParams,
    /// Number of output candidates produced per decode step.
    pub output_heads: usize,
    pub tokens_per_decode: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerParams::default(),
            output_heads: 1,
            tokens_per_decode: 1,
        }
    }
}

/// Mutable per-session position state.
///
/// Invariant: `0 <= current_step <= processed token count`. The switch layer
/// clamps (and logs) out-of-range values instead of propagating them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub current_step: usize,
    pub ran_decode: bool,
}

/// Opaque per-layer cache payload. The runtime only moves it around.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheState {
    blob: Vec<u8>,
}

impl CacheState {
    pub fn from_blob(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }
}

/// Tokens already absorbed into the KV cache plus the executor-specific
/// state representing that absorption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedContext {
    pub tokens: ProcessedTokens,
    pub lora_id: Option<u32>,
    pub cache: CacheState,
}

impl ProcessedContext {
    pub fn token_count(&self) -> usize {
        self.tokens.token_count()
    }
}

/// A full drained/restorable executor context.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmContext {
    pub processed: ProcessedContext,
    pub config: RuntimeConfig,
    pub state: RuntimeState,
}

/// Embeddings produced by a vision or audio encoder, consumed by prefill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingData {
    pub embeddings: Vec<f32>,
    pub per_layer: Option<Vec<f32>>,
}

/// One prefill/decode input batch. Token batch size is always 1.
#[derive(Debug, Clone, Default)]
pub struct ExecutorInputs {
    pub tokens: Vec<TokenId>,
    pub vision: Option<EmbeddingData>,
    pub audio: Option<EmbeddingData>,
}

impl ExecutorInputs {
    pub fn from_tokens(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.vision.is_none() && self.audio.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrefillParams {
    /// Absolute position to prefill at; `None` means the executor's current
    /// step.
    pub current_step: Option<usize>,
    /// Best-effort cancellation flag checked at executor cancel points.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeParams {
    pub cancel: Option<Arc<AtomicBool>>,
}

/// LoRA adapter weights, either on disk or scoped in memory.
#[derive(Debug, Clone)]
pub enum LoraAssets {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// The contract between the runtime and an LLM executor implementation.
///
/// Stateful: exactly one context is resident at a time. `clone_context`
/// returns a deep copy and leaves the resident state untouched;
/// `restore_context` replaces it wholesale.
pub trait LlmExecutor: Send {
    fn settings(&self) -> ExecutorSettings;

    /// Absorb `inputs` into the KV cache at `params.current_step` (or the
    /// resident step). Does not sample.
    fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()>;

    /// One generation step: consume the current KV state, sample, append.
    /// Returns one token id per output head.
    fn decode(&mut self, params: &DecodeParams) -> Result<Vec<TokenId>>;

    /// Logits for the next position given the resident context; does not
    /// sample or append.
    fn decode_to_logits(&mut self, inputs: &ExecutorInputs) -> Result<Vec<f32>>;

    /// Build a fresh empty context without installing it.
    fn create_new_context(
        &mut self,
        lora_id: Option<u32>,
        config: RuntimeConfig,
    ) -> Result<LlmContext>;

    /// Deep-copy the resident context. The resident state stays in place.
    fn clone_context(&mut self) -> Result<LlmContext>;

    /// Install `context`, replacing whatever was resident.
    fn restore_context(&mut self, context: LlmContext) -> Result<()>;

    fn runtime_config(&self) -> Result<RuntimeConfig>;
    fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()>;

    fn runtime_state(&self) -> Result<RuntimeState>;
    fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()>;

    fn current_step(&self) -> Result<usize>;
    fn set_current_step(&mut self, step: usize) -> Result<()>;

    /// Read-only view of the resident processed tokens.
    fn processed_tokens(&self) -> Result<&ProcessedTokens>;

    fn load_lora(&mut self, lora_id: u32, assets: &LoraAssets) -> Result<()>;
    fn unload_lora(&mut self, lora_id: u32) -> Result<()>;

    /// Best-effort cancellation of an in-flight operation; no-op otherwise.
    fn cancel(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn vocab_size(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioExecutorProperties {
    pub is_streaming_model: bool,
}

/// Streaming state of the audio encoder for one session.
///
/// Cloning may be unsupported by a backend; callers must degrade with a
/// warning rather than fail the surrounding clone (see §error taxonomy).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioContext {
    blob: Vec<u8>,
    cloneable: bool,
}

impl AudioContext {
    pub fn new(blob: Vec<u8>) -> Self {
        Self {
            blob,
            cloneable: true,
        }
    }

    pub fn uncloneable(blob: Vec<u8>) -> Self {
        Self {
            blob,
            cloneable: false,
        }
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn try_clone(&self) -> Result<AudioContext> {
        if !self.cloneable {
            return Err(crate::error::Error::unimplemented(
                "audio context cloning is not supported by this backend",
            ));
        }
        Ok(self.clone())
    }
}

pub trait AudioExecutor: Send {
    fn encode(&mut self, spectrogram: &[f32]) -> Result<EmbeddingData>;
    fn properties(&self) -> Result<AudioExecutorProperties>;
    fn create_new_context(&mut self) -> Result<AudioContext>;
    fn clone_context(&mut self) -> Result<AudioContext>;
    fn restore_context(&mut self, context: AudioContext) -> Result<()>;
    fn reset(&mut self) -> Result<()>;
}

pub trait VisionExecutor: Send {
    fn encode(&mut self, image: &crate::io::ImageData) -> Result<EmbeddingData>;
    fn expected_input_dimensions(&self) -> Result<Vec<usize>>;
}
