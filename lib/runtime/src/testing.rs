// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic mock executors and a numeric tokenizer for tests.
//!
//! [`MockExecutor`] models an autoregressive executor whose next token is
//! always `previous + 1` (greedy), with real context clone/restore and
//! step/truncation semantics, plus shared call counters so tests can assert
//! how many times the context-switch layer actually touched the executor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_tokens::{ProcessedTokens, TokenId, Tokenizer, TokenizerError};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::executor::{
    AudioContext, AudioExecutor, AudioExecutorProperties, DecodeParams, EmbeddingData,
    ExecutorInputs, ExecutorSettings, LlmContext, LlmExecutor, LoraAssets, PrefillParams,
    ProcessedContext, RuntimeConfig, RuntimeState,
};
use crate::io::ImageData;

/// Shared executor call counters.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub prefill_calls: AtomicUsize,
    pub decode_calls: AtomicUsize,
    pub clone_context_calls: AtomicUsize,
    pub restore_context_calls: AtomicUsize,
    pub create_context_calls: AtomicUsize,
    /// Token list of the most recent prefill call that reached the executor.
    pub last_prefill_tokens: Mutex<Vec<TokenId>>,
    /// `current_step` the most recent prefill ran at.
    pub last_prefill_step: AtomicUsize,
}

impl MockCounters {
    pub fn prefill_calls(&self) -> usize {
        self.prefill_calls.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn clone_context_calls(&self) -> usize {
        self.clone_context_calls.load(Ordering::SeqCst)
    }

    pub fn restore_context_calls(&self) -> usize {
        self.restore_context_calls.load(Ordering::SeqCst)
    }

    pub fn create_context_calls(&self) -> usize {
        self.create_context_calls.load(Ordering::SeqCst)
    }
}

/// Deterministic mock LLM executor: next token = previous + 1.
pub struct MockExecutor {
    settings: ExecutorSettings,
    context: LlmContext,
    vocab_size: usize,
    loaded_loras: HashSet<u32>,
    counters: Arc<MockCounters>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_settings(ExecutorSettings {
            backend_name: "mock".to_string(),
            num_threads: 1,
            max_context_tokens: 4096,
        })
    }

    pub fn with_settings(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            context: LlmContext {
                processed: ProcessedContext::default(),
                config: RuntimeConfig::default(),
                state: RuntimeState::default(),
            },
            vocab_size: 1024,
            loaded_loras: HashSet::new(),
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn with_num_threads(num_threads: usize) -> Self {
        Self::with_settings(ExecutorSettings {
            backend_name: "mock".to_string(),
            num_threads,
            max_context_tokens: 4096,
        })
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.counters.clone()
    }

    fn next_token(&self) -> TokenId {
        let step = self.context.state.current_step;
        if step == 0 {
            return 1;
        }
        self.context
            .processed
            .tokens
            .tokens()
            .get(step - 1)
            .map_or(1, |&previous| previous + 1)
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmExecutor for MockExecutor {
    fn settings(&self) -> ExecutorSettings {
        self.settings.clone()
    }

    fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()> {
        self.counters.prefill_calls.fetch_add(1, Ordering::SeqCst);
        let step = params.current_step.unwrap_or(self.context.state.current_step);
        self.counters
            .last_prefill_step
            .store(step, Ordering::SeqCst);
        *self.counters.last_prefill_tokens.lock() = inputs.tokens.clone();

        if step > self.context.processed.token_count() {
            return Err(Error::invalid_argument(format!(
                "prefill step {step} beyond processed token count {}",
                self.context.processed.token_count()
            )));
        }
        // Absorbing at a position inside the processed region replaces the
        // tail from that position on.
        self.context.processed.tokens.truncate(step);
        self.context.processed.tokens.extend(&inputs.tokens);
        self.context.state.current_step = step + inputs.tokens.len();
        Ok(())
    }

    fn decode(&mut self, _params: &DecodeParams) -> Result<Vec<TokenId>> {
        self.counters.decode_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.context.state.current_step;
        if step > self.context.processed.token_count() {
            return Err(Error::invalid_argument(format!(
                "decode step {step} beyond processed token count {}",
                self.context.processed.token_count()
            )));
        }
        self.context.processed.tokens.truncate(step);
        let token = self.next_token();
        self.context.processed.tokens.extend(&[token]);
        self.context.state.current_step = step + 1;
        self.context.state.ran_decode = true;
        Ok(vec![token; self.context.config.output_heads])
    }

    fn decode_to_logits(&mut self, _inputs: &ExecutorInputs) -> Result<Vec<f32>> {
        let mut logits = vec![0.0f32; self.vocab_size];
        let preferred = self.next_token() as usize;
        if preferred < logits.len() {
            logits[preferred] = 5.0;
        }
        Ok(logits)
    }

    fn create_new_context(
        &mut self,
        lora_id: Option<u32>,
        config: RuntimeConfig,
    ) -> Result<LlmContext> {
        self.counters
            .create_context_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(LlmContext {
            processed: ProcessedContext {
                tokens: ProcessedTokens::new(),
                lora_id,
                cache: Default::default(),
            },
            config,
            state: RuntimeState::default(),
        })
    }

    fn clone_context(&mut self) -> Result<LlmContext> {
        self.counters
            .clone_context_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.context.clone())
    }

    fn restore_context(&mut self, context: LlmContext) -> Result<()> {
        self.counters
            .restore_context_calls
            .fetch_add(1, Ordering::SeqCst);
        self.context = context;
        Ok(())
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(self.context.config.clone())
    }

    fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()> {
        self.context.config = config.clone();
        Ok(())
    }

    fn runtime_state(&self) -> Result<RuntimeState> {
        Ok(self.context.state)
    }

    fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()> {
        if state.current_step > self.context.processed.token_count() {
            return Err(Error::invalid_argument(
                "current_step beyond processed token count",
            ));
        }
        self.context.state = *state;
        Ok(())
    }

    fn current_step(&self) -> Result<usize> {
        Ok(self.context.state.current_step)
    }

    fn set_current_step(&mut self, step: usize) -> Result<()> {
        if step > self.context.processed.token_count() {
            return Err(Error::invalid_argument(
                "current_step beyond processed token count",
            ));
        }
        self.context.state.current_step = step;
        Ok(())
    }

    fn processed_tokens(&self) -> Result<&ProcessedTokens> {
        Ok(&self.context.processed.tokens)
    }

    fn load_lora(&mut self, lora_id: u32, _assets: &LoraAssets) -> Result<()> {
        if !self.loaded_loras.insert(lora_id) {
            return Err(Error::already_exists(format!(
                "lora {lora_id} already loaded"
            )));
        }
        Ok(())
    }

    fn unload_lora(&mut self, lora_id: u32) -> Result<()> {
        if !self.loaded_loras.remove(&lora_id) {
            return Err(Error::not_found(format!("lora {lora_id} is not loaded")));
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.context.processed = ProcessedContext::default();
        self.context.state = RuntimeState::default();
        Ok(())
    }

    fn vocab_size(&self) -> Result<usize> {
        Ok(self.vocab_size)
    }
}

/// One-shot gate for making scheduling races deterministic in tests: gated
/// executor calls block until [`Gate::open`].
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, parking_lot::Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock() = true;
        condvar.notify_all();
    }

    fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut open = lock.lock();
        while !*open {
            condvar.wait(&mut open);
        }
    }
}

/// [`MockExecutor`] wrapper that parks prefill and/or decode calls on a
/// [`Gate`], so tests can hold the execution worker at a known point.
pub struct GatedExecutor {
    inner: MockExecutor,
    prefill_gate: Option<Gate>,
    decode_gate: Option<Gate>,
}

impl GatedExecutor {
    pub fn new(inner: MockExecutor) -> Self {
        Self {
            inner,
            prefill_gate: None,
            decode_gate: None,
        }
    }

    pub fn gate_prefill(mut self, gate: Gate) -> Self {
        self.prefill_gate = Some(gate);
        self
    }

    pub fn gate_decode(mut self, gate: Gate) -> Self {
        self.decode_gate = Some(gate);
        self
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.inner.counters()
    }
}

impl LlmExecutor for GatedExecutor {
    fn settings(&self) -> ExecutorSettings {
        self.inner.settings()
    }

    fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()> {
        if let Some(gate) = &self.prefill_gate {
            gate.wait();
        }
        self.inner.prefill(inputs, params)
    }

    fn decode(&mut self, params: &DecodeParams) -> Result<Vec<TokenId>> {
        if let Some(gate) = &self.decode_gate {
            gate.wait();
        }
        self.inner.decode(params)
    }

    fn decode_to_logits(&mut self, inputs: &ExecutorInputs) -> Result<Vec<f32>> {
        self.inner.decode_to_logits(inputs)
    }

    fn create_new_context(
        &mut self,
        lora_id: Option<u32>,
        config: RuntimeConfig,
    ) -> Result<LlmContext> {
        self.inner.create_new_context(lora_id, config)
    }

    fn clone_context(&mut self) -> Result<LlmContext> {
        self.inner.clone_context()
    }

    fn restore_context(&mut self, context: LlmContext) -> Result<()> {
        self.inner.restore_context(context)
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        self.inner.runtime_config()
    }

    fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()> {
        self.inner.update_runtime_config(config)
    }

    fn runtime_state(&self) -> Result<RuntimeState> {
        self.inner.runtime_state()
    }

    fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()> {
        self.inner.update_runtime_state(state)
    }

    fn current_step(&self) -> Result<usize> {
        self.inner.current_step()
    }

    fn set_current_step(&mut self, step: usize) -> Result<()> {
        self.inner.set_current_step(step)
    }

    fn processed_tokens(&self) -> Result<&ProcessedTokens> {
        self.inner.processed_tokens()
    }

    fn load_lora(&mut self, lora_id: u32, assets: &LoraAssets) -> Result<()> {
        self.inner.load_lora(lora_id, assets)
    }

    fn unload_lora(&mut self, lora_id: u32) -> Result<()> {
        self.inner.unload_lora(lora_id)
    }

    fn cancel(&mut self) -> Result<()> {
        self.inner.cancel()
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset()
    }

    fn vocab_size(&self) -> Result<usize> {
        self.inner.vocab_size()
    }
}

/// Tokenizer over decimal token ids: `"1 2 3"` <-> `[1, 2, 3]`. Decoded text
/// carries a leading space per token so streamed chunks concatenate
/// readably.
pub struct NumericTokenizer;

impl Tokenizer for NumericTokenizer {
    fn text_to_ids(&self, text: &str) -> std::result::Result<Vec<TokenId>, TokenizerError> {
        text.split_whitespace()
            .map(|piece| {
                piece
                    .parse::<TokenId>()
                    .map_err(|_| TokenizerError::UnknownToken(piece.to_string()))
            })
            .collect()
    }

    fn ids_to_text(&self, ids: &[TokenId]) -> std::result::Result<String, TokenizerError> {
        Ok(ids.iter().map(|id| format!(" {id}")).collect())
    }

    fn token_to_id(&self, piece: &str) -> Option<TokenId> {
        piece.trim().parse().ok()
    }

    fn all_tokens(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Mock audio executor with trivially cloneable streaming contexts.
#[derive(Default)]
pub struct MockAudioExecutor {
    restored: usize,
}

impl AudioExecutor for MockAudioExecutor {
    fn encode(&mut self, spectrogram: &[f32]) -> Result<EmbeddingData> {
        Ok(EmbeddingData {
            embeddings: spectrogram.to_vec(),
            per_layer: None,
        })
    }

    fn properties(&self) -> Result<AudioExecutorProperties> {
        Ok(AudioExecutorProperties {
            is_streaming_model: true,
        })
    }

    fn create_new_context(&mut self) -> Result<AudioContext> {
        Ok(AudioContext::new(Vec::new()))
    }

    fn clone_context(&mut self) -> Result<AudioContext> {
        Ok(AudioContext::new(vec![self.restored as u8]))
    }

    fn restore_context(&mut self, _context: AudioContext) -> Result<()> {
        self.restored += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Mock vision executor: encodes an image into a fixed-size embedding.
#[derive(Default)]
pub struct MockVisionExecutor;

impl crate::executor::VisionExecutor for MockVisionExecutor {
    fn encode(&mut self, image: &ImageData) -> Result<EmbeddingData> {
        Ok(EmbeddingData {
            embeddings: vec![image.pixels.len() as f32],
            per_layer: None,
        })
    }

    fn expected_input_dimensions(&self) -> Result<Vec<usize>> {
        Ok(vec![224, 224, 3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_decode_is_previous_plus_one() {
        let mut executor = MockExecutor::new();
        executor
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        assert_eq!(executor.decode(&DecodeParams::default()).unwrap(), vec![4]);
        assert_eq!(executor.decode(&DecodeParams::default()).unwrap(), vec![5]);
        assert_eq!(
            executor.processed_tokens().unwrap().tokens(),
            &[1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn mock_prefill_inside_processed_region_truncates() {
        let mut executor = MockExecutor::new();
        executor
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3, 4]),
                &PrefillParams::default(),
            )
            .unwrap();
        executor
            .prefill(
                &ExecutorInputs::from_tokens(vec![9]),
                &PrefillParams {
                    current_step: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(executor.processed_tokens().unwrap().tokens(), &[1, 2, 9]);
        assert_eq!(executor.current_step().unwrap(), 3);
    }

    #[test]
    fn numeric_tokenizer_round_trips() {
        let tokenizer = NumericTokenizer;
        let ids = tokenizer.text_to_ids("4 5 6").unwrap();
        assert_eq!(ids, vec![4, 5, 6]);
        assert_eq!(tokenizer.ids_to_text(&ids).unwrap(), " 4 5 6");
    }
}
