// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Executor ownership, context switching, prefix matching, copy-on-write.
//!
//! The [`ResourceManager`] owns the LLM executor (plus optional audio and
//! vision executors) and is the only way to reach them. Access goes through
//! scoped handles that hold the executor mutex for their whole lifetime:
//!
//! - [`ResourceManager::acquire_executor`]: exclusive, session-less (LoRA
//!   loading and other context-free operations)
//! - [`ResourceManager::acquire_executor_with`]: exclusive, bound to a
//!   [`ContextHandler`]; performs a context switch when the active handler
//!   differs from the requested one
//!
//! The scoped handle's prefill/decode wrap the executor calls with the
//! prefix-match fast path and the copy-on-write divergence check, which is
//! the sole mechanism by which cloned sessions diverge.
//!
//! Lock order: `llm` before `audio`/`vision`. A single mutex protects the
//! executor; holding the guard for the handle's lifetime is sound because
//! the execution manager's single worker is the only hot-path caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ember_tokens::TokenId;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::config::SessionConfig;
use crate::context::ContextHandler;
use crate::error::{Error, Result};
use crate::executor::{
    AudioExecutor, DecodeParams, ExecutorInputs, LlmContext, LlmExecutor, LoraAssets,
    PrefillParams, ProcessedContext, RuntimeConfig, RuntimeState, VisionExecutor,
};

struct ExecutorSlot {
    executor: Box<dyn LlmExecutor>,
    /// The handler whose state is currently resident in the executor.
    active: Option<Arc<ContextHandler>>,
    /// LoRA reference key (path or scoped marker) to assigned id.
    lora_ids: HashMap<String, u32>,
}

/// Owns the executors and mediates all access to them.
pub struct ResourceManager {
    llm: Mutex<ExecutorSlot>,
    audio: Mutex<Option<Box<dyn AudioExecutor>>>,
    vision: Mutex<Option<Box<dyn VisionExecutor>>>,
}

impl ResourceManager {
    pub fn new(
        executor: Box<dyn LlmExecutor>,
        audio_executor: Option<Box<dyn AudioExecutor>>,
        vision_executor: Option<Box<dyn VisionExecutor>>,
    ) -> Self {
        Self {
            llm: Mutex::new(ExecutorSlot {
                executor,
                active: None,
                lora_ids: HashMap::new(),
            }),
            audio: Mutex::new(audio_executor),
            vision: Mutex::new(vision_executor),
        }
    }

    /// Exclusive executor access with no session context. Used for
    /// session-less operations; no prefix matching or copy-on-write applies.
    pub fn acquire_executor(&self) -> ScopedExecutor<'_> {
        ScopedExecutor {
            slot: self.llm.lock(),
            bound: None,
        }
    }

    /// Exclusive executor access bound to `handler`, switching the resident
    /// context if a different handler is active.
    pub fn acquire_executor_with(
        &self,
        handler: &Arc<ContextHandler>,
    ) -> Result<ScopedExecutor<'_>> {
        let mut slot = self.llm.lock();

        let same_handler = slot
            .active
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, handler));
        if !same_handler {
            self.switch_context(&mut slot, handler)?;
        }

        Ok(ScopedExecutor {
            slot,
            bound: Some(handler.clone()),
        })
    }

    fn switch_context(
        &self,
        slot: &mut ExecutorSlot,
        handler: &Arc<ContextHandler>,
    ) -> Result<()> {
        let outgoing = slot.active.clone();
        tracing::debug!(
            has_current_handler = outgoing.is_some(),
            target_handler = handler.id(),
            "context switch begin"
        );

        let same_cell = outgoing
            .as_ref()
            .is_some_and(|cur| cur.shares_context_with(handler));

        if same_cell {
            // Both handlers alias the resident processed context; only the
            // runtime config and state move.
            let cur = outgoing
                .as_ref()
                .ok_or_else(|| Error::internal("same-cell switch without an active handler"))?;
            let config = slot.executor.runtime_config()?;
            let state = slot.executor.runtime_state()?;
            cur.store_runtime(config, state)?;

            let (new_config, mut new_state) = handler.take_runtime()?;
            let token_count = slot.executor.processed_tokens()?.token_count();
            clamp_step(&mut new_state, token_count);
            slot.executor.update_runtime_config(&new_config)?;
            slot.executor.update_runtime_state(&new_state)?;
            tracing::debug!(
                target_handler = handler.id(),
                current_step = new_state.current_step,
                "context switch within shared processed context"
            );
        } else {
            if let Some(cur) = outgoing.as_ref() {
                // Save the full resident context back into the outgoing
                // handler, restoring it to the suspended state.
                let saved = slot.executor.clone_context()?;
                cur.store_runtime(saved.config, saved.state)?;
                cur.shared_context().set_context(saved.processed)?;
            }

            let (new_config, mut new_state) = handler.take_runtime()?;
            let new_processed = handler.shared_context().take_context();
            let token_count = new_processed.as_ref().map_or(0, ProcessedContext::token_count);
            clamp_step(&mut new_state, token_count);

            let fresh = token_count == 0 && new_state.current_step == 0 && !new_state.ran_decode;
            tracing::debug!(
                token_count,
                current_step = new_state.current_step,
                ran_decode = new_state.ran_decode,
                path = if fresh { "create_new_context" } else { "restore_context" },
                "restore context decision"
            );
            if fresh {
                let lora_id = new_processed.as_ref().and_then(|p| p.lora_id);
                let context = slot.executor.create_new_context(lora_id, new_config)?;
                slot.executor.restore_context(context)?;
                slot.executor.update_runtime_state(&new_state)?;
            } else {
                let processed = new_processed.ok_or_else(|| {
                    Error::internal("non-fresh context handler holds no processed context")
                })?;
                slot.executor.restore_context(LlmContext {
                    processed,
                    config: new_config,
                    state: new_state,
                })?;
            }
        }

        // Audio runs in parallel with the LLM swap: snapshot the outgoing
        // side's streaming state, restore the incoming side's.
        if let Some(cur) = outgoing.as_ref() {
            if cur.has_audio_context() {
                let mut audio = self.acquire_audio_executor()?;
                let snapshot = audio.clone_context()?;
                cur.set_audio_context(snapshot);
            }
        }
        if handler.has_audio_context() {
            if let Some(context) = handler.clone_audio_context()? {
                let mut audio = self.acquire_audio_executor()?;
                audio.restore_context(context)?;
            }
        }

        slot.active = Some(handler.clone());
        Ok(())
    }

    /// Build a fresh handler for a new session: assigns (and loads) the
    /// session's LoRA if any, creates an empty context, and sets up the
    /// audio streaming context when the modality is enabled.
    pub fn create_context_handler(&self, config: &SessionConfig) -> Result<Arc<ContextHandler>> {
        let lora_id = self.assign_session_lora(config)?;
        let runtime_config = RuntimeConfig {
            sampler: config.sampler.clone(),
            output_heads: config.num_output_candidates,
            tokens_per_decode: 1,
        };

        let context = {
            let mut slot = self.llm.lock();
            slot.executor.create_new_context(lora_id, runtime_config)?
        };

        let audio_context = if config.audio_enabled {
            let mut audio = self.acquire_audio_executor()?;
            match audio.properties() {
                Ok(props) if props.is_streaming_model => Some(audio.create_new_context()?),
                Ok(_) => None,
                Err(e) if e.is_unimplemented() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(ContextHandler::suspended(context, audio_context))
    }

    /// Clone a handler for session cloning: the processed context is shared
    /// with `source`, config/state are deep copies, the audio context is
    /// deep-cloned (degrading with a warning if the backend cannot clone).
    pub fn clone_context_handler(
        &self,
        source: &Arc<ContextHandler>,
    ) -> Result<Arc<ContextHandler>> {
        let (config, state) = match source.peek_runtime() {
            Some(pair) => pair,
            None => {
                // Source is active; read its config/state out of the
                // executor. Deterministic because the execution manager runs
                // every executor operation on a single worker thread.
                let slot = self.llm.lock();
                let is_active = slot
                    .active
                    .as_ref()
                    .is_some_and(|cur| Arc::ptr_eq(cur, source));
                if !is_active {
                    return Err(Error::internal(
                        "context handler has no runtime config/state and is not the active \
                         handler; refusing to clone executor state",
                    ));
                }
                (
                    slot.executor.runtime_config()?,
                    slot.executor.runtime_state()?,
                )
            }
        };

        let audio = match source.clone_audio_context() {
            Ok(audio) => audio,
            Err(e) if e.is_unimplemented() => {
                tracing::warn!(
                    source_handler = source.id(),
                    error = %e,
                    "audio context cloning unsupported; clone proceeds without streaming audio state"
                );
                None
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            source_handler = source.id(),
            current_step = state.current_step,
            "cloning context handler"
        );
        Ok(ContextHandler::aliasing(
            source.shared_context(),
            config,
            state,
            audio,
        ))
    }

    fn assign_session_lora(&self, config: &SessionConfig) -> Result<Option<u32>> {
        let lora_path = config.lora_path.as_deref().unwrap_or("");
        let has_scoped_file = config.scoped_lora_file.is_some();
        if lora_path.is_empty() && !has_scoped_file {
            return Ok(None);
        }

        let mut slot = self.llm.lock();
        let (lora_id, newly_assigned) = if !lora_path.is_empty() {
            // A path is the reference key; sessions sharing a path share the
            // adapter.
            match slot.lora_ids.get(lora_path) {
                Some(&id) => (id, false),
                None => {
                    let id = slot.lora_ids.len() as u32;
                    slot.lora_ids.insert(lora_path.to_string(), id);
                    (id, true)
                }
            }
        } else {
            // Scoped file without a path is assumed single-use.
            let id = slot.lora_ids.len() as u32;
            slot.lora_ids.insert(format!("scoped_lora:{id}"), id);
            (id, true)
        };

        if newly_assigned {
            let assets = match &config.scoped_lora_file {
                Some(path) => LoraAssets::Path(path.clone()),
                None => LoraAssets::Path(PathBuf::from(lora_path)),
            };
            slot.executor.load_lora(lora_id, &assets)?;
        }
        Ok(Some(lora_id))
    }

    /// Session-less LoRA registration. `key` must be new.
    pub fn load_lora(&self, key: &str, assets: &LoraAssets) -> Result<u32> {
        let mut slot = self.llm.lock();
        if slot.lora_ids.contains_key(key) {
            return Err(Error::already_exists(format!(
                "lora already registered under key {key:?}"
            )));
        }
        let lora_id = slot.lora_ids.len() as u32;
        slot.executor.load_lora(lora_id, assets)?;
        slot.lora_ids.insert(key.to_string(), lora_id);
        Ok(lora_id)
    }

    pub fn unload_lora(&self, lora_id: u32) -> Result<()> {
        let mut slot = self.llm.lock();
        let key = slot
            .lora_ids
            .iter()
            .find(|(_, &id)| id == lora_id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| Error::not_found(format!("lora id {lora_id} is not loaded")))?;
        slot.executor.unload_lora(lora_id)?;
        slot.lora_ids.remove(&key);
        Ok(())
    }

    pub fn acquire_audio_executor(
        &self,
    ) -> Result<MappedMutexGuard<'_, Box<dyn AudioExecutor>>> {
        MutexGuard::try_map(self.audio.lock(), Option::as_mut)
            .map_err(|_| Error::failed_precondition("audio executor is not loaded"))
    }

    pub fn acquire_vision_executor(
        &self,
    ) -> Result<MappedMutexGuard<'_, Box<dyn VisionExecutor>>> {
        MutexGuard::try_map(self.vision.lock(), Option::as_mut)
            .map_err(|_| Error::failed_precondition("vision executor is not loaded"))
    }
}

fn clamp_step(state: &mut RuntimeState, token_count: usize) {
    if state.current_step > token_count {
        tracing::warn!(
            original_current_step = state.current_step,
            token_count,
            "runtime state current_step clamped to processed token count"
        );
        state.current_step = token_count;
    }
}

/// Scoped executor handle. Holds the executor mutex for its lifetime and,
/// when bound to a handler, layers prefix matching and copy-on-write over
/// the raw executor operations.
pub struct ScopedExecutor<'a> {
    slot: MutexGuard<'a, ExecutorSlot>,
    bound: Option<Arc<ContextHandler>>,
}

impl std::fmt::Debug for ScopedExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedExecutor")
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

impl ScopedExecutor<'_> {
    pub fn handler(&self) -> Option<&Arc<ContextHandler>> {
        self.bound.as_ref()
    }

    /// Prefill with the prefix-match fast path.
    ///
    /// Given input tokens `I` and effective step `s` (clamped to the token
    /// count): when `s` lies inside the processed region, the longest
    /// overlap `P[s..s+k] == I[..k]` is skipped; if everything overlaps, the
    /// step is advanced without any executor call. A prefill that still
    /// rewinds into the processed region after matching runs the divergence
    /// check first so sibling sessions keep their snapshot.
    pub fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()> {
        let Some(handler) = self.bound.clone() else {
            return self.slot.executor.prefill(inputs, params);
        };
        if inputs.is_empty() {
            return Ok(());
        }

        let mut step = match params.current_step {
            Some(step) => step,
            None => self.slot.executor.current_step()?,
        };
        let token_count = self.slot.executor.processed_tokens()?.token_count();
        if step > token_count {
            tracing::warn!(
                original_current_step = step,
                token_count,
                "prefill current_step clamped to processed token count"
            );
            step = token_count;
        }

        if step == token_count {
            let mut forwarded = params.clone();
            forwarded.current_step = Some(step);
            return self.slot.executor.prefill(inputs, &forwarded);
        }

        let matched = self
            .slot
            .executor
            .processed_tokens()?
            .matching_prefix_len(step, &inputs.tokens);
        step += matched;

        if matched == inputs.tokens.len() && inputs.vision.is_none() && inputs.audio.is_none() {
            // Everything already absorbed; just reposition.
            self.slot.executor.set_current_step(step)?;
            return Ok(());
        }

        let forwarded_inputs = ExecutorInputs {
            tokens: inputs.tokens[matched..].to_vec(),
            vision: inputs.vision.clone(),
            audio: inputs.audio.clone(),
        };
        let mut forwarded = params.clone();
        forwarded.current_step = Some(step);

        if step == token_count {
            return self.slot.executor.prefill(&forwarded_inputs, &forwarded);
        }

        // Part of the processed region mismatches the input; absorbing the
        // tail will truncate it. Diverge first if a sibling still needs it.
        self.maybe_diverge(&handler, step)?;
        self.slot.executor.set_current_step(step)?;
        self.slot.executor.prefill(&forwarded_inputs, &forwarded)
    }

    /// One decode step. Runs the divergence check first: decoding with the
    /// step inside the processed region truncates it.
    pub fn decode(&mut self, params: &DecodeParams) -> Result<Vec<TokenId>> {
        self.divergence_guard()?;
        self.slot.executor.decode(params)
    }

    /// Logits for the next position, without sampling or appending.
    pub fn decode_to_logits(&mut self, inputs: &ExecutorInputs) -> Result<Vec<f32>> {
        self.divergence_guard()?;
        self.slot.executor.decode_to_logits(inputs)
    }

    fn divergence_guard(&mut self) -> Result<()> {
        let Some(handler) = self.bound.clone() else {
            return Ok(());
        };
        let step = self.slot.executor.current_step()?;
        let token_count = self.slot.executor.processed_tokens()?.token_count();
        if step == token_count {
            return Ok(());
        }
        self.maybe_diverge(&handler, step)?;
        self.slot.executor.set_current_step(step)?;
        Ok(())
    }

    /// Copy-on-write: if some sibling of `handler` within the shared cell is
    /// further along than `step`, snapshot the resident context into the
    /// cell for the siblings and detach `handler` onto its own fresh cell.
    fn maybe_diverge(&mut self, handler: &Arc<ContextHandler>, step: usize) -> Result<()> {
        let sibling_ahead = handler
            .longest_sibling_step()
            .is_some_and(|sibling| sibling > step);
        if !sibling_ahead {
            return Ok(());
        }
        tracing::info!(
            handler_id = handler.id(),
            step,
            "copy-on-write divergence: snapshotting shared context for sibling sessions"
        );
        let snapshot = self.slot.executor.clone_context()?;
        handler.diverge_with_snapshot(snapshot.processed, step)
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        self.slot.executor.runtime_config()
    }

    pub fn runtime_state(&self) -> Result<RuntimeState> {
        self.slot.executor.runtime_state()
    }

    pub fn current_step(&self) -> Result<usize> {
        self.slot.executor.current_step()
    }

    pub fn processed_tokens(&self) -> Result<Vec<TokenId>> {
        Ok(self.slot.executor.processed_tokens()?.tokens().to_vec())
    }

    pub fn vocab_size(&self) -> Result<usize> {
        self.slot.executor.vocab_size()
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.slot.executor.cancel()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.slot.executor.reset()
    }
}
