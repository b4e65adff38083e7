// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-session context handlers and the shared processed-context cell.
//!
//! A [`ContextHandler`] bundles everything the executor needs to resume a
//! session: the processed context (shared, copy-on-write), the runtime
//! config, the runtime state and an optional audio context. At any instant a
//! handler is either *active* (its state has been moved into the executor;
//! all three parts absent here) or *suspended* (all parts held here). The
//! "moved into executor" condition is represented by emptying the shared
//! cell rather than by a back-pointer into the executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::executor::{AudioContext, LlmContext, ProcessedContext, RuntimeConfig, RuntimeState};
use crate::HandlerId;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(0);

/// Reference-counted cell around an optional [`ProcessedContext`].
///
/// Multiple handlers may alias one cell (a cloned session and its parent
/// until divergence). Only the handler currently loaded into the executor is
/// allowed to observe the cell as empty: emptiness means the content has
/// been moved into the executor.
///
/// The cell also tracks a per-handler step watermark: the last logical step
/// each attached handler was known to be at. The copy-on-write decision asks
/// whether some *sibling* is further along than the step a prefill/decode is
/// about to mutate at.
pub struct SharedProcessedContext {
    inner: Mutex<Option<ProcessedContext>>,
    watermarks: Mutex<HashMap<HandlerId, usize>>,
}

impl SharedProcessedContext {
    /// Cell whose content currently lives in the executor.
    pub fn resident_in_executor() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
            watermarks: Mutex::new(HashMap::new()),
        })
    }

    /// Cell holding a suspended processed context.
    pub fn holding(context: ProcessedContext) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(context)),
            watermarks: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_context(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Move the context out (into the executor). `None` when a cell-sharing
    /// handler is already active.
    pub fn take_context(&self) -> Option<ProcessedContext> {
        self.inner.lock().take()
    }

    /// Store a context back (out of the executor). Refuses to overwrite: an
    /// occupied cell means no handler of this cell was active, so something
    /// upstream violated the ownership discipline.
    pub fn set_context(&self, context: ProcessedContext) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(Error::internal(
                "shared processed context already occupied while saving executor state",
            ));
        }
        *inner = Some(context);
        Ok(())
    }

    pub(crate) fn attach(&self, handler: HandlerId, step: usize) {
        self.watermarks.lock().insert(handler, step);
    }

    pub(crate) fn detach(&self, handler: HandlerId) {
        self.watermarks.lock().remove(&handler);
    }

    pub(crate) fn record_step(&self, handler: HandlerId, step: usize) {
        if let Some(entry) = self.watermarks.lock().get_mut(&handler) {
            *entry = step;
        }
    }

    /// Largest known step among handlers other than `exclude`. `None` when
    /// the handler is the sole owner.
    pub(crate) fn longest_sibling_step(&self, exclude: HandlerId) -> Option<usize> {
        self.watermarks
            .lock()
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(_, step)| *step)
            .max()
    }

    pub fn sharer_count(&self) -> usize {
        self.watermarks.lock().len()
    }
}

impl std::fmt::Debug for SharedProcessedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedProcessedContext")
            .field("has_context", &self.has_context())
            .field("sharers", &self.sharer_count())
            .finish()
    }
}

#[derive(Default)]
struct HandlerRuntime {
    config: Option<RuntimeConfig>,
    state: Option<RuntimeState>,
}

/// Per-session facade over the executor's swapped-out state.
pub struct ContextHandler {
    id: HandlerId,
    shared: Mutex<Arc<SharedProcessedContext>>,
    runtime: Mutex<HandlerRuntime>,
    audio: Mutex<Option<AudioContext>>,
}

impl ContextHandler {
    /// Suspended handler owning a freshly created (or restored) context.
    pub fn suspended(context: LlmContext, audio: Option<AudioContext>) -> Arc<Self> {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        let LlmContext {
            processed,
            config,
            state,
        } = context;
        let shared = SharedProcessedContext::holding(processed);
        shared.attach(id, state.current_step);
        Arc::new(Self {
            id,
            shared: Mutex::new(shared),
            runtime: Mutex::new(HandlerRuntime {
                config: Some(config),
                state: Some(state),
            }),
            audio: Mutex::new(audio),
        })
    }

    /// Suspended handler aliasing an existing cell; used by session cloning.
    /// The processed context is shared, config/state are owned copies.
    pub fn aliasing(
        shared: Arc<SharedProcessedContext>,
        config: RuntimeConfig,
        state: RuntimeState,
        audio: Option<AudioContext>,
    ) -> Arc<Self> {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        shared.attach(id, state.current_step);
        Arc::new(Self {
            id,
            shared: Mutex::new(shared),
            runtime: Mutex::new(HandlerRuntime {
                config: Some(config),
                state: Some(state),
            }),
            audio: Mutex::new(audio),
        })
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn shared_context(&self) -> Arc<SharedProcessedContext> {
        self.shared.lock().clone()
    }

    pub fn shares_context_with(&self, other: &ContextHandler) -> bool {
        Arc::ptr_eq(&self.shared_context(), &other.shared_context())
    }

    pub fn has_runtime_config(&self) -> bool {
        self.runtime.lock().config.is_some()
    }

    pub fn has_runtime_state(&self) -> bool {
        self.runtime.lock().state.is_some()
    }

    /// Owned copies of the suspended config/state, without taking them.
    pub fn peek_runtime(&self) -> Option<(RuntimeConfig, RuntimeState)> {
        let runtime = self.runtime.lock();
        match (&runtime.config, &runtime.state) {
            (Some(config), Some(state)) => Some((config.clone(), *state)),
            _ => None,
        }
    }

    /// Move config and state out for activation. Fails if the handler does
    /// not hold them (it was already active).
    pub fn take_runtime(&self) -> Result<(RuntimeConfig, RuntimeState)> {
        let mut runtime = self.runtime.lock();
        match (runtime.config.take(), runtime.state.take()) {
            (Some(config), Some(state)) => Ok((config, state)),
            (config, state) => {
                // Restore whatever half was present before failing.
                runtime.config = config;
                runtime.state = state;
                Err(Error::internal(
                    "context handler has no runtime config/state while being activated",
                ))
            }
        }
    }

    /// Store config and state back on suspension, recording the step
    /// watermark for copy-on-write decisions. Fails if the handler already
    /// holds them.
    pub fn store_runtime(&self, config: RuntimeConfig, state: RuntimeState) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.config.is_some() || runtime.state.is_some() {
            return Err(Error::internal(
                "context handler already owns runtime config/state while being suspended",
            ));
        }
        self.shared.lock().record_step(self.id, state.current_step);
        runtime.config = Some(config);
        runtime.state = Some(state);
        Ok(())
    }

    pub fn has_audio_context(&self) -> bool {
        self.audio.lock().is_some()
    }

    pub fn set_audio_context(&self, context: AudioContext) {
        *self.audio.lock() = Some(context);
    }

    /// Deep-clone the held audio context, if any. `Unimplemented` bubbles up
    /// for the caller to degrade on.
    pub fn clone_audio_context(&self) -> Result<Option<AudioContext>> {
        match self.audio.lock().as_ref() {
            Some(context) => Ok(Some(context.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Verify the *active* half of the ownership invariant: an activated
    /// handler must not own any context artifact.
    pub fn ensure_fully_active(&self) -> Result<()> {
        let has_config = self.has_runtime_config();
        let has_state = self.has_runtime_state();
        let has_context = self.shared_context().has_context();
        if has_config || has_state || has_context {
            tracing::error!(
                handler_id = self.id,
                has_config,
                has_state,
                has_context,
                "context handler owns context artifacts while active; refusing unsafe divergence"
            );
            return Err(Error::internal(
                "active context handler unexpectedly owns runtime state or processed context",
            ));
        }
        Ok(())
    }

    /// Copy-on-write divergence: store `snapshot` into the current cell for
    /// the siblings, then detach onto a fresh cell representing exclusive
    /// ownership of the executor-resident context.
    ///
    /// Caller must hold the executor lock and have verified this handler is
    /// the active one.
    pub(crate) fn diverge_with_snapshot(&self, snapshot: ProcessedContext, step: usize) -> Result<()> {
        self.ensure_fully_active()?;
        let mut shared = self.shared.lock();
        shared.set_context(snapshot)?;
        shared.detach(self.id);
        let fresh = SharedProcessedContext::resident_in_executor();
        fresh.attach(self.id, step);
        *shared = fresh;
        Ok(())
    }

    /// Record this handler's current logical step in its cell.
    pub(crate) fn record_step(&self, step: usize) {
        self.shared.lock().record_step(self.id, step);
    }

    /// Largest known sibling step within the shared cell.
    pub(crate) fn longest_sibling_step(&self) -> Option<usize> {
        self.shared.lock().longest_sibling_step(self.id)
    }
}

impl Drop for ContextHandler {
    fn drop(&mut self) {
        // Suspended handlers may be dropped freely; the processed context is
        // freed with the last Arc. Detach the watermark so former siblings
        // stop seeing this handler in divergence decisions.
        self.shared.lock().detach(self.id);
    }
}

impl std::fmt::Debug for ContextHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandler")
            .field("id", &self.id)
            .field("has_runtime_config", &self.has_runtime_config())
            .field("has_runtime_state", &self.has_runtime_state())
            .field("shared", &*self.shared.lock())
            .finish()
    }
}
