// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-session API.
//!
//! A [`Session`] translates prefill/decode/score/clone calls into scheduler
//! submissions and keeps the automatic dependency chain: each submission
//! depends on the session's `last_task_ids`, which is rewritten to the new
//! task id on success and cleared when a task ends in a failed or cancelled
//! state (otherwise every later task would inherit the dead dependency and
//! fail forever).
//!
//! Synchronous operations are the obvious submit-then-wait of their async
//! twins, with [`DEFAULT_TIMEOUT`]. Callbacks run on the manager's callback
//! worker and must be quick; long work should be re-enqueued elsewhere.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ember_runtime::{
    is_task_end_state, BenchmarkInfo, BenchmarkParams, CancelInfo, DecodeConfig, Error,
    ExecutionManager, InputData, Responses, Result, SessionConfig, SessionId, TaskId, TaskState,
};
use ember_tokens::Tokenizer;
use parking_lot::Mutex;

use crate::engine::DEFAULT_TIMEOUT;
use crate::preprocess;
use crate::template::{ContentType, PromptTemplate};

/// Caller-facing task callback. Decode streams deliver it once per decoded
/// step with [`TaskState::Running`], then exactly once with a terminal
/// state.
pub type ResponseCallback = Box<dyn FnMut(Result<Responses>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Prefilled,
    Decoded,
}

struct SessionCore {
    session_id: SessionId,
    manager: Weak<ExecutionManager>,
    tokenizer: Arc<dyn Tokenizer>,
    config: SessionConfig,
    template: PromptTemplate,
    state: Mutex<SessionState>,
}

impl SessionCore {
    fn manager(&self) -> Result<Arc<ExecutionManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::failed_precondition("execution manager is no longer available"))
    }

    fn benchmark_params(&self, manager: &ExecutionManager) -> Option<BenchmarkParams> {
        manager
            .benchmark_info(self.session_id)
            .ok()
            .map(|info| info.params())
    }
}

/// Handle to one submitted task: carries the cancel flag and a wait.
#[derive(Debug)]
pub struct TaskController {
    task_id: TaskId,
    cancel: Arc<AtomicBool>,
    manager: Weak<ExecutionManager>,
}

impl TaskController {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Set the cancel flag; a task that has not started running transitions
    /// immediately.
    pub fn cancel(&self) -> Result<()> {
        self.cancel.store(true, Ordering::SeqCst);
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::failed_precondition("execution manager is no longer available"))?;
        manager.cancel_task(self.task_id)
    }

    /// Block until the task retires. Timing out does NOT cancel the task.
    pub fn wait_until_done(&self, timeout: Duration) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::failed_precondition("execution manager is no longer available"))?;
        manager.wait_until_task_done(self.task_id, timeout)
    }
}

fn structured_cancelled(
    reason_code: &str,
    session_id: SessionId,
    is_prefill: bool,
    is_decode: bool,
) -> Error {
    Error::Cancelled(CancelInfo {
        reason_code: reason_code.to_string(),
        origin: "SCHEDULER".to_string(),
        session_id,
        is_prefill,
        is_decode,
    })
}

fn clear_last_task_ids(manager: &Weak<ExecutionManager>, session_id: SessionId, reason: &str) {
    if let Some(manager) = manager.upgrade() {
        manager.clear_last_task_ids(session_id, reason);
    }
}

/// Wrap a user callback so terminal failed/cancelled states reset the
/// session's dependency chain before the user sees the result.
fn wrap_with_chain_reset(
    core: &Arc<SessionCore>,
    mut user: ResponseCallback,
    op: &'static str,
) -> ResponseCallback {
    let manager = core.manager.clone();
    let session_id = core.session_id;
    Box::new(move |result: Result<Responses>| {
        match &result {
            Err(_) => {
                clear_last_task_ids(&manager, session_id, &format!("{op}_callback_error_status"));
            }
            Ok(responses) => match responses.task_state() {
                TaskState::Cancelled | TaskState::DependentTaskCancelled => {
                    clear_last_task_ids(
                        &manager,
                        session_id,
                        &format!("{op}_callback_cancelled_state"),
                    );
                }
                TaskState::Failed | TaskState::DependentTaskFailed => {
                    clear_last_task_ids(
                        &manager,
                        session_id,
                        &format!("{op}_callback_failed_state"),
                    );
                }
                _ => {}
            },
        }
        user(result);
    })
}

fn prefill_async(
    core: &Arc<SessionCore>,
    contents: Vec<InputData>,
    callback: ResponseCallback,
) -> Result<TaskController> {
    let manager = core.manager()?;
    let cancel = Arc::new(AtomicBool::new(false));

    let preprocessed = {
        let state = *core.state.lock();
        let is_first_turn = state == SessionState::Fresh;
        let content_type = if core.config.apply_prompt_template {
            if is_first_turn || state == SessionState::Decoded {
                ContentType::First
            } else {
                ContentType::Middle
            }
        } else {
            ContentType::Raw
        };
        let templated =
            preprocess::apply_prompt_templates(contents, content_type, &core.template, is_first_turn);
        preprocess::preprocess_contents(
            templated,
            core.tokenizer.as_ref(),
            core.benchmark_params(&manager),
        )?
    };

    let task_id = manager.new_task_id();
    let deps = manager.last_task_ids(core.session_id)?;
    tracing::debug!(
        session_id = core.session_id,
        task_id,
        dep_count = deps.len(),
        "prefill task created"
    );
    manager.add_prefill_task(
        core.session_id,
        task_id,
        preprocessed,
        deps,
        cancel.clone(),
        wrap_with_chain_reset(core, callback, "prefill"),
    )?;
    *core.state.lock() = SessionState::Prefilled;
    manager.set_last_task_ids(core.session_id, HashSet::from([task_id]))?;

    Ok(TaskController {
        task_id,
        cancel,
        manager: core.manager.clone(),
    })
}

fn decode_async(
    core: &Arc<SessionCore>,
    callback: ResponseCallback,
    decode_config: DecodeConfig,
) -> Result<TaskController> {
    if *core.state.lock() != SessionState::Prefilled {
        return Err(Error::failed_precondition(
            "decode requires a prefilled session",
        ));
    }
    let manager = core.manager()?;
    let cancel = Arc::new(AtomicBool::new(false));
    let max_output_tokens =
        decode_config.effective_max_output_tokens(core.config.max_output_tokens)?;

    // Close the user turn before decoding so the prompt is set up for the
    // model turn.
    if core.config.apply_prompt_template {
        let flush = preprocess::apply_prompt_templates(
            vec![InputData::Text(String::new())],
            ContentType::Last,
            &core.template,
            false,
        );
        if !flush.is_empty() {
            let flush = preprocess::preprocess_contents(
                flush,
                core.tokenizer.as_ref(),
                core.benchmark_params(&manager),
            )?;
            let tail_task_id = manager.new_task_id();
            let deps = manager.last_task_ids(core.session_id)?;
            tracing::debug!(
                session_id = core.session_id,
                task_id = tail_task_id,
                dep_count = deps.len(),
                "turn flush prefill task created"
            );
            let noop: ResponseCallback = Box::new(|_| {});
            manager.add_prefill_task(
                core.session_id,
                tail_task_id,
                flush,
                deps,
                cancel.clone(),
                noop,
            )?;
            manager.set_last_task_ids(core.session_id, HashSet::from([tail_task_id]))?;
        }
    }
    *core.state.lock() = SessionState::Decoded;

    let task_id = manager.new_task_id();
    let deps = manager.last_task_ids(core.session_id)?;
    tracing::debug!(
        session_id = core.session_id,
        task_id,
        dep_count = deps.len(),
        max_output_tokens,
        "decode task created"
    );
    manager.add_decode_task(
        core.session_id,
        task_id,
        deps,
        cancel.clone(),
        wrap_with_chain_reset(core, callback, "decode"),
        max_output_tokens,
    )?;
    manager.set_last_task_ids(core.session_id, HashSet::from([task_id]))?;

    Ok(TaskController {
        task_id,
        cancel,
        manager: core.manager.clone(),
    })
}

/// Fold one decode delivery into the accumulated result. Decode tasks carry
/// text only (the executor's decode samples ids without reporting
/// likelihoods; scores come from text scoring), so only texts accumulate.
fn accumulate_decode(
    accumulator: &Arc<Mutex<Result<Responses>>>,
    session_id: SessionId,
    result: Result<Responses>,
) {
    let mut collected_slot = accumulator.lock();

    let responses = match result {
        Err(error) => {
            *collected_slot = Err(error);
            return;
        }
        Ok(responses) => responses,
    };
    let state = responses.task_state();
    if matches!(
        state,
        TaskState::Cancelled | TaskState::DependentTaskCancelled
    ) {
        tracing::warn!(session_id, task_state = ?state, "decode cancelled");
        *collected_slot = Err(structured_cancelled(
            "DECODE_TASK_CANCELLED_STATE",
            session_id,
            false,
            true,
        ));
        return;
    }

    let Ok(collected) = collected_slot.as_mut() else {
        // Keep the first error.
        return;
    };
    collected.set_task_state(state);
    if responses.texts().is_empty() {
        return;
    }
    if collected.texts().len() == responses.texts().len() {
        for (total, text) in collected.texts_mut().iter_mut().zip(responses.texts()) {
            total.push_str(text);
        }
    } else {
        let collected_len = collected.texts().len();
        *collected_slot = Err(Error::internal(format!(
            "decode responses size mismatch: {collected_len} vs {}",
            responses.texts().len()
        )));
    }
}

/// One logical conversation session.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    pub(crate) fn new(
        session_id: SessionId,
        manager: Weak<ExecutionManager>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SessionConfig,
        template: PromptTemplate,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                session_id,
                manager,
                tokenizer,
                config,
                template,
                state: Mutex::new(SessionState::Fresh),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.core.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.core.state.lock()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// Preprocess `contents` (template + tokenize) and enqueue a prefill
    /// task depending on the session's previous tasks.
    pub fn run_prefill_async(
        &self,
        contents: Vec<InputData>,
        callback: ResponseCallback,
    ) -> Result<TaskController> {
        prefill_async(&self.core, contents, callback)
    }

    pub fn run_prefill(&self, contents: Vec<InputData>) -> Result<()> {
        let status: Arc<Mutex<Result<()>>> = Arc::new(Mutex::new(Ok(())));
        let session_id = self.core.session_id;
        let callback: ResponseCallback = {
            let status = status.clone();
            Box::new(move |result| {
                let mut guard = status.lock();
                *guard = match result {
                    Err(error) => Err(error),
                    Ok(responses) => match responses.task_state() {
                        TaskState::Cancelled | TaskState::DependentTaskCancelled => {
                            tracing::warn!(session_id, "prefill cancelled");
                            Err(structured_cancelled(
                                "PREFILL_TASK_CANCELLED_STATE",
                                session_id,
                                true,
                                false,
                            ))
                        }
                        _ => Ok(()),
                    },
                };
            })
        };
        let controller = self.run_prefill_async(contents, callback)?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        let result = std::mem::replace(&mut *status.lock(), Ok(()));
        result
    }

    /// Enqueue a decode task. When templating is on, a final templated
    /// prefill marking the end of the user turn is inserted first.
    pub fn run_decode_async(
        &self,
        callback: ResponseCallback,
        decode_config: DecodeConfig,
    ) -> Result<TaskController> {
        decode_async(&self.core, callback, decode_config)
    }

    pub fn run_decode(&self) -> Result<Responses> {
        self.run_decode_with_config(DecodeConfig::default())
    }

    pub fn run_decode_with_config(&self, decode_config: DecodeConfig) -> Result<Responses> {
        let candidates = self.core.config.num_output_candidates;
        let accumulator: Arc<Mutex<Result<Responses>>> = Arc::new(Mutex::new(Ok(Responses::new(
            TaskState::Created,
            vec![String::new(); candidates],
            Vec::new(),
        ))));
        let session_id = self.core.session_id;
        let callback: ResponseCallback = {
            let accumulator = accumulator.clone();
            Box::new(move |result| accumulate_decode(&accumulator, session_id, result))
        };
        let controller = self.run_decode_async(callback, decode_config)?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        let mut guard = accumulator.lock();
        std::mem::replace(&mut *guard, Ok(Responses::default()))
    }

    /// Score `target_text` under the session's current context. Single
    /// batch only.
    pub fn run_text_scoring_async(
        &self,
        target_text: &[&str],
        callback: ResponseCallback,
        store_token_lengths: bool,
    ) -> Result<TaskController> {
        if target_text.len() != 1 {
            return Err(Error::invalid_argument("target text size should be 1"));
        }
        let manager = self.core.manager()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let task_id = manager.new_task_id();
        let deps = manager.last_task_ids(self.core.session_id)?;
        manager.add_text_scoring_task(
            self.core.session_id,
            task_id,
            deps,
            target_text[0].to_string(),
            store_token_lengths,
            cancel.clone(),
            wrap_with_chain_reset(&self.core, callback, "text_scoring"),
        )?;
        Ok(TaskController {
            task_id,
            cancel,
            manager: self.core.manager.clone(),
        })
    }

    pub fn run_text_scoring(
        &self,
        target_text: &[&str],
        store_token_lengths: bool,
    ) -> Result<Responses> {
        let collected: Arc<Mutex<Option<Result<Responses>>>> = Arc::new(Mutex::new(None));
        let callback: ResponseCallback = {
            let collected = collected.clone();
            Box::new(move |result| {
                *collected.lock() = Some(result);
            })
        };
        let controller = self.run_text_scoring_async(target_text, callback, store_token_lengths)?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        let result = collected
            .lock()
            .take()
            .unwrap_or_else(|| Err(Error::internal("text scoring callback never delivered")));
        result
    }

    pub fn generate_content(&self, contents: Vec<InputData>) -> Result<Responses> {
        self.run_prefill(contents)?;
        self.run_decode()
    }

    /// Prefill, then stream the decode through `callback`. A prefill that
    /// ends in a non-`Done` terminal state surfaces as a structured
    /// cancelled error, never as an empty response.
    pub fn generate_content_stream(
        &self,
        contents: Vec<InputData>,
        callback: ResponseCallback,
        decode_config: DecodeConfig,
    ) -> Result<()> {
        let core = self.core.clone();
        let mut stream_callback = Some(callback);
        let prefill_callback: ResponseCallback = Box::new(move |result| match result {
            Err(error) => {
                clear_last_task_ids(&core.manager, core.session_id, "stream_prefill_error_status");
                if let Some(mut callback) = stream_callback.take() {
                    callback(Err(error));
                }
            }
            Ok(responses) => {
                let state = responses.task_state();
                if state == TaskState::Done {
                    if let Some(callback) = stream_callback.take() {
                        if let Err(error) = decode_async(&core, callback, decode_config.clone()) {
                            tracing::error!(
                                session_id = core.session_id,
                                error = %error,
                                "failed to start decode task"
                            );
                        }
                    }
                } else if is_task_end_state(state) {
                    tracing::warn!(
                        session_id = core.session_id,
                        prefill_state = ?state,
                        "stream prefill ended without completing"
                    );
                    clear_last_task_ids(
                        &core.manager,
                        core.session_id,
                        "stream_prefill_end_non_done",
                    );
                    if let Some(mut callback) = stream_callback.take() {
                        callback(Err(structured_cancelled(
                            "PREFILL_TASK_CANCELLED_STATE",
                            core.session_id,
                            true,
                            false,
                        )));
                    }
                }
            }
        });
        prefill_async(&self.core, contents, prefill_callback)?;
        Ok(())
    }

    /// Register a new session sharing this one's processed context and
    /// submit the clone task. Any operation on the returned session waits
    /// for the clone to complete; until divergence the two sessions share
    /// the same processed context.
    pub fn clone_async(&self, callback: ResponseCallback) -> Result<Session> {
        self.clone_async_impl(callback).map(|(session, _)| session)
    }

    pub fn try_clone(&self) -> Result<Session> {
        let status: Arc<Mutex<Result<()>>> = Arc::new(Mutex::new(Ok(())));
        let callback: ResponseCallback = {
            let status = status.clone();
            Box::new(move |result| {
                *status.lock() = result.map(|_| ());
            })
        };
        let (session, controller) = self.clone_async_impl(callback)?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        std::mem::replace(&mut *status.lock(), Ok(()))?;
        Ok(session)
    }

    fn clone_async_impl(&self, callback: ResponseCallback) -> Result<(Session, TaskController)> {
        let core = &self.core;
        let manager = core.manager()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let task_id = manager.new_task_id();
        let dst_session =
            manager.register_session(core.config.clone(), core.benchmark_params(&manager))?;
        let deps = manager.last_task_ids(core.session_id)?;
        tracing::debug!(
            session_id = core.session_id,
            task_id,
            dst_session,
            "clone session task created"
        );
        manager.add_clone_session_task(
            core.session_id,
            task_id,
            deps,
            dst_session,
            cancel.clone(),
            wrap_with_chain_reset(core, callback, "clone"),
        )?;
        manager.set_last_task_ids(core.session_id, HashSet::from([task_id]))?;
        // The clone waits on its own creation before doing anything else.
        manager.set_last_task_ids(dst_session, HashSet::from([task_id]))?;

        let session = Session {
            core: Arc::new(SessionCore {
                session_id: dst_session,
                manager: core.manager.clone(),
                tokenizer: core.tokenizer.clone(),
                config: core.config.clone(),
                template: core.template.clone(),
                state: Mutex::new(*core.state.lock()),
            }),
        };
        let controller = TaskController {
            task_id,
            cancel,
            manager: core.manager.clone(),
        };
        Ok((session, controller))
    }

    /// Cancel every outstanding task of this session.
    pub fn cancel(&self) -> Result<()> {
        self.core.manager()?.cancel_session(self.core.session_id)
    }

    pub fn benchmark_info(&self) -> Result<BenchmarkInfo> {
        self.core.manager()?.benchmark_info(self.core.session_id)
    }
}
