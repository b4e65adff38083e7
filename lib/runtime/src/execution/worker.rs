// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The execution and callback worker loops.
//!
//! The execution worker pops task ids FIFO, re-checks dependencies and the
//! cancel flag, runs the operation against the resource manager, and hands
//! the outcome to the callback worker. The callback worker is the only
//! place user closures run, and it never holds a table mutex across an
//! invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ember_tokens::DecodeStream;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::context::ContextHandler;
use crate::error::{Error, Result};
use crate::execution::{
    is_task_end_state, CallbackJob, ManagerInner, TaskPayload, TaskState, WorkItem,
};
use crate::executor::{DecodeParams, ExecutorInputs, PrefillParams};
use crate::io::{InputData, Responses};
use crate::{SessionId, TaskId};

pub(crate) fn run_execution_loop(
    inner: Arc<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
) {
    while let Some(item) = rx.blocking_recv() {
        match item {
            WorkItem::Shutdown => break,
            WorkItem::Task(task_id) => execute_task(&inner, task_id),
        }
    }
    // Propagate shutdown once this queue is drained so callbacks for every
    // executed task still fire.
    let _ = inner.cb_tx.send(CallbackJob::Shutdown);
}

pub(crate) fn run_callback_loop(
    inner: Arc<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<CallbackJob>,
) {
    while let Some(job) = rx.blocking_recv() {
        let CallbackJob::Invoke {
            task_id,
            result,
            terminal,
        } = job
        else {
            break;
        };

        // Move the callback out of the record, release the lock, invoke.
        // Callbacks frequently re-enter the manager (chaining a decode after
        // a prefill, cancelling a session); invoking under a table mutex
        // would deadlock.
        let callback = {
            let mut tasks = inner.tasks.lock();
            tasks
                .records
                .get_mut(&task_id)
                .and_then(|record| record.callback.take())
        };
        let Some(mut callback) = callback else {
            tracing::error!(task_id, "callback missing for scheduled delivery");
            continue;
        };
        callback(result);

        let mut tasks = inner.tasks.lock();
        if terminal {
            if let Some(record) = tasks.records.remove(&task_id) {
                tasks.finished.insert(task_id, record.state);
            }
            inner.task_retired.notify_all();
        } else if let Some(record) = tasks.records.get_mut(&task_id) {
            record.callback = Some(callback);
        }
    }
}

enum Preflight {
    /// Already terminal (cancelled before dispatch); callback was scheduled
    /// by whoever made it terminal.
    Skip,
    /// Became terminal now; schedule only the callback.
    Terminal(TaskState),
    Run {
        session_id: SessionId,
        payload: TaskPayload,
        cancel: Arc<AtomicBool>,
    },
}

fn execute_task(inner: &Arc<ManagerInner>, task_id: TaskId) {
    let preflight = {
        let mut tasks = inner.tasks.lock();
        let Some(record) = tasks.records.get(&task_id) else {
            return;
        };
        if is_task_end_state(record.state) {
            Preflight::Skip
        } else if record.cancel.load(Ordering::SeqCst) {
            Preflight::Terminal(TaskState::Cancelled)
        } else {
            let mut dep_terminal = None;
            for dep in &record.deps {
                match tasks.state_of(*dep) {
                    Some(TaskState::Done) => {}
                    Some(TaskState::Failed) | Some(TaskState::DependentTaskFailed) => {
                        dep_terminal = Some(TaskState::DependentTaskFailed);
                        break;
                    }
                    Some(TaskState::Cancelled) | Some(TaskState::DependentTaskCancelled) => {
                        dep_terminal = Some(TaskState::DependentTaskCancelled);
                        break;
                    }
                    other => {
                        // FIFO dispatch means every dependency ran first;
                        // anything else is a scheduling bug.
                        tracing::error!(
                            task_id,
                            dep = *dep,
                            state = ?other,
                            "dependency not terminal at dispatch"
                        );
                        dep_terminal = Some(TaskState::DependentTaskFailed);
                        break;
                    }
                }
            }
            match (dep_terminal, tasks.records.get_mut(&task_id)) {
                (Some(state), _) => Preflight::Terminal(state),
                (None, None) => Preflight::Skip,
                (None, Some(record)) => {
                    record.state = TaskState::Running;
                    tracing::trace!(
                        task_id,
                        session_id = record.session_id,
                        kind = ?record.kind,
                        "task running"
                    );
                    match record.payload.take() {
                        Some(payload) => Preflight::Run {
                            session_id: record.session_id,
                            payload,
                            cancel: record.cancel.clone(),
                        },
                        None => {
                            tracing::error!(task_id, "task payload missing at dispatch");
                            Preflight::Terminal(TaskState::Failed)
                        }
                    }
                }
            }
        }
    };

    match preflight {
        Preflight::Skip => {}
        Preflight::Terminal(state) => {
            set_task_state(inner, task_id, state);
            let result = if state == TaskState::Failed {
                Err(Error::internal("task could not be dispatched"))
            } else {
                Ok(Responses::with_state(state))
            };
            deliver(inner, task_id, result, true);
        }
        Preflight::Run {
            session_id,
            payload,
            cancel,
        } => {
            let outcome = run_payload(inner, task_id, session_id, payload, &cancel);
            let (state, result) = match outcome {
                Ok(responses) => (responses.task_state(), Ok(responses)),
                Err(error) => {
                    tracing::warn!(
                        session_id,
                        task_id,
                        kind = error.kind(),
                        error = %error,
                        "task failed"
                    );
                    (TaskState::Failed, Err(error))
                }
            };
            set_task_state(inner, task_id, state);
            deliver(inner, task_id, result, true);
        }
    }
}

fn set_task_state(inner: &ManagerInner, task_id: TaskId, state: TaskState) {
    if let Some(record) = inner.tasks.lock().records.get_mut(&task_id) {
        record.state = state;
    }
}

/// Hand a result to the callback worker; if it is gone, invoke inline so
/// the callback is never lost.
fn deliver(inner: &ManagerInner, task_id: TaskId, result: Result<Responses>, terminal: bool) {
    if let Err(mpsc::error::SendError(CallbackJob::Invoke { result, .. })) =
        inner.cb_tx.send(CallbackJob::Invoke {
            task_id,
            result,
            terminal,
        })
    {
        let callback = {
            let mut tasks = inner.tasks.lock();
            let callback = tasks
                .records
                .get_mut(&task_id)
                .and_then(|record| record.callback.take());
            if terminal {
                if let Some(record) = tasks.records.remove(&task_id) {
                    tasks.finished.insert(task_id, record.state);
                }
                inner.task_retired.notify_all();
            }
            callback
        };
        if let Some(mut callback) = callback {
            callback(result);
        }
    }
}

fn run_payload(
    inner: &Arc<ManagerInner>,
    task_id: TaskId,
    session_id: SessionId,
    payload: TaskPayload,
    cancel: &Arc<AtomicBool>,
) -> Result<Responses> {
    let (handler, config) = resolve_handler(inner, session_id)?;
    match payload {
        TaskPayload::Prefill { inputs } => {
            run_prefill(inner, session_id, &handler, inputs, cancel)
        }
        TaskPayload::Decode { max_output_tokens } => run_decode(
            inner,
            task_id,
            session_id,
            &handler,
            &config,
            max_output_tokens,
            cancel,
        ),
        TaskPayload::TextScore {
            target,
            store_token_lengths,
        } => run_text_scoring(inner, &handler, &target, store_token_lengths, cancel),
        TaskPayload::CloneSession { dst_session } => {
            run_clone_session(inner, session_id, dst_session, &handler)
        }
    }
}

/// The session's context handler, created lazily on its first task.
fn resolve_handler(
    inner: &ManagerInner,
    session_id: SessionId,
) -> Result<(Arc<ContextHandler>, SessionConfig)> {
    let mut sessions = inner.sessions.lock();
    let record = sessions
        .get_mut(&session_id)
        .ok_or_else(|| Error::not_found(format!("session {session_id} is not registered")))?;
    let handler = match &record.handler {
        Some(handler) => handler.clone(),
        None => {
            let handler = inner.resources.create_context_handler(&record.config)?;
            record.handler = Some(handler.clone());
            handler
        }
    };
    Ok((handler, record.config.clone()))
}

fn run_prefill(
    inner: &Arc<ManagerInner>,
    session_id: SessionId,
    handler: &Arc<ContextHandler>,
    inputs: Vec<InputData>,
    cancel: &Arc<AtomicBool>,
) -> Result<Responses> {
    let started = Instant::now();
    let mut total_tokens = 0usize;
    {
        let mut scoped = inner.resources.acquire_executor_with(handler)?;
        for input in inputs {
            if cancel.load(Ordering::SeqCst) {
                return Ok(Responses::with_state(TaskState::Cancelled));
            }
            let executor_inputs = match input {
                InputData::Tokens(tokens) => {
                    total_tokens += tokens.len();
                    ExecutorInputs::from_tokens(tokens)
                }
                InputData::Text(text) => {
                    let tokens = inner.tokenizer.text_to_ids(&text)?;
                    total_tokens += tokens.len();
                    ExecutorInputs::from_tokens(tokens)
                }
                InputData::Image(image) => {
                    let embeddings = inner.resources.acquire_vision_executor()?.encode(&image)?;
                    ExecutorInputs {
                        vision: Some(embeddings),
                        ..ExecutorInputs::default()
                    }
                }
                InputData::Audio(audio) => {
                    let embeddings = inner
                        .resources
                        .acquire_audio_executor()?
                        .encode(&audio.spectrogram)?;
                    ExecutorInputs {
                        audio: Some(embeddings),
                        ..ExecutorInputs::default()
                    }
                }
            };
            let params = PrefillParams {
                current_step: None,
                cancel: Some(cancel.clone()),
            };
            scoped.prefill(&executor_inputs, &params)?;
        }
    }

    with_benchmark(inner, session_id, |benchmark| {
        benchmark.mark_session_start();
        benchmark.record_prefill_turn(total_tokens, started.elapsed());
    });
    Ok(Responses::with_state(TaskState::Done))
}

fn run_decode(
    inner: &Arc<ManagerInner>,
    task_id: TaskId,
    session_id: SessionId,
    handler: &Arc<ContextHandler>,
    config: &SessionConfig,
    max_output_tokens: usize,
    cancel: &Arc<AtomicBool>,
) -> Result<Responses> {
    let started = Instant::now();
    let mut produced = 0usize;
    let mut first_token_at = None;
    let mut cancelled = false;

    let final_texts = {
        let mut scoped = inner.resources.acquire_executor_with(handler)?;
        let heads = scoped.runtime_config()?.output_heads;
        let mut streams: Vec<DecodeStream> = (0..heads).map(|_| DecodeStream::new()).collect();

        while produced < max_output_tokens {
            if cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            let params = DecodeParams {
                cancel: Some(cancel.clone()),
            };
            let sampled = scoped.decode(&params)?;
            if sampled.len() != heads {
                return Err(Error::internal(format!(
                    "executor produced {} candidates, runtime config asks for {heads}",
                    sampled.len()
                )));
            }
            produced += 1;
            if first_token_at.is_none() {
                first_token_at = Some(Instant::now());
            }
            if config.stop_token_ids.contains(&sampled[0]) {
                break;
            }

            let mut texts = vec![String::new(); heads];
            for (head, &token) in sampled.iter().enumerate() {
                if let Some(text) = streams[head].step(inner.tokenizer.as_ref(), token)? {
                    texts[head] = text;
                }
            }
            // Stream this step to the caller; ordering is preserved by the
            // FIFO callback worker.
            deliver(
                inner,
                task_id,
                Ok(Responses::new(TaskState::Running, texts, Vec::new())),
                false,
            );
        }

        let mut final_texts = vec![String::new(); heads];
        for (head, stream) in streams.iter_mut().enumerate() {
            if let Some(text) = stream.flush(inner.tokenizer.as_ref())? {
                final_texts[head] = text;
            }
        }
        final_texts
    };

    with_benchmark(inner, session_id, |benchmark| {
        if let Some(at) = first_token_at {
            benchmark.mark_first_token_at(at);
        }
        benchmark.record_decode_turn(produced, started.elapsed());
    });

    if cancelled {
        return Ok(Responses::with_state(TaskState::Cancelled));
    }
    Ok(Responses::new(TaskState::Done, final_texts, Vec::new()))
}

/// Score a target continuation: sum of per-token log-probabilities under
/// the session's current context. Behaves like a constrained prefill.
fn run_text_scoring(
    inner: &Arc<ManagerInner>,
    handler: &Arc<ContextHandler>,
    target: &str,
    store_token_lengths: bool,
    cancel: &Arc<AtomicBool>,
) -> Result<Responses> {
    let target_ids = inner.tokenizer.text_to_ids(target)?;
    if target_ids.is_empty() {
        return Err(Error::invalid_argument(
            "text scoring target produced no tokens",
        ));
    }

    let mut scoped = inner.resources.acquire_executor_with(handler)?;
    let vocab_size = scoped.vocab_size()?;
    let mut total_log_prob = 0.0f32;
    let mut token_lengths = Vec::new();

    for &token in &target_ids {
        if cancel.load(Ordering::SeqCst) {
            return Ok(Responses::with_state(TaskState::Cancelled));
        }
        let logits = scoped.decode_to_logits(&ExecutorInputs::default())?;
        if logits.len() != vocab_size {
            return Err(Error::internal(format!(
                "executor produced {} logits for a vocab of {vocab_size}",
                logits.len()
            )));
        }
        let index = token as usize;
        if index >= logits.len() {
            return Err(Error::not_found(format!(
                "token id {token} is outside the vocabulary"
            )));
        }
        total_log_prob += log_softmax_at(&logits, index);

        let params = PrefillParams {
            current_step: None,
            cancel: Some(cancel.clone()),
        };
        scoped.prefill(&ExecutorInputs::from_tokens(vec![token]), &params)?;

        if store_token_lengths {
            token_lengths.push(inner.tokenizer.ids_to_text(&[token])?.len());
        }
    }

    let mut responses = Responses::new(TaskState::Done, Vec::new(), vec![total_log_prob]);
    if store_token_lengths {
        responses.set_token_lengths(token_lengths);
    }
    Ok(responses)
}

fn run_clone_session(
    inner: &Arc<ManagerInner>,
    src_session: SessionId,
    dst_session: SessionId,
    src_handler: &Arc<ContextHandler>,
) -> Result<Responses> {
    let cloned = inner.resources.clone_context_handler(src_handler)?;
    let mut sessions = inner.sessions.lock();
    let record = sessions.get_mut(&dst_session).ok_or_else(|| {
        Error::not_found(format!("destination session {dst_session} is not registered"))
    })?;
    if record.handler.is_some() {
        return Err(Error::already_exists(format!(
            "destination session {dst_session} already has a context handler"
        )));
    }
    record.handler = Some(cloned);
    tracing::debug!(src_session, dst_session, "session cloned");
    Ok(Responses::with_state(TaskState::Done))
}

fn with_benchmark(
    inner: &ManagerInner,
    session_id: SessionId,
    update: impl FnOnce(&mut crate::io::BenchmarkInfo),
) {
    let mut sessions = inner.sessions.lock();
    if let Some(benchmark) = sessions
        .get_mut(&session_id)
        .and_then(|record| record.benchmark.as_mut())
    {
        update(benchmark);
    }
}

fn log_softmax_at(logits: &[f32], index: usize) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
    logits[index] - max - log_sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_softmax_of_uniform_logits_is_uniform() {
        let logits = vec![0.0f32; 4];
        let lp = log_softmax_at(&logits, 2);
        assert!((lp - (1.0f32 / 4.0).ln()).abs() < 1e-6);
    }

    #[test]
    fn log_softmax_prefers_larger_logit() {
        let logits = vec![0.0, 5.0, 0.0];
        assert!(log_softmax_at(&logits, 1) > log_softmax_at(&logits, 0));
        assert!(log_softmax_at(&logits, 1) < 0.0);
    }
}
