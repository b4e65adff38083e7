// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The task scheduler.
//!
//! [`ExecutionManager`] serializes all executor work onto exactly one
//! execution worker and delivers every user callback from exactly one
//! callback worker. Both are long-lived, FIFO, dedicated OS threads; the
//! single-threadedness is a hard invariant (prefix matching and
//! copy-on-write read executor state without further locking), enforced at
//! construction against the executor's advertised settings.
//!
//! Locking discipline:
//! - two mutexes, session table and task table, acquired in that order when
//!   both are needed
//! - user callbacks are NEVER invoked with either table mutex held; the
//!   callback worker moves the closure out of the record, releases the
//!   lock, invokes, and restores it for streaming (non-terminal) deliveries

mod task;
pub(crate) mod worker;

pub use task::{is_task_end_state, TaskCallback, TaskKind, TaskState};
pub(crate) use task::{TaskPayload, TaskRecord};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ember_tokens::Tokenizer;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::context::ContextHandler;
use crate::error::{Error, Result};
use crate::executor::{AudioExecutor, LlmExecutor, VisionExecutor};
use crate::io::{BenchmarkInfo, BenchmarkParams, InputData, Responses};
use crate::resource::ResourceManager;
use crate::{SessionId, TaskId};

pub(crate) enum WorkItem {
    Task(TaskId),
    Shutdown,
}

pub(crate) enum CallbackJob {
    Invoke {
        task_id: TaskId,
        result: Result<Responses>,
        terminal: bool,
    },
    Shutdown,
}

pub(crate) struct SessionRecord {
    pub config: SessionConfig,
    /// Created lazily by the execution worker on the session's first task,
    /// or installed by a clone-session task.
    pub handler: Option<Arc<ContextHandler>>,
    pub benchmark: Option<BenchmarkInfo>,
    /// Task ids a newly submitted task in this session depends on by
    /// default. Rewritten to the new task id on each submission; cleared on
    /// terminal failure/cancel so the next submission starts a new chain.
    pub last_task_ids: HashSet<TaskId>,
}

pub(crate) struct TaskTable {
    pub records: HashMap<TaskId, TaskRecord>,
    /// Terminal states of retired tasks, kept for dependency resolution
    /// (task ids are process-lifetime unique and never recycled).
    pub finished: HashMap<TaskId, TaskState>,
}

impl TaskTable {
    pub fn state_of(&self, task_id: TaskId) -> Option<TaskState> {
        self.records
            .get(&task_id)
            .map(|record| record.state)
            .or_else(|| self.finished.get(&task_id).copied())
    }
}

pub(crate) struct ManagerInner {
    pub resources: Arc<ResourceManager>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    pub tasks: Mutex<TaskTable>,
    /// Paired with the task mutex; signalled whenever a task retires.
    pub task_retired: Condvar,
    pub exec_tx: mpsc::UnboundedSender<WorkItem>,
    pub cb_tx: mpsc::UnboundedSender<CallbackJob>,
    pub shutdown: CancellationToken,
    next_session_id: AtomicU64,
    next_task_id: AtomicU64,
}

/// Serializes executor work, enforces session/task ordering, and invokes
/// user callbacks exactly once per terminal state.
pub struct ExecutionManager {
    inner: Arc<ManagerInner>,
    exec_thread: Option<JoinHandle<()>>,
    callback_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager").finish_non_exhaustive()
    }
}

impl ExecutionManager {
    /// Build the manager and start its two workers.
    ///
    /// Fails with [`Error::Internal`] when the executor advertises more than
    /// one thread: context switching assumes serialized access to the
    /// executor's processed-tokens view.
    pub fn new(
        executor: Box<dyn LlmExecutor>,
        audio_executor: Option<Box<dyn AudioExecutor>>,
        vision_executor: Option<Box<dyn VisionExecutor>>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Arc<Self>> {
        let settings = executor.settings();
        if settings.num_threads != 1 {
            return Err(Error::internal(format!(
                "executor advertises {} threads; the execution core requires a single-threaded \
                 executor",
                settings.num_threads
            )));
        }

        let resources = Arc::new(ResourceManager::new(
            executor,
            audio_executor,
            vision_executor,
        ));
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let (cb_tx, cb_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            resources,
            tokenizer,
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(TaskTable {
                records: HashMap::new(),
                finished: HashMap::new(),
            }),
            task_retired: Condvar::new(),
            exec_tx,
            cb_tx,
            shutdown: CancellationToken::new(),
            next_session_id: AtomicU64::new(0),
            next_task_id: AtomicU64::new(0),
        });

        let exec_thread = std::thread::Builder::new()
            .name("ember-execution".to_string())
            .spawn({
                let inner = inner.clone();
                move || worker::run_execution_loop(inner, exec_rx)
            })
            .map_err(|e| Error::internal_with_source("failed to spawn execution worker", e.into()))?;
        let callback_thread = std::thread::Builder::new()
            .name("ember-callback".to_string())
            .spawn({
                let inner = inner.clone();
                move || worker::run_callback_loop(inner, cb_rx)
            })
            .map_err(|e| Error::internal_with_source("failed to spawn callback worker", e.into()))?;

        Ok(Arc::new(Self {
            inner,
            exec_thread: Some(exec_thread),
            callback_thread: Some(callback_thread),
        }))
    }

    pub fn register_session(
        &self,
        config: SessionConfig,
        benchmark: Option<BenchmarkParams>,
    ) -> Result<SessionId> {
        if config.num_output_candidates == 0 {
            return Err(Error::invalid_argument(
                "num_output_candidates must be at least 1",
            ));
        }
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let record = SessionRecord {
            config,
            handler: None,
            benchmark: benchmark.map(BenchmarkInfo::new),
            last_task_ids: HashSet::new(),
        };
        self.inner.sessions.lock().insert(session_id, record);
        tracing::debug!(session_id, "session registered");
        Ok(session_id)
    }

    pub fn new_task_id(&self) -> TaskId {
        self.inner.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_prefill_task(
        &self,
        session_id: SessionId,
        task_id: TaskId,
        inputs: Vec<InputData>,
        deps: HashSet<TaskId>,
        cancel: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        self.add_task(
            session_id,
            task_id,
            TaskKind::Prefill,
            TaskPayload::Prefill { inputs },
            deps,
            cancel,
            callback,
        )
    }

    /// `max_output_tokens` is the session-resolved bound (see
    /// [`crate::config::DecodeConfig::effective_max_output_tokens`]).
    pub fn add_decode_task(
        &self,
        session_id: SessionId,
        task_id: TaskId,
        deps: HashSet<TaskId>,
        cancel: Arc<AtomicBool>,
        callback: TaskCallback,
        max_output_tokens: usize,
    ) -> Result<()> {
        self.add_task(
            session_id,
            task_id,
            TaskKind::Decode,
            TaskPayload::Decode { max_output_tokens },
            deps,
            cancel,
            callback,
        )
    }

    pub fn add_text_scoring_task(
        &self,
        session_id: SessionId,
        task_id: TaskId,
        deps: HashSet<TaskId>,
        target: String,
        store_token_lengths: bool,
        cancel: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        self.add_task(
            session_id,
            task_id,
            TaskKind::TextScore,
            TaskPayload::TextScore {
                target,
                store_token_lengths,
            },
            deps,
            cancel,
            callback,
        )
    }

    /// `dst_session` must already be registered; the clone task installs the
    /// shared context handler into it when it runs.
    pub fn add_clone_session_task(
        &self,
        src_session: SessionId,
        task_id: TaskId,
        deps: HashSet<TaskId>,
        dst_session: SessionId,
        cancel: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        {
            let sessions = self.inner.sessions.lock();
            if !sessions.contains_key(&dst_session) {
                return Err(Error::not_found(format!(
                    "destination session {dst_session} is not registered"
                )));
            }
        }
        self.add_task(
            src_session,
            task_id,
            TaskKind::CloneSession,
            TaskPayload::CloneSession { dst_session },
            deps,
            cancel,
            callback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn add_task(
        &self,
        session_id: SessionId,
        task_id: TaskId,
        kind: TaskKind,
        payload: TaskPayload,
        deps: HashSet<TaskId>,
        cancel: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::failed_precondition(
                "execution manager is shutting down",
            ));
        }
        {
            // Lock order: sessions before tasks.
            let sessions = self.inner.sessions.lock();
            if !sessions.contains_key(&session_id) {
                return Err(Error::not_found(format!(
                    "session {session_id} is not registered"
                )));
            }
        }

        let synthesized = {
            let mut tasks = self.inner.tasks.lock();
            if tasks.records.contains_key(&task_id) || tasks.finished.contains_key(&task_id) {
                return Err(Error::already_exists(format!(
                    "task {task_id} already exists"
                )));
            }

            let mut synthesized = None;
            for dep in &deps {
                match tasks.state_of(*dep) {
                    None => {
                        return Err(Error::not_found(format!(
                            "dependency task {dep} is unknown"
                        )))
                    }
                    Some(TaskState::Failed) | Some(TaskState::DependentTaskFailed) => {
                        synthesized = Some(TaskState::DependentTaskFailed);
                        break;
                    }
                    Some(TaskState::Cancelled) | Some(TaskState::DependentTaskCancelled) => {
                        synthesized = Some(TaskState::DependentTaskCancelled);
                        break;
                    }
                    Some(_) => {}
                }
            }

            let state = synthesized.unwrap_or(TaskState::Queued);
            tasks.records.insert(
                task_id,
                TaskRecord {
                    session_id,
                    kind,
                    deps,
                    payload: Some(payload),
                    cancel,
                    callback: Some(callback),
                    state,
                },
            );
            synthesized
        };

        if let Some(terminal) = synthesized {
            // A dependency already ended badly: never enqueue, only deliver
            // the terminal callback.
            tracing::warn!(
                session_id,
                task_id,
                state = ?terminal,
                "task terminal at submission because a dependency already failed or was cancelled"
            );
            self.send_callback_or_recover(task_id, Ok(Responses::with_state(terminal)), true);
            return Ok(());
        }

        if self.inner.exec_tx.send(WorkItem::Task(task_id)).is_err() {
            // The execution worker is gone. The caller's callback must still
            // fire: mark Failed and deliver the error through it.
            let error = Error::internal("execution worker is unavailable");
            if let Some(record) = self.inner.tasks.lock().records.get_mut(&task_id) {
                record.state = TaskState::Failed;
            }
            self.send_callback_or_recover(task_id, Err(error), true);
        }
        Ok(())
    }

    /// Route a result to the task's callback via the callback worker. If
    /// that worker is gone, invoke inline (no locks held) so the caller's
    /// callback is never silently dropped.
    fn send_callback_or_recover(&self, task_id: TaskId, result: Result<Responses>, terminal: bool) {
        if let Err(mpsc::error::SendError(job)) = self.inner.cb_tx.send(CallbackJob::Invoke {
            task_id,
            result,
            terminal,
        }) {
            let CallbackJob::Invoke { result, .. } = job else {
                return;
            };
            let callback = {
                let mut tasks = self.inner.tasks.lock();
                let callback = tasks
                    .records
                    .get_mut(&task_id)
                    .and_then(|record| record.callback.take());
                if terminal {
                    if let Some(record) = tasks.records.remove(&task_id) {
                        tasks.finished.insert(task_id, record.state);
                    }
                    self.inner.task_retired.notify_all();
                }
                callback
            };
            if let Some(mut callback) = callback {
                callback(result);
            }
        }
    }

    /// Set the task's cancel flag; a task that has not started running
    /// transitions to `Cancelled` immediately. Terminal tasks ignore this.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        let transitioned = {
            let mut tasks = self.inner.tasks.lock();
            let Some(record) = tasks.records.get_mut(&task_id) else {
                return if tasks.finished.contains_key(&task_id) {
                    Ok(())
                } else {
                    Err(Error::not_found(format!("task {task_id} is unknown")))
                };
            };
            record.cancel.store(true, Ordering::SeqCst);
            if matches!(record.state, TaskState::Created | TaskState::Queued) {
                record.state = TaskState::Cancelled;
                true
            } else {
                false
            }
        };
        if transitioned {
            tracing::debug!(task_id, "task cancelled before dispatch");
            self.send_callback_or_recover(
                task_id,
                Ok(Responses::with_state(TaskState::Cancelled)),
                true,
            );
        }
        Ok(())
    }

    /// Cancel every non-terminal task of `session_id`.
    pub fn cancel_session(&self, session_id: SessionId) -> Result<()> {
        let task_ids: Vec<TaskId> = {
            let tasks = self.inner.tasks.lock();
            tasks
                .records
                .iter()
                .filter(|(_, record)| {
                    record.session_id == session_id && !is_task_end_state(record.state)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for task_id in task_ids {
            self.cancel_task(task_id)?;
        }
        Ok(())
    }

    /// Block until every submitted task has retired (terminal callback
    /// delivered). Times out with [`Error::DeadlineExceeded`]; no task is
    /// cancelled by the timeout.
    pub fn wait_until_all_done(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.inner.tasks.lock();
        while !tasks.records.is_empty() {
            if self
                .inner
                .task_retired
                .wait_until(&mut tasks, deadline)
                .timed_out()
            {
                return Err(Error::deadline_exceeded(format!(
                    "{} tasks still outstanding",
                    tasks.records.len()
                )));
            }
        }
        Ok(())
    }

    /// Block until `task_id` has retired.
    pub fn wait_until_task_done(&self, task_id: TaskId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.inner.tasks.lock();
        loop {
            if tasks.finished.contains_key(&task_id) {
                return Ok(());
            }
            if !tasks.records.contains_key(&task_id) {
                return Err(Error::not_found(format!("task {task_id} is unknown")));
            }
            if self
                .inner
                .task_retired
                .wait_until(&mut tasks, deadline)
                .timed_out()
            {
                return Err(Error::deadline_exceeded(format!(
                    "task {task_id} did not finish in time"
                )));
            }
        }
    }

    pub fn task_state(&self, task_id: TaskId) -> Result<TaskState> {
        self.inner
            .tasks
            .lock()
            .state_of(task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id} is unknown")))
    }

    pub fn session_config(&self, session_id: SessionId) -> Result<SessionConfig> {
        let sessions = self.inner.sessions.lock();
        sessions
            .get(&session_id)
            .map(|record| record.config.clone())
            .ok_or_else(|| Error::not_found(format!("session {session_id} is not registered")))
    }

    /// Snapshot of the session's benchmark counters.
    pub fn benchmark_info(&self, session_id: SessionId) -> Result<BenchmarkInfo> {
        let sessions = self.inner.sessions.lock();
        let record = sessions
            .get(&session_id)
            .ok_or_else(|| Error::not_found(format!("session {session_id} is not registered")))?;
        record.benchmark.clone().ok_or_else(|| {
            Error::failed_precondition("benchmarking is not enabled for this session")
        })
    }

    pub fn last_task_ids(&self, session_id: SessionId) -> Result<HashSet<TaskId>> {
        let sessions = self.inner.sessions.lock();
        sessions
            .get(&session_id)
            .map(|record| record.last_task_ids.clone())
            .ok_or_else(|| Error::not_found(format!("session {session_id} is not registered")))
    }

    pub fn set_last_task_ids(&self, session_id: SessionId, task_ids: HashSet<TaskId>) -> Result<()> {
        let mut sessions = self.inner.sessions.lock();
        let record = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::not_found(format!("session {session_id} is not registered")))?;
        record.last_task_ids = task_ids;
        Ok(())
    }

    /// Clear the dependency chain after a terminal non-`Done` state so the
    /// next submission does not inherit the failed dependency forever.
    pub fn clear_last_task_ids(&self, session_id: SessionId, reason: &str) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(record) = sessions.get_mut(&session_id) {
            tracing::warn!(
                session_id,
                reason,
                prev_count = record.last_task_ids.len(),
                "session last_task_ids cleared"
            );
            record.last_task_ids.clear();
        }
    }

    pub fn vocab_size(&self) -> Result<usize> {
        self.inner.resources.acquire_executor().vocab_size()
    }

    /// Session-less resource access (LoRA loading and similar).
    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }
}

impl Drop for ExecutionManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        let _ = self.inner.exec_tx.send(WorkItem::Shutdown);
        if let Some(thread) = self.exec_thread.take() {
            let _ = thread.join();
        }
        // The execution worker forwards the shutdown to the callback worker
        // after draining its own queue.
        if let Some(thread) = self.callback_thread.take() {
            let _ = thread.join();
        }
    }
}
