// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Task records and the task state machine.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::{InputData, Responses};
use crate::{SessionId, TaskId};

/// Observable task lifecycle.
///
/// ```text
/// Created -> Queued -> Running -> {Done, Failed, Cancelled}
/// Created/Queued -> {DependentTaskFailed, DependentTaskCancelled, Cancelled}
/// ```
///
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[default]
    Created,
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
    /// A dependency ended in `Failed`; this task never ran.
    DependentTaskFailed,
    /// A dependency ended in `Cancelled`; this task never ran.
    DependentTaskCancelled,
}

pub fn is_task_end_state(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::Done
            | TaskState::Failed
            | TaskState::Cancelled
            | TaskState::DependentTaskFailed
            | TaskState::DependentTaskCancelled
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Prefill,
    Decode,
    TextScore,
    CloneSession,
    /// Cancellation is delivered through the shared flag and immediate
    /// transition of not-yet-running tasks, never through the queue; the
    /// kind exists for observability.
    Cancel,
}

/// Task completion/progress callback.
///
/// Invoked on the callback worker only, with no manager lock held. Decode
/// tasks call it once per decode step ([`TaskState::Running`]) and exactly
/// once with a terminal state; every other kind calls it exactly once.
pub type TaskCallback = Box<dyn FnMut(Result<Responses>) + Send>;

pub(crate) enum TaskPayload {
    Prefill {
        inputs: Vec<InputData>,
    },
    Decode {
        max_output_tokens: usize,
    },
    TextScore {
        target: String,
        store_token_lengths: bool,
    },
    CloneSession {
        dst_session: SessionId,
    },
}

pub(crate) struct TaskRecord {
    pub session_id: SessionId,
    pub kind: TaskKind,
    pub deps: HashSet<TaskId>,
    /// Taken by the execution worker when the task starts running.
    pub payload: Option<TaskPayload>,
    pub cancel: Arc<AtomicBool>,
    /// Taken by the callback worker around each invocation; restored for
    /// non-terminal (streaming) invocations.
    pub callback: Option<TaskCallback>,
    pub state: TaskState,
}
