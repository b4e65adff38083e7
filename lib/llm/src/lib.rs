// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine facade and per-session surface of the ember runtime.
//!
//! [`Engine`] owns the [`ember_runtime::ExecutionManager`] and hands out
//! [`Session`]s. A session translates caller-facing prefill/decode/score/
//! clone operations into scheduler submissions, maintains the per-session
//! dependency chain so program order is preserved, and applies the prompt
//! template when enabled.

mod engine;
mod preprocess;
mod session;
mod template;

pub use engine::{Engine, EngineArgs, DEFAULT_TIMEOUT};
pub use session::{ResponseCallback, Session, SessionState, TaskController};
pub use template::{ContentType, PromptTemplate};

pub use ember_runtime::{
    BenchmarkInfo, BenchmarkParams, DecodeConfig, Error, InputData, Responses, Result,
    SessionConfig, TaskState,
};
