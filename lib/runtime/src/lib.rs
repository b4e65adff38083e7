// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Execution and context-management core of the ember runtime.
//!
//! This crate multiplexes many logical conversation sessions onto a single,
//! stateful LLM executor that owns a large KV cache. The moving parts:
//!
//! - [`executor`]: the narrow contract an executor implementation fulfils
//!   (prefill/decode kernels are out of scope; exclusion is provided here)
//! - [`context`]: per-session [`ContextHandler`]s and the reference-counted
//!   [`SharedProcessedContext`] cell they alias until copy-on-write divergence
//! - [`resource`]: the [`ResourceManager`] that owns the executor and issues
//!   scoped handles performing context switches, prefix matching and
//!   copy-on-write
//! - [`execution`]: the [`ExecutionManager`] task scheduler with its single
//!   execution worker and single callback worker
//!
//! Everything here assumes the executor is single-threaded by contract; the
//! manager refuses to construct otherwise.

pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod executor;
pub mod io;
pub mod logging;
pub mod resource;

pub mod testing;

pub use config::{DecodeConfig, SessionConfig, SessionConfigBuilder};
pub use context::{ContextHandler, SharedProcessedContext};
pub use error::{CancelInfo, Error, Result};
pub use execution::{
    is_task_end_state, ExecutionManager, TaskCallback, TaskKind, TaskState,
};
pub use executor::{
    AudioContext, AudioExecutor, AudioExecutorProperties, CacheState, DecodeParams, EmbeddingData,
    ExecutorInputs, ExecutorSettings, LlmContext, LlmExecutor, LoraAssets, PrefillParams,
    ProcessedContext, RuntimeConfig, RuntimeState, SamplerKind, SamplerParams, VisionExecutor,
};
pub use io::{BenchmarkInfo, BenchmarkParams, InitPhase, InputData, Responses};
pub use resource::{ResourceManager, ScopedExecutor};

pub use tokio_util::sync::CancellationToken;

/// Dense, monotonically-issued session identifier. Never recycled.
pub type SessionId = u64;

/// Dense, monotonically-issued task identifier. Never recycled.
pub type TaskId = u64;

/// Identifier of a [`ContextHandler`]; used for copy-on-write bookkeeping.
pub type HandlerId = u64;
