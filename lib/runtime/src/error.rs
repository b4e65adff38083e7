// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the ember runtime.
//!
//! Every fallible operation in the core returns one of these kinds; the kind
//! is what callers dispatch on to decide recovery. Errors never cross the
//! worker-thread boundary silently: any error that ends a task reaches that
//! task's callback.

use serde::{Deserialize, Serialize};

use crate::SessionId;

pub type Result<T> = std::result::Result<T, Error>;

/// Structured payload carried by [`Error::Cancelled`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInfo {
    pub reason_code: String,
    pub origin: String,
    pub session_id: SessionId,
    pub is_prefill: bool,
    pub is_decode: bool,
}

impl std::fmt::Display for CancelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reason_code={};origin={};session_id={};is_prefill={};is_decode={}",
            self.reason_code,
            self.origin,
            self.session_id,
            u8::from(self.is_prefill),
            u8::from(self.is_decode),
        )
    }
}

/// The runtime error type.
///
/// Kinds mirror the recovery contract:
/// - `InvalidArgument`, `FailedPrecondition`, `NotFound`, `AlreadyExists`:
///   caller-visible misuse, surfaced as-is
/// - `Unimplemented`: optional capability missing; clone paths degrade with a
///   warning instead of failing
/// - `Cancelled`: carries a structured [`CancelInfo`]
/// - `DeadlineExceeded`: a synchronous wait timed out; the underlying task is
///   not cancelled
/// - `Internal`: invariant violation. Fatal to the current operation only;
///   the system must stay usable for other sessions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("cancelled: {0}")]
    Cancelled(CancelInfo),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists(message.into())
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented(message.into())
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented(_))
    }

    /// Stable name of the error kind, for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::FailedPrecondition(_) => "FailedPrecondition",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Unimplemented(_) => "Unimplemented",
            Self::Cancelled(_) => "Cancelled",
            Self::DeadlineExceeded(_) => "DeadlineExceeded",
            Self::Internal { .. } => "Internal",
        }
    }
}

impl From<ember_tokens::TokenizerError> for Error {
    fn from(err: ember_tokens::TokenizerError) -> Self {
        match err {
            ember_tokens::TokenizerError::UnknownToken(token) => {
                Self::NotFound(format!("unknown token: {token}"))
            }
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time assertions that Error stays Send + Sync + 'static; task
    // results cross the worker/callback thread boundary.
    const _: () = {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        fn assert_static<T: 'static>() {}
        fn assert_all() {
            assert_send::<Error>();
            assert_sync::<Error>();
            assert_static::<Error>();
        }
    };

    #[test]
    fn cancel_info_display_is_structured() {
        let info = CancelInfo {
            reason_code: "PREFILL_TASK_CANCELLED_STATE".to_string(),
            origin: "SCHEDULER".to_string(),
            session_id: 7,
            is_prefill: true,
            is_decode: false,
        };
        let rendered = Error::Cancelled(info).to_string();
        assert!(rendered.contains("reason_code=PREFILL_TASK_CANCELLED_STATE"));
        assert!(rendered.contains("session_id=7"));
        assert!(rendered.contains("is_prefill=1"));
        assert!(rendered.contains("is_decode=0"));
    }

    #[test]
    fn internal_preserves_source_chain() {
        let source = anyhow::anyhow!("executor backend fault");
        let err = Error::internal_with_source("context switch failed", source);
        assert_eq!(err.kind(), "Internal");
        let source = std::error::Error::source(&err).expect("source should be preserved");
        assert!(source.to_string().contains("executor backend fault"));
    }

    #[test]
    fn tokenizer_unknown_token_maps_to_not_found() {
        let err = Error::from(ember_tokens::TokenizerError::UnknownToken("<pad>".into()));
        assert_eq!(err.kind(), "NotFound");
    }
}
