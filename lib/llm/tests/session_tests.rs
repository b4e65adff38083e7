// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end session behavior on top of the deterministic mock executor:
//! the mock's next token is always previous + 1, and the numeric tokenizer
//! renders token id N as " N".

use std::sync::Arc;
use std::time::Duration;

use ember_llm::{
    DecodeConfig, Engine, EngineArgs, InputData, PromptTemplate, Responses, SessionConfig,
    SessionState, TaskState,
};
use ember_runtime::testing::{Gate, GatedExecutor, MockExecutor, NumericTokenizer};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(10);

fn new_engine() -> Engine {
    Engine::new(EngineArgs::new(
        Box::new(MockExecutor::new()),
        Arc::new(NumericTokenizer),
    ))
    .unwrap()
}

#[test]
fn prefill_then_decode_generates_consecutive_tokens() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();

    session
        .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
        .unwrap();
    assert_eq!(session.state(), SessionState::Prefilled);

    let responses = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(4),
        })
        .unwrap();
    assert_eq!(responses.task_state(), TaskState::Done);
    assert_eq!(responses.texts(), &[" 4 5 6 7".to_string()]);
    assert_eq!(session.state(), SessionState::Decoded);
}

#[test]
fn decode_without_prefill_is_a_failed_precondition() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();
    let err = session.run_decode().unwrap_err();
    assert_eq!(err.kind(), "FailedPrecondition");
}

#[test]
fn prompt_template_wraps_turns_and_flushes_before_decode() {
    // Markers are themselves token ids so the numeric tokenizer can encode
    // them: bos=100, user prefix=101, user suffix=102, model prefix=103.
    let template = PromptTemplate {
        bos: "100 ".to_string(),
        user_prefix: "101 ".to_string(),
        user_suffix: "102 ".to_string(),
        model_prefix: "103 ".to_string(),
    };
    let engine = Engine::new(
        EngineArgs::new(Box::new(MockExecutor::new()), Arc::new(NumericTokenizer))
            .with_template(template),
    )
    .unwrap();
    let config = SessionConfig::builder()
        .apply_prompt_template(true)
        .build()
        .unwrap();
    let session = engine.create_session(config).unwrap();

    session
        .run_prefill(vec![InputData::Text("1 2".to_string())])
        .unwrap();
    let responses = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(2),
        })
        .unwrap();

    // Processed sequence is [100, 101, 1, 2, 102, 103]; the mock continues
    // from the flushed model prefix.
    assert_eq!(responses.texts(), &[" 104 105".to_string()]);
}

#[test]
fn stop_token_terminates_decode_early() {
    let engine = new_engine();
    let config = SessionConfig::builder()
        .stop_token_ids(vec![6])
        .build()
        .unwrap();
    let session = engine.create_session(config).unwrap();

    session
        .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
        .unwrap();
    let responses = session.run_decode().unwrap();
    // Tokens 4 and 5 are emitted; 6 is the stop token and is withheld.
    assert_eq!(responses.texts(), &[" 4 5".to_string()]);
}

#[test]
fn cloned_session_diverges_independently() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();

    session
        .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
        .unwrap();
    let first = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(2),
        })
        .unwrap();
    assert_eq!(first.texts(), &[" 4 5".to_string()]);

    // Clone at [1, 2, 3, 4, 5]; the clone starts with the parent's exact
    // context and state.
    let clone = session.try_clone().unwrap();
    assert_eq!(clone.state(), SessionState::Decoded);

    // Parent continues: prefill [9] appends, decode continues from 9.
    session.run_prefill(vec![InputData::Tokens(vec![9])]).unwrap();
    let parent_next = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(1),
        })
        .unwrap();
    assert_eq!(parent_next.texts(), &[" 10".to_string()]);

    // Clone diverges with a different continuation; copy-on-write keeps the
    // parent's tokens out of the clone's context.
    clone.run_prefill(vec![InputData::Tokens(vec![7])]).unwrap();
    let clone_next = clone
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(1),
        })
        .unwrap();
    assert_eq!(clone_next.texts(), &[" 8".to_string()]);

    // And the parent's context is still its own: continues from 10.
    session
        .run_prefill(vec![InputData::Tokens(vec![20])])
        .unwrap();
    let parent_after = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(1),
        })
        .unwrap();
    assert_eq!(parent_after.texts(), &[" 21".to_string()]);
}

#[test]
fn cancelling_a_queued_prefill_cascades_and_resets_the_chain() {
    // Park the execution worker on an unrelated session's prefill so the
    // interesting tasks stay queued.
    let gate = Gate::new();
    let executor = GatedExecutor::new(MockExecutor::new()).gate_prefill(gate.clone());
    let counters = executor.counters();
    let engine = Engine::new(EngineArgs::new(
        Box::new(executor),
        Arc::new(NumericTokenizer),
    ))
    .unwrap();

    let blocker = engine.create_session(SessionConfig::default()).unwrap();
    let session = engine.create_session(SessionConfig::default()).unwrap();

    let blocker_controller = blocker
        .run_prefill_async(vec![InputData::Tokens(vec![42])], Box::new(|_| {}))
        .unwrap();

    let prefill_result: Arc<Mutex<Option<ember_llm::Result<Responses>>>> =
        Arc::new(Mutex::new(None));
    let prefill_controller = session
        .run_prefill_async(vec![InputData::Tokens(vec![1, 2, 3])], {
            let prefill_result = prefill_result.clone();
            Box::new(move |result| {
                *prefill_result.lock() = Some(result);
            })
        })
        .unwrap();

    let decode_state = Arc::new(Mutex::new(None));
    let decode_controller = session
        .run_decode_async(
            {
                let decode_state = decode_state.clone();
                Box::new(move |result| {
                    if let Ok(responses) = result {
                        *decode_state.lock() = Some(responses.task_state());
                    }
                })
            },
            DecodeConfig::default(),
        )
        .unwrap();

    // Cancel the still-queued prefill, then let the worker go.
    prefill_controller.cancel().unwrap();
    gate.open();

    blocker_controller.wait_until_done(WAIT).unwrap();
    prefill_controller.wait_until_done(WAIT).unwrap();
    decode_controller.wait_until_done(WAIT).unwrap();

    let prefill_state = prefill_result
        .lock()
        .take()
        .unwrap()
        .unwrap()
        .task_state();
    assert_eq!(prefill_state, TaskState::Cancelled);
    assert_eq!(*decode_state.lock(), Some(TaskState::DependentTaskCancelled));

    // Only the blocker's tokens ever reached the executor.
    assert_eq!(counters.prefill_calls(), 1);
    assert_eq!(*counters.last_prefill_tokens.lock(), vec![42]);

    // The dependency chain was reset: the next turn succeeds instead of
    // inheriting the cancelled dependency.
    session
        .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
        .unwrap();
    let responses = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(1),
        })
        .unwrap();
    assert_eq!(responses.task_state(), TaskState::Done);
}

#[test]
fn generate_content_stream_streams_tokens_then_completes() {
    let engine = new_engine();
    let config = SessionConfig::builder()
        .max_output_tokens(3)
        .build()
        .unwrap();
    let session = engine.create_session(config).unwrap();

    let streamed: Arc<Mutex<Vec<(TaskState, String)>>> = Arc::new(Mutex::new(Vec::new()));
    session
        .generate_content_stream(
            vec![InputData::Tokens(vec![1, 2, 3])],
            {
                let streamed = streamed.clone();
                Box::new(move |result| {
                    if let Ok(responses) = result {
                        streamed
                            .lock()
                            .push((responses.task_state(), responses.texts().concat()));
                    }
                })
            },
            DecodeConfig::default(),
        )
        .unwrap();

    engine.wait_until_done(WAIT).unwrap();

    let events = streamed.lock();
    let running: Vec<&str> = events
        .iter()
        .filter(|(state, _)| *state == TaskState::Running)
        .map(|(_, text)| text.as_str())
        .collect();
    assert_eq!(running, vec![" 4", " 5", " 6"]);
    assert_eq!(events.last().map(|(state, _)| *state), Some(TaskState::Done));
}

#[test]
fn cancelled_stream_prefill_surfaces_structured_error() {
    let gate = Gate::new();
    let executor = GatedExecutor::new(MockExecutor::new()).gate_prefill(gate.clone());
    let engine = Engine::new(EngineArgs::new(
        Box::new(executor),
        Arc::new(NumericTokenizer),
    ))
    .unwrap();
    let session = engine.create_session(SessionConfig::default()).unwrap();

    let outcome: Arc<Mutex<Option<ember_llm::Result<Responses>>>> = Arc::new(Mutex::new(None));
    // Two chunks: the worker parks inside the first, the cancel lands
    // before the second.
    session
        .generate_content_stream(
            vec![
                InputData::Tokens(vec![1, 2]),
                InputData::Tokens(vec![3]),
            ],
            {
                let outcome = outcome.clone();
                Box::new(move |result| {
                    *outcome.lock() = Some(result);
                })
            },
            DecodeConfig::default(),
        )
        .unwrap();

    session.cancel().unwrap();
    gate.open();
    engine.wait_until_done(WAIT).unwrap();

    let result = outcome.lock().take().expect("stream callback must fire");
    let error = result.unwrap_err();
    assert!(error.is_cancelled());
    let rendered = error.to_string();
    assert!(rendered.contains("reason_code=PREFILL_TASK_CANCELLED_STATE"));
    assert!(rendered.contains("is_prefill=1"));
}

#[test]
fn text_scoring_prefers_the_model_continuation() {
    let engine = new_engine();

    // Score the continuation the mock would generate ("4 5" after [1,2,3]).
    let right = {
        let session = engine.create_session(SessionConfig::default()).unwrap();
        session
            .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
            .unwrap();
        let responses = session.run_text_scoring(&["4 5"], true).unwrap();
        assert_eq!(responses.task_state(), TaskState::Done);
        assert_eq!(responses.token_lengths(), Some(&[2usize, 2][..]));
        responses.scores()[0]
    };

    // An arbitrary continuation scores strictly lower.
    let wrong = {
        let session = engine.create_session(SessionConfig::default()).unwrap();
        session
            .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
            .unwrap();
        session.run_text_scoring(&["9 9"], false).unwrap().scores()[0]
    };

    assert!(right < 0.0);
    assert!(right > wrong);
}

#[test]
fn text_scoring_requires_a_single_target() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();
    let err = session
        .run_text_scoring(&["a", "b"], false)
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");
}

#[test]
fn failed_task_resets_the_chain_for_the_next_turn() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();
    session
        .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
        .unwrap();

    // Token 2000 is outside the mock vocabulary; the task fails on the
    // worker and the error reaches the synchronous wrapper.
    let err = session.run_text_scoring(&["2000"], false).unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    // The session is still usable: the failed task's ids were cleared from
    // the chain.
    let responses = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(1),
        })
        .unwrap();
    assert_eq!(responses.task_state(), TaskState::Done);
}

#[test]
fn benchmark_counters_track_prefill_and_decode() {
    let engine = Engine::new(
        EngineArgs::new(Box::new(MockExecutor::new()), Arc::new(NumericTokenizer))
            .with_benchmark(ember_llm::BenchmarkParams::default()),
    )
    .unwrap();
    let session = engine.create_session(SessionConfig::default()).unwrap();

    session
        .run_prefill(vec![InputData::Tokens(vec![1, 2, 3])])
        .unwrap();
    session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(2),
        })
        .unwrap();

    let info = session.benchmark_info().unwrap();
    assert_eq!(info.turns().len(), 1);
    assert_eq!(info.turns()[0].prefill_tokens, 3);
    assert_eq!(info.turns()[0].decode_tokens, 2);
    assert!(info.time_to_first_token().is_some());
}

#[test]
fn decode_config_zero_max_tokens_is_invalid() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();
    session
        .run_prefill(vec![InputData::Tokens(vec![1])])
        .unwrap();
    let err = session
        .run_decode_with_config(DecodeConfig {
            max_output_tokens: Some(0),
        })
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");
}

#[test]
fn unknown_text_during_preprocessing_fails_submission() {
    let engine = new_engine();
    let session = engine.create_session(SessionConfig::default()).unwrap();
    let err = session
        .run_prefill(vec![InputData::Text("not-a-number".to_string())])
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    let controller_err = session
        .run_prefill_async(
            vec![InputData::Text("also bad".to_string())],
            Box::new(|_| {}),
        )
        .unwrap_err();
    assert_eq!(controller_err.kind(), "NotFound");
}
