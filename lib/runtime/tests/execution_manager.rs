// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler behavior: ordering, dependency cascades, cancellation,
//! callback discipline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_runtime::testing::{Gate, GatedExecutor, MockCounters, MockExecutor, NumericTokenizer};
use ember_runtime::{
    is_task_end_state, ExecutionManager, InputData, Responses, Result, SessionConfig, TaskState,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(10);

fn new_manager() -> (Arc<ExecutionManager>, Arc<MockCounters>) {
    let executor = MockExecutor::new();
    let counters = executor.counters();
    let manager = ExecutionManager::new(
        Box::new(executor),
        None,
        None,
        Arc::new(NumericTokenizer),
    )
    .unwrap();
    (manager, counters)
}

fn no_cancel() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

/// Collects every callback delivery for later inspection.
#[derive(Default)]
struct Deliveries {
    events: Mutex<Vec<(String, Result<Responses>)>>,
}

impl Deliveries {
    fn callback(self: Arc<Self>, label: &str) -> ember_runtime::TaskCallback {
        let label = label.to_string();
        Box::new(move |result| {
            self.events.lock().push((label.clone(), result));
        })
    }

    fn labels(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    fn terminal_state_of(&self, label: &str) -> Option<TaskState> {
        self.events
            .lock()
            .iter()
            .filter(|(l, _)| l == label)
            .filter_map(|(_, result)| result.as_ref().ok().map(|r| r.task_state()))
            .find(|state| is_task_end_state(*state))
    }
}

#[test]
fn prefill_then_decode_produces_consecutive_tokens() {
    let (manager, counters) = new_manager();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();
    let deliveries = Arc::new(Deliveries::default());

    let prefill_id = manager.new_task_id();
    manager
        .add_prefill_task(
            session,
            prefill_id,
            vec![InputData::Tokens(vec![1, 2, 3])],
            HashSet::new(),
            no_cancel(),
            deliveries.clone().callback("prefill"),
        )
        .unwrap();

    let decode_id = manager.new_task_id();
    manager
        .add_decode_task(
            session,
            decode_id,
            HashSet::from([prefill_id]),
            no_cancel(),
            deliveries.clone().callback("decode"),
            4,
        )
        .unwrap();

    manager.wait_until_all_done(WAIT).unwrap();

    assert_eq!(deliveries.terminal_state_of("prefill"), Some(TaskState::Done));
    assert_eq!(deliveries.terminal_state_of("decode"), Some(TaskState::Done));
    assert_eq!(counters.decode_calls(), 4);

    // Streaming deliveries carry the decoded tokens in order: 4 5 6 7.
    let streamed: String = deliveries
        .events
        .lock()
        .iter()
        .filter(|(label, _)| label == "decode")
        .filter_map(|(_, result)| result.as_ref().ok())
        .flat_map(|responses| responses.texts().iter().cloned())
        .collect();
    assert_eq!(streamed, " 4 5 6 7");
}

#[test]
fn cancelled_prefill_cascades_to_dependent_decode() {
    let (manager, counters) = new_manager();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();
    let deliveries = Arc::new(Deliveries::default());

    // The flag is set before submission, so the worker observes the cancel
    // before any executor call.
    let cancelled = Arc::new(AtomicBool::new(true));
    let prefill_id = manager.new_task_id();
    manager
        .add_prefill_task(
            session,
            prefill_id,
            vec![InputData::Tokens(vec![1, 2, 3])],
            HashSet::new(),
            cancelled,
            deliveries.clone().callback("prefill"),
        )
        .unwrap();

    let decode_id = manager.new_task_id();
    manager
        .add_decode_task(
            session,
            decode_id,
            HashSet::from([prefill_id]),
            no_cancel(),
            deliveries.clone().callback("decode"),
            4,
        )
        .unwrap();

    manager.wait_until_all_done(WAIT).unwrap();

    assert_eq!(
        deliveries.terminal_state_of("prefill"),
        Some(TaskState::Cancelled)
    );
    assert_eq!(
        deliveries.terminal_state_of("decode"),
        Some(TaskState::DependentTaskCancelled)
    );
    // Neither task reached the executor.
    assert_eq!(counters.prefill_calls(), 0);
    assert_eq!(counters.decode_calls(), 0);
    // The prefill's terminal delivery precedes the dependent's.
    assert_eq!(deliveries.labels(), vec!["prefill", "decode"]);
}

#[test]
fn dependency_already_terminal_at_submission_short_circuits() {
    let (manager, counters) = new_manager();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();
    let deliveries = Arc::new(Deliveries::default());

    let cancelled = Arc::new(AtomicBool::new(true));
    let first = manager.new_task_id();
    manager
        .add_prefill_task(
            session,
            first,
            vec![InputData::Tokens(vec![1])],
            HashSet::new(),
            cancelled,
            deliveries.clone().callback("first"),
        )
        .unwrap();
    manager.wait_until_all_done(WAIT).unwrap();

    // `first` is already Cancelled; the new task must synthesize its
    // terminal state at submission and only its callback runs.
    let second = manager.new_task_id();
    manager
        .add_prefill_task(
            session,
            second,
            vec![InputData::Tokens(vec![2])],
            HashSet::from([first]),
            no_cancel(),
            deliveries.clone().callback("second"),
        )
        .unwrap();
    manager.wait_until_all_done(WAIT).unwrap();

    assert_eq!(
        deliveries.terminal_state_of("second"),
        Some(TaskState::DependentTaskCancelled)
    );
    assert_eq!(counters.prefill_calls(), 0);
}

#[test]
fn construction_rejects_multithreaded_executor() {
    let err = ExecutionManager::new(
        Box::new(MockExecutor::with_num_threads(2)),
        None,
        None,
        Arc::new(NumericTokenizer),
    )
    .unwrap_err();
    assert_eq!(err.kind(), "Internal");
}

#[test]
fn callbacks_fire_exactly_once_per_task_in_submission_order() {
    let (manager, _counters) = new_manager();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();
    let deliveries = Arc::new(Deliveries::default());

    let mut previous: Option<u64> = None;
    for label in ["a", "b", "c"] {
        let task_id = manager.new_task_id();
        let deps = previous.map(|id| HashSet::from([id])).unwrap_or_default();
        manager
            .add_prefill_task(
                session,
                task_id,
                vec![InputData::Tokens(vec![1])],
                deps,
                no_cancel(),
                deliveries.clone().callback(label),
            )
            .unwrap();
        previous = Some(task_id);
    }

    manager.wait_until_all_done(WAIT).unwrap();
    assert_eq!(deliveries.labels(), vec!["a", "b", "c"]);
    for label in ["a", "b", "c"] {
        assert_eq!(deliveries.terminal_state_of(label), Some(TaskState::Done));
    }
}

#[test]
fn callback_may_reenter_the_manager_without_deadlock() {
    let gate = Gate::new();
    let executor = GatedExecutor::new(MockExecutor::new()).gate_decode(gate.clone());
    let manager = ExecutionManager::new(
        Box::new(executor),
        None,
        None,
        Arc::new(NumericTokenizer),
    )
    .unwrap();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();

    let prefill_id = manager.new_task_id();
    let reentered = Arc::new(AtomicBool::new(false));
    let prefill_callback: ember_runtime::TaskCallback = {
        let manager = manager.clone();
        let gate = gate.clone();
        let reentered = reentered.clone();
        Box::new(move |_result| {
            // Re-enter the manager from the callback: reads both tables and
            // cancels the session's in-flight decode.
            manager.session_config(session).unwrap();
            manager.cancel_session(session).unwrap();
            reentered.store(true, Ordering::SeqCst);
            gate.open();
        })
    };
    manager
        .add_prefill_task(
            session,
            prefill_id,
            vec![InputData::Tokens(vec![1, 2, 3])],
            HashSet::new(),
            no_cancel(),
            prefill_callback,
        )
        .unwrap();

    let decode_id = manager.new_task_id();
    let decode_state = Arc::new(Mutex::new(None));
    let decode_callback: ember_runtime::TaskCallback = {
        let decode_state = decode_state.clone();
        Box::new(move |result| {
            if let Ok(responses) = &result {
                if is_task_end_state(responses.task_state()) {
                    *decode_state.lock() = Some(responses.task_state());
                }
            }
        })
    };
    manager
        .add_decode_task(
            session,
            decode_id,
            HashSet::from([prefill_id]),
            no_cancel(),
            decode_callback,
            64,
        )
        .unwrap();

    manager.wait_until_all_done(WAIT).unwrap();
    assert!(reentered.load(Ordering::SeqCst));
    // The in-flight decode observed the session cancel at a cancel point.
    assert_eq!(*decode_state.lock(), Some(TaskState::Cancelled));
}

#[test]
fn failed_task_error_reaches_callback_and_fails_dependents() {
    let (manager, _counters) = new_manager();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();

    // Token 2000 is outside the mock vocabulary (1024); scoring fails on
    // the worker, after task creation.
    let scoring_id = manager.new_task_id();
    let scoring_error = Arc::new(Mutex::new(None));
    let scoring_callback: ember_runtime::TaskCallback = {
        let scoring_error = scoring_error.clone();
        Box::new(move |result| {
            if let Err(error) = result {
                *scoring_error.lock() = Some(error.kind());
            }
        })
    };
    manager
        .add_text_scoring_task(
            session,
            scoring_id,
            HashSet::new(),
            "2000".to_string(),
            false,
            no_cancel(),
            scoring_callback,
        )
        .unwrap();

    let dependent_id = manager.new_task_id();
    let dependent_state = Arc::new(Mutex::new(None));
    let dependent_callback: ember_runtime::TaskCallback = {
        let dependent_state = dependent_state.clone();
        Box::new(move |result| {
            if let Ok(responses) = result {
                *dependent_state.lock() = Some(responses.task_state());
            }
        })
    };
    manager
        .add_prefill_task(
            session,
            dependent_id,
            vec![InputData::Tokens(vec![1])],
            HashSet::from([scoring_id]),
            no_cancel(),
            dependent_callback,
        )
        .unwrap();

    manager.wait_until_all_done(WAIT).unwrap();
    assert_eq!(*scoring_error.lock(), Some("NotFound"));
    assert_eq!(*dependent_state.lock(), Some(TaskState::DependentTaskFailed));
}

#[test]
fn decode_streams_one_delivery_per_token() {
    let (manager, _counters) = new_manager();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();

    let prefill_id = manager.new_task_id();
    manager
        .add_prefill_task(
            session,
            prefill_id,
            vec![InputData::Tokens(vec![7])],
            HashSet::new(),
            no_cancel(),
            Box::new(|_| {}),
        )
        .unwrap();

    let decode_id = manager.new_task_id();
    let running = Arc::new(AtomicUsize::new(0));
    let terminal = Arc::new(AtomicUsize::new(0));
    let decode_callback: ember_runtime::TaskCallback = {
        let running = running.clone();
        let terminal = terminal.clone();
        Box::new(move |result| {
            let Ok(responses) = result else { return };
            if responses.task_state() == TaskState::Running {
                running.fetch_add(1, Ordering::SeqCst);
            } else if is_task_end_state(responses.task_state()) {
                terminal.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    manager
        .add_decode_task(
            session,
            decode_id,
            HashSet::from([prefill_id]),
            no_cancel(),
            decode_callback,
            3,
        )
        .unwrap();

    manager.wait_until_all_done(WAIT).unwrap();
    assert_eq!(running.load(Ordering::SeqCst), 3);
    assert_eq!(terminal.load(Ordering::SeqCst), 1);
}

#[test]
fn waits_report_not_found_and_deadline() {
    let (manager, _counters) = new_manager();
    let err = manager
        .wait_until_task_done(9999, Duration::from_millis(50))
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    // A decode parked on a closed gate exceeds the wait deadline; the task
    // itself is not cancelled by the timeout.
    let gate = Gate::new();
    let executor = GatedExecutor::new(MockExecutor::new()).gate_prefill(gate.clone());
    let manager = ExecutionManager::new(
        Box::new(executor),
        None,
        None,
        Arc::new(NumericTokenizer),
    )
    .unwrap();
    let session = manager
        .register_session(SessionConfig::default(), None)
        .unwrap();
    let task_id = manager.new_task_id();
    manager
        .add_prefill_task(
            session,
            task_id,
            vec![InputData::Tokens(vec![1])],
            HashSet::new(),
            no_cancel(),
            Box::new(|_| {}),
        )
        .unwrap();

    let err = manager
        .wait_until_task_done(task_id, Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err.kind(), "DeadlineExceeded");

    gate.open();
    manager.wait_until_task_done(task_id, WAIT).unwrap();
    assert_eq!(manager.task_state(task_id).unwrap(), TaskState::Done);
}
