// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session-level input/output types and benchmark counters.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ember_tokens::TokenId;
use serde::{Deserialize, Serialize};

use crate::execution::TaskState;

/// Raw image pixels handed to the vision encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// Audio spectrogram handed to the audio encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub spectrogram: Vec<f32>,
}

/// One piece of session input. Text is tokenized during preprocessing;
/// images and audio are encoded on the execution worker.
#[derive(Debug, Clone)]
pub enum InputData {
    Text(String),
    Tokens(Vec<TokenId>),
    Image(ImageData),
    Audio(AudioData),
}

/// Task output delivered to callbacks.
///
/// `texts` has one entry per output candidate. Decode tasks deliver
/// incremental `Responses` (state [`TaskState::Running`]) once per decode
/// step, then a final one with a terminal state; their `scores` stay empty
/// because the executor's decode samples ids without reporting likelihoods.
/// Text-scoring tasks populate `scores` (and leave `texts` empty).
#[derive(Debug, Clone, Default)]
pub struct Responses {
    task_state: TaskState,
    texts: Vec<String>,
    scores: Vec<f32>,
    token_lengths: Option<Vec<usize>>,
}

impl Responses {
    pub fn new(task_state: TaskState, texts: Vec<String>, scores: Vec<f32>) -> Self {
        Self {
            task_state,
            texts,
            scores,
            token_lengths: None,
        }
    }

    pub fn with_state(task_state: TaskState) -> Self {
        Self {
            task_state,
            ..Self::default()
        }
    }

    pub fn task_state(&self) -> TaskState {
        self.task_state
    }

    pub fn set_task_state(&mut self, state: TaskState) {
        self.task_state = state;
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn texts_mut(&mut self) -> &mut Vec<String> {
        &mut self.texts
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn scores_mut(&mut self) -> &mut Vec<f32> {
        &mut self.scores
    }

    pub fn token_lengths(&self) -> Option<&[usize]> {
        self.token_lengths.as_deref()
    }

    pub fn set_token_lengths(&mut self, lengths: Vec<usize>) {
        self.token_lengths = Some(lengths);
    }
}

/// Synthetic-load knobs for benchmarking sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkParams {
    /// When non-zero, prefill inputs are replaced with this many synthetic
    /// tokens.
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitPhase {
    Executor,
    Tokenizer,
}

/// Prefill/decode counters for one conversation turn.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TurnStats {
    pub prefill_tokens: usize,
    pub prefill_duration: Duration,
    pub decode_tokens: usize,
    pub decode_duration: Duration,
}

impl TurnStats {
    pub fn prefill_tokens_per_second(&self) -> f64 {
        per_second(self.prefill_tokens, self.prefill_duration)
    }

    pub fn decode_tokens_per_second(&self) -> f64 {
        per_second(self.decode_tokens, self.decode_duration)
    }
}

fn per_second(tokens: usize, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    tokens as f64 / secs
}

/// Per-session benchmark counters.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkInfo {
    params: BenchmarkParams,
    init_phase_starts: HashMap<InitPhase, Instant>,
    init_phases: HashMap<InitPhase, Duration>,
    session_start: Option<Instant>,
    time_to_first_token: Option<Duration>,
    turns: Vec<TurnStats>,
}

impl BenchmarkInfo {
    pub fn new(params: BenchmarkParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn params(&self) -> BenchmarkParams {
        self.params
    }

    pub fn time_init_phase_start(&mut self, phase: InitPhase) {
        self.init_phase_starts.insert(phase, Instant::now());
    }

    pub fn time_init_phase_end(&mut self, phase: InitPhase) {
        if let Some(start) = self.init_phase_starts.remove(&phase) {
            self.init_phases.insert(phase, start.elapsed());
        }
    }

    pub fn init_phase_duration(&self, phase: InitPhase) -> Option<Duration> {
        self.init_phases.get(&phase).copied()
    }

    /// Marks the start of the first prefill; time-to-first-token is measured
    /// from here.
    pub fn mark_session_start(&mut self) {
        if self.session_start.is_none() {
            self.session_start = Some(Instant::now());
        }
    }

    pub fn mark_first_token(&mut self) {
        self.mark_first_token_at(Instant::now());
    }

    /// Record time-to-first-token against a timestamp captured when the
    /// token was actually produced.
    pub fn mark_first_token_at(&mut self, at: Instant) {
        if self.time_to_first_token.is_none() {
            if let Some(start) = self.session_start {
                self.time_to_first_token = Some(at.saturating_duration_since(start));
            }
        }
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.time_to_first_token
    }

    pub fn record_prefill_turn(&mut self, tokens: usize, duration: Duration) {
        self.turns.push(TurnStats {
            prefill_tokens: tokens,
            prefill_duration: duration,
            ..TurnStats::default()
        });
    }

    pub fn record_decode_turn(&mut self, tokens: usize, duration: Duration) {
        match self.turns.last_mut() {
            Some(turn) if turn.decode_tokens == 0 => {
                turn.decode_tokens = tokens;
                turn.decode_duration = duration;
            }
            _ => self.turns.push(TurnStats {
                decode_tokens: tokens,
                decode_duration: duration,
                ..TurnStats::default()
            }),
        }
    }

    pub fn turns(&self) -> &[TurnStats] {
        &self.turns
    }
}
