// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The engine facade.

use std::sync::Arc;
use std::time::Duration;

use ember_runtime::{
    AudioExecutor, BenchmarkParams, ExecutionManager, LlmExecutor, LoraAssets, Result,
    SessionConfig, VisionExecutor,
};
use ember_tokens::Tokenizer;

use crate::session::Session;
use crate::template::PromptTemplate;

/// Default timeout for the synchronous operation wrappers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to bring up an engine. The executor and tokenizer are
/// external collaborators; model loading is out of scope.
pub struct EngineArgs {
    executor: Box<dyn LlmExecutor>,
    tokenizer: Arc<dyn Tokenizer>,
    audio_executor: Option<Box<dyn AudioExecutor>>,
    vision_executor: Option<Box<dyn VisionExecutor>>,
    template: PromptTemplate,
    benchmark: Option<BenchmarkParams>,
}

impl EngineArgs {
    pub fn new(executor: Box<dyn LlmExecutor>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            executor,
            tokenizer,
            audio_executor: None,
            vision_executor: None,
            template: PromptTemplate::default(),
            benchmark: None,
        }
    }

    pub fn with_audio_executor(mut self, audio_executor: Box<dyn AudioExecutor>) -> Self {
        self.audio_executor = Some(audio_executor);
        self
    }

    pub fn with_vision_executor(mut self, vision_executor: Box<dyn VisionExecutor>) -> Self {
        self.vision_executor = Some(vision_executor);
        self
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    /// Enable per-session benchmark counters.
    pub fn with_benchmark(mut self, params: BenchmarkParams) -> Self {
        self.benchmark = Some(params);
        self
    }
}

/// Owns the execution manager; hands out sessions.
pub struct Engine {
    manager: Arc<ExecutionManager>,
    tokenizer: Arc<dyn Tokenizer>,
    template: PromptTemplate,
    benchmark: Option<BenchmarkParams>,
}

impl Engine {
    pub fn new(args: EngineArgs) -> Result<Self> {
        let EngineArgs {
            executor,
            tokenizer,
            audio_executor,
            vision_executor,
            template,
            benchmark,
        } = args;
        let manager =
            ExecutionManager::new(executor, audio_executor, vision_executor, tokenizer.clone())?;
        tracing::info!("engine constructed");
        Ok(Self {
            manager,
            tokenizer,
            template,
            benchmark,
        })
    }

    pub fn create_session(&self, config: SessionConfig) -> Result<Session> {
        let session_id = self.manager.register_session(config.clone(), self.benchmark)?;
        Ok(Session::new(
            session_id,
            Arc::downgrade(&self.manager),
            self.tokenizer.clone(),
            config,
            self.template.clone(),
        ))
    }

    /// Block until every task submitted through any session has retired.
    pub fn wait_until_done(&self, timeout: Duration) -> Result<()> {
        self.manager.wait_until_all_done(timeout)
    }

    /// Load a LoRA adapter outside of any session context.
    pub fn load_lora(&self, key: &str, assets: &LoraAssets) -> Result<u32> {
        self.manager.resource_manager().load_lora(key, assets)
    }

    pub fn unload_lora(&self, lora_id: u32) -> Result<()> {
        self.manager.resource_manager().unload_lora(lora_id)
    }

    pub fn vocab_size(&self) -> Result<usize> {
        self.manager.vocab_size()
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }
}
