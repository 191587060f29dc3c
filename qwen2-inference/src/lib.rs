//! Qwen2 inference over memory-mapped GGUF models.
//!
//! The engine loads a quantized Qwen2 checkpoint (F32, Q8_0 or Q4_0 tensors)
//! straight from a GGUF file, tokenizes with the byte-level BPE vocabulary
//! shipped in the same file, and generates text either once (instruct) or
//! interactively (chat) with ChatML prompt framing.

pub mod chatml;
pub mod generation;
pub mod gguf;
pub mod sampler;
pub mod tensor;
pub mod tokenizer;
pub mod transformer;
mod utils;

use anyhow::Result;
use log::debug;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::generation::{run_chat, run_instruct};
use crate::sampler::Sampler;
use crate::transformer::ModelBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One framed turn, then exit.
    Instruct,
    /// Interactive conversation over stdin.
    Chat,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_path: String,
    pub temperature: f32,
    pub topp: f32,
    pub seed: u64,
    /// Token cap per generation; negative means the full context window.
    pub max_tokens: i64,
    pub mode: Mode,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub stream: bool,
    pub echo: bool,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    seed: Option<u64>,
    max_tokens: Option<i64>,
    mode: Option<Mode>,
    prompt: Option<String>,
    system_prompt: Option<String>,
    stream: Option<bool>,
    echo: Option<bool>,
}

impl InferenceConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn max_tokens(mut self, max_tokens: Option<i64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn mode(mut self, mode: Option<Mode>) -> Self {
        self.mode = mode;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn stream(mut self, stream: Option<bool>) -> Self {
        self.stream = stream;
        self
    }
    pub fn echo(mut self, echo: Option<bool>) -> Self {
        self.echo = echo;
        self
    }

    pub fn build(self) -> Result<InferenceConfig, String> {
        let config = InferenceConfig {
            model_path: self.model_path.ok_or("--model <path> is required")?,
            temperature: self.temperature.unwrap_or(0.1),
            topp: self.topp.unwrap_or(0.95),
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_nanos() as u64
            }),
            max_tokens: self.max_tokens.unwrap_or(512),
            mode: self.mode.unwrap_or(Mode::Instruct),
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            stream: self.stream.unwrap_or(true),
            echo: self.echo.unwrap_or(false),
        };

        if config.temperature < 0.0 {
            return Err("--temperature must be non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&config.topp) {
            return Err("--top-p must be within [0, 1]".to_string());
        }
        if config.mode == Mode::Instruct && config.prompt.is_none() {
            return Err("--prompt is required in instruct mode".to_string());
        }
        Ok(config)
    }
}

/// Loads the model and runs the configured mode to completion.
pub fn run_inference(config: InferenceConfig) -> Result<()> {
    debug!("{config:#?}");

    let model = ModelBuilder::new(&config.model_path)
        .with_context_length((config.max_tokens > 0).then_some(config.max_tokens as usize))
        .build()?;

    debug!("{model:?}");

    let mut sampler = Sampler::new(
        model.config().vocab_size,
        config.temperature,
        config.topp,
        config.seed,
    );

    match config.mode {
        Mode::Instruct => run_instruct(
            &model,
            &mut sampler,
            config.prompt.as_deref().unwrap_or(""),
            config.system_prompt.as_deref(),
            config.max_tokens,
            config.stream,
            config.echo,
        ),
        Mode::Chat => run_chat(
            &model,
            &mut sampler,
            config.system_prompt.as_deref(),
            config.max_tokens,
            config.stream,
            config.echo,
        ),
    }
}
