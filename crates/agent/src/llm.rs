use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dataagent_core::structured_output::{FixerError, OutputFixer};
use futures::stream::BoxStream;
use tera::Context;

use crate::prompts::PromptRegistry;

/// Fragments of one streamed completion, in arrival order.
pub type TextStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_stream(&self, system: Option<&str>, user: &str) -> Result<TextStream>;

    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String>;
}

#[async_trait]
impl<G> TextGenerator for Arc<G>
where
    G: TextGenerator + ?Sized,
{
    async fn generate_stream(&self, system: Option<&str>, user: &str) -> Result<TextStream> {
        (**self).generate_stream(system, user).await
    }

    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        (**self).complete(prompt, temperature).await
    }
}

/// Asks the model to correct its own malformed JSON using the `json-fix` prompt.
pub struct LlmOutputFixer {
    generator: Arc<dyn TextGenerator>,
    prompts: Arc<PromptRegistry>,
    temperature: f32,
}

impl LlmOutputFixer {
    pub fn new(generator: Arc<dyn TextGenerator>, prompts: Arc<PromptRegistry>) -> Self {
        Self { generator, prompts, temperature: 0.0 }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl OutputFixer for LlmOutputFixer {
    async fn fix(&self, content: &str, error_message: &str) -> Result<String, FixerError> {
        let mut context = Context::new();
        context.insert("content", content);
        context.insert("error", error_message);
        let prompt = self
            .prompts
            .render("json-fix", &context)
            .map_err(|error| FixerError(error.to_string()))?;

        self.generator
            .complete(&prompt, self.temperature)
            .await
            .map_err(|error| FixerError(error.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use futures::stream;

    use super::{TextGenerator, TextStream};

    /// Replays canned answers in call order and records every prompt it saw.
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        answers: Mutex<VecDeque<Result<String, String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new<I, S>(answers: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                answers: Mutex::new(answers.into_iter().map(|answer| Ok(answer.into())).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn push_answer(&self, answer: &str) {
            self.answers.lock().expect("script lock").push_back(Ok(answer.to_string()));
        }

        pub(crate) fn push_failure(&self, message: &str) {
            self.answers.lock().expect("script lock").push_back(Err(message.to_string()));
        }

        pub(crate) fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("prompt lock").clone()
        }

        pub(crate) fn remaining(&self) -> usize {
            self.answers.lock().expect("script lock").len()
        }

        fn next(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().expect("prompt lock").push(prompt.to_string());
            match self.answers.lock().expect("script lock").pop_front() {
                Some(Ok(answer)) => Ok(answer),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Err(anyhow!("scripted generator has no answers left")),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate_stream(&self, _system: Option<&str>, user: &str) -> Result<TextStream> {
            let answer = self.next(user)?;
            let middle = answer.char_indices().nth(answer.chars().count() / 2).map_or(0, |(i, _)| i);
            let (head, tail) = answer.split_at(middle);
            let chunks: Vec<Result<String>> = [head, tail]
                .into_iter()
                .filter(|chunk| !chunk.is_empty())
                .map(|chunk| Ok(chunk.to_string()))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn complete(&self, prompt: &str, _temperature: f32) -> Result<String> {
            self.next(prompt)
        }
    }
}
