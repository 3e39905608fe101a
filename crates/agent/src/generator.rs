use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::time::Instant;

use crate::llm::{FragmentStream, LlmClient, LlmError};
use crate::prompts::{ChatterPrompt, PromptError, PromptLibrary};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("generation could not start: {0}")]
    Llm(#[from] LlmError),
    #[error("generation did not start before the deadline")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    /// The model stream broke or the deadline passed; nothing follows.
    Failed(String),
}

/// One in-flight answer. Fragments are pulled one at a time and buffered as they arrive.
pub struct Generation {
    stream: Option<FragmentStream>,
    deadline: Instant,
    fragments: Vec<String>,
    failure: Option<String>,
}

impl Generation {
    pub fn new(stream: FragmentStream, deadline: Instant) -> Self {
        Self { stream: Some(stream), deadline, fragments: Vec::new(), failure: None }
    }

    pub async fn next_fragment(&mut self) -> Option<Fragment> {
        let stream = self.stream.as_mut()?;

        let fragment = match tokio::time::timeout_at(self.deadline, stream.next()).await {
            Ok(Some(Ok(text))) => {
                self.fragments.push(text.clone());
                return Some(Fragment::Text(text));
            }
            Ok(Some(Err(error))) => Fragment::Failed(error.to_string()),
            Ok(None) => {
                self.stream = None;
                return None;
            }
            Err(_) => Fragment::Failed("generation deadline elapsed".to_string()),
        };

        self.stream = None;
        if let Fragment::Failed(reason) = &fragment {
            self.failure = Some(reason.clone());
        }
        Some(fragment)
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn text(&self) -> String {
        self.fragments.concat()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

pub struct ResponseGenerator {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
}

impl ResponseGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptLibrary>) -> Self {
        Self { llm, prompts }
    }

    pub async fn start(
        &self,
        prompt: &ChatterPrompt<'_>,
        deadline: Instant,
    ) -> Result<Generation, GenerationError> {
        let messages = self.prompts.chatter(prompt)?;
        let stream = tokio::time::timeout_at(deadline, self.llm.stream(&messages))
            .await
            .map_err(|_| GenerationError::Timeout)??;
        Ok(Generation::new(stream, deadline))
    }
}
