use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::llm::LlmClient;
use crate::prompts::PromptLibrary;
use crate::tools::{summary_text, summary_tool};

/// Appends this turn's exchange to the running context.
pub fn fold_turn(prior: &str, query: &str, answer: &str) -> String {
    let entry = format!("USER QUERY: {query}\nRESPONSE: {answer}");
    if prior.trim().is_empty() {
        entry
    } else {
        format!("{prior}\n{entry}")
    }
}

/// Keeps the most recent `max_chars` characters.
pub fn truncate_to_recent(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryOutcome {
    pub context: String,
    pub summarized: bool,
    pub degraded: bool,
}

pub struct ContextSummarizer {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    memory_length: usize,
    timeout: Duration,
}

impl ContextSummarizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        memory_length: usize,
        timeout: Duration,
    ) -> Self {
        Self { llm, prompts, memory_length, timeout }
    }

    pub async fn summarize(&self, prior: &str, query: &str, answer: &str) -> SummaryOutcome {
        let folded = fold_turn(prior, query, answer);
        if folded.chars().count() <= self.memory_length {
            return SummaryOutcome { context: folded, summarized: false, degraded: false };
        }

        let messages = match self.prompts.summary(&folded) {
            Ok(messages) => messages,
            Err(error) => {
                warn!(event_name = "turn.summary.prompt_failed", error = %error, "truncating context");
                return self.truncated(&folded);
            }
        };
        let tools = [summary_tool()];

        match tokio::time::timeout(self.timeout, self.llm.call_tool(&messages, &tools)).await {
            Ok(Ok(call)) => match summary_text(&call.arguments) {
                Some(summary) => {
                    info!(
                        event_name = "turn.summary.applied",
                        before_chars = folded.chars().count(),
                        after_chars = summary.chars().count(),
                        "context summarized"
                    );
                    SummaryOutcome {
                        context: truncate_to_recent(&summary, self.memory_length),
                        summarized: true,
                        degraded: false,
                    }
                }
                None => {
                    warn!(event_name = "turn.summary.empty", "summary tool returned no text");
                    self.truncated(&folded)
                }
            },
            Ok(Err(error)) => {
                warn!(event_name = "turn.summary.failed", error = %error, "truncating context");
                self.truncated(&folded)
            }
            Err(_) => {
                warn!(event_name = "turn.summary.timeout", "truncating context");
                self.truncated(&folded)
            }
        }
    }

    fn truncated(&self, folded: &str) -> SummaryOutcome {
        SummaryOutcome {
            context: truncate_to_recent(folded, self.memory_length),
            summarized: false,
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{fold_turn, truncate_to_recent, ContextSummarizer};
    use crate::llm::{ChatMessage, FragmentStream, LlmClient, LlmError, ToolCall, ToolSpec};
    use crate::prompts::PromptLibrary;

    struct SummaryLlm(Result<ToolCall, LlmError>);

    #[async_trait]
    impl LlmClient for SummaryLlm {
        async fn complete(&self, _: &[ChatMessage], _: u32) -> Result<String, LlmError> {
            Ok(String::new())
        }

        async fn call_tool(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ToolCall, LlmError> {
            self.0.clone()
        }

        async fn stream(&self, _: &[ChatMessage]) -> Result<FragmentStream, LlmError> {
            Err(LlmError::Transport("not used".to_string()))
        }
    }

    fn summarizer(result: Result<ToolCall, LlmError>, memory_length: usize) -> ContextSummarizer {
        ContextSummarizer::new(
            Arc::new(SummaryLlm(result)),
            Arc::new(PromptLibrary::new("route", "chat", "sum").expect("prompts")),
            memory_length,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn fold_appends_exchange() {
        assert_eq!(fold_turn("", "hi", "hello"), "USER QUERY: hi\nRESPONSE: hello");
        assert_eq!(fold_turn("old", "hi", "hello"), "old\nUSER QUERY: hi\nRESPONSE: hello");
    }

    #[test]
    fn truncation_keeps_recent_text_on_char_boundaries() {
        assert_eq!(truncate_to_recent("abcdef", 3), "def");
        assert_eq!(truncate_to_recent("héllo wörld", 5), "wörld");
        assert_eq!(truncate_to_recent("short", 10), "short");
    }

    #[tokio::test]
    async fn short_context_skips_the_model() {
        let outcome = summarizer(Err(LlmError::MissingToolCall), 1_000)
            .summarize("", "hi", "hello")
            .await;

        assert!(!outcome.summarized);
        assert!(!outcome.degraded);
        assert_eq!(outcome.context, "USER QUERY: hi\nRESPONSE: hello");
    }

    #[tokio::test]
    async fn long_context_is_replaced_by_summary() {
        let call = ToolCall {
            name: "summarizer".to_string(),
            arguments: json!({"summary": "User likes red dresses."}),
        };
        let outcome = summarizer(Ok(call), 40).summarize(&"x".repeat(100), "hi", "hello").await;

        assert!(outcome.summarized);
        assert_eq!(outcome.context, "User likes red dresses.");
    }

    #[tokio::test]
    async fn failed_summary_still_respects_the_bound() {
        let outcome = summarizer(Err(LlmError::Transport("down".to_string())), 20)
            .summarize(&"x".repeat(100), "hi", "hello")
            .await;

        assert!(outcome.degraded);
        assert_eq!(outcome.context.chars().count(), 20);
        assert!(outcome.context.ends_with("RESPONSE: hello"));
    }
}
