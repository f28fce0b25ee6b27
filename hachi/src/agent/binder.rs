//! Session binding: history loading, summarisation, and write-back.
//!
//! Reading happens at run start; writing happens once, on completion or
//! terminal failure, as a single contiguous batch of the run's committed
//! messages (everything up to the last fully-integrated step). If the
//! backend fails mid-append, the binder deletes whatever the failed batch
//! left behind so the session never exposes a partial run.

use serde_json::Value;
use tracing::warn;

use crate::chat::{ChatRequest, SharedChatProvider};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::session::SharedSession;
use crate::trace::TraceContext;

/// Default number of characters extracted per message by the
/// deterministic summariser.
pub const DEFAULT_EXTRACT_CHARS: usize = 100;

/// A model used to write conversation summaries.
#[derive(Clone)]
pub struct Summarizer {
    /// The provider to call.
    pub provider: SharedChatProvider,
    /// Model identifier.
    pub model: String,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// When and how to collapse old session history.
#[derive(Clone, Debug)]
pub struct SummarizeConfig {
    /// Collapse once history exceeds this many messages.
    pub trigger_len: usize,
    /// Keep this many recent messages verbatim.
    pub keep_recent: usize,
    /// Summariser model; without one, a deterministic extraction is used.
    pub summarizer: Option<Summarizer>,
    /// Characters taken per message by the deterministic extraction.
    pub extract_chars: usize,
}

impl SummarizeConfig {
    /// Summarise once history exceeds `trigger_len`, keeping the last
    /// `keep_recent` messages verbatim.
    #[must_use]
    pub const fn new(trigger_len: usize, keep_recent: usize) -> Self {
        Self {
            trigger_len,
            keep_recent,
            summarizer: None,
            extract_chars: DEFAULT_EXTRACT_CHARS,
        }
    }

    /// Use a model to write the summary.
    #[must_use]
    pub fn with_summarizer(mut self, provider: SharedChatProvider, model: impl Into<String>) -> Self {
        self.summarizer = Some(Summarizer {
            provider,
            model: model.into(),
        });
        self
    }

    /// Characters per message for the deterministic extraction.
    #[must_use]
    pub const fn extract_chars(mut self, chars: usize) -> Self {
        self.extract_chars = chars;
        self
    }
}

pub(crate) struct SessionBinder;

impl SessionBinder {
    /// Load prior history, collapsing old messages per the summarisation
    /// policy when configured.
    pub(crate) async fn load(
        session: &SharedSession,
        summarize: Option<&SummarizeConfig>,
        trace: &TraceContext,
    ) -> Result<Vec<Message>> {
        let span = trace.session("read");
        let _entered = span.span().enter();

        let history = session.get_messages(None).await?;

        let Some(config) = summarize else {
            return Ok(history);
        };
        if history.len() <= config.trigger_len {
            return Ok(history);
        }

        let split = history.len().saturating_sub(config.keep_recent);
        let (older, recent) = history.split_at(split);

        let summary = match &config.summarizer {
            Some(summarizer) => Self::model_summary(summarizer, older).await?,
            None => Self::extract_summary(older, config.extract_chars),
        };

        let mut compacted =
            vec![Message::system(format!("Summary of earlier conversation:\n{summary}"))];
        compacted.extend(recent.iter().cloned());
        Ok(compacted)
    }

    /// Append the run's committed messages as one batch.
    ///
    /// On append failure, pops whatever the failed batch managed to write
    /// (compensating deletion) so the caller sees all-or-nothing.
    pub(crate) async fn write(
        session: &SharedSession,
        messages: &[Message],
        trace: &TraceContext,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let span = trace.session("append");
        let _entered = span.span().enter();

        let len_before = session.len().await.unwrap_or(0);
        match session.add_messages(messages).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let len_after = session.len().await.unwrap_or(len_before);
                let partial = len_after.saturating_sub(len_before);
                for _ in 0..partial {
                    let _ = session.pop_message().await;
                }
                warn!(error = %err, rolled_back = partial, "Session append failed");
                Err(Error::session(err.to_string()))
            }
        }
    }

    async fn model_summary(summarizer: &Summarizer, older: &[Message]) -> Result<String> {
        let transcript: String = older
            .iter()
            .map(|m| {
                format!(
                    "{}: {}\n",
                    m.role.as_str(),
                    m.text().unwrap_or_default()
                )
            })
            .collect();

        let request = ChatRequest::with_messages(
            &summarizer.model,
            vec![
                Message::system(
                    "Summarize the following conversation in a short paragraph. \
                     Keep names, decisions, and unresolved questions.",
                ),
                Message::user(transcript),
            ],
        );

        let response = summarizer.provider.chat(&request).await?;
        Ok(response.text().unwrap_or_default())
    }

    fn extract_summary(older: &[Message], chars: usize) -> String {
        older
            .iter()
            .filter_map(|m| {
                let text = m.text()?;
                if text.is_empty() {
                    return None;
                }
                let cut = text
                    .char_indices()
                    .nth(chars)
                    .map_or(text.len(), |(i, _)| i);
                Some(format!("{}: {}", m.role.as_str(), &text[..cut]))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Convert a final output value into the assistant text persisted and
/// returned for it.
#[must_use]
pub(crate) fn output_to_text(output: &Value) -> String {
    output
        .as_str()
        .map_or_else(|| output.to_string(), ToString::to_string)
}
