//! In-memory session implementation.
//!
//! [`InMemorySession`] stores conversation history in a `Vec<Message>`
//! behind a `tokio::sync::RwLock`. Data is lost when the value is dropped.
//! Best suited for single-run agents, testing, and short-lived
//! conversations.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Session;
use crate::error::Result;
use crate::message::Message;

/// In-memory session backed by `tokio::sync::RwLock<Vec<Message>>`.
///
/// Concurrent readers may retrieve history simultaneously; writes acquire
/// exclusive access.
#[derive(Debug)]
pub struct InMemorySession {
    id: String,
    messages: RwLock<Vec<Message>>,
    metadata: RwLock<HashMap<String, String>>,
}

impl InMemorySession {
    /// Creates an empty session.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: RwLock::new(Vec::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session pre-populated with `messages`.
    #[must_use]
    pub fn with_messages(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages: RwLock::new(messages),
            metadata: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_messages(&self, limit: Option<usize>) -> Result<Vec<Message>> {
        let guard = self.messages.read().await;
        match limit {
            Some(n) if n < guard.len() => Ok(guard[guard.len() - n..].to_vec()),
            _ => Ok(guard.clone()),
        }
    }

    async fn add_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.messages.write().await.extend(messages.iter().cloned());
        Ok(())
    }

    async fn pop_message(&self) -> Result<Option<Message>> {
        Ok(self.messages.write().await.pop())
    }

    async fn clear(&self) -> Result<()> {
        self.messages.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.messages.read().await.len())
    }

    async fn metadata(&self) -> Result<HashMap<String, String>> {
        Ok(self.metadata.read().await.clone())
    }

    async fn update_metadata(&self, entries: HashMap<String, String>) -> Result<()> {
        self.metadata.write().await.extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| match i % 2 {
                0 => Message::user(format!("user-{i}")),
                _ => Message::assistant(format!("assistant-{i}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn returns_all_when_limit_is_none() {
        let msgs = sample_messages(5);
        let session = InMemorySession::with_messages("s1", msgs.clone());
        assert_eq!(session.get_messages(None).await.unwrap(), msgs);
    }

    #[tokio::test]
    async fn limit_returns_latest_n_messages() {
        let msgs = sample_messages(5);
        let session = InMemorySession::with_messages("s2", msgs.clone());

        let last2 = session.get_messages(Some(2)).await.unwrap();
        assert_eq!(last2, msgs[3..5]);
    }

    #[tokio::test]
    async fn add_then_len_then_clear() {
        let session = InMemorySession::new("s3");
        assert!(session.is_empty().await.unwrap());

        session.add_messages(&sample_messages(3)).await.unwrap();
        assert_eq!(session.len().await.unwrap(), 3);

        session.clear().await.unwrap();
        assert!(session.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn pop_removes_most_recent() {
        let session = InMemorySession::with_messages("s4", sample_messages(2));
        let popped = session.pop_message().await.unwrap().expect("message");
        assert_eq!(popped.text().as_deref(), Some("assistant-1"));
        assert_eq!(session.len().await.unwrap(), 1);

        session.pop_message().await.unwrap();
        assert!(session.pop_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let session = InMemorySession::new("s5");
        assert!(session.metadata().await.unwrap().is_empty());

        session
            .update_metadata(HashMap::from([("topic".to_owned(), "travel".to_owned())]))
            .await
            .unwrap();
        assert_eq!(
            session.metadata().await.unwrap().get("topic").map(String::as_str),
            Some("travel")
        );
    }

    #[tokio::test]
    async fn empty_append_is_noop() {
        let session = InMemorySession::new("s6");
        session.add_messages(&[]).await.unwrap();
        assert!(session.is_empty().await.unwrap());
    }
}
