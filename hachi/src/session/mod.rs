//! Conversation persistence across runs.
//!
//! A [`Session`] is a stable identifier plus message storage. At run start
//! the binder prefixes prior history to the prompt; on completion it
//! appends the newly generated messages as one contiguous batch (see the
//! runner). Backends beyond the in-memory one — Redis, SQL, files — live
//! outside the core and just implement this trait.

mod in_memory;

pub use in_memory::InMemorySession;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// A conversation store shared across runs.
#[async_trait]
pub trait Session: Send + Sync {
    /// Stable identifier for this session.
    fn id(&self) -> &str;

    /// Retrieve stored messages, most recent last. `limit` keeps only the
    /// latest `n`.
    async fn get_messages(&self, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Append a batch of messages.
    async fn add_messages(&self, messages: &[Message]) -> Result<()>;

    /// Remove and return the most recent message.
    ///
    /// Used by the binder for compensating deletion when a backend cannot
    /// append atomically.
    async fn pop_message(&self) -> Result<Option<Message>>;

    /// Delete all messages.
    async fn clear(&self) -> Result<()>;

    /// Number of stored messages.
    async fn len(&self) -> Result<usize>;

    /// Whether the session holds no messages.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Read session metadata. Backends without metadata return an empty map.
    async fn metadata(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    /// Merge key-value pairs into session metadata.
    async fn update_metadata(&self, entries: HashMap<String, String>) -> Result<()> {
        let _ = entries;
        Ok(())
    }
}

/// Type alias for an Arc-wrapped session.
pub type SharedSession = Arc<dyn Session>;
