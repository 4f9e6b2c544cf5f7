//! Transcript persistence collaborator.
//!
//! The engine never writes storage itself; it hands the final ordered
//! message list of a run to a [`TranscriptStore`].

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::message::{ConversationId, Message};

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Append the messages of one finished run to a conversation.
    async fn save(&self, conversation: &ConversationId, messages: Vec<Message>) -> Result<(), Error>;

    /// Load everything stored for a conversation, oldest first.
    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, Error>;
}

/// Process-local store, mainly for tests and the CLI.
#[derive(Debug, Default)]
pub struct InMemoryTranscriptStore {
    conversations: RwLock<HashMap<ConversationId, Vec<Message>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn save(&self, conversation: &ConversationId, messages: Vec<Message>) -> Result<(), Error> {
        self.conversations
            .write()
            .await
            .entry(conversation.clone())
            .or_default()
            .extend(messages);
        Ok(())
    }

    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, Error> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }
}
