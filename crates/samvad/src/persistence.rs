//! Message persistence boundary.
//!
//! The orchestrator only persists through this trait, strictly after
//! successful generation. The in-memory store backs the server default and
//! tests; a database-backed implementation slots in behind the same trait.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ChatError;
use crate::types::{Chat, Message};

#[derive(Debug, Clone, Default)]
pub struct ChatPatch {
    pub name: Option<String>,
    pub touch_updated_at: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_chat(&self, chat: Chat) -> Result<Chat, ChatError>;

    async fn update_chat(&self, chat_id: Uuid, patch: ChatPatch) -> Result<Chat, ChatError>;

    /// Insert a batch of messages, defaulting missing timestamps before
    /// insert. Returns the stored rows.
    async fn create_messages(&self, messages: Vec<Message>) -> Result<Vec<Message>, ChatError>;

    /// Delete the message at `sequence_number` and everything after it.
    async fn delete_messages_from(
        &self,
        chat_id: Uuid,
        sequence_number: i64,
    ) -> Result<(), ChatError>;

    async fn messages_for_chat(&self, chat_id: Uuid) -> Result<Vec<Message>, ChatError>;
}

pub struct InMemoryMessageStore {
    chats: DashMap<Uuid, Chat>,
    messages: DashMap<Uuid, Vec<Message>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            chats: DashMap::new(),
            messages: DashMap::new(),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_chat(&self, chat: Chat) -> Result<Chat, ChatError> {
        self.chats.insert(chat.id, chat.clone());
        self.messages.entry(chat.id).or_default();
        Ok(chat)
    }

    async fn update_chat(&self, chat_id: Uuid, patch: ChatPatch) -> Result<Chat, ChatError> {
        let mut chat = self
            .chats
            .get_mut(&chat_id)
            .ok_or_else(|| ChatError::Validation(format!("chat {chat_id} not found")))?;
        if let Some(name) = patch.name {
            chat.name = name;
        }
        if patch.touch_updated_at {
            chat.updated_at = Utc::now();
        }
        Ok(chat.clone())
    }

    async fn create_messages(&self, messages: Vec<Message>) -> Result<Vec<Message>, ChatError> {
        let now = Utc::now();
        let mut stored = Vec::with_capacity(messages.len());

        for mut message in messages {
            if message.created_at.is_none() {
                message.created_at = Some(now);
            }
            if message.updated_at.is_none() {
                message.updated_at = Some(now);
            }
            let mut chat_messages = self.messages.entry(message.chat_id).or_default();
            chat_messages.push(message.clone());
            chat_messages.sort_by_key(|m| m.sequence_number);
            stored.push(message);
        }

        Ok(stored)
    }

    async fn delete_messages_from(
        &self,
        chat_id: Uuid,
        sequence_number: i64,
    ) -> Result<(), ChatError> {
        let mut chat_messages = self
            .messages
            .get_mut(&chat_id)
            .ok_or_else(|| ChatError::Validation(format!("chat {chat_id} not found")))?;
        chat_messages.retain(|m| m.sequence_number < sequence_number);
        Ok(())
    }

    async fn messages_for_chat(&self, chat_id: Uuid) -> Result<Vec<Message>, ChatError> {
        Ok(self
            .messages
            .get(&chat_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }
}
