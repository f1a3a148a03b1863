//! Durable chat data model and the transient per-send aggregates.
//!
//! `Message` and `Chat` are the only durable entities; everything else is
//! built fresh for one send and discarded once the assistant turn is
//! persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequence number reserved for the synthesized system message. It is never
/// persisted as a regular turn.
pub const SYSTEM_SEQUENCE_NUMBER: i64 = -1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One turn in a chat's ordered history.
///
/// `sequence_number` is strictly increasing per chat. Timestamps are optional
/// on the way in; the persistence layer defaults them before insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub image_paths: Vec<String>,
    pub sequence_number: i64,
    pub model: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        chat_id: Uuid,
        user_id: Uuid,
        role: Role,
        content: impl Into<String>,
        sequence_number: i64,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            user_id,
            role,
            content: content.into(),
            image_paths: Vec::new(),
            sequence_number,
            model: model.into(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Per-send chat configuration, selected once per chat session or preset.
/// Missing wire fields fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub context_length: usize,
    pub include_profile_context: bool,
    pub include_workspace_instructions: bool,
    pub embeddings_provider: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4-turbo-preview".to_string(),
            prompt: "You are a friendly, helpful AI assistant.".to_string(),
            temperature: 0.5,
            context_length: 4096,
            include_profile_context: true,
            include_workspace_instructions: true,
            embeddings_provider: "openai".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub model: String,
    pub assistant_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub profile_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub id: Uuid,
    pub name: String,
    pub prompt: String,
}

/// A ranked text chunk returned by the retrieval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileItem {
    pub id: Uuid,
    pub file_id: Uuid,
    pub content: String,
}

/// A resolved chat image: a storage path plus the inline payload it resolves
/// to. Paths already carrying inline data pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageImage {
    pub path: String,
    pub base64: String,
}

/// A message plus the file items its retrieval produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message: Message,
    #[serde(default)]
    pub file_items: Vec<Uuid>,
}

impl ChatMessage {
    pub fn bare(message: Message) -> Self {
        Self {
            message,
            file_items: Vec::new(),
        }
    }
}

/// Minimal {role, content} view of a turn, used as classifier and rewrite
/// context. Anything without a string content or a recognized role is
/// discarded when building these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn from_chat_messages(messages: &[ChatMessage]) -> Vec<ConversationTurn> {
        messages
            .iter()
            .filter(|m| !m.message.content.is_empty())
            .map(|m| ConversationTurn {
                role: m.message.role,
                content: m.message.content.clone(),
            })
            .collect()
    }
}

/// Transient aggregate handed to the prompt builder. Built fresh per send.
#[derive(Debug, Clone)]
pub struct ChatPayload {
    pub chat_settings: ChatSettings,
    pub workspace_instructions: String,
    pub chat_messages: Vec<ChatMessage>,
    pub assistant: Option<Assistant>,
    /// Retrieval hits for the current turn.
    pub message_file_items: Vec<FileItem>,
    /// All file chunks attached to the chat, for historical source blocks.
    pub chat_file_items: Vec<FileItem>,
}

/// An externally described callable tool: a name, an OpenAPI document (as
/// JSON text, the way the tool registry stores it), and optional custom
/// headers (a JSON object, also as text). Read-only input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRegistration {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schema: String,
    #[serde(default)]
    pub custom_headers: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("model"), None);
    }

    #[test]
    fn test_chat_settings_wire_names_are_camel_case() {
        let json = serde_json::to_value(ChatSettings::default()).unwrap();
        assert!(json.get("contextLength").is_some());
        assert!(json.get("includeProfileContext").is_some());
        assert!(json.get("context_length").is_none());
    }

    #[test]
    fn test_conversation_turns_skip_empty_content() {
        let chat_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let filled = ChatMessage::bare(Message::new(chat_id, user_id, Role::User, "hi", 0, "m"));
        let empty = ChatMessage::bare(Message::new(chat_id, user_id, Role::Assistant, "", 1, "m"));
        let turns = ConversationTurn::from_chat_messages(&[filled, empty]);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "hi");
    }
}
