//! Prompt assembly for the completion provider.
//!
//! Builds the final ordered message list: system preamble, a token-budgeted
//! trailing window of prior turns (drop oldest first), retrieval source
//! blocks attached to the question that triggered them, and image parts
//! resolved from the chat image collection. Also adapts the built list for
//! providers with a two-role vocabulary.

use chrono::Utc;
use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;

use crate::llm::{ContentPart, ImageUrl, ProviderContent, ProviderMessage};
use crate::types::{
    Assistant, ChatMessage, ChatPayload, FileItem, Message, MessageImage, Profile, Role,
    SYSTEM_SEQUENCE_NUMBER,
};

static CL100K: LazyLock<CoreBPE> =
    LazyLock::new(|| tiktoken_rs::cl100k_base().expect("cl100k tokenizer data is embedded"));

/// Token cost of a text under the provider-consistent tokenizer.
pub fn count_tokens(text: &str) -> usize {
    CL100K.encode_with_special_tokens(text).len()
}

/// Compose the system preamble: persona injection, date stamp, profile
/// context, workspace instructions, then the base prompt, in that order.
pub fn build_base_prompt(
    prompt: &str,
    profile_context: &str,
    workspace_instructions: &str,
    assistant: Option<&Assistant>,
) -> String {
    let mut full_prompt = String::new();

    if let Some(assistant) = assistant {
        full_prompt.push_str(&format!(
            "<INJECT ROLE>\nYou are not an AI. You are {}.\n</INJECT ROLE>\n\n",
            assistant.name
        ));
    }

    full_prompt.push_str(&format!("Today is {}.\n\n", Utc::now().format("%Y-%m-%d")));

    if !profile_context.is_empty() {
        full_prompt.push_str(&format!("User Info:\n{profile_context}\n\n"));
    }

    if !workspace_instructions.is_empty() {
        full_prompt.push_str(&format!("System Instructions:\n{workspace_instructions}\n\n"));
    }

    full_prompt.push_str(&format!("User Instructions:\n{prompt}"));
    full_prompt
}

/// Format retrieval hits into a source-delimited block with the fixed
/// grounding instruction.
pub fn build_retrieval_text(file_items: &[FileItem]) -> String {
    let sources = file_items
        .iter()
        .map(|item| format!("<BEGIN SOURCE>\n{}\n</END SOURCE>", item.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "You may use the following sources if needed to answer the user's question. If you don't know the answer, say \"I don't know.\"\n\n{sources}"
    )
}

/// Attach historical retrieval blocks: a turn gains a source block if and
/// only if its immediate successor references at least one file item. This
/// associates sources with the question that triggered the retrieval.
fn attach_historical_sources(
    chat_messages: &[ChatMessage],
    chat_file_items: &[FileItem],
) -> Vec<Message> {
    chat_messages
        .iter()
        .enumerate()
        .map(|(index, chat_message)| {
            let mut message = chat_message.message.clone();
            let Some(next) = chat_messages.get(index + 1) else {
                return message;
            };
            if next.file_items.is_empty() {
                return message;
            }

            let found: Vec<FileItem> = next
                .file_items
                .iter()
                .filter_map(|id| chat_file_items.iter().find(|item| item.id == *id).cloned())
                .collect();
            if found.is_empty() {
                return message;
            }

            message.content = format!("{}\n\n{}", message.content, build_retrieval_text(&found));
            message
        })
        .collect()
}

/// Resolve a message's image references and convert it to provider form.
/// References already carrying inline data pass through; others resolve via
/// the chat image collection by path. Text-only messages stay plain strings.
fn to_provider_message(message: &Message, chat_images: &[MessageImage]) -> ProviderMessage {
    if message.image_paths.is_empty() {
        return ProviderMessage::text(message.role, message.content.clone());
    }

    let mut parts = vec![ContentPart::Text {
        text: message.content.clone(),
    }];
    for path in &message.image_paths {
        let url = if path.starts_with("data") {
            path.clone()
        } else {
            chat_images
                .iter()
                .find(|image| image.path == *path)
                .map(|image| image.base64.clone())
                .unwrap_or_else(|| path.clone())
        };
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl { url },
        });
    }
    ProviderMessage::parts(message.role, parts)
}

/// Assemble the final ordered provider-message list for one send.
pub fn build_final_messages(
    payload: &ChatPayload,
    profile: &Profile,
    chat_images: &[MessageImage],
) -> Vec<ProviderMessage> {
    let settings = &payload.chat_settings;

    let built_prompt = build_base_prompt(
        &settings.prompt,
        if settings.include_profile_context {
            &profile.profile_context
        } else {
            ""
        },
        if settings.include_workspace_instructions {
            &payload.workspace_instructions
        } else {
            ""
        },
        payload.assistant.as_ref(),
    );

    // Budget is measured against the user-configured base prompt.
    let mut remaining_tokens = settings
        .context_length
        .saturating_sub(count_tokens(&settings.prompt));

    let processed = attach_historical_sources(&payload.chat_messages, &payload.chat_file_items);

    // Fill from the back: newest turns first, drop oldest once the budget is
    // exhausted. Deterministic given budget and tokenizer.
    let mut window: Vec<&Message> = Vec::new();
    for message in processed.iter().rev() {
        let message_tokens = count_tokens(&message.content);
        if message_tokens > remaining_tokens {
            break;
        }
        remaining_tokens -= message_tokens;
        window.push(message);
    }
    window.reverse();

    let system_message = Message {
        id: uuid::Uuid::nil(),
        chat_id: uuid::Uuid::nil(),
        user_id: profile.user_id,
        role: Role::System,
        content: built_prompt,
        image_paths: Vec::new(),
        sequence_number: SYSTEM_SEQUENCE_NUMBER,
        model: settings.model.clone(),
        created_at: None,
        updated_at: None,
    };

    let mut final_messages: Vec<ProviderMessage> = Vec::with_capacity(window.len() + 1);
    final_messages.push(to_provider_message(&system_message, chat_images));
    for message in window {
        final_messages.push(to_provider_message(message, chat_images));
    }

    // Current turn's own retrieval hits go on the last message.
    if !payload.message_file_items.is_empty() {
        if let Some(last) = final_messages.last_mut() {
            if let Some(content) = last.content.as_mut() {
                content.append_text(&format!(
                    "\n\n{}",
                    build_retrieval_text(&payload.message_file_items)
                ));
            }
        }
    }

    final_messages
}

// ============================================================================
// Two-role provider adaptation
// ============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct GeminiMessage {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    pub mime_type: String,
}

fn base64_from_data_url(url: &str) -> String {
    url.split_once(',')
        .map(|(_, data)| data.to_string())
        .unwrap_or_default()
}

fn media_type_from_data_url(url: &str) -> String {
    url.strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .unwrap_or("")
        .to_string()
}

/// Remap one message into the two-role vocabulary: system and user collapse
/// to "user", assistant maps to "model"; parts flatten into the target
/// schema.
fn adapt_single_message(message: &ProviderMessage) -> GeminiMessage {
    let raw_parts: Vec<ContentPart> = match &message.content {
        Some(ProviderContent::Parts(parts)) => parts.clone(),
        Some(ProviderContent::Text(text)) => vec![ContentPart::Text { text: text.clone() }],
        None => Vec::new(),
    };

    let parts = raw_parts
        .into_iter()
        .map(|part| match part {
            ContentPart::Text { text } => GeminiPart::Text { text },
            ContentPart::ImageUrl { image_url } => GeminiPart::InlineData {
                inline_data: InlineData {
                    data: base64_from_data_url(&image_url.url),
                    mime_type: media_type_from_data_url(&image_url.url),
                },
            },
        })
        .collect();

    let role = match message.role {
        Role::User | Role::System => "user",
        _ => "model",
    };

    GeminiMessage {
        role: role.to_string(),
        parts,
    }
}

/// Vision-specialized variants take no history: collapse everything into one
/// synthetic user turn: the preamble and final question as text, followed by
/// the image parts of the final turn only.
fn adapt_for_vision(messages: Vec<GeminiMessage>) -> Vec<GeminiMessage> {
    let base_prompt = messages
        .first()
        .and_then(|m| m.parts.first())
        .and_then(|p| match p {
            GeminiPart::Text { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let base_role = messages.first().map(|m| m.role.clone()).unwrap_or_default();

    let last = messages.last();
    let last_text = last
        .and_then(|m| m.parts.first())
        .and_then(|p| match p {
            GeminiPart::Text { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let visual_parts: Vec<GeminiPart> = last
        .map(|m| m.parts.iter().skip(1).cloned().collect())
        .unwrap_or_default();

    let mut parts = vec![GeminiPart::Text {
        text: format!("{base_role}:\n{base_prompt}\n\nuser:\n{last_text}\n\n"),
    }];
    parts.extend(visual_parts);

    vec![GeminiMessage {
        role: "user".to_string(),
        parts,
    }]
}

pub fn adapt_messages_for_gemini(
    model: &str,
    messages: &[ProviderMessage],
) -> Vec<GeminiMessage> {
    let adapted: Vec<GeminiMessage> = messages.iter().map(adapt_single_message).collect();
    if model == "gemini-pro-vision" {
        adapt_for_vision(adapted)
    } else {
        adapted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatSettings;
    use uuid::Uuid;

    fn profile() -> Profile {
        Profile {
            user_id: Uuid::new_v4(),
            username: "tester".into(),
            profile_context: "Works on search infrastructure".into(),
        }
    }

    fn turn(role: Role, content: &str, seq: i64) -> ChatMessage {
        ChatMessage::bare(Message::new(
            Uuid::nil(),
            Uuid::nil(),
            role,
            content,
            seq,
            "gpt-4-turbo-preview",
        ))
    }

    fn payload_with(messages: Vec<ChatMessage>, context_length: usize) -> ChatPayload {
        ChatPayload {
            chat_settings: ChatSettings {
                context_length,
                ..ChatSettings::default()
            },
            workspace_instructions: String::new(),
            chat_messages: messages,
            assistant: None,
            message_file_items: Vec::new(),
            chat_file_items: Vec::new(),
        }
    }

    #[test]
    fn test_base_prompt_section_order() {
        let assistant = Assistant {
            id: Uuid::new_v4(),
            name: "Atlas".into(),
            prompt: String::new(),
        };
        let built = build_base_prompt("Be helpful.", "profile", "workspace", Some(&assistant));

        let inject = built.find("<INJECT ROLE>").unwrap();
        let date = built.find("Today is").unwrap();
        let info = built.find("User Info:").unwrap();
        let system = built.find("System Instructions:").unwrap();
        let user = built.find("User Instructions:").unwrap();
        assert!(inject < date && date < info && info < system && system < user);
        assert!(built.contains("You are not an AI. You are Atlas."));
    }

    #[test]
    fn test_system_message_is_first() {
        let messages = vec![turn(Role::User, "hello", 0)];
        let built = build_final_messages(&payload_with(messages, 4096), &profile(), &[]);
        assert_eq!(built[0].role, Role::System);
        assert_eq!(built.len(), 2);
    }

    #[test]
    fn test_truncation_drops_oldest_first() {
        let messages = vec![
            turn(Role::User, "first message in the history", 0),
            turn(Role::Assistant, "second message in the history", 1),
            turn(Role::User, "third message in the history", 2),
        ];
        // Budget only large enough for the newest turn plus a little.
        let base_tokens = count_tokens(&ChatSettings::default().prompt);
        let newest_tokens = count_tokens("third message in the history");
        let budget = base_tokens + newest_tokens + 1;

        let built = build_final_messages(&payload_with(messages, budget), &profile(), &[]);
        // System message + newest turn only.
        assert_eq!(built.len(), 2);
        assert_eq!(
            built[1].content.as_ref().unwrap().text(),
            Some("third message in the history")
        );
    }

    #[test]
    fn test_truncation_is_idempotent_and_monotonic() {
        let messages: Vec<ChatMessage> = (0..6)
            .map(|i| turn(Role::User, &format!("message number {i} with some words"), i))
            .collect();

        let small = build_final_messages(&payload_with(messages.clone(), 80), &profile(), &[]);
        let small_again =
            build_final_messages(&payload_with(messages.clone(), 80), &profile(), &[]);
        assert_eq!(small.len(), small_again.len());

        let large = build_final_messages(&payload_with(messages, 4096), &profile(), &[]);
        assert!(large.len() >= small.len());
    }

    #[test]
    fn test_retrieval_block_attaches_to_question_turn() {
        let item = FileItem {
            id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            content: "chunk text".into(),
        };
        let question = turn(Role::User, "what does the report say", 0);
        let mut answer = turn(Role::Assistant, "the report says things", 1);
        answer.file_items = vec![item.id];

        let mut payload = payload_with(vec![question, answer], 4096);
        payload.chat_file_items = vec![item];

        let built = build_final_messages(&payload, &profile(), &[]);
        let question_text = built[1].content.as_ref().unwrap().text().unwrap();
        let answer_text = built[2].content.as_ref().unwrap().text().unwrap();
        assert!(question_text.contains("<BEGIN SOURCE>"));
        assert!(question_text.contains("chunk text"));
        assert!(!answer_text.contains("<BEGIN SOURCE>"));
    }

    #[test]
    fn test_turn_without_sourced_successor_gains_no_block() {
        let built = build_final_messages(
            &payload_with(
                vec![
                    turn(Role::User, "plain question", 0),
                    turn(Role::Assistant, "plain answer", 1),
                ],
                4096,
            ),
            &profile(),
            &[],
        );
        for message in &built[1..] {
            assert!(!message
                .content
                .as_ref()
                .unwrap()
                .text()
                .unwrap()
                .contains("<BEGIN SOURCE>"));
        }
    }

    #[test]
    fn test_current_turn_retrieval_goes_to_last_message() {
        let mut payload = payload_with(vec![turn(Role::User, "question", 0)], 4096);
        payload.message_file_items = vec![FileItem {
            id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            content: "fresh chunk".into(),
        }];

        let built = build_final_messages(&payload, &profile(), &[]);
        let last_text = built.last().unwrap().content.as_ref().unwrap().text().unwrap();
        assert!(last_text.contains("fresh chunk"));
        assert!(last_text.starts_with("question"));
    }

    #[test]
    fn test_image_paths_become_parts() {
        let mut message = turn(Role::User, "look at this", 0);
        message.message.image_paths = vec!["chat/img-1.png".into(), "data:image/png;base64,zz".into()];
        let images = vec![MessageImage {
            path: "chat/img-1.png".into(),
            base64: "data:image/png;base64,abc".into(),
        }];

        let built = build_final_messages(&payload_with(vec![message], 4096), &profile(), &images);
        match built[1].content.as_ref().unwrap() {
            ProviderContent::Parts(parts) => {
                assert_eq!(parts.len(), 3);
                match &parts[1] {
                    ContentPart::ImageUrl { image_url } => {
                        assert_eq!(image_url.url, "data:image/png;base64,abc")
                    }
                    _ => panic!("expected resolved image part"),
                }
                match &parts[2] {
                    ContentPart::ImageUrl { image_url } => {
                        assert_eq!(image_url.url, "data:image/png;base64,zz")
                    }
                    _ => panic!("expected pass-through image part"),
                }
            }
            ProviderContent::Text(_) => panic!("expected multi-part content"),
        }
    }

    #[test]
    fn test_gemini_role_remap() {
        let messages = vec![
            ProviderMessage::system("preamble"),
            ProviderMessage::user("question"),
            ProviderMessage::assistant("answer"),
        ];
        let adapted = adapt_messages_for_gemini("gemini-pro", &messages);
        let roles: Vec<&str> = adapted.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "user", "model"]);
    }

    #[test]
    fn test_gemini_vision_collapses_to_single_turn() {
        let messages = vec![
            ProviderMessage::system("preamble"),
            ProviderMessage::parts(
                Role::User,
                vec![
                    ContentPart::Text {
                        text: "what is in this image".into(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/jpeg;base64,abc123".into(),
                        },
                    },
                ],
            ),
        ];
        let adapted = adapt_messages_for_gemini("gemini-pro-vision", &messages);
        assert_eq!(adapted.len(), 1);
        assert_eq!(adapted[0].role, "user");
        assert_eq!(adapted[0].parts.len(), 2);
        match &adapted[0].parts[0] {
            GeminiPart::Text { text } => {
                assert!(text.contains("user:\npreamble"));
                assert!(text.contains("user:\nwhat is in this image"));
            }
            _ => panic!("expected collapsed text part"),
        }
        match &adapted[0].parts[1] {
            GeminiPart::InlineData { inline_data } => {
                assert_eq!(inline_data.data, "abc123");
                assert_eq!(inline_data.mime_type, "image/jpeg");
            }
            _ => panic!("expected inline image data"),
        }
    }
}
