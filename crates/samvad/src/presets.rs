//! Built-in chat presets: named persona prompts a chat can start from.

use serde::{Deserialize, Serialize};

use crate::types::ChatSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPreset {
    pub key: &'static str,
    pub name: &'static str,
    pub prompt: &'static str,
}

pub const CHAT_PRESETS: [ChatPreset; 3] = [
    ChatPreset {
        key: "seo_assistant",
        name: "SEO Assistant",
        prompt: "You are an SEO expert. Answer precisely and help the user achieve better rankings.",
    },
    ChatPreset {
        key: "marketing_helper",
        name: "Marketing Helper",
        prompt: "You are a marketing assistant. Give creative and helpful suggestions.",
    },
    ChatPreset {
        key: "support_bot",
        name: "Support Bot",
        prompt: "You are a technical support bot. Answer clearly and understandably.",
    },
];

pub fn preset_by_key(key: &str) -> Option<&'static ChatPreset> {
    CHAT_PRESETS.iter().find(|p| p.key == key)
}

/// Apply a preset's persona prompt on top of the given settings.
pub fn apply_preset(settings: &ChatSettings, preset: &ChatPreset) -> ChatSettings {
    ChatSettings {
        prompt: preset.prompt.to_string(),
        ..settings.clone()
    }
}
