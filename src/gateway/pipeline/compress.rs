//! Output-length and system-prompt compression.

use std::sync::OnceLock;

use regex::Regex;

use crate::gateway::message::{Message, MessageContent, Role};
use crate::gateway::settings::{CompressOutputSettings, PromptCompressSettings};

pub const OUTPUT_REQUIREMENT_MARKER: &str = "\n\n[output requirement] ";

/// Appends the configured instruction to a trailing plain-text user message.
pub fn apply_compress_output(settings: &CompressOutputSettings, messages: &[Message]) -> Vec<Message> {
    let mut out = messages.to_vec();
    if !settings.enabled || settings.instruction.is_empty() {
        return out;
    }

    if let Some(last) = out.last_mut() {
        if last.role == Role::User {
            if let MessageContent::Text(text) = &mut last.content {
                text.push_str(OUTPUT_REQUIREMENT_MARKER);
                text.push_str(&settings.instruction);
            }
        }
    }
    out
}

pub fn compress_system_prompt(settings: &PromptCompressSettings, messages: &[Message]) -> Vec<Message> {
    let mut out = messages.to_vec();
    if !settings.enabled {
        return out;
    }

    for message in out.iter_mut().filter(|message| message.role == Role::System) {
        if let MessageContent::Text(text) = &mut message.content {
            let before = text.chars().count();
            *text = compress_prompt_text(text);
            tracing::debug!(before, after = text.chars().count(), "system prompt compressed");
        }
    }
    out
}

fn compress_prompt_text(text: &str) -> String {
    let text = blank_lines_regex().replace_all(text, "\n\n");
    let text = horizontal_space_regex().replace_all(&text, " ");
    let text = html_comment_regex().replace_all(&text, "");
    text.trim().to_string()
}

fn blank_lines_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\n{3,}").expect("blank line regex is valid"))
}

fn horizontal_space_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"[ \t]+").expect("horizontal space regex is valid"))
}

fn html_comment_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("html comment regex is valid"))
}
