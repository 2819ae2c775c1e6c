//! Shapes the message list so the upstream's prompt cache can reuse the stable prefix.

use crate::gateway::message::{CacheControl, ContentPart, Message, MessageContent, Role};
use crate::gateway::provider::{CacheStrategy, Provider};

/// The provider's configured strategy, or a guess from its base URL when it is `auto`.
pub fn detect_cache_strategy(provider: &Provider) -> CacheStrategy {
    if provider.cache_strategy != CacheStrategy::Auto {
        return provider.cache_strategy;
    }

    let base_url = provider.base_url.to_ascii_lowercase();
    if base_url.contains("anthropic") || base_url.contains("openrouter") {
        CacheStrategy::Breakpoint
    } else {
        // deepseek, openai and unknown hosts cache on an exact prefix
        CacheStrategy::Prefix
    }
}

pub fn apply_cache_alignment(messages: &[Message], provider: &Provider) -> Vec<Message> {
    let strategy = detect_cache_strategy(provider);
    if messages.is_empty() {
        return Vec::new();
    }
    tracing::debug!(strategy = strategy.as_str(), "cache alignment");

    match strategy {
        CacheStrategy::Breakpoint => apply_breakpoints(messages),
        CacheStrategy::Prefix => merge_system_prefix(messages),
        CacheStrategy::None | CacheStrategy::Auto => messages.to_vec(),
    }
}

fn apply_breakpoints(messages: &[Message]) -> Vec<Message> {
    let mut out = messages.to_vec();

    if let Some(last_system) = out.iter_mut().rev().find(|message| message.role == Role::System) {
        mark_ephemeral(last_system);
    }

    let count = out.len();
    if count >= 3 {
        mark_ephemeral(&mut out[count - 2]);
    }
    out
}

fn mark_ephemeral(message: &mut Message) {
    match &mut message.content {
        MessageContent::Text(text) => {
            let mut part = ContentPart::text(std::mem::take(text));
            part.cache_control = Some(CacheControl::ephemeral());
            message.content = MessageContent::Parts(vec![part]);
        }
        MessageContent::Parts(parts) => {
            if let Some(last) = parts.last_mut().filter(|part| part.is_text()) {
                last.cache_control = Some(CacheControl::ephemeral());
            }
        }
        MessageContent::Other(_) => {}
    }
}

fn merge_system_prefix(messages: &[Message]) -> Vec<Message> {
    let system_count = messages
        .iter()
        .filter(|message| message.role == Role::System)
        .count();
    if system_count <= 1 {
        return messages.to_vec();
    }

    let merged = messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(Message::text)
        .collect::<Vec<_>>()
        .join("\n\n");

    std::iter::once(Message::system(merged.trim()))
        .chain(
            messages
                .iter()
                .filter(|message| message.role != Role::System)
                .cloned(),
        )
        .collect()
}
