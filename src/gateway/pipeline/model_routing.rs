use crate::gateway::message::{Message, last_user_text};
use crate::gateway::provider::ModelTarget;
use crate::gateway::settings::ModelRoutingSettings;

/// Whether the turn is simple enough for the light model.
///
/// Only the newest user message is measured, in characters. Long messages are checked against
/// the complex keywords first, but the outcome is decided by length alone: a short message is
/// routed even when it names a keyword.
pub fn should_route_to_light_model(settings: &ModelRoutingSettings, messages: &[Message]) -> bool {
    if !settings.enabled {
        return false;
    }

    let last_user = last_user_text(messages);
    let length = last_user.chars().count();

    if length > settings.simple_max_chars {
        if let Some(keyword) =
            complex_keywords(&settings.complex_keywords).find(|keyword| last_user.contains(keyword))
        {
            tracing::debug!(keyword, length, "complex keyword present, keeping requested model");
            return false;
        }
    }

    length <= settings.simple_max_chars
}

/// The configured light target, when it is a well-formed `provider::model` string.
pub fn light_model(settings: &ModelRoutingSettings) -> Option<ModelTarget> {
    let target = ModelTarget::parse(&settings.light_model);
    if target.is_none() && !settings.light_model.trim().is_empty() {
        tracing::warn!(light_model = %settings.light_model, "light model is not provider::model");
    }
    target
}

fn complex_keywords(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',')
        .map(str::trim)
        .filter(|keyword| !keyword.is_empty())
}
