use crate::gateway::message::{Message, last_user_text};
use crate::gateway::settings::SmartMaxTokensSettings;

pub const FALLBACK_MAX_TOKENS: u32 = 4096;

/// `max_tokens` for the outbound request, picked from `chars:limit` tiers by the length of the
/// newest user message. `None` when the stage is off.
pub fn calculate_smart_max_tokens(
    settings: &SmartMaxTokensSettings,
    messages: &[Message],
) -> Option<u32> {
    if !settings.enabled {
        return None;
    }

    let mut tiers = parse_tiers(&settings.tiers);
    tiers.sort_by(|a, b| b.0.cmp(&a.0));

    let length = last_user_text(messages).chars().count();
    let limit = tiers
        .iter()
        .find(|(chars, _)| *chars <= length)
        .map(|(_, limit)| *limit)
        .unwrap_or(FALLBACK_MAX_TOKENS);
    tracing::debug!(length, limit, "smart max tokens");
    Some(limit)
}

fn parse_tiers(raw: &str) -> Vec<(usize, u32)> {
    raw.split(',')
        .filter_map(|pair| {
            let (chars, limit) = pair.split_once(':')?;
            let parsed = chars.trim().parse::<usize>().ok().zip(limit.trim().parse::<u32>().ok());
            if parsed.is_none() {
                tracing::debug!(tier = pair, "skipping unparseable max token tier");
            }
            parsed
        })
        .collect()
}
