//! History truncation to a token budget.
//!
//! The conversation is cut into rounds (everything up to and including an assistant reply) and
//! rounds are kept or dropped whole, so a user turn never loses the reply that answered it.

use crate::gateway::message::{Message, Role};
use crate::gateway::settings::SlidingWindowSettings;
use crate::gateway::token_count::estimate_tokens;

struct Round<'a> {
    messages: Vec<&'a Message>,
    tokens: u64,
}

impl<'a> Round<'a> {
    fn new(messages: Vec<&'a Message>) -> Self {
        let tokens = messages_tokens(messages.iter().copied());
        Self { messages, tokens }
    }
}

pub fn apply_sliding_window(settings: &SlidingWindowSettings, messages: &[Message]) -> Vec<Message> {
    if !settings.enabled || messages.is_empty() {
        return messages.to_vec();
    }

    let (system, conversation): (Vec<&Message>, Vec<&Message>) = messages
        .iter()
        .partition(|message| message.role == Role::System);

    let rounds = split_rounds(&conversation);
    let keep_first = settings.keep_first_rounds;
    let keep_last = settings.keep_last_rounds;
    if rounds.len() <= keep_first.saturating_add(keep_last) {
        return messages.to_vec();
    }

    let tail_start = rounds.len() - keep_last;
    let first = &rounds[..keep_first];
    let middle = &rounds[keep_first..tail_start];
    let last = &rounds[tail_start..];

    let kept_tokens = messages_tokens(system.iter().copied())
        + first.iter().map(|round| round.tokens).sum::<u64>()
        + last.iter().map(|round| round.tokens).sum::<u64>();

    let mut readmitted = 0usize;
    if kept_tokens < settings.max_tokens {
        let mut remaining = settings.max_tokens - kept_tokens;
        for round in middle.iter().rev() {
            if round.tokens > remaining {
                break;
            }
            remaining -= round.tokens;
            readmitted += 1;
        }
    }

    let readmitted_rounds = &middle[middle.len() - readmitted..];
    tracing::debug!(
        rounds = rounds.len(),
        kept_tokens,
        max_tokens = settings.max_tokens,
        dropped_rounds = middle.len() - readmitted,
        "sliding window applied"
    );

    system
        .into_iter()
        .chain(first.iter().flat_map(|round| round.messages.iter().copied()))
        .chain(
            readmitted_rounds
                .iter()
                .flat_map(|round| round.messages.iter().copied()),
        )
        .chain(last.iter().flat_map(|round| round.messages.iter().copied()))
        .cloned()
        .collect()
}

fn split_rounds<'a>(conversation: &[&'a Message]) -> Vec<Round<'a>> {
    let mut rounds = Vec::new();
    let mut current = Vec::new();
    for message in conversation {
        current.push(*message);
        if message.role == Role::Assistant {
            rounds.push(Round::new(std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        rounds.push(Round::new(current));
    }
    rounds
}

fn messages_tokens<'a>(messages: impl Iterator<Item = &'a Message>) -> u64 {
    messages.map(|message| estimate_tokens(&message.text())).sum()
}
