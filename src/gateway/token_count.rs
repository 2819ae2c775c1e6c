//! Heuristic token estimate.
//!
//! This is a deliberately crude approximation: CJK code points count as 0.6 tokens each and every
//! other character as a quarter token. It is only used for budget decisions inside the cost
//! pipeline, never for billing.

use serde_json::Value;

pub fn estimate_tokens(text: &str) -> u64 {
    let mut total = 0u64;
    let mut cjk = 0u64;
    for ch in text.chars() {
        total += 1;
        if is_cjk(ch) {
            cjk += 1;
        }
    }
    let other = total.saturating_sub(cjk);
    (cjk as f64 * 0.6 + other as f64 / 4.0).round() as u64
}

/// Estimate for arbitrary JSON; anything that is not a string counts as zero.
pub fn estimate_value_tokens(value: &Value) -> u64 {
    value.as_str().map(estimate_tokens).unwrap_or(0)
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch,
        '\u{4e00}'..='\u{9fff}' | '\u{3000}'..='\u{303f}' | '\u{ff00}'..='\u{ffef}'
    )
}
