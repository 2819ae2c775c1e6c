//! The cost-optimization transform applied to a chat request before dispatch.
//!
//! Every stage is a pure function over `&[Message]`; the request's own message list is never
//! touched so it can still key the response cache afterwards.

pub mod cache_alignment;
pub mod compress;
pub mod max_tokens;
pub mod model_routing;
pub mod sliding_window;

use serde_json::{Value, json};

use super::message::Message;
use super::provider::Provider;
use super::settings::CostSettings;

pub use cache_alignment::{apply_cache_alignment, detect_cache_strategy};
pub use compress::{apply_compress_output, compress_system_prompt};
pub use max_tokens::calculate_smart_max_tokens;
pub use model_routing::{light_model, should_route_to_light_model};
pub use sliding_window::apply_sliding_window;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutput {
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub model: String,
    pub stream: bool,
}

impl PipelineOutput {
    /// Outbound chat-completions body.
    pub fn payload(&self) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": self.messages,
            "stream": self.stream,
        });
        if let (Some(max_tokens), Some(obj)) = (self.max_tokens, payload.as_object_mut()) {
            obj.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        payload
    }
}

/// Runs the message-rewriting stages in their fixed order, then sizes `max_tokens` from the
/// rewritten list.
pub fn run_cost_pipeline(
    settings: &CostSettings,
    messages: &[Message],
    provider: &Provider,
    model: &str,
    stream: bool,
) -> PipelineOutput {
    let messages = apply_sliding_window(&settings.sliding_window, messages);
    let messages = apply_compress_output(&settings.compress_output, &messages);
    let messages = compress_system_prompt(&settings.prompt_compress, &messages);
    let messages = apply_cache_alignment(&messages, provider);
    let max_tokens = calculate_smart_max_tokens(&settings.smart_max_tokens, &messages);

    PipelineOutput {
        messages,
        max_tokens,
        model: model.to_string(),
        stream,
    }
}
