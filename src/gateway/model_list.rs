//! Model ids from a provider's model-list endpoint.
//!
//! Providers disagree on the response shape, so the body is offered to a fixed list of matchers
//! and the first one that recognises the shape decides the result.

use serde_json::{Map, Value};

use super::provider::Provider;
use crate::{AdaError, Result};

const ERROR_SAMPLE_CHARS: usize = 500;

type ShapeMatcher = fn(&Value) -> Option<Vec<String>>;

const MATCHERS: &[ShapeMatcher] = &[bare_list, data_list, models_list, object_values];

/// Model ids in the order the provider listed them.
pub fn extract_model_ids(body: &Value) -> Option<Vec<String>> {
    MATCHERS.iter().find_map(|matcher| matcher(body))
}

pub async fn fetch_provider_models(
    client: &reqwest::Client,
    provider: &Provider,
) -> Result<Vec<String>> {
    let mut req = client
        .get(provider.models_url())
        .header("Content-Type", "application/json")
        .header("X-Title", "Ada Chat");
    if !provider.api_key.is_empty() {
        req = req.bearer_auth(&provider.api_key);
    }

    let bytes = crate::utils::http::send_checked_bytes(req).await?;
    let body: Value = serde_json::from_slice(&bytes).map_err(|err| {
        AdaError::InvalidResponse(format!(
            "cannot parse model list ({err}): {}",
            sample(&bytes)
        ))
    })?;

    match extract_model_ids(&body) {
        Some(models) if !models.is_empty() => {
            tracing::debug!(provider = %provider.id, count = models.len(), "fetched model list");
            Ok(models)
        }
        _ => Err(AdaError::InvalidResponse(format!(
            "no models found in response: {}",
            sample(&bytes)
        ))),
    }
}

fn sample(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .take(ERROR_SAMPLE_CHARS)
        .collect()
}

fn model_id_field(item: &Map<String, Value>) -> Option<String> {
    ["id", "model", "name"]
        .iter()
        .find_map(|key| item.get(*key).filter(|value| !value.is_null()))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn string_or_object_id(item: &Value) -> Option<String> {
    match item {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => model_id_field(obj),
        _ => None,
    }
}

/// `["a", {"id": "b"}]`
fn bare_list(body: &Value) -> Option<Vec<String>> {
    let items = body.as_array()?;
    Some(items.iter().filter_map(string_or_object_id).collect())
}

/// `{"data": [{"id": "a"}]}`
fn data_list(body: &Value) -> Option<Vec<String>> {
    let items = body.get("data")?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(model_id_field)
            .collect(),
    )
}

/// `{"models": ["a", {"name": "b"}]}`
fn models_list(body: &Value) -> Option<Vec<String>> {
    let items = body.get("models")?.as_array()?;
    Some(items.iter().filter_map(string_or_object_id).collect())
}

/// `{"x": "a", "y": {"id": "b"}}`
fn object_values(body: &Value) -> Option<Vec<String>> {
    let obj = body.as_object()?;
    Some(
        obj.values()
            .filter_map(|value| match value {
                Value::String(id) if !id.is_empty() => Some(id.clone()),
                Value::Object(inner) => inner.get("id").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
    )
}
