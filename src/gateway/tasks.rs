//! Image and video generation. These skip the cost pipeline and the cache entirely.

use bytes::Bytes;
use serde_json::{Value, json};

use super::GatewayError;
use super::provider::{ModelTarget, Provider, ProviderDirectory};
use super::upstream::{Upstream, UpstreamRequest};

const IMAGE_SIZE: &str = "1024x1024";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaTask {
    TextToImage { prompt: String },
    /// `image` is base64 encoded and sent inline as JSON.
    ImageToImage { prompt: String, image: String },
    Video { prompt: String },
}

impl MediaTask {
    /// Builds an image task from the request's `mode`; anything other than `img2img` is
    /// text-to-image.
    pub fn image(mode: &str, prompt: impl Into<String>, image: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if mode == "img2img" {
            MediaTask::ImageToImage {
                prompt,
                image: image.into(),
            }
        } else {
            MediaTask::TextToImage { prompt }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MediaTask::TextToImage { .. } => "text2img",
            MediaTask::ImageToImage { .. } => "img2img",
            MediaTask::Video { .. } => "video",
        }
    }

    pub fn endpoint(&self, provider: &Provider) -> String {
        let path = match self {
            MediaTask::TextToImage { .. } => &provider.image_gen_path,
            MediaTask::ImageToImage { .. } => &provider.image_edit_path,
            MediaTask::Video { .. } => &provider.video_path,
        };
        provider.endpoint(path)
    }

    pub fn payload(&self, model: &str) -> Value {
        match self {
            MediaTask::TextToImage { prompt } => json!({
                "model": model,
                "prompt": prompt,
                "n": 1,
                "size": IMAGE_SIZE,
            }),
            MediaTask::ImageToImage { prompt, image } => json!({
                "model": model,
                "prompt": prompt,
                "image": image,
                "n": 1,
                "size": IMAGE_SIZE,
            }),
            MediaTask::Video { prompt } => json!({
                "model": model,
                "prompt": prompt,
            }),
        }
    }
}

/// Upstream status and raw body, passed through to the caller as-is.
#[derive(Clone, Debug)]
pub struct MediaReply {
    pub status: u16,
    pub body: Bytes,
}

pub async fn run_media_task(
    providers: &dyn ProviderDirectory,
    upstream: &dyn Upstream,
    model: &str,
    task: &MediaTask,
) -> Result<MediaReply, GatewayError> {
    let target = ModelTarget::parse(model).ok_or_else(|| GatewayError::InvalidRequest {
        reason: "invalid model format, expected provider_id::model_id".to_string(),
    })?;
    let provider = providers
        .find_provider(&target.provider_id)
        .await?
        .ok_or_else(|| GatewayError::ProviderNotFound {
            id: target.provider_id.clone(),
        })?;

    let request = UpstreamRequest::for_provider(
        &provider,
        task.endpoint(&provider),
        task.payload(&target.model),
        false,
    );
    tracing::info!(task = task.name(), model = %target, "dispatching media task");

    let response = upstream.call(request).await?;
    let status = response.status;
    let body = response.into_bytes().await?;
    if !(200..300).contains(&status) {
        tracing::warn!(task = task.name(), status, "media task failed upstream");
    }
    Ok(MediaReply { status, body })
}
