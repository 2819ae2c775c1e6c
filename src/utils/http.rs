use bytes::Bytes;
use futures_util::StreamExt;

use crate::{AdaError, Result};

pub(crate) const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

pub(crate) async fn response_bytes_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> (Vec<u8>, bool) {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    (out, truncated)
}

pub(crate) async fn send_checked_bytes(req: reqwest::RequestBuilder) -> Result<Bytes> {
    let response = req.send().await?;
    let status = response.status();
    let (bytes, truncated) = response_bytes_truncated(response, MAX_RESPONSE_BODY_BYTES).await;
    let bytes = Bytes::from(bytes);
    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes).to_string();
        if truncated {
            return Err(AdaError::Api {
                status,
                body: format!("{body}\n...(truncated)"),
            });
        }
        return Err(AdaError::Api { status, body });
    }
    if truncated {
        return Err(AdaError::InvalidResponse(format!(
            "response exceeded max bytes ({MAX_RESPONSE_BODY_BYTES})"
        )));
    }
    Ok(bytes)
}
