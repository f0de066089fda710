use crate::adapters::{
    ChunkSink, GENERATE_FAILED, GenerationContext, ProviderAdapter, UpstreamError,
};
use crate::catalog::AdapterSettings;
use crate::config::SignedSettings;
use crate::pricing::UsageCounters;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Canonical string: sorted `key=value` pairs joined with `&`, prefixed
/// with the request line. The BTreeMap gives the sort.
fn canonical_string(endpoint: &str, path: &str, params: &BTreeMap<String, String>) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("POST{endpoint}{path}?{query}")
}

fn sign(secret_key: &str, canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Accumulates raw body bytes across TCP reads and yields complete
/// `data: {json}` frames. A frame is only surfaced once its full payload
/// and the blank-line terminator have arrived.
pub(crate) struct FrameBuffer {
    buf: String,
    matcher: Regex,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: String::new(),
            matcher: Regex::new(r"(?s)data:\s*(\{.*?\})\n\n").expect("static regex"),
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut frames = Vec::new();
        loop {
            let Some(captures) = self.matcher.captures(&self.buf) else {
                break;
            };
            let frame = captures.get(1).map(|m| m.as_str().to_string());
            let end = captures.get(0).map(|m| m.end()).unwrap_or(0);
            self.buf.drain(..end);
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Adapter for the proprietary signed streaming protocol: one POST whose
/// canonical parameters are HMAC-signed, answered with a custom
/// `data: {json}` framing inside the response body.
pub struct SignedStreamAdapter;

impl SignedStreamAdapter {
    fn settings(ctx: &GenerationContext) -> Result<SignedSettings, UpstreamError> {
        match &ctx.model.settings {
            AdapterSettings::Signed(settings) => Ok(settings.clone()),
            _ => Err(UpstreamError::Decode(
                "model is not configured for the signed provider".to_string(),
            )),
        }
    }

    async fn stream(
        &self,
        ctx: &mut GenerationContext,
        out: &ChunkSink,
    ) -> Result<(), UpstreamError> {
        let settings = Self::settings(ctx)?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce = uuid::Uuid::new_v4().simple().to_string();

        let mut params = BTreeMap::new();
        params.insert("model".to_string(), ctx.model.upstream_model.clone());
        params.insert("secret_id".to_string(), settings.secret_id.clone());
        params.insert("timestamp".to_string(), timestamp.clone());
        params.insert("nonce".to_string(), nonce.clone());
        params.insert("stream".to_string(), "1".to_string());
        let canonical = canonical_string(&settings.endpoint, &settings.path, &params);
        let signature = sign(&settings.secret_key, &canonical);

        let body = serde_json::json!({
            "model": ctx.model.upstream_model,
            "messages": crate::adapters::outbound_messages(ctx),
            "temperature": ctx.params.temperature,
            "top_p": ctx.params.top_p,
            "stream": true,
        });
        let base = if settings.endpoint.contains("://") {
            settings.endpoint.clone()
        } else {
            format!("https://{}", settings.endpoint)
        };
        let resp = ctx
            .http
            .post(format!("{base}{}", settings.path))
            .header("Authorization", signature)
            .header("X-Secret-Id", &settings.secret_id)
            .header("X-Timestamp", &timestamp)
            .header("X-Nonce", &nonce)
            .timeout(Duration::from_millis(settings.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let mut frames = FrameBuffer::new();
        let mut stream = resp.bytes_stream();
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(UpstreamError::from_reqwest)?;
            for frame in frames.push(&chunk) {
                let value: Value = match serde_json::from_str(&frame) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                // An error frame is terminal; nothing behind it may be
                // forwarded.
                if self.handle_frame(ctx, out, &value).await {
                    break 'read;
                }
            }
        }
        Ok(())
    }

    /// Returns true when the frame ended the stream.
    async fn handle_frame(
        &self,
        ctx: &mut GenerationContext,
        out: &ChunkSink,
        frame: &Value,
    ) -> bool {
        if let Some(chat_id) = frame.get("Id").and_then(|v| v.as_str()) {
            ctx.recorder.set_chat_id(chat_id).await;
        }
        if let Some(usage) = frame.get("Usage") {
            ctx.recorder
                .report(UsageCounters {
                    prompt_tokens: usage
                        .get("PromptTokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    completion_tokens: usage
                        .get("CompletionTokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    image_count: 0,
                })
                .await;
        }
        if let Some(message) = frame.get("ErrorMsg").and_then(|v| v.as_str()) {
            out.error(message).await;
            return true;
        }
        let Some(content) = frame
            .get("Choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("Delta"))
            .and_then(|delta| delta.get("Content"))
            .and_then(|v| v.as_str())
        else {
            return false;
        };
        if !content.is_empty() {
            out.text(content).await;
        }
        false
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for SignedStreamAdapter {
    async fn generate(&self, ctx: &mut GenerationContext, out: &ChunkSink) {
        if let Err(err) = self.stream(ctx, out).await {
            tracing::warn!(model = %ctx.model.model, error = %err, "signed upstream call failed");
            out.error(GENERATE_FAILED).await;
        }
        let prices = ctx.model.prices.clone();
        ctx.recorder.finish(prices).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_sorts_parameters() {
        let mut params = BTreeMap::new();
        params.insert("timestamp".to_string(), "100".to_string());
        params.insert("model".to_string(), "m1".to_string());
        params.insert("nonce".to_string(), "abc".to_string());
        let canonical = canonical_string("api.example.com", "/chat", &params);
        assert_eq!(
            canonical,
            "POSTapi.example.com/chat?model=m1&nonce=abc&timestamp=100"
        );
    }

    #[test]
    fn signature_is_deterministic() {
        assert_eq!(sign("key", "payload"), sign("key", "payload"));
        assert_ne!(sign("key", "payload"), sign("other", "payload"));
    }

    #[test]
    fn frames_reassemble_across_partial_reads() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(b"data: {\"Id\":").is_empty());
        assert!(buffer.push(b" \"c1\"}").is_empty());
        let frames = buffer.push(b"\n\n");
        assert_eq!(frames, vec!["{\"Id\": \"c1\"}".to_string()]);
    }

    #[test]
    fn one_read_can_carry_multiple_frames() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: {\"c\"");
        assert_eq!(
            frames,
            vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]
        );
        assert_eq!(buffer.push(b":3}\n\n"), vec!["{\"c\":3}".to_string()]);
    }
}
