use crate::adapters::reasoning::ReasoningSplitter;
use crate::adapters::{
    ChatChunk, ChunkSink, GENERATE_FAILED, GenerationContext, ProviderAdapter, UpstreamError,
    join_url, rehost_image_markdown,
};
use crate::catalog::AdapterSettings;
use crate::config::OpenAiSettings;
use crate::pricing::UsageCounters;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;

/// A tool invocation assembled from streamed fragments.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDraft {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// What one upstream streaming call produced besides forwarded chunks.
#[derive(Debug, Default)]
pub struct LegOutcome {
    pub tool_calls: Vec<ToolCallDraft>,
}

fn openai_settings(ctx: &GenerationContext) -> Result<OpenAiSettings, UpstreamError> {
    match &ctx.model.settings {
        AdapterSettings::OpenAi(settings) => Ok(settings.clone()),
        _ => Err(UpstreamError::Decode(
            "model is not configured for an openai-compatible provider".to_string(),
        )),
    }
}

/// One streaming chat call against an OpenAI-compatible upstream. Forwards
/// text deltas (through the reasoning splitter when configured), merges
/// usage reports into the recorder, and collects tool-call fragments for
/// the caller. Usage comes from the last usage-bearing chunk, not a sum.
pub(crate) async fn stream_leg(
    ctx: &mut GenerationContext,
    out: &ChunkSink,
    tools: Option<&Value>,
) -> Result<LegOutcome, UpstreamError> {
    let settings = openai_settings(ctx)?;
    let mut body = json!({
        "model": ctx.model.upstream_model,
        "messages": crate::adapters::outbound_messages(ctx),
        "stream": true,
    });
    if settings.include_usage {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if let Some(temperature) = ctx.params.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = ctx.params.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(tools) = tools {
        body["tools"] = tools.clone();
    }

    let resp = ctx
        .http
        .post(join_url(&settings.base_url, "/chat/completions"))
        .bearer_auth(&settings.api_key)
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

    let mut splitter = settings
        .reasoning_tag
        .as_deref()
        .map(ReasoningSplitter::new);
    let mut drafts: Vec<ToolCallDraft> = Vec::new();
    let mut stream = resp.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event.map_err(|err| UpstreamError::Decode(err.to_string()))?;
        if event.data.trim() == "[DONE]" {
            break;
        }
        let value: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if let Some(chat_id) = value.get("id").and_then(|v| v.as_str()) {
            ctx.recorder.set_chat_id(chat_id).await;
        }
        if let Some(usage) = value.get("usage").filter(|v| !v.is_null()) {
            ctx.recorder
                .report(UsageCounters {
                    prompt_tokens: usage
                        .get("prompt_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    completion_tokens: usage
                        .get("completion_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0),
                    image_count: 0,
                })
                .await;
        }
        let Some(delta) = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
        else {
            continue;
        };
        if let Some(fragments) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            accumulate_tool_fragments(&mut drafts, fragments);
        }
        if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
            if content.is_empty() {
                continue;
            }
            let chunk = match splitter.as_mut() {
                Some(splitter) => splitter.feed(content.to_string()),
                None => Some(ChatChunk::Text(content.to_string())),
            };
            if let Some(chunk) = chunk {
                out.send(chunk).await;
            }
        }
    }
    Ok(LegOutcome { tool_calls: drafts })
}

/// Fragments carry an index plus whichever of {id, name, arguments} this
/// chunk happened to include; arguments concatenate across chunks.
fn accumulate_tool_fragments(drafts: &mut Vec<ToolCallDraft>, fragments: &[Value]) {
    for fragment in fragments {
        let index = fragment
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(drafts.len() as u64) as usize;
        if drafts.len() <= index {
            drafts.resize_with(index + 1, ToolCallDraft::default);
        }
        let draft = &mut drafts[index];
        if let Some(call_id) = fragment.get("id").and_then(|v| v.as_str()) {
            if !call_id.is_empty() {
                draft.call_id = call_id.to_string();
            }
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    draft.name = name.to_string();
                }
            }
            if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                draft.arguments.push_str(arguments);
            }
        }
    }
}

/// OpenAI-compatible streaming chat adapter.
pub struct OpenAiChatAdapter;

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiChatAdapter {
    async fn generate(&self, ctx: &mut GenerationContext, out: &ChunkSink) {
        if let Err(err) = stream_leg(ctx, out, None).await {
            tracing::warn!(model = %ctx.model.model, error = %err, "upstream chat call failed");
            out.error(GENERATE_FAILED).await;
        }
        let prices = ctx.model.prices.clone();
        ctx.recorder.finish(prices).await;
    }
}

/// OpenAI-compatible image generation adapter. Non-streaming upstream: one
/// call, one terminal markdown chunk referencing the (re-hosted) image.
pub struct OpenAiImageAdapter;

impl OpenAiImageAdapter {
    async fn generate_image(
        &self,
        ctx: &mut GenerationContext,
        out: &ChunkSink,
    ) -> Result<(), UpstreamError> {
        let settings = openai_settings(ctx)?;
        let prompt = ctx
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let body = json!({
            "model": ctx.model.upstream_model,
            "prompt": prompt,
            "n": 1,
        });
        let resp = ctx
            .http
            .post(join_url(&settings.base_url, "/images/generations"))
            .bearer_auth(&settings.api_key)
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
        let value: Value = resp
            .json()
            .await
            .map_err(|err| UpstreamError::Decode(err.to_string()))?;
        let url = value
            .get("data")
            .and_then(|v| v.as_array())
            .and_then(|data| data.first())
            .and_then(|item| item.get("url"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamError::Decode("no image url in response".to_string()))?;
        ctx.recorder
            .report(UsageCounters {
                prompt_tokens: 0,
                completion_tokens: 0,
                image_count: 1,
            })
            .await;
        let markdown = rehost_image_markdown(ctx, url).await?;
        out.text(markdown).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiImageAdapter {
    async fn generate(&self, ctx: &mut GenerationContext, out: &ChunkSink) {
        if let Err(err) = self.generate_image(ctx, out).await {
            tracing::warn!(model = %ctx.model.model, error = %err, "upstream image call failed");
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
    fn tool_fragments_accumulate_by_index() {
        let mut drafts = Vec::new();
        accumulate_tool_fragments(
            &mut drafts,
            &[json!({
                "index": 0,
                "id": "call_1",
                "function": { "name": "web_search", "arguments": "{\"qu" },
            })],
        );
        accumulate_tool_fragments(
            &mut drafts,
            &[json!({
                "index": 0,
                "function": { "arguments": "ery\":\"rust\"}" },
            })],
        );
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].call_id, "call_1");
        assert_eq!(drafts[0].name, "web_search");
        assert_eq!(drafts[0].arguments, "{\"query\":\"rust\"}");
    }

    #[test]
    fn parallel_tool_calls_keep_separate_slots() {
        let mut drafts = Vec::new();
        accumulate_tool_fragments(
            &mut drafts,
            &[
                json!({ "index": 0, "id": "call_a", "function": { "name": "one", "arguments": "{}" } }),
                json!({ "index": 1, "id": "call_b", "function": { "name": "two", "arguments": "{" } }),
            ],
        );
        accumulate_tool_fragments(
            &mut drafts,
            &[json!({ "index": 1, "function": { "arguments": "}" } })],
        );
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].name, "one");
        assert_eq!(drafts[1].call_id, "call_b");
        assert_eq!(drafts[1].arguments, "{}");
    }
}
