use crate::catalog::ModelConfig;
use crate::objectstore::ObjectStore;
use crate::usage::UsageRecorder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod imagejob;
pub mod openai;
pub mod reasoning;
pub mod signed;
pub mod tools;

/// Text shown to the client when an upstream call fails for any reason the
/// provider did not put into words itself.
pub const GENERATE_FAILED: &str = "generation failed, please try again later";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// One unit of normalized adapter output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChunk {
    Text(String),
    Reasoning(String),
    /// Terminal: the stream ends after this chunk.
    Error(String),
}

/// Failures talking to an upstream provider. These never escape an
/// adapter; they are rendered into a terminal [`ChatChunk::Error`].
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Everything an adapter needs for one generation session. The recorder is
/// single-writer: only the adapter task touches the usage record until it
/// finishes.
pub struct GenerationContext {
    pub model: ModelConfig,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub user_id: String,
    pub recorder: UsageRecorder,
    pub http: reqwest::Client,
    pub objects: Arc<dyn ObjectStore>,
    pub rehost_images: bool,
}

/// Chunk channel into the relay. Send failures mean the relay stopped
/// pulling; adapters ignore them and run their current step to completion.
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<ChatChunk>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<ChatChunk>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, chunk: ChatChunk) {
        let _ = self.tx.send(chunk).await;
    }

    pub async fn text(&self, content: impl Into<String>) {
        self.send(ChatChunk::Text(content.into())).await;
    }

    pub async fn reasoning(&self, content: impl Into<String>) {
        self.send(ChatChunk::Reasoning(content.into())).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.send(ChatChunk::Error(message.into())).await;
    }
}

/// Translates one upstream protocol into the common chunk contract.
///
/// The produced sequence is lazy, finite and non-restartable: it always
/// terminates, and a failure surfaces as a single terminal error chunk
/// while the usage record is still finalized (with whatever counters were
/// observed, possibly zero). `generate` must not panic or return errors.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn generate(&self, ctx: &mut GenerationContext, out: &ChunkSink);
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProviderAdapter")
    }
}

/// Messages as they go on the wire: models that reject the system role
/// get those turns downgraded to user turns.
pub(crate) fn outbound_messages(ctx: &GenerationContext) -> Vec<ChatMessage> {
    downgrade_system(&ctx.messages, ctx.model.supports_system)
}

fn downgrade_system(messages: &[ChatMessage], supports_system: bool) -> Vec<ChatMessage> {
    let mut messages = messages.to_vec();
    if !supports_system {
        for message in &mut messages {
            if message.role == Role::System {
                message.role = Role::User;
            }
        }
    }
    messages
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Download an upstream image and re-host it through the object store,
/// returning the markdown reference to emit. Falls back to the upstream
/// URL when re-hosting is disabled.
pub(crate) async fn rehost_image_markdown(
    ctx: &GenerationContext,
    upstream_url: &str,
) -> Result<String, UpstreamError> {
    if !ctx.rehost_images {
        return Ok(format!("![output]({upstream_url})"));
    }
    let resp = ctx
        .http
        .get(upstream_url)
        .send()
        .await
        .map_err(UpstreamError::from_reqwest)?;
    if !resp.status().is_success() {
        return Err(UpstreamError::Http {
            status: resp.status().as_u16(),
            message: "image download failed".to_string(),
        });
    }
    let extension = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split('/').next_back())
        .unwrap_or("png")
        .to_string();
    let bytes = resp
        .bytes()
        .await
        .map_err(UpstreamError::from_reqwest)?
        .to_vec();
    let name = format!("{}.{extension}", uuid::Uuid::new_v4().simple());
    let url = ctx
        .objects
        .put_object(bytes, &name)
        .await
        .map_err(UpstreamError::Decode)?;
    Ok(format!("![output]({url})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_turns_downgrade_when_unsupported() {
        let messages = vec![
            ChatMessage::new(Role::System, "be terse"),
            ChatMessage::new(Role::User, "hi"),
        ];
        let downgraded = downgrade_system(&messages, false);
        assert_eq!(downgraded[0].role, Role::User);
        assert_eq!(downgraded[0].content, "be terse");
        let kept = downgrade_system(&messages, true);
        assert_eq!(kept[0].role, Role::System);
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("https://api.example.com/v1/", "/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.example.com", "images/generations"),
            "https://api.example.com/images/generations"
        );
    }
}
