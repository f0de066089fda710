use crate::adapters::openai::{ToolCallDraft, stream_leg};
use crate::adapters::{
    ChatMessage, ChunkSink, GENERATE_FAILED, GenerationContext, ProviderAdapter, Role,
    UpstreamError,
};
use crate::catalog::AdapterSettings;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// A server-side tool the model may call mid-generation.
#[async_trait::async_trait]
pub trait ToolRunner: Send + Sync {
    /// OpenAI-style tool spec advertised to the upstream.
    fn spec(&self) -> Value;
    fn name(&self) -> &str;
    /// `arguments` is the raw JSON string assembled from stream fragments.
    /// Errors come back as a string so the model can read and recover.
    async fn execute(&self, arguments: &str) -> Result<String, String>;
}

/// Web search backed by an external search API. The whole response body
/// goes back to the model verbatim; it decides what to quote.
pub struct WebSearchTool {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl WebSearchTool {
    pub fn new(http: reqwest::Client, endpoint: String, api_key: String) -> Self {
        Self {
            http,
            endpoint,
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

#[async_trait::async_trait]
impl ToolRunner for WebSearchTool {
    fn spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "web_search",
                "description": "Search the web for current information.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search terms." }
                    },
                    "required": ["query"],
                },
            },
        })
    }

    fn name(&self) -> &str {
        "web_search"
    }

    async fn execute(&self, arguments: &str) -> Result<String, String> {
        let args: SearchArgs =
            serde_json::from_str(arguments).map_err(|err| format!("invalid arguments: {err}"))?;
        let mut req = self.http.post(&self.endpoint).json(&json!({ "q": args.query }));
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await.map_err(|err| err.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("search returned status {}", resp.status()));
        }
        resp.text().await.map_err(|err| err.to_string())
    }
}

/// Streaming chat adapter with server-side tool execution. Runs upstream
/// legs in a bounded loop rather than recursing: each leg either streams a
/// final answer or requests tool calls, whose results are appended as tool
/// turns before the next leg.
pub struct ToolLoopAdapter {
    tools: Vec<Arc<dyn ToolRunner>>,
}

impl ToolLoopAdapter {
    pub fn new(tools: Vec<Arc<dyn ToolRunner>>) -> Self {
        Self { tools }
    }

    fn specs(&self) -> Value {
        Value::Array(self.tools.iter().map(|tool| tool.spec()).collect())
    }

    fn runner(&self, name: &str) -> Option<&Arc<dyn ToolRunner>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    fn max_depth(ctx: &GenerationContext) -> usize {
        match &ctx.model.settings {
            AdapterSettings::OpenAi(settings) => settings.max_tool_depth as usize,
            _ => 0,
        }
    }

    /// Record the assistant's tool request and each tool's reply on the
    /// transcript so the next leg sees the full exchange.
    async fn append_tool_turns(&self, ctx: &mut GenerationContext, drafts: &[ToolCallDraft]) {
        let calls: Vec<Value> = drafts
            .iter()
            .map(|draft| {
                json!({
                    "id": draft.call_id,
                    "type": "function",
                    "function": { "name": draft.name, "arguments": draft.arguments },
                })
            })
            .collect();
        let mut assistant = ChatMessage::new(Role::Assistant, "");
        assistant.tool_calls = Some(Value::Array(calls));
        ctx.messages.push(assistant);

        for draft in drafts {
            let output = match self.runner(&draft.name) {
                Some(runner) => match runner.execute(&draft.arguments).await {
                    Ok(output) => output,
                    Err(err) => {
                        tracing::warn!(tool = %draft.name, error = %err, "tool execution failed");
                        format!("tool error: {err}")
                    }
                },
                None => format!("unknown tool: {}", draft.name),
            };
            let mut reply = ChatMessage::new(Role::Tool, output);
            reply.tool_call_id = Some(draft.call_id.clone());
            ctx.messages.push(reply);
        }
    }

    async fn run_loop(&self, ctx: &mut GenerationContext, out: &ChunkSink) -> Result<(), UpstreamError> {
        let max_depth = Self::max_depth(ctx);
        let specs = self.specs();
        let mut depth = 0;
        loop {
            let outcome = stream_leg(ctx, out, Some(&specs)).await?;
            // Each leg reports usage relative to its own call; fold the
            // finished leg into the running total before the next one.
            ctx.recorder.checkpoint();
            if outcome.tool_calls.is_empty() {
                return Ok(());
            }
            depth += 1;
            if depth > max_depth {
                tracing::warn!(
                    model = %ctx.model.model,
                    max_depth,
                    "tool call depth exceeded, stopping the loop"
                );
                return Ok(());
            }
            self.append_tool_turns(ctx, &outcome.tool_calls).await;
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ToolLoopAdapter {
    async fn generate(&self, ctx: &mut GenerationContext, out: &ChunkSink) {
        if let Err(err) = self.run_loop(ctx, out).await {
            tracing::warn!(model = %ctx.model.model, error = %err, "tool loop failed");
            out.error(GENERATE_FAILED).await;
        }
        let prices = ctx.model.prices.clone();
        ctx.recorder.finish(prices).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl ToolRunner for Echo {
        fn spec(&self) -> Value {
            json!({
                "type": "function",
                "function": { "name": "echo", "parameters": { "type": "object" } },
            })
        }

        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, arguments: &str) -> Result<String, String> {
            Ok(arguments.to_string())
        }
    }

    #[test]
    fn specs_advertise_every_tool() {
        let adapter = ToolLoopAdapter::new(vec![Arc::new(Echo)]);
        let specs = adapter.specs();
        let names: Vec<&str> = specs
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|spec| spec["function"]["name"].as_str())
            .collect();
        assert_eq!(names, vec!["echo"]);
    }

    #[test]
    fn unknown_runner_lookup_is_none() {
        let adapter = ToolLoopAdapter::new(vec![Arc::new(Echo)]);
        assert!(adapter.runner("echo").is_some());
        assert!(adapter.runner("search").is_none());
    }

    #[tokio::test]
    async fn search_rejects_malformed_arguments_before_calling_out() {
        let tool = WebSearchTool::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/search".to_string(),
            String::new(),
        );
        let err = tool.execute("{\"query\":").await.unwrap_err();
        assert!(err.starts_with("invalid arguments"));
    }
}
