use crate::adapters::{
    ChunkSink, GENERATE_FAILED, GenerationContext, ProviderAdapter, UpstreamError, join_url,
    rehost_image_markdown,
};
use crate::catalog::AdapterSettings;
use crate::config::ImageJobSettings;
use crate::pricing::UsageCounters;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;

/// Adapter for asynchronous image providers: submit a job, then poll its
/// status until it settles. Each poll emits an empty text chunk so the
/// downstream connection sees liveness while the job renders.
pub struct ImageJobAdapter;

enum JobState {
    Pending,
    Done { image_url: String },
    Failed { reason: String },
}

impl ImageJobAdapter {
    fn settings(ctx: &GenerationContext) -> Result<ImageJobSettings, UpstreamError> {
        match &ctx.model.settings {
            AdapterSettings::ImageJob(settings) => Ok(settings.clone()),
            _ => Err(UpstreamError::Decode(
                "model is not configured for the image job provider".to_string(),
            )),
        }
    }

    async fn submit(
        &self,
        ctx: &GenerationContext,
        settings: &ImageJobSettings,
    ) -> Result<String, UpstreamError> {
        let prompt = ctx
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let resp = ctx
            .http
            .post(join_url(&settings.base_url, &settings.submit_path))
            .bearer_auth(&settings.api_key)
            .json(&json!({ "prompt": prompt }))
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
        value
            .get("result")
            .and_then(|v| v.as_str())
            .map(|id| id.to_string())
            .ok_or_else(|| UpstreamError::Decode("no job id in submit response".to_string()))
    }

    async fn poll(
        &self,
        ctx: &GenerationContext,
        settings: &ImageJobSettings,
        job_id: &str,
    ) -> Result<JobState, UpstreamError> {
        let path = settings.result_path.replace("{id}", job_id);
        let resp = ctx
            .http
            .get(join_url(&settings.base_url, &path))
            .bearer_auth(&settings.api_key)
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
        let state = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
        match state {
            "SUCCESS" => {
                let image_url = value
                    .get("imageUrl")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        UpstreamError::Decode("finished job has no image url".to_string())
                    })?;
                Ok(JobState::Done {
                    image_url: image_url.to_string(),
                })
            }
            "FAILURE" => {
                let reason = value
                    .get("failReason")
                    .and_then(|v| v.as_str())
                    .unwrap_or(GENERATE_FAILED);
                Ok(JobState::Failed {
                    reason: reason.to_string(),
                })
            }
            _ => Ok(JobState::Pending),
        }
    }

    async fn run_job(&self, ctx: &mut GenerationContext, out: &ChunkSink) -> Result<(), UpstreamError> {
        let settings = Self::settings(ctx)?;
        let job_id = self.submit(ctx, &settings).await?;
        ctx.recorder.set_chat_id(&job_id).await;
        tracing::info!(model = %ctx.model.model, job_id = %job_id, "image job submitted");

        let deadline = Instant::now() + Duration::from_millis(settings.job_timeout_ms);
        loop {
            if Instant::now() >= deadline {
                return Err(UpstreamError::Decode(format!(
                    "image job {job_id} did not settle within {}ms",
                    settings.job_timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(settings.poll_interval_ms)).await;
            // Keep-alive: tells the client the session is still live.
            out.text("").await;
            match self.poll(ctx, &settings, &job_id).await? {
                JobState::Pending => continue,
                JobState::Failed { reason } => {
                    out.error(reason).await;
                    return Ok(());
                }
                JobState::Done { image_url } => {
                    ctx.recorder
                        .report(UsageCounters {
                            prompt_tokens: 0,
                            completion_tokens: 0,
                            image_count: 1,
                        })
                        .await;
                    let markdown = rehost_image_markdown(ctx, &image_url).await?;
                    out.text(markdown).await;
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ImageJobAdapter {
    async fn generate(&self, ctx: &mut GenerationContext, out: &ChunkSink) {
        if let Err(err) = self.run_job(ctx, out).await {
            tracing::warn!(model = %ctx.model.model, error = %err, "image job failed");
            out.error(GENERATE_FAILED).await;
        }
        let prices = ctx.model.prices.clone();
        ctx.recorder.finish(prices).await;
    }
}
