//! Submission collaborator
//!
//! Pass/fail is decided remotely from the captured output; the engine only
//! ships results and reads back the verdict.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use stagecheck_common::config::EngineConfig;
use stagecheck_common::types::{SubmissionRequest, SubmissionResult};
use std::time::Duration;
use tracing::{debug, info, instrument};

#[async_trait]
pub trait Adjudicator: Send + Sync {
    /// Submit one stage's results and return the verdict
    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionResult>;
}

/// Grading service reached over HTTP with a bearer credential
pub struct HttpAdjudicator {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpAdjudicator {
    pub fn new(api_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build submission client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/stages/validate", api_url.trim_end_matches('/')),
            token: token.into(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let Some(token) = config.access_token.as_deref().filter(|t| !t.is_empty()) else {
            bail!("No access token configured. Set STAGECHECK_TOKEN to submit results");
        };
        Self::new(&config.api_url, token, config.request_timeout)
    }
}

#[async_trait]
impl Adjudicator for HttpAdjudicator {
    #[instrument(skip_all, fields(stage_uuid = %request.stage_uuid, tests = request.test_results.len()))]
    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionResult> {
        debug!(endpoint = %self.endpoint, "Submitting stage results");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .context("Failed to reach grading service")?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            bail!("HTTP {} - {}", status.as_u16(), body);
        }

        let verdict: SubmissionResult = response
            .json()
            .await
            .context("Failed to decode grading response")?;

        info!(
            passed = verdict.passed,
            passed_tests = verdict.passed_tests,
            total_tests = verdict.total_tests,
            "Stage adjudicated"
        );
        Ok(verdict)
    }
}
