use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SyncConfig;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("worker dispatch rate limited: {status}")]
    RateLimited { status: u16 },
    #[error("worker dispatch rejected {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("worker dispatch failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid repository `{0}`; expected owner/repo")]
    InvalidRepo(String),
}

/// Wakes the external extraction worker. Delivery is at least once; pickup
/// reconciles whatever the worker produces.
#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, run_id: &str) -> Result<(), TriggerError>;
}

/// Used when no worker is configured; notifications are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl WorkerNotifier for NoopNotifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn notify(&self, run_id: &str) -> Result<(), TriggerError> {
        info!(%run_id, "no worker configured; extraction requests wait for a manual run");
        Ok(())
    }
}

/// Dispatches a GitHub Actions workflow run.
#[derive(Debug, Clone)]
pub struct GithubWorkflowNotifier {
    client: reqwest::Client,
    api_base: String,
    repo: String,
    workflow: String,
    git_ref: String,
    token: String,
}

impl GithubWorkflowNotifier {
    pub fn new(
        token: impl Into<String>,
        repo: &str,
        workflow: impl Into<String>,
        git_ref: impl Into<String>,
    ) -> Result<Self, TriggerError> {
        let valid = repo
            .split_once('/')
            .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
        if !valid {
            return Err(TriggerError::InvalidRepo(repo.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("tabula/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: GITHUB_API_BASE.to_string(),
            repo: repo.to_string(),
            workflow: workflow.into(),
            git_ref: git_ref.into(),
            token: token.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn dispatch_url(&self) -> String {
        format!(
            "{}/repos/{}/actions/workflows/{}/dispatches",
            self.api_base, self.repo, self.workflow
        )
    }
}

#[async_trait]
impl WorkerNotifier for GithubWorkflowNotifier {
    fn name(&self) -> &'static str {
        "github-workflow"
    }

    async fn notify(&self, run_id: &str) -> Result<(), TriggerError> {
        let response = self
            .client
            .post(self.dispatch_url())
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&json!({ "ref": self.git_ref, "inputs": { "run_id": run_id } }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            info!(%run_id, workflow = %self.workflow, "worker dispatched");
            return Ok(());
        }
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TriggerError::RateLimited {
                status: status.as_u16(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(TriggerError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// GitHub dispatch when a token and repository are configured, else no-op.
pub fn notifier_from_config(config: &SyncConfig) -> Result<Arc<dyn WorkerNotifier>, TriggerError> {
    match (&config.github_token, &config.github_repo) {
        (Some(token), Some(repo)) => Ok(Arc::new(GithubWorkflowNotifier::new(
            token.clone(),
            repo,
            config.github_workflow.clone(),
            config.github_ref.clone(),
        )?)),
        (Some(_), None) => {
            warn!("TABULA_GITHUB_TOKEN set without TABULA_GITHUB_REPO; worker dispatch disabled");
            Ok(Arc::new(NoopNotifier))
        }
        _ => Ok(Arc::new(NoopNotifier)),
    }
}
