//! Handler registry: maps a job name to the handler chosen at startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::job::Job;

/// Failure of a job execution.
#[derive(Debug, Error)]
pub enum JobError {
    /// Worth another attempt while the job's budget lasts.
    #[error("retryable job failure: {0}")]
    Retryable(anyhow::Error),

    /// Never retried; logged and dropped.
    #[error("terminal job failure: {0}")]
    Terminal(anyhow::Error),
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Retryable(err)
    }
}

impl From<campaign_core::CampaignError> for JobError {
    fn from(err: campaign_core::CampaignError) -> Self {
        JobError::Retryable(err.into())
    }
}

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Name-keyed handler table.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any earlier registration.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler registered for `job.name`.
    pub async fn dispatch(&self, job: &Job) -> Result<(), JobError> {
        let handler = self.handlers.get(&job.name).ok_or_else(|| {
            JobError::Terminal(anyhow::anyhow!("no handler registered for job `{}`", job.name))
        })?;
        debug!(job = %job.name, job_id = ?job.options.job_id, "Dispatching job");
        handler.handle(job).await
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
