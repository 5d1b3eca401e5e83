use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::registry::JobError;

/// Scheduling options carried with every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Idempotency key: at most one pending job per id.
    #[serde(default)]
    pub job_id: Option<String>,
}

fn default_attempts() -> u32 {
    3
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            attempts: default_attempts(),
            job_id: None,
        }
    }
}

/// A named unit of work with a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}

impl Job {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            options: JobOptions::default(),
        }
    }

    /// Build a job from any serializable payload.
    pub fn from_payload<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(name, serde_json::to_value(payload)?))
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.options.delay_ms = delay_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.options.attempts = attempts.max(1);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.options.job_id = Some(job_id.into());
        self
    }

    /// Decode the payload. A payload that does not decode can never
    /// succeed, so the error is terminal.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| JobError::Terminal(anyhow::anyhow!("job `{}` payload: {e}", self.name)))
    }
}

/// A job as handed to a worker, with its 1-based attempt number.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job: Job,
    pub attempt: u32,
}

impl QueuedJob {
    pub fn first(job: Job) -> Self {
        Self { job, attempt: 1 }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.job.options.attempts
    }
}
