//! Errores del core.
//!
//! `HubError` es la taxonomía visible para los llamadores (coordinador,
//! triggers, CLI). `StepError` es la señal de fallo que devuelve el código de
//! un step; el engine la registra y decide retry/fallo. `StoreError` y
//! `QueueError` son los errores de los adaptadores (gateway y broker).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::JobStatus;

/// Fallo producido por el código de un step.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    /// Detalle opcional que se persiste como resultado del step para diagnóstico.
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(),
               details: None }
    }

    pub fn with_details(message: impl Into<String>, details: Value) -> Self {
        Self { message: message.into(),
               details: Some(details) }
    }

    /// Representación JSON guardada en `JobStep.result` cuando el step falla.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "error": self.message,
            "details": self.details,
        })
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("json: {err}"))
    }
}

/// Errores del Persistence Gateway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Errores del Durable Queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("broker job not found: {0}")]
    NotFound(String),
    #[error("invalid cron pattern '{0}'")]
    InvalidPattern(String),
    #[error("timed out waiting for broker job {0}")]
    Timeout(String),
    #[error("broker backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("duplicate workflow key: {0}")]
    DuplicateWorkflowKey(String),
    #[error("job {job_id} is not paused (status {status})")]
    NotPaused { job_id: Uuid, status: JobStatus },
    #[error("job {job_id} cannot be cancelled from status {status}")]
    NotCancellable { job_id: Uuid, status: JobStatus },
    #[error("job {job_id} is not a draft (status {status})")]
    NotDraft { job_id: Uuid, status: JobStatus },
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(i64),
    #[error("invalid cron expression '{0}'")]
    InvalidCron(String),
    #[error("step '{step}' failed: {source}")]
    StepExecution {
        step: String,
        #[source]
        source: StepError,
    },
    #[error("token refresh for '{0}' timed out")]
    TokenRefreshTimeout(String),
    #[error("token refresh for '{connection}' failed: {reason}")]
    TokenRefreshFailed { connection: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("internal: {0}")]
    Internal(String),
}

impl HubError {
    /// Errores que nunca deben reintentarse (el llamador recibe el fallo tal cual).
    pub fn is_fatal(&self) -> bool {
        matches!(self,
                 HubError::WorkflowNotFound(_)
                 | HubError::DuplicateWorkflowKey(_)
                 | HubError::NotPaused { .. }
                 | HubError::NotCancellable { .. }
                 | HubError::NotDraft { .. }
                 | HubError::InvalidCron(_))
    }
}
