//! Job: un intento de ejecución de un workflow.
//!
//! Transiciones válidas:
//! - `Draft` -> `Waiting` (activación explícita)
//! - `Waiting` -> `Running`
//! - `Running` -> `Paused | Delayed | WaitingRerun | Succeeded | Failed | Cancelled`
//! - `Paused | Delayed | WaitingRerun` -> `Running` (resume o timer del broker)
//! - `Paused | Delayed | WaitingRerun` -> `Cancelled` (cancel del coordinador)
//!
//! `Succeeded`, `Failed` y `Cancelled` son terminales; un job nunca se borra.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ParseStatusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Draft,
    Waiting,
    Running,
    Paused,
    Delayed,
    WaitingRerun,
    Stalled,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [JobStatus::Draft,
                                      JobStatus::Waiting,
                                      JobStatus::Running,
                                      JobStatus::Paused,
                                      JobStatus::Delayed,
                                      JobStatus::WaitingRerun,
                                      JobStatus::Stalled,
                                      JobStatus::Succeeded,
                                      JobStatus::Failed,
                                      JobStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Draft => "DRAFT",
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Delayed => "DELAYED",
            JobStatus::WaitingRerun => "WAITING_RERUN",
            JobStatus::Stalled => "STALLED",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Estados desde los que `cancel` está permitido.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Delayed | JobStatus::WaitingRerun)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL.iter()
                      .copied()
                      .find(|st| st.as_str() == s)
                      .ok_or_else(|| ParseStatusError { kind: "job status",
                                                        value: s.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobTrigger {
    Manual,
    Schedule,
    Event,
    Webhook,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Manual => "MANUAL",
            JobTrigger::Schedule => "SCHEDULE",
            JobTrigger::Event => "EVENT",
            JobTrigger::Webhook => "WEBHOOK",
        }
    }
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTrigger {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(JobTrigger::Manual),
            "SCHEDULE" => Ok(JobTrigger::Schedule),
            "EVENT" => Ok(JobTrigger::Event),
            "WEBHOOK" => Ok(JobTrigger::Webhook),
            other => Err(ParseStatusError { kind: "job trigger",
                                            value: other.to_string() }),
        }
    }
}

/// Parámetros de encolado guardados con el job; `execute_draft` los reutiliza.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
}

impl JobOptions {
    /// Presupuesto total de entregas (primer intento + reintentos).
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub workflow_id: i64,
    pub parent_id: Option<Uuid>,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub trigger_id: Option<String>,
    pub payload: Value,
    pub dedupe_id: Option<String>,
    pub options: JobOptions,
    /// Índice del próximo step a ejecutar según la última transición persistida
    /// (copia de auditoría; el puntero autoritativo viaja en el mensaje del broker).
    pub checkpoint: Option<u32>,
    /// Ids de correlación para trazas.
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Datos para insertar un job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: Uuid,
    pub workflow_id: i64,
    pub parent_id: Option<Uuid>,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub trigger_id: Option<String>,
    pub payload: Value,
    pub dedupe_id: Option<String>,
    pub options: JobOptions,
    pub context: Value,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job { id: self.id,
              workflow_id: self.workflow_id,
              parent_id: self.parent_id,
              status: self.status,
              trigger: self.trigger,
              trigger_id: self.trigger_id,
              payload: self.payload,
              dedupe_id: self.dedupe_id,
              options: self.options,
              checkpoint: None,
              context: self.context,
              created_at: now,
              updated_at: now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_roundtrip_covers_all_variants() {
        for st in JobStatus::ALL {
            assert_eq!(st.as_str().parse::<JobStatus>().unwrap(), st);
        }
        assert!("NOPE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_and_cancellable_sets_are_disjoint() {
        for st in JobStatus::ALL {
            assert!(!(st.is_terminal() && st.is_cancellable()), "{st}");
        }
        assert!(JobStatus::WaitingRerun.is_cancellable());
        assert!(!JobStatus::Running.is_cancellable());
    }

    #[test]
    fn attempts_include_first_delivery() {
        let opts = JobOptions { scheduled_at: None,
                                max_retries: 2 };
        assert_eq!(opts.attempts(), 3);
    }
}
