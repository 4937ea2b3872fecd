use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ParseStatusError;

/// Estado de un par (job, step).
///
/// - `Running` -> `Succeeded`
/// - `Running` -> `Failed` (sin presupuesto de reintentos)
/// - `Running` -> `WaitingRerun` (rerun explícito, pausa o reintento pendiente)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStepStatus {
    Running,
    Succeeded,
    Failed,
    WaitingRerun,
}

impl JobStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStepStatus::Running => "RUNNING",
            JobStepStatus::Succeeded => "SUCCEEDED",
            JobStepStatus::Failed => "FAILED",
            JobStepStatus::WaitingRerun => "WAITING_RERUN",
        }
    }
}

impl fmt::Display for JobStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStepStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(JobStepStatus::Running),
            "SUCCEEDED" => Ok(JobStepStatus::Succeeded),
            "FAILED" => Ok(JobStepStatus::Failed),
            "WAITING_RERUN" => Ok(JobStepStatus::WaitingRerun),
            other => Err(ParseStatusError { kind: "step status",
                                            value: other.to_string() }),
        }
    }
}

/// Exactamente una fila por (job_id, name): se hace upsert al iniciar el step
/// y se actualiza al terminar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub id: i64,
    pub job_id: Uuid,
    pub name: String,
    /// Índice declarado del step en la definición.
    pub step_index: u32,
    pub status: JobStepStatus,
    /// Número de ejecuciones (incluye reruns y reintentos).
    pub runs: u32,
    /// Número de ejecuciones que fueron reintentos tras un error.
    pub retries: u32,
    /// Valor de retorno durable del step (o detalle del error si falló).
    pub result: Option<Value>,
    /// Datos externos entregados por `resume` para la reentrada tras una pausa.
    pub resume: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
