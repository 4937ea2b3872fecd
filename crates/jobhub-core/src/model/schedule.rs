use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Programación cron de un workflow. Única por (workflow_id, cron_expression).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub workflow_id: i64,
    pub cron_expression: String,
    pub timezone: Option<String>,
    /// Inactivo => la entrada recurrente no existe en el broker.
    pub active: bool,
    /// Ticks que se consumirán sin crear job.
    pub skip_next_run: u32,
    pub max_retries: Option<u32>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Id de la registración recurrente en el broker.
    pub fn recurring_id(&self) -> String {
        format!("schedule:{}", self.id)
    }
}

/// Datos para upsert de un schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub workflow_id: i64,
    pub cron_expression: String,
    pub timezone: Option<String>,
    pub active: bool,
    pub max_retries: Option<u32>,
    pub context: Value,
}

/// Enlace entre un evento externo y el trigger de un workflow. Se crea al
/// primer dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    pub provider: Option<String>,
    pub connection: Option<String>,
    /// Inactiva => los dispatch crean jobs en DRAFT.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
