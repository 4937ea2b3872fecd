use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fila persistida de un workflow del catálogo. Se crea perezosamente la
/// primera vez que se usa la definición (run, repeat, bootstrap de triggers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub internal: bool,
    /// Un workflow inactivo mantiene su cola pausada y sus schedules fuera del broker.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
