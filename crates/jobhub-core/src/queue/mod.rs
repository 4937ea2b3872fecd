//! Durable Queue: contrato del broker.
//!
//! Una cola con nombre por workflow (el nombre es la clave del workflow),
//! entregas at-least-once con lock de visibilidad, mensajes diferidos,
//! registraciones recurrentes (cron) y primitivas sobre el mensaje en vuelo.
//!
//! El mensaje es el puntero autoritativo de reanudación: `step_index` indica
//! el primer step que todavía debe correr. La fila `Job` es sólo la traza
//! durable; el engine escribe primero la fila y después avanza el mensaje.

mod cron_spec;
mod memory;

pub use cron_spec::{next_tick, parse_cron, parse_timezone};
pub use memory::InMemoryQueue;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::QueueError;
use crate::model::JobTrigger;
use crate::workflow::RateLimit;

/// Contenido de un mensaje del broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// `None` en ticks cron: el engine deriva un id determinista.
    pub job_id: Option<Uuid>,
    pub workflow_key: String,
    /// Checkpoint: índice declarado del próximo step a ejecutar.
    pub step_index: Option<u32>,
    /// La próxima entrega es un reintento tras error.
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub payload: Value,
    pub trigger: JobTrigger,
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub schedule_id: Option<i64>,
    #[serde(default)]
    pub context: Value,
}

impl QueueMessage {
    pub fn for_job(job_id: Uuid, workflow_key: impl Into<String>, trigger: JobTrigger) -> Self {
        Self { job_id: Some(job_id),
               workflow_key: workflow_key.into(),
               step_index: None,
               is_retry: false,
               payload: Value::Null,
               trigger,
               trigger_id: None,
               schedule_id: None,
               context: Value::Null }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    /// Entregas máximas (primer intento + reintentos).
    pub attempts: u32,
    /// Id explícito; un id existente devuelve el mensaje existente.
    pub id: Option<String>,
    /// Mientras exista un mensaje no terminado con esta clave se devuelve ese.
    pub dedupe: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { delay: None,
               attempts: 1,
               id: None,
               dedupe: None }
    }
}

/// Referencia a un mensaje concreto del broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerHandle {
    pub queue: String,
    pub id: String,
}

impl BrokerHandle {
    pub fn new(queue: impl Into<String>, id: impl Into<String>) -> Self {
        Self { queue: queue.into(),
               id: id.into() }
    }
}

impl fmt::Display for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerState {
    Waiting,
    /// Diferido hasta `due_at`; sin `due_at` queda estacionado hasta `change_delay`.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl BrokerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Waiting => "waiting",
            BrokerState::Delayed => "delayed",
            BrokerState::Active => "active",
            BrokerState::Completed => "completed",
            BrokerState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, BrokerState::Completed | BrokerState::Failed)
    }
}

impl FromStr for BrokerState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(BrokerState::Waiting),
            "delayed" => Ok(BrokerState::Delayed),
            "active" => Ok(BrokerState::Active),
            "completed" => Ok(BrokerState::Completed),
            "failed" => Ok(BrokerState::Failed),
            other => Err(QueueError::Backend(format!("unknown broker state '{other}'"))),
        }
    }
}

/// Vista de un mensaje del broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerJob {
    pub handle: BrokerHandle,
    pub message: QueueMessage,
    pub state: BrokerState,
    pub attempts: u32,
    /// Entregas fallidas hasta ahora.
    pub attempts_made: u32,
    pub dedupe: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Una entrega reclamada por un worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub handle: BrokerHandle,
    pub message: QueueMessage,
    /// Número de intento (1 = primera entrega, sin contar reruns ni delays).
    pub attempt: u32,
    pub attempts: u32,
    /// Reentrega de un mensaje cuyo lock había expirado.
    pub stalled: bool,
}

/// Límites por cola que aplica el broker (no el engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub concurrency: u32,
    pub rate_limit: Option<RateLimit>,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self { concurrency: 1,
               rate_limit: None }
    }
}

/// Registración recurrente (cron) de una cola.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringSpec {
    pub id: String,
    pub pattern: String,
    pub timezone: Option<String>,
    /// Dispara una entrega inmediata además del calendario.
    pub immediate: bool,
    /// Entregas máximas de cada mensaje generado.
    pub attempts: u32,
    pub message: QueueMessage,
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self,
                     queue: &str,
                     message: QueueMessage,
                     opts: EnqueueOptions)
                     -> Result<BrokerHandle, QueueError>;

    /// Registra (o reemplaza) una entrada recurrente por id.
    async fn add_recurring(&self, queue: &str, spec: RecurringSpec) -> Result<BrokerHandle, QueueError>;
    /// `true` si existía.
    async fn remove_recurring(&self, queue: &str, id: &str) -> Result<bool, QueueError>;
    async fn list_recurring(&self, queue: &str) -> Result<Vec<RecurringSpec>, QueueError>;

    async fn get(&self, handle: &BrokerHandle) -> Result<Option<BrokerJob>, QueueError>;
    async fn is_delayed(&self, handle: &BrokerHandle) -> Result<bool, QueueError>;
    /// Reprograma un mensaje diferido (o estacionado) para dentro de `delay`.
    async fn change_delay(&self, handle: &BrokerHandle, delay: Duration) -> Result<(), QueueError>;
    /// Quita el mensaje para que no pueda volver a entregarse. `true` si existía.
    async fn remove(&self, handle: &BrokerHandle) -> Result<bool, QueueError>;
    /// Pasa el mensaje a diferido hasta `until`; `None` lo estaciona.
    async fn move_to_delayed(&self, handle: &BrokerHandle, until: Option<DateTime<Utc>>) -> Result<(), QueueError>;
    async fn update_data(&self, handle: &BrokerHandle, message: QueueMessage) -> Result<(), QueueError>;
    /// Espera a que el mensaje termine. `Ok(None)` si no existe; `Timeout` si
    /// vence `ttl`.
    async fn wait_until_finished(&self,
                                 handle: &BrokerHandle,
                                 ttl: Option<Duration>)
                                 -> Result<Option<BrokerState>, QueueError>;

    async fn pause_queue(&self, queue: &str) -> Result<(), QueueError>;
    async fn resume_queue(&self, queue: &str) -> Result<(), QueueError>;
    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError>;
    async fn configure_queue(&self, queue: &str, limits: QueueLimits) -> Result<(), QueueError>;

    /// Reclama la próxima entrega lista de cualquiera de `queues`, respetando
    /// pausas, concurrencia y rate limit. Los mensajes activos con lock
    /// vencido se reentregan.
    async fn claim(&self, queues: &[String], lock: Duration) -> Result<Option<Delivery>, QueueError>;
    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;
    /// Registra un fallo. Con `retry` el mensaje vuelve a entregarse con
    /// backoff exponencial; si no, queda `Failed`.
    async fn fail(&self, delivery: &Delivery, reason: &str, retry: bool) -> Result<(), QueueError>;
    /// Libera el lock sin completar (el mensaje ya fue diferido o estacionado).
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Backoff exponencial `base * 2^(attempt-1)` con tope.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3, cap), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9, cap), cap);
    }

    #[test]
    fn message_serializes_checkpoint() {
        let mut msg = QueueMessage::for_job(Uuid::nil(), "wf", JobTrigger::Manual);
        msg.step_index = Some(3);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["step_index"], 3);
        assert_eq!(v["trigger"], "MANUAL");
        let back: QueueMessage = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }
}
