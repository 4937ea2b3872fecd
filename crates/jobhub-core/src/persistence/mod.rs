//! Persistence Gateway: contrato de almacenamiento durable.
//!
//! Cubre las cinco entidades del modelo (workflow, job, job step, schedule,
//! event subscription). Implementaciones:
//! - `InMemoryGateway`: paridad 1:1 para tests y modo `memory`.
//! - `CachedGateway`: decorador con cache read-through de TTL corto,
//!   invalidada explícitamente en cada escritura.
//! - Postgres (crate `jobhub-persistence`).
//!
//! Contratos que toda implementación debe respetar:
//! - `insert_job` es atómico respecto al dedupe id: mientras exista un job no
//!   terminal con el mismo (workflow_id, dedupe_id) se devuelve ese job con
//!   `created = false`.
//! - `upsert_job` es idempotente por id.
//! - `start_step` hace upsert de la única fila (job_id, name).
//! - `consume_skip` decrementa `skip_next_run` sólo si es > 0, de forma atómica.

mod cache;
mod memory;

pub use cache::CachedGateway;
pub use memory::InMemoryGateway;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{EventSubscription, Job, JobStatus, JobStep, JobStepStatus, NewJob, NewSchedule, Schedule,
                   WorkflowRecord};

/// Resultado de `insert_job`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInsert {
    pub job: Job,
    /// `false` si se devolvió un job activo existente con el mismo dedupe id.
    pub created: bool,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn upsert_workflow(&self, key: &str, name: &str, internal: bool) -> Result<WorkflowRecord, StoreError>;
    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowRecord>, StoreError>;
    async fn get_workflow_by_key(&self, key: &str) -> Result<Option<WorkflowRecord>, StoreError>;
    async fn set_workflow_active(&self, id: i64, active: bool) -> Result<WorkflowRecord, StoreError>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn insert_job(&self, job: NewJob) -> Result<JobInsert, StoreError>;
    async fn upsert_job(&self, job: NewJob) -> Result<Job, StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;
    /// Cambia el estado y, si se indica, el checkpoint de auditoría.
    async fn update_job_status(&self,
                               id: Uuid,
                               status: JobStatus,
                               checkpoint: Option<u32>)
                               -> Result<Job, StoreError>;
    async fn list_jobs(&self, workflow_id: i64, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError>;

    /// Upsert a RUNNING incrementando `runs` (y `retries` si `is_retry`).
    async fn start_step(&self, job_id: Uuid, name: &str, index: u32, is_retry: bool) -> Result<JobStep, StoreError>;
    async fn finish_step(&self,
                         job_id: Uuid,
                         name: &str,
                         status: JobStepStatus,
                         result: Option<Value>)
                         -> Result<JobStep, StoreError>;
    async fn get_step(&self, job_id: Uuid, name: &str) -> Result<Option<JobStep>, StoreError>;
    /// Steps del job ordenados por índice.
    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>, StoreError>;
    async fn set_step_resume(&self, job_id: Uuid, name: &str, data: Value) -> Result<JobStep, StoreError>;

    /// Upsert por (workflow_id, cron_expression).
    async fn upsert_schedule(&self, schedule: NewSchedule) -> Result<Schedule, StoreError>;
    /// Reemplaza la expresión `old_pattern` por la de `schedule`. `Ok(None)` si
    /// no existe fila con la expresión vieja; `UniqueViolation` si la nueva ya existe.
    async fn replace_schedule_pattern(&self,
                                      old_pattern: &str,
                                      schedule: NewSchedule)
                                      -> Result<Option<Schedule>, StoreError>;
    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError>;
    async fn list_schedules(&self, workflow_id: i64) -> Result<Vec<Schedule>, StoreError>;
    async fn set_schedule_active(&self, id: i64, active: bool) -> Result<Schedule, StoreError>;
    async fn set_skip_next_run(&self, id: i64, count: u32) -> Result<Schedule, StoreError>;
    /// `true` si había ticks por saltar (y se consumió uno).
    async fn consume_skip(&self, id: i64) -> Result<bool, StoreError>;

    async fn get_or_create_subscription(&self,
                                        workflow_id: i64,
                                        name: &str,
                                        provider: Option<&str>,
                                        connection: Option<&str>)
                                        -> Result<EventSubscription, StoreError>;
    async fn set_subscription_active(&self, id: i64, active: bool) -> Result<EventSubscription, StoreError>;
}
