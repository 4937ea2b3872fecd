//! Run Coordinator: fachada pública para crear y administrar jobs.
//!
//! Dueño de la creación de jobs y de los schedules. Nunca ejecuta steps: todo
//! lo que corre pasa por el broker y el engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::catalog::{WorkflowCatalog, WorkflowRef};
use crate::engine::queue_limits;
use crate::errors::{HubError, StoreError};
use crate::model::{Job, JobOptions, JobStatus, JobStep, JobStepStatus, JobTrigger, NewJob, NewSchedule, Schedule,
                   WorkflowRecord};
use crate::notify::{HubEvent, NotificationBus};
use crate::persistence::PersistenceGateway;
use crate::queue::{parse_cron, BrokerHandle, DurableQueue, EnqueueOptions, QueueMessage, RecurringSpec};
use crate::workflow::WorkflowDefinition;

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub payload: Value,
    pub trigger: JobTrigger,
    pub trigger_id: Option<String>,
    /// Crea el job en DRAFT sin encolarlo.
    pub draft: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Por defecto, el de la definición.
    pub max_retries: Option<u32>,
    pub dedupe_id: Option<String>,
    pub parent_id: Option<Uuid>,
    pub context: Value,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { payload: Value::Null,
               trigger: JobTrigger::Manual,
               trigger_id: None,
               draft: false,
               scheduled_at: None,
               max_retries: None,
               dedupe_id: None,
               parent_id: None,
               context: Value::Null }
    }
}

impl RunOptions {
    pub fn with_payload(payload: Value) -> Self {
        Self { payload,
               ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatOptions {
    pub pattern: String,
    /// Expresión que se reemplaza por `pattern`.
    pub old_pattern: Option<String>,
    pub timezone: Option<String>,
    pub immediate: bool,
    pub context: Value,
    pub max_retries: Option<u32>,
    pub active: bool,
}

impl RepeatOptions {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into(),
               old_pattern: None,
               timezone: None,
               immediate: false,
               context: Value::Null,
               max_retries: None,
               active: true }
    }
}

/// Resultado de las operaciones sobre jobs. `handle` es `None` para drafts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub handle: Option<BrokerHandle>,
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatHandle {
    /// `None` si el schedule quedó fuera del broker (inactivo).
    pub handle: Option<BrokerHandle>,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSummary {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub internal: bool,
    pub active: bool,
    pub steps: Vec<String>,
}

pub struct RunCoordinator {
    catalog: Arc<WorkflowCatalog>,
    store: Arc<dyn PersistenceGateway>,
    queue: Arc<dyn DurableQueue>,
    bus: NotificationBus,
    ensured: DashMap<String, i64>,
}

impl RunCoordinator {
    pub fn new(catalog: Arc<WorkflowCatalog>,
               store: Arc<dyn PersistenceGateway>,
               queue: Arc<dyn DurableQueue>,
               bus: NotificationBus)
               -> Self {
        Self { catalog,
               store,
               queue,
               bus,
               ensured: DashMap::new() }
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn PersistenceGateway> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.queue
    }

    pub fn resolve(&self, workflow: &WorkflowRef) -> Result<Arc<WorkflowDefinition>, HubError> {
        self.catalog
            .resolve(workflow, true)?
            .ok_or_else(|| HubError::WorkflowNotFound(workflow.to_string()))
    }

    /// Materializa la fila del workflow (perezosamente) y configura su cola.
    pub async fn ensure_workflow(&self, def: &WorkflowDefinition) -> Result<WorkflowRecord, HubError> {
        if let Some(id) = self.ensured.get(&def.key).map(|e| *e.value()) {
            if let Some(rec) = self.store.get_workflow(id).await? {
                return Ok(rec);
            }
        }
        let rec = match self.store.get_workflow_by_key(&def.key).await? {
            Some(rec) => rec,
            None => self.store.upsert_workflow(&def.key, &def.name, def.internal).await?,
        };
        self.catalog.bind_id(rec.id, &def.key);
        self.queue.configure_queue(&def.key, queue_limits(def)).await?;
        self.ensured.insert(def.key.clone(), rec.id);
        debug!("coordinator:workflow ensured key={} id={}", def.key, rec.id);
        Ok(rec)
    }

    async fn job(&self, job_id: Uuid) -> Result<Job, HubError> {
        self.store.get_job(job_id).await?.ok_or(HubError::JobNotFound(job_id))
    }

    async fn key_of(&self, job: &Job) -> Result<String, HubError> {
        if let Some(key) = self.catalog.key_for_id(job.workflow_id) {
            return Ok(key);
        }
        let rec = self.store
                      .get_workflow(job.workflow_id)
                      .await?
                      .ok_or_else(|| HubError::WorkflowNotFound(format!("#{}", job.workflow_id)))?;
        self.catalog.bind_id(rec.id, &rec.key);
        Ok(rec.key)
    }

    fn handle_for(key: &str, job: &Job) -> BrokerHandle {
        BrokerHandle::new(key, job.id.to_string())
    }

    async fn enqueue_job(&self, key: &str, job: &Job, step_index: Option<u32>) -> Result<BrokerHandle, HubError> {
        let delay = job.options
                       .scheduled_at
                       .and_then(|at| (at - Utc::now()).to_std().ok())
                       .filter(|d| !d.is_zero());
        let mut message = QueueMessage::for_job(job.id, key, job.trigger);
        message.step_index = step_index;
        message.payload = job.payload.clone();
        message.trigger_id = job.trigger_id.clone();
        message.context = job.context.clone();
        let handle = self.queue
                         .enqueue(key,
                                  message,
                                  EnqueueOptions { delay,
                                                   attempts: job.options.attempts(),
                                                   id: Some(job.id.to_string()),
                                                   dedupe: job.dedupe_id.clone() })
                         .await?;
        Ok(handle)
    }

    /// Crea (o devuelve por dedupe) un job y lo encola salvo que sea draft.
    pub async fn run(&self, workflow: impl Into<WorkflowRef>, opts: RunOptions) -> Result<RunHandle, HubError> {
        let def = self.resolve(&workflow.into())?;
        let rec = self.ensure_workflow(&def).await?;
        let status = if opts.draft { JobStatus::Draft } else { JobStatus::Waiting };
        let inserted = self.store
                           .insert_job(NewJob { id: Uuid::new_v4(),
                                                workflow_id: rec.id,
                                                parent_id: opts.parent_id,
                                                status,
                                                trigger: opts.trigger,
                                                trigger_id: opts.trigger_id,
                                                payload: opts.payload,
                                                dedupe_id: opts.dedupe_id,
                                                options: JobOptions { scheduled_at: opts.scheduled_at,
                                                                      max_retries: opts.max_retries
                                                                                       .unwrap_or(def.max_retries) },
                                                context: opts.context })
                           .await?;
        let job = inserted.job;

        if !inserted.created {
            debug!("coordinator:run dedupe hit workflow={} job_id={}", def.key, job.id);
            // El mensaje del broker usa el id del job, así que el handle se
            // conoce aunque la otra llamada todavía no haya encolado.
            let handle = (job.status != JobStatus::Draft).then(|| Self::handle_for(&def.key, &job));
            return Ok(RunHandle { handle, job });
        }

        self.bus.publish(HubEvent::JobCreated { job_id: job.id,
                                                workflow_key: def.key.clone(),
                                                status: job.status });
        if opts.draft {
            info!("coordinator:draft workflow={} job_id={}", def.key, job.id);
            return Ok(RunHandle { handle: None, job });
        }
        let handle = self.enqueue_job(&def.key, &job, None).await?;
        info!("coordinator:run workflow={} job_id={} trigger={}", def.key, job.id, job.trigger);
        Ok(RunHandle { handle: Some(handle),
                       job })
    }

    /// Promueve un job DRAFT a encolado con sus opciones guardadas.
    pub async fn execute_draft(&self, job_id: Uuid) -> Result<RunHandle, HubError> {
        let job = self.job(job_id).await?;
        if job.status != JobStatus::Draft {
            return Err(HubError::NotDraft { job_id,
                                            status: job.status });
        }
        let key = self.key_of(&job).await?;
        let def = self.resolve(&WorkflowRef::Key(key.clone()))?;
        self.ensure_workflow(&def).await?;
        let job = self.store.update_job_status(job_id, JobStatus::Waiting, None).await?;
        self.bus.publish(HubEvent::JobStatusChanged { job_id,
                                                      workflow_key: key.clone(),
                                                      status: JobStatus::Waiting });
        let handle = self.enqueue_job(&key, &job, None).await?;
        info!("coordinator:draft executed job_id={job_id}");
        Ok(RunHandle { handle: Some(handle),
                       job })
    }

    /// Reanuda un job PAUSED. `data` queda en el step pausado como dato de resume.
    pub async fn resume(&self, job_id: Uuid, data: Option<Value>) -> Result<RunHandle, HubError> {
        let job = self.job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(HubError::NotPaused { job_id,
                                             status: job.status });
        }
        let key = self.key_of(&job).await?;
        if let Some(data) = data {
            let steps = self.store.list_steps(job_id).await?;
            let target = steps.iter()
                              .filter(|s| s.status == JobStepStatus::WaitingRerun)
                              .max_by_key(|s| s.started_at)
                              .or_else(|| steps.iter().max_by_key(|s| s.started_at));
            match target {
                Some(step) => {
                    self.store.set_step_resume(job_id, &step.name, data).await?;
                }
                None => warn!("coordinator:resume job_id={job_id} has no step to attach data to"),
            }
        }

        let handle = Self::handle_for(&key, &job);
        if self.queue.get(&handle).await?.is_some() {
            if self.queue.is_delayed(&handle).await? {
                self.queue.change_delay(&handle, Duration::ZERO).await?;
            }
        } else {
            warn!("coordinator:resume job_id={job_id} lost its broker message, re-enqueueing");
            self.enqueue_job(&key, &job, job.checkpoint).await?;
        }
        if self.queue.is_paused(&key).await? {
            self.queue.resume_queue(&key).await?;
        }
        info!("coordinator:resume job_id={job_id}");
        Ok(RunHandle { handle: Some(handle),
                       job })
    }

    /// Cancela un job PAUSED, DELAYED o WAITING_RERUN y quita su mensaje.
    pub async fn cancel(&self, job_id: Uuid) -> Result<RunHandle, HubError> {
        let job = self.job(job_id).await?;
        if !job.status.is_cancellable() {
            return Err(HubError::NotCancellable { job_id,
                                                  status: job.status });
        }
        let key = self.key_of(&job).await?;
        let handle = Self::handle_for(&key, &job);
        let removed = self.queue.remove(&handle).await?;
        let job = self.store.update_job_status(job_id, JobStatus::Cancelled, None).await?;
        self.bus.publish(HubEvent::JobStatusChanged { job_id,
                                                      workflow_key: key,
                                                      status: JobStatus::Cancelled });
        info!("coordinator:cancel job_id={job_id} broker_removed={removed}");
        Ok(RunHandle { handle: Some(handle),
                       job })
    }

    /// Crea o actualiza el schedule cron de un workflow y lo refleja en el broker.
    pub async fn repeat(&self, workflow: impl Into<WorkflowRef>, opts: RepeatOptions) -> Result<RepeatHandle, HubError> {
        let def = self.resolve(&workflow.into())?;
        let rec = self.ensure_workflow(&def).await?;
        parse_cron(&opts.pattern).map_err(|_| HubError::InvalidCron(opts.pattern.clone()))?;

        let row = NewSchedule { workflow_id: rec.id,
                                cron_expression: opts.pattern.clone(),
                                timezone: opts.timezone.clone(),
                                active: opts.active,
                                max_retries: opts.max_retries,
                                context: opts.context.clone() };
        let schedule = match opts.old_pattern.as_deref().filter(|old| *old != opts.pattern) {
            None => self.store.upsert_schedule(row).await?,
            Some(old) => match self.store.replace_schedule_pattern(old, row.clone()).await {
                Ok(Some(s)) => s,
                Ok(None) => {
                    debug!("coordinator:repeat old pattern '{old}' not found, upserting new");
                    self.store.upsert_schedule(row).await?
                }
                Err(StoreError::UniqueViolation(_)) => {
                    self.retire_pattern(&def.key, rec.id, old).await?;
                    self.store.upsert_schedule(row).await?
                }
                Err(e) => return Err(e.into()),
            },
        };

        let handle = self.sync_schedule(&def, &rec, &schedule, opts.immediate).await?;
        info!("coordinator:repeat workflow={} schedule_id={} pattern='{}' active={}",
              def.key, schedule.id, schedule.cron_expression, schedule.active);
        Ok(RepeatHandle { handle, schedule })
    }

    /// Desactiva el schedule `pattern` y quita su entrada recurrente.
    async fn retire_pattern(&self, key: &str, workflow_id: i64, pattern: &str) -> Result<(), HubError> {
        let old = self.store
                      .list_schedules(workflow_id)
                      .await?
                      .into_iter()
                      .find(|s| s.cron_expression == pattern);
        if let Some(old) = old {
            self.store.set_schedule_active(old.id, false).await?;
            self.queue.remove_recurring(key, &old.recurring_id()).await?;
        }
        Ok(())
    }

    /// Registra o quita la entrada recurrente de un schedule según su `active`
    /// y el del workflow.
    pub async fn sync_schedule(&self,
                               def: &WorkflowDefinition,
                               rec: &WorkflowRecord,
                               schedule: &Schedule,
                               immediate: bool)
                               -> Result<Option<BrokerHandle>, HubError> {
        if !(schedule.active && rec.active) {
            self.queue.remove_recurring(&def.key, &schedule.recurring_id()).await?;
            return Ok(None);
        }
        let message = QueueMessage { job_id: None,
                                     workflow_key: def.key.clone(),
                                     step_index: None,
                                     is_retry: false,
                                     payload: Value::Null,
                                     trigger: JobTrigger::Schedule,
                                     trigger_id: Some(schedule.id.to_string()),
                                     schedule_id: Some(schedule.id),
                                     context: schedule.context.clone() };
        let attempts = schedule.max_retries.unwrap_or(def.max_retries) + 1;
        let handle = self.queue
                         .add_recurring(&def.key,
                                        RecurringSpec { id: schedule.recurring_id(),
                                                        pattern: schedule.cron_expression.clone(),
                                                        timezone: schedule.timezone.clone(),
                                                        immediate,
                                                        attempts,
                                                        message })
                         .await?;
        Ok(Some(handle))
    }

    /// Fija cuántos ticks próximos del schedule se saltan.
    pub async fn skip_next_runs(&self, schedule_id: i64, count: u32) -> Result<Schedule, HubError> {
        match self.store.set_skip_next_run(schedule_id, count).await {
            Ok(s) => Ok(s),
            Err(StoreError::NotFound(_)) => Err(HubError::ScheduleNotFound(schedule_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_result(&self, job_id: Uuid, step: &str) -> Result<Option<Value>, HubError> {
        Ok(self.store.get_step(job_id, step).await?.and_then(|s| s.result))
    }

    /// Resultados de todos los steps con resultado, en orden de índice.
    pub async fn get_results(&self, job_id: Uuid) -> Result<IndexMap<String, Value>, HubError> {
        Ok(self.store
               .list_steps(job_id)
               .await?
               .into_iter()
               .filter_map(|s| s.result.map(|r| (s.name, r)))
               .collect())
    }

    pub async fn get_resume_data(&self, job_id: Uuid, step: &str) -> Result<Option<Value>, HubError> {
        Ok(self.store.get_step(job_id, step).await?.and_then(|s| s.resume))
    }

    /// Espera a que el mensaje del job termine en el broker y devuelve la fila
    /// actualizada. Jobs terminales o sin mensaje se devuelven tal cual.
    pub async fn wait_for_job(&self, job_id: Uuid, ttl: Option<Duration>) -> Result<Job, HubError> {
        let job = self.job(job_id).await?;
        if job.status.is_terminal() || job.status == JobStatus::Draft {
            return Ok(job);
        }
        let key = self.key_of(&job).await?;
        self.queue.wait_until_finished(&Self::handle_for(&key, &job), ttl).await?;
        self.job(job_id).await
    }

    pub async fn list_workflows(&self, include_internal: bool) -> Result<Vec<WorkflowSummary>, HubError> {
        let mut out = Vec::new();
        for def in self.catalog.list(include_internal) {
            let rec = self.ensure_workflow(&def).await?;
            out.push(WorkflowSummary { id: rec.id,
                                       key: def.key.clone(),
                                       name: def.name.clone(),
                                       internal: def.internal,
                                       active: rec.active,
                                       steps: def.steps.iter().map(|s| s.name.clone()).collect() });
        }
        Ok(out)
    }

    pub async fn list_jobs(&self, workflow: impl Into<WorkflowRef>, status: Option<JobStatus>) -> Result<Vec<Job>, HubError> {
        let def = self.resolve(&workflow.into())?;
        let rec = self.ensure_workflow(&def).await?;
        Ok(self.store.list_jobs(rec.id, status).await?)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, HubError> {
        self.job(job_id).await
    }

    pub async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>, HubError> {
        Ok(self.store.list_steps(job_id).await?)
    }
}
