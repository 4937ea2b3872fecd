//! Execution Engine: el bucle de steps.
//!
//! Para cada entrega del broker:
//! 1. resuelve la definición y crea una instancia nueva del workflow;
//! 2. carga o crea (upsert idempotente por id) la fila `Job`;
//! 3. ubica el primer step con índice >= checkpoint del mensaje;
//! 4. ejecuta los steps en orden, persistiendo cada transición antes de mover
//!    el checkpoint del mensaje (persist-then-advance);
//! 5. devuelve al worker la acción sobre la entrega (`Disposition`).
//!
//! Precedencia de estado tras un step:
//! FAILED (error sin presupuesto) > PAUSED > WAITING_RERUN (rerun o reintento)
//! > DELAYED (sólo si hay step siguiente y no se pidió cancelación)
//! > SUCCEEDED (último step) > CANCELLED > RUNNING.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::catalog::{WorkflowCatalog, WorkflowRef};
use crate::errors::{HubError, StepError};
use crate::hashing::derive_job_id;
use crate::model::{Job, JobOptions, JobStatus, JobStepStatus, NewJob, WorkflowRecord};
use crate::notify::{HubEvent, NotificationBus};
use crate::persistence::PersistenceGateway;
use crate::queue::{Delivery, DurableQueue, QueueLimits};
use crate::workflow::{StepContext, StepSignals, WorkflowDefinition, WorkflowDeps};

/// Acción que el worker aplica sobre la entrega cuando el engine termina.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// El mensaje terminó (job terminal, tick saltado o mensaje obsoleto).
    Completed,
    /// El mensaje ya fue diferido/estacionado; sólo se libera el lock.
    Deferred,
    /// Error sin presupuesto de reintentos: el broker lo marca como fallido.
    Failed(String),
}

/// Resultado de evaluar un step ya ejecutado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepOutcome {
    pub job_status: JobStatus,
    pub step_status: JobStepStatus,
    pub can_retry: bool,
    pub rerun: bool,
}

/// Decide el estado del job y del step a partir de las señales del step.
pub(crate) fn evaluate(failed: bool, attempt: u32, attempts: u32, signals: &StepSignals, has_next: bool) -> StepOutcome {
    let can_retry = failed && attempt < attempts;
    let rerun = signals.needs_rerun || can_retry;
    let delayed = signals.delay_ms() > 0 && has_next && signals.cancelled.is_none();

    let job_status = if failed && !can_retry {
        JobStatus::Failed
    } else if signals.paused {
        JobStatus::Paused
    } else if rerun {
        JobStatus::WaitingRerun
    } else if delayed {
        JobStatus::Delayed
    } else if !has_next {
        JobStatus::Succeeded
    } else if signals.cancelled.is_some() {
        JobStatus::Cancelled
    } else {
        JobStatus::Running
    };
    let step_status = match job_status {
        JobStatus::Failed => JobStepStatus::Failed,
        JobStatus::Paused | JobStatus::WaitingRerun => JobStepStatus::WaitingRerun,
        _ => JobStepStatus::Succeeded,
    };
    StepOutcome { job_status,
                  step_status,
                  can_retry,
                  rerun: rerun || signals.paused }
}

/// Límites de cola derivados de la definición.
pub(crate) fn queue_limits(def: &WorkflowDefinition) -> QueueLimits {
    QueueLimits { concurrency: def.concurrency,
                  rate_limit: def.rate_limit }
}

pub struct ExecutionEngine {
    catalog: Arc<WorkflowCatalog>,
    store: Arc<dyn PersistenceGateway>,
    queue: Arc<dyn DurableQueue>,
    bus: NotificationBus,
}

impl ExecutionEngine {
    pub fn new(catalog: Arc<WorkflowCatalog>,
               store: Arc<dyn PersistenceGateway>,
               queue: Arc<dyn DurableQueue>,
               bus: NotificationBus)
               -> Self {
        Self { catalog,
               store,
               queue,
               bus }
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.queue
    }

    pub fn deps(&self) -> WorkflowDeps {
        WorkflowDeps { store: self.store.clone(),
                       queue: self.queue.clone(),
                       bus: self.bus.clone() }
    }

    async fn workflow_row(&self, def: &WorkflowDefinition) -> Result<WorkflowRecord, HubError> {
        let rec = match self.store.get_workflow_by_key(&def.key).await? {
            Some(rec) => rec,
            None => self.store.upsert_workflow(&def.key, &def.name, def.internal).await?,
        };
        self.catalog.bind_id(rec.id, &def.key);
        Ok(rec)
    }

    async fn set_status(&self, job: &mut Job, status: JobStatus, checkpoint: Option<u32>) -> Result<(), HubError> {
        let changed = job.status != status;
        let id = job.id;
        *job = self.store
                   .update_job_status(id, status, checkpoint)
                   .await
                   .map_err(|e| {
                       error!("engine:persist job_id={id} status={status} error={e}");
                       e
                   })?;
        if changed {
            self.bus.publish(HubEvent::JobStatusChanged { job_id: job.id,
                                                          workflow_key: job_key(&self.catalog, job),
                                                          status });
        }
        Ok(())
    }

    /// Carga el job del mensaje o lo crea. `None` si la entrega no debe
    /// producir trabajo (tick saltado o schedule desaparecido).
    async fn load_job(&self,
                      def: &WorkflowDefinition,
                      rec: &WorkflowRecord,
                      delivery: &Delivery)
                      -> Result<Option<Job>, HubError> {
        let msg = &delivery.message;
        let job_id = msg.job_id
                        .unwrap_or_else(|| derive_job_id(&delivery.handle.queue, &delivery.handle.id));
        if let Some(job) = self.store.get_job(job_id).await? {
            return Ok(Some(job));
        }

        let mut max_retries = def.max_retries;
        if let Some(schedule_id) = msg.schedule_id {
            let Some(schedule) = self.store.get_schedule(schedule_id).await? else {
                warn!("engine:tick schedule_id={schedule_id} missing, dropping");
                return Ok(None);
            };
            if self.store.consume_skip(schedule_id).await? {
                info!("engine:tick skipped schedule_id={schedule_id} workflow={}", def.key);
                return Ok(None);
            }
            max_retries = schedule.max_retries.unwrap_or(max_retries);
        }

        let job = self.store
                      .upsert_job(NewJob { id: job_id,
                                           workflow_id: rec.id,
                                           parent_id: None,
                                           status: JobStatus::Waiting,
                                           trigger: msg.trigger,
                                           trigger_id: msg.trigger_id.clone(),
                                           payload: msg.payload.clone(),
                                           dedupe_id: None,
                                           options: JobOptions { scheduled_at: None,
                                                                 max_retries },
                                           context: msg.context.clone() })
                      .await?;
        self.bus.publish(HubEvent::JobCreated { job_id: job.id,
                                                workflow_key: def.key.clone(),
                                                status: job.status });
        Ok(Some(job))
    }

    async fn results_of(&self, job: &Job) -> Result<HashMap<String, Value>, HubError> {
        Ok(self.store
               .list_steps(job.id)
               .await?
               .into_iter()
               .filter(|s| s.status == JobStepStatus::Succeeded)
               .filter_map(|s| s.result.map(|r| (s.name, r)))
               .collect())
    }

    /// Procesa una entrega. Un error de step con presupuesto de reintentos se
    /// devuelve como `HubError::StepExecution` después de registrar el estado,
    /// para que el broker aplique su backoff. Los errores de persistencia o del
    /// broker se registran y se propagan.
    pub async fn process(&self, delivery: &Delivery) -> Result<Disposition, HubError> {
        let key = delivery.message.workflow_key.clone();
        let def = self.catalog
                      .resolve(&WorkflowRef::Key(key.clone()), true)?
                      .ok_or_else(|| HubError::WorkflowNotFound(key.clone()))?;
        let rec = self.workflow_row(&def).await?;

        let Some(mut job) = self.load_job(&def, &rec, delivery).await? else {
            return Ok(Disposition::Completed);
        };
        if job.status.is_terminal() || job.status == JobStatus::Draft {
            debug!("engine:skip job_id={} status={}", job.id, job.status);
            return Ok(Disposition::Completed);
        }
        if delivery.stalled {
            warn!("engine:stalled job_id={} resuming from checkpoint {:?}", job.id, delivery.message.step_index);
            self.set_status(&mut job, JobStatus::Stalled, None).await?;
        }

        let Some(start) = def.resume_position(delivery.message.step_index) else {
            info!("engine:checkpoint past last step job_id={}", job.id);
            self.set_status(&mut job, JobStatus::Succeeded, None).await?;
            return Ok(Disposition::Completed);
        };
        self.set_status(&mut job, JobStatus::Running, Some(def.steps[start].index)).await?;

        let mut message = delivery.message.clone();
        message.job_id = Some(job.id);
        let mut results = self.results_of(&job).await?;
        let mut instance = def.instantiate(&self.deps());
        let attempts = job.options.attempts();

        for pos in start..def.len() {
            let step = &def.steps[pos];
            let has_next = pos + 1 < def.len();
            let is_retry = pos == start && message.is_retry;

            let row = self.store.start_step(job.id, &step.name, step.index, is_retry).await?;
            self.bus.publish(HubEvent::StepStarted { job_id: job.id,
                                                     workflow_key: key.clone(),
                                                     step: step.name.clone(),
                                                     attempt: delivery.attempt });
            debug!("engine:step start job_id={} step={} runs={} attempt={}",
                   job.id, step.name, row.runs, delivery.attempt);

            let mut ctx = StepContext::new(job.clone(),
                                           key.clone(),
                                           step.clone(),
                                           delivery.attempt,
                                           is_retry,
                                           results.clone(),
                                           row.resume.clone());
            let run = instance.run_step(&step.name, &mut ctx).await;
            let signals = ctx.signals().clone();
            let outcome = evaluate(run.is_err(), delivery.attempt, attempts, &signals, has_next);

            let step_result = match &run {
                Ok(v) => Some(v.clone()),
                Err(e) => Some(e.to_value()),
            };
            self.store
                .finish_step(job.id, &step.name, outcome.step_status, step_result)
                .await
                .map_err(|e| {
                    error!("engine:persist step job_id={} step={} error={e}", job.id, step.name);
                    e
                })?;
            self.bus.publish(HubEvent::StepFinished { job_id: job.id,
                                                      workflow_key: key.clone(),
                                                      step: step.name.clone(),
                                                      status: outcome.step_status });

            // Un cancel concurrente gana: el resultado del step queda guardado
            // pero el job no vuelve a moverse.
            if let Some(current) = self.store.get_job(job.id).await? {
                if current.status == JobStatus::Cancelled {
                    warn!("engine:cancelled while step ran job_id={} step={}", job.id, step.name);
                    return Ok(Disposition::Completed);
                }
            }

            let checkpoint = if outcome.rerun || !has_next {
                step.index
            } else {
                def.steps[pos + 1].index
            };
            self.set_status(&mut job, outcome.job_status, Some(checkpoint)).await?;

            message.step_index = Some(checkpoint);
            message.is_retry = outcome.can_retry;
            if outcome.job_status != JobStatus::Succeeded && outcome.job_status != JobStatus::Failed {
                if let Err(e) = self.queue.update_data(&delivery.handle, message.clone()).await {
                    error!("engine:advance job_id={} error={e}", job.id);
                    return Err(e.into());
                }
            }

            match outcome.job_status {
                JobStatus::Running => {
                    if let Ok(v) = run {
                        results.insert(step.name.clone(), v);
                    }
                    continue;
                }
                JobStatus::Succeeded => {
                    info!("engine:job succeeded job_id={} workflow={key}", job.id);
                    return Ok(Disposition::Completed);
                }
                JobStatus::Cancelled => {
                    info!("engine:job cancelled job_id={} reason={}",
                          job.id,
                          signals.cancelled.as_deref().unwrap_or(""));
                    return Ok(Disposition::Completed);
                }
                JobStatus::Failed => {
                    let err = run.err().unwrap_or_else(|| StepError::new("step failed"));
                    warn!("engine:job failed job_id={} step={} error={err}", job.id, step.name);
                    return Ok(Disposition::Failed(err.message));
                }
                JobStatus::Paused => {
                    info!("engine:job paused job_id={} step={}", job.id, step.name);
                    self.queue.move_to_delayed(&delivery.handle, None).await?;
                    return Ok(Disposition::Deferred);
                }
                JobStatus::WaitingRerun if outcome.can_retry => {
                    let err = run.err().unwrap_or_else(|| StepError::new("step failed"));
                    warn!("engine:step error job_id={} step={} attempt={}/{attempts} error={err}",
                          job.id, step.name, delivery.attempt);
                    return Err(HubError::StepExecution { step: step.name.clone(),
                                                         source: err });
                }
                JobStatus::WaitingRerun | JobStatus::Delayed => {
                    let wait = signals.delay.unwrap_or(Duration::ZERO);
                    let until = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                    debug!("engine:reschedule job_id={} step_index={checkpoint} in={wait:?}", job.id);
                    self.queue.move_to_delayed(&delivery.handle, Some(until)).await?;
                    return Ok(Disposition::Deferred);
                }
                other => {
                    return Err(HubError::Internal(format!("unexpected status {other} after step")));
                }
            }
        }
        Ok(Disposition::Completed)
    }
}

fn job_key(catalog: &WorkflowCatalog, job: &Job) -> String {
    catalog.key_for_id(job.workflow_id).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> StepSignals {
        StepSignals::default()
    }

    #[test]
    fn plain_success_advances_or_finishes() {
        assert_eq!(evaluate(false, 1, 1, &signals(), true).job_status, JobStatus::Running);
        let last = evaluate(false, 1, 1, &signals(), false);
        assert_eq!(last.job_status, JobStatus::Succeeded);
        assert_eq!(last.step_status, JobStepStatus::Succeeded);
    }

    #[test]
    fn error_retries_until_budget_is_spent() {
        let retry = evaluate(true, 1, 3, &signals(), true);
        assert_eq!(retry.job_status, JobStatus::WaitingRerun);
        assert!(retry.can_retry && retry.rerun);
        let last = evaluate(true, 3, 3, &signals(), true);
        assert_eq!(last.job_status, JobStatus::Failed);
        assert_eq!(last.step_status, JobStepStatus::Failed);
    }

    #[test]
    fn pause_beats_rerun_and_keeps_step() {
        let mut s = signals();
        s.paused = true;
        s.needs_rerun = true;
        let out = evaluate(false, 1, 1, &s, true);
        assert_eq!(out.job_status, JobStatus::Paused);
        assert_eq!(out.step_status, JobStepStatus::WaitingRerun);
        assert!(out.rerun);
    }

    #[test]
    fn cancel_wins_over_delay() {
        let mut s = signals();
        s.delay = Some(Duration::from_secs(5));
        s.cancelled = Some("stop".into());
        assert_eq!(evaluate(false, 1, 1, &s, true).job_status, JobStatus::Cancelled);
        s.cancelled = None;
        assert_eq!(evaluate(false, 1, 1, &s, true).job_status, JobStatus::Delayed);
    }

    #[test]
    fn delay_on_last_step_finishes_job() {
        let mut s = signals();
        s.delay = Some(Duration::from_secs(5));
        assert_eq!(evaluate(false, 1, 1, &s, false).job_status, JobStatus::Succeeded);
    }

    #[test]
    fn rerun_with_delay_waits_for_rerun() {
        let mut s = signals();
        s.needs_rerun = true;
        s.delay = Some(Duration::from_millis(10));
        assert_eq!(evaluate(false, 1, 1, &s, true).job_status, JobStatus::WaitingRerun);
    }
}
