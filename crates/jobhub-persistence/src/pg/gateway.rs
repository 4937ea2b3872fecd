//! `PersistenceGateway` sobre Postgres.
//!
//! Las operaciones compuestas que el contrato exige atómicas se resuelven en
//! SQL: el dedupe de `insert_job` se apoya en el índice único parcial
//! `jobs_active_dedupe_idx`, `start_step` es un upsert sobre (job_id, name) y
//! `consume_skip` es un único `UPDATE ... WHERE skip_next_run > 0`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use jobhub_core::errors::StoreError;
use jobhub_core::model::{EventSubscription, Job, JobStatus, JobStep, JobStepStatus, NewJob, NewSchedule, Schedule,
                         WorkflowRecord};
use jobhub_core::persistence::{JobInsert, PersistenceGateway};
use log::debug;
use serde_json::Value;
use uuid::Uuid;

use super::rows::{encode_u32, JobRow, NewJobRow, ScheduleRow, StepRow, SubscriptionRow, WorkflowRow};
use super::{run_blocking, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::{event_subscriptions, job_steps, jobs, schedules, workflows};

fn terminal_statuses() -> Vec<&'static str> {
    JobStatus::ALL.iter().filter(|s| s.is_terminal()).map(|s| s.as_str()).collect()
}

fn missing(what: String) -> impl FnOnce() -> StoreError {
    move || StoreError::NotFound(what)
}

/// Implementación Postgres de `PersistenceGateway`.
pub struct PgGateway<P: ConnectionProvider> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> Clone for PgGateway<P> {
    fn clone(&self) -> Self {
        Self { provider: self.provider.clone() }
    }
}

impl<P: ConnectionProvider> PgGateway<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }

    pub fn from_shared(provider: Arc<P>) -> Self {
        Self { provider }
    }

    async fn run<F, T>(&self, op: &'static str, f: F) -> Result<T, StoreError>
        where F: FnMut(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static,
              T: Send + 'static
    {
        run_blocking(self.provider.clone(), op, f).await.map_err(StoreError::from)
    }
}

fn find_active_dedupe(conn: &mut PgConnection, workflow_id: i64, dedupe: &str) -> QueryResult<Option<JobRow>> {
    jobs::table.filter(jobs::workflow_id.eq(workflow_id))
               .filter(jobs::dedupe_id.eq(dedupe))
               .filter(jobs::status.ne_all(terminal_statuses()))
               .select(JobRow::as_select())
               .first(conn)
               .optional()
}

#[async_trait]
impl<P: ConnectionProvider> PersistenceGateway for PgGateway<P> {
    async fn upsert_workflow(&self, key: &str, name: &str, internal: bool) -> Result<WorkflowRecord, StoreError> {
        let (key, name) = (key.to_string(), name.to_string());
        self.run("upsert_workflow", move |conn| {
                diesel::insert_into(workflows::table).values((workflows::key.eq(&key),
                                                              workflows::name.eq(&name),
                                                              workflows::internal.eq(internal)))
                                                     .on_conflict(workflows::key)
                                                     .do_update()
                                                     .set((workflows::name.eq(excluded(workflows::name)),
                                                           workflows::internal.eq(excluded(workflows::internal))))
                                                     .returning(WorkflowRow::as_returning())
                                                     .get_result(conn)
                                                     .map(WorkflowRecord::from)
                                                     .map_err(PersistenceError::from)
            })
            .await
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowRecord>, StoreError> {
        self.run("get_workflow", move |conn| {
                let row = workflows::table.find(id).select(WorkflowRow::as_select()).first(conn).optional()?;
                Ok(row.map(WorkflowRecord::from))
            })
            .await
    }

    async fn get_workflow_by_key(&self, key: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        let key = key.to_string();
        self.run("get_workflow_by_key", move |conn| {
                let row = workflows::table.filter(workflows::key.eq(&key))
                                          .select(WorkflowRow::as_select())
                                          .first(conn)
                                          .optional()?;
                Ok(row.map(WorkflowRecord::from))
            })
            .await
    }

    async fn set_workflow_active(&self, id: i64, active: bool) -> Result<WorkflowRecord, StoreError> {
        let row = self.run("set_workflow_active", move |conn| {
                          let row = diesel::update(workflows::table.find(id)).set(workflows::active.eq(active))
                                                                             .returning(WorkflowRow::as_returning())
                                                                             .get_result(conn)
                                                                             .optional()?;
                          Ok(row.map(WorkflowRecord::from))
                      })
                      .await?;
        row.ok_or_else(missing(format!("workflow {id}")))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        self.run("list_workflows", |conn| {
                let rows = workflows::table.order(workflows::id.asc())
                                           .select(WorkflowRow::as_select())
                                           .load(conn)?;
                Ok(rows.into_iter().map(WorkflowRecord::from).collect())
            })
            .await
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobInsert, StoreError> {
        let options = serde_json::to_value(&job.options).map_err(|e| StoreError::Backend(format!("options: {e}")))?;
        let (row, created) = self.run("insert_job", move |conn| {
                                     let new_row = NewJobRow { id: job.id,
                                                               workflow_id: job.workflow_id,
                                                               parent_id: job.parent_id,
                                                               status: job.status.as_str(),
                                                               trigger_kind: job.trigger.as_str(),
                                                               trigger_id: job.trigger_id.as_deref(),
                                                               payload: &job.payload,
                                                               dedupe_id: job.dedupe_id.as_deref(),
                                                               options: &options,
                                                               context: &job.context };
                                     conn.transaction(|tx| {
                                             if let Some(dedupe) = job.dedupe_id.as_deref() {
                                                 if let Some(existing) = find_active_dedupe(tx, job.workflow_id, dedupe)? {
                                                     return Ok((existing, false));
                                                 }
                                             }
                                             // El índice parcial cubre la carrera entre dos inserts concurrentes.
                                             let inserted = diesel::insert_into(jobs::table).values(&new_row)
                                                                                            .on_conflict_do_nothing()
                                                                                            .returning(JobRow::as_returning())
                                                                                            .get_result(tx)
                                                                                            .optional()?;
                                             if let Some(row) = inserted {
                                                 return Ok((row, true));
                                             }
                                             if let Some(dedupe) = job.dedupe_id.as_deref() {
                                                 if let Some(existing) = find_active_dedupe(tx, job.workflow_id, dedupe)? {
                                                     return Ok((existing, false));
                                                 }
                                             }
                                             Err(PersistenceError::UniqueViolation(format!("job {}", job.id)))
                                         })
                                 })
                                 .await?;
        if !created {
            debug!("insert_job: dedupe hit job_id={}", row.id);
        }
        Ok(JobInsert { job: Job::try_from(row).map_err(StoreError::from)?,
                       created })
    }

    async fn upsert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let options = serde_json::to_value(&job.options).map_err(|e| StoreError::Backend(format!("options: {e}")))?;
        self.run("upsert_job", move |conn| {
                let new_row = NewJobRow { id: job.id,
                                          workflow_id: job.workflow_id,
                                          parent_id: job.parent_id,
                                          status: job.status.as_str(),
                                          trigger_kind: job.trigger.as_str(),
                                          trigger_id: job.trigger_id.as_deref(),
                                          payload: &job.payload,
                                          dedupe_id: job.dedupe_id.as_deref(),
                                          options: &options,
                                          context: &job.context };
                let inserted = diesel::insert_into(jobs::table).values(&new_row)
                                                               .on_conflict(jobs::id)
                                                               .do_nothing()
                                                               .returning(JobRow::as_returning())
                                                               .get_result(conn)
                                                               .optional()?;
                let row = match inserted {
                    Some(row) => row,
                    None => jobs::table.find(job.id).select(JobRow::as_select()).first(conn)?,
                };
                Job::try_from(row)
            })
            .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.run("get_job", move |conn| {
                jobs::table.find(id)
                           .select(JobRow::as_select())
                           .first(conn)
                           .optional()?
                           .map(Job::try_from)
                           .transpose()
            })
            .await
    }

    async fn update_job_status(&self,
                               id: Uuid,
                               status: JobStatus,
                               checkpoint: Option<u32>)
                               -> Result<Job, StoreError> {
        let row = self.run("update_job_status", move |conn| {
                          let target = jobs::table.find(id);
                          let now = Utc::now();
                          let row = match checkpoint {
                              Some(c) => diesel::update(target).set((jobs::status.eq(status.as_str()),
                                                                     jobs::checkpoint.eq(encode_u32(c)),
                                                                     jobs::updated_at.eq(now)))
                                                               .returning(JobRow::as_returning())
                                                               .get_result(conn)
                                                               .optional()?,
                              None => diesel::update(target).set((jobs::status.eq(status.as_str()),
                                                                  jobs::updated_at.eq(now)))
                                                            .returning(JobRow::as_returning())
                                                            .get_result(conn)
                                                            .optional()?,
                          };
                          row.map(Job::try_from).transpose()
                      })
                      .await?;
        row.ok_or_else(missing(format!("job {id}")))
    }

    async fn list_jobs(&self, workflow_id: i64, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        self.run("list_jobs", move |conn| {
                let mut query = jobs::table.filter(jobs::workflow_id.eq(workflow_id)).into_boxed();
                if let Some(st) = status {
                    query = query.filter(jobs::status.eq(st.as_str()));
                }
                let rows = query.order((jobs::created_at.asc(), jobs::id.asc()))
                                .select(JobRow::as_select())
                                .load(conn)?;
                rows.into_iter().map(Job::try_from).collect()
            })
            .await
    }

    async fn start_step(&self, job_id: Uuid, name: &str, index: u32, is_retry: bool) -> Result<JobStep, StoreError> {
        let name = name.to_string();
        self.run("start_step", move |conn| {
                let now = Utc::now();
                let row = diesel::insert_into(job_steps::table)
                    .values((job_steps::job_id.eq(job_id),
                             job_steps::name.eq(&name),
                             job_steps::step_index.eq(encode_u32(index)),
                             job_steps::status.eq(JobStepStatus::Running.as_str()),
                             job_steps::runs.eq(1),
                             job_steps::retries.eq(i32::from(is_retry)),
                             job_steps::started_at.eq(now)))
                    .on_conflict((job_steps::job_id, job_steps::name))
                    .do_update()
                    .set((job_steps::status.eq(JobStepStatus::Running.as_str()),
                          job_steps::step_index.eq(excluded(job_steps::step_index)),
                          job_steps::runs.eq(job_steps::runs + 1),
                          job_steps::retries.eq(job_steps::retries + excluded(job_steps::retries)),
                          job_steps::started_at.eq(excluded(job_steps::started_at)),
                          job_steps::finished_at.eq(None::<chrono::DateTime<Utc>>)))
                    .returning(StepRow::as_returning())
                    .get_result(conn)?;
                JobStep::try_from(row)
            })
            .await
    }

    async fn finish_step(&self,
                         job_id: Uuid,
                         name: &str,
                         status: JobStepStatus,
                         result: Option<Value>)
                         -> Result<JobStep, StoreError> {
        let name = name.to_string();
        let label = format!("step {job_id}/{name}");
        let row = self.run("finish_step", move |conn| {
                          let target = job_steps::table.filter(job_steps::job_id.eq(job_id))
                                                       .filter(job_steps::name.eq(&name));
                          let now = Some(Utc::now());
                          let row = match &result {
                              Some(value) => diesel::update(target).set((job_steps::status.eq(status.as_str()),
                                                                         job_steps::result.eq(Some(value)),
                                                                         job_steps::finished_at.eq(now)))
                                                                   .returning(StepRow::as_returning())
                                                                   .get_result(conn)
                                                                   .optional()?,
                              None => diesel::update(target).set((job_steps::status.eq(status.as_str()),
                                                                  job_steps::finished_at.eq(now)))
                                                            .returning(StepRow::as_returning())
                                                            .get_result(conn)
                                                            .optional()?,
                          };
                          row.map(JobStep::try_from).transpose()
                      })
                      .await?;
        row.ok_or_else(missing(label))
    }

    async fn get_step(&self, job_id: Uuid, name: &str) -> Result<Option<JobStep>, StoreError> {
        let name = name.to_string();
        self.run("get_step", move |conn| {
                job_steps::table.filter(job_steps::job_id.eq(job_id))
                                .filter(job_steps::name.eq(&name))
                                .select(StepRow::as_select())
                                .first(conn)
                                .optional()?
                                .map(JobStep::try_from)
                                .transpose()
            })
            .await
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>, StoreError> {
        self.run("list_steps", move |conn| {
                let rows = job_steps::table.filter(job_steps::job_id.eq(job_id))
                                           .order(job_steps::step_index.asc())
                                           .select(StepRow::as_select())
                                           .load(conn)?;
                rows.into_iter().map(JobStep::try_from).collect()
            })
            .await
    }

    async fn set_step_resume(&self, job_id: Uuid, name: &str, data: Value) -> Result<JobStep, StoreError> {
        let name = name.to_string();
        let label = format!("step {job_id}/{name}");
        let row = self.run("set_step_resume", move |conn| {
                          diesel::update(job_steps::table.filter(job_steps::job_id.eq(job_id))
                                                         .filter(job_steps::name.eq(&name)))
                          .set(job_steps::resume.eq(Some(&data)))
                          .returning(StepRow::as_returning())
                          .get_result(conn)
                          .optional()?
                          .map(JobStep::try_from)
                          .transpose()
                      })
                      .await?;
        row.ok_or_else(missing(label))
    }

    async fn upsert_schedule(&self, schedule: NewSchedule) -> Result<Schedule, StoreError> {
        self.run("upsert_schedule", move |conn| {
                let now = Utc::now();
                let row = diesel::insert_into(schedules::table)
                    .values((schedules::workflow_id.eq(schedule.workflow_id),
                             schedules::cron_expression.eq(&schedule.cron_expression),
                             schedules::timezone.eq(schedule.timezone.as_deref()),
                             schedules::active.eq(schedule.active),
                             schedules::max_retries.eq(schedule.max_retries.map(encode_u32)),
                             schedules::context.eq(&schedule.context),
                             schedules::updated_at.eq(now)))
                    .on_conflict((schedules::workflow_id, schedules::cron_expression))
                    .do_update()
                    .set((schedules::timezone.eq(excluded(schedules::timezone)),
                          schedules::active.eq(excluded(schedules::active)),
                          schedules::max_retries.eq(excluded(schedules::max_retries)),
                          schedules::context.eq(excluded(schedules::context)),
                          schedules::updated_at.eq(excluded(schedules::updated_at))))
                    .returning(ScheduleRow::as_returning())
                    .get_result(conn)?;
                Schedule::try_from(row)
            })
            .await
    }

    async fn replace_schedule_pattern(&self,
                                      old_pattern: &str,
                                      schedule: NewSchedule)
                                      -> Result<Option<Schedule>, StoreError> {
        let old_pattern = old_pattern.to_string();
        self.run("replace_schedule_pattern", move |conn| {
                // Si la expresión nueva ya existe, la restricción única la rechaza.
                diesel::update(schedules::table.filter(schedules::workflow_id.eq(schedule.workflow_id))
                                               .filter(schedules::cron_expression.eq(&old_pattern)))
                .set((schedules::cron_expression.eq(&schedule.cron_expression),
                      schedules::timezone.eq(schedule.timezone.as_deref()),
                      schedules::active.eq(schedule.active),
                      schedules::max_retries.eq(schedule.max_retries.map(encode_u32)),
                      schedules::context.eq(&schedule.context),
                      schedules::updated_at.eq(Utc::now())))
                .returning(ScheduleRow::as_returning())
                .get_result(conn)
                .optional()?
                .map(Schedule::try_from)
                .transpose()
            })
            .await
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError> {
        self.run("get_schedule", move |conn| {
                schedules::table.find(id)
                                .select(ScheduleRow::as_select())
                                .first(conn)
                                .optional()?
                                .map(Schedule::try_from)
                                .transpose()
            })
            .await
    }

    async fn list_schedules(&self, workflow_id: i64) -> Result<Vec<Schedule>, StoreError> {
        self.run("list_schedules", move |conn| {
                let rows = schedules::table.filter(schedules::workflow_id.eq(workflow_id))
                                           .order(schedules::id.asc())
                                           .select(ScheduleRow::as_select())
                                           .load(conn)?;
                rows.into_iter().map(Schedule::try_from).collect()
            })
            .await
    }

    async fn set_schedule_active(&self, id: i64, active: bool) -> Result<Schedule, StoreError> {
        let row = self.run("set_schedule_active", move |conn| {
                          diesel::update(schedules::table.find(id))
                          .set((schedules::active.eq(active), schedules::updated_at.eq(Utc::now())))
                          .returning(ScheduleRow::as_returning())
                          .get_result(conn)
                          .optional()?
                          .map(Schedule::try_from)
                          .transpose()
                      })
                      .await?;
        row.ok_or_else(missing(format!("schedule {id}")))
    }

    async fn set_skip_next_run(&self, id: i64, count: u32) -> Result<Schedule, StoreError> {
        let row = self.run("set_skip_next_run", move |conn| {
                          diesel::update(schedules::table.find(id))
                          .set((schedules::skip_next_run.eq(encode_u32(count)),
                                schedules::updated_at.eq(Utc::now())))
                          .returning(ScheduleRow::as_returning())
                          .get_result(conn)
                          .optional()?
                          .map(Schedule::try_from)
                          .transpose()
                      })
                      .await?;
        row.ok_or_else(missing(format!("schedule {id}")))
    }

    async fn consume_skip(&self, id: i64) -> Result<bool, StoreError> {
        let outcome = self.run("consume_skip", move |conn| {
                              let updated = diesel::update(schedules::table.find(id)
                                                                           .filter(schedules::skip_next_run.gt(0)))
                                            .set((schedules::skip_next_run.eq(schedules::skip_next_run - 1),
                                                  schedules::updated_at.eq(Utc::now())))
                                            .execute(conn)?;
                              if updated > 0 {
                                  return Ok(Some(true));
                              }
                              let exists: i64 = schedules::table.find(id).count().get_result(conn)?;
                              Ok((exists > 0).then_some(false))
                          })
                          .await?;
        outcome.ok_or_else(missing(format!("schedule {id}")))
    }

    async fn get_or_create_subscription(&self,
                                        workflow_id: i64,
                                        name: &str,
                                        provider: Option<&str>,
                                        connection: Option<&str>)
                                        -> Result<EventSubscription, StoreError> {
        let name = name.to_string();
        let provider = provider.map(str::to_string);
        let connection = connection.map(str::to_string);
        self.run("get_or_create_subscription", move |conn| {
                // El índice único usa COALESCE sobre provider/connection.
                diesel::insert_into(event_subscriptions::table)
                    .values((event_subscriptions::workflow_id.eq(workflow_id),
                             event_subscriptions::name.eq(&name),
                             event_subscriptions::provider.eq(provider.as_deref()),
                             event_subscriptions::connection.eq(connection.as_deref())))
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                let mut query = event_subscriptions::table.filter(event_subscriptions::workflow_id.eq(workflow_id))
                                                          .filter(event_subscriptions::name.eq(name.clone()))
                                                          .into_boxed();
                query = match &provider {
                    Some(p) => query.filter(event_subscriptions::provider.eq(p.clone())),
                    None => query.filter(event_subscriptions::provider.is_null()),
                };
                query = match &connection {
                    Some(c) => query.filter(event_subscriptions::connection.eq(c.clone())),
                    None => query.filter(event_subscriptions::connection.is_null()),
                };
                let row = query.select(SubscriptionRow::as_select()).first(conn)?;
                Ok(EventSubscription::from(row))
            })
            .await
    }

    async fn set_subscription_active(&self, id: i64, active: bool) -> Result<EventSubscription, StoreError> {
        let row = self.run("set_subscription_active", move |conn| {
                          let row = diesel::update(event_subscriptions::table.find(id))
                                    .set(event_subscriptions::active.eq(active))
                                    .returning(SubscriptionRow::as_returning())
                                    .get_result(conn)
                                    .optional()?;
                          Ok(row.map(EventSubscription::from))
                      })
                      .await?;
        row.ok_or_else(missing(format!("subscription {id}")))
    }
}
