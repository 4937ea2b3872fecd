//! Gateway en memoria. Mismo contrato que la implementación Postgres; todo el
//! estado vive detrás de un único `RwLock`, lo que hace atómicas las
//! operaciones compuestas (dedupe, upsert de steps, consumo de skips).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobInsert, PersistenceGateway};
use crate::errors::StoreError;
use crate::model::{EventSubscription, Job, JobStatus, JobStep, JobStepStatus, NewJob, NewSchedule, Schedule,
                   WorkflowRecord};

#[derive(Default)]
struct State {
    seq: i64,
    workflows: Vec<WorkflowRecord>,
    jobs: HashMap<Uuid, Job>,
    /// Orden de inserción para listados estables.
    job_order: Vec<Uuid>,
    steps: HashMap<(Uuid, String), JobStep>,
    schedules: Vec<Schedule>,
    subscriptions: Vec<EventSubscription>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn workflow_mut(&mut self, id: i64) -> Result<&mut WorkflowRecord, StoreError> {
        self.workflows
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))
    }

    fn schedule_mut(&mut self, id: i64) -> Result<&mut Schedule, StoreError> {
        self.schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))
    }

    fn step_mut(&mut self, job_id: Uuid, name: &str) -> Result<&mut JobStep, StoreError> {
        self.steps
            .get_mut(&(job_id, name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("step {job_id}/{name}")))
    }
}

#[derive(Default)]
pub struct InMemoryGateway {
    state: RwLock<State>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn upsert_workflow(&self, key: &str, name: &str, internal: bool) -> Result<WorkflowRecord, StoreError> {
        let mut st = self.state.write().await;
        if let Some(existing) = st.workflows.iter_mut().find(|w| w.key == key) {
            existing.name = name.to_string();
            existing.internal = internal;
            return Ok(existing.clone());
        }
        let rec = WorkflowRecord { id: st.next_id(),
                                   key: key.to_string(),
                                   name: name.to_string(),
                                   internal,
                                   active: true,
                                   created_at: Utc::now() };
        st.workflows.push(rec.clone());
        Ok(rec)
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.state.read().await.workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn get_workflow_by_key(&self, key: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.state.read().await.workflows.iter().find(|w| w.key == key).cloned())
    }

    async fn set_workflow_active(&self, id: i64, active: bool) -> Result<WorkflowRecord, StoreError> {
        let mut st = self.state.write().await;
        let wf = st.workflow_mut(id)?;
        wf.active = active;
        Ok(wf.clone())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        Ok(self.state.read().await.workflows.clone())
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobInsert, StoreError> {
        let mut st = self.state.write().await;
        if let Some(dedupe) = job.dedupe_id.as_deref() {
            let active = st.job_order
                           .iter()
                           .filter_map(|id| st.jobs.get(id))
                           .find(|j| {
                               j.workflow_id == job.workflow_id
                               && j.dedupe_id.as_deref() == Some(dedupe)
                               && !j.status.is_terminal()
                           });
            if let Some(existing) = active {
                return Ok(JobInsert { job: existing.clone(),
                                      created: false });
            }
        }
        if st.jobs.contains_key(&job.id) {
            return Err(StoreError::UniqueViolation(format!("job {}", job.id)));
        }
        let job = job.into_job(Utc::now());
        st.job_order.push(job.id);
        st.jobs.insert(job.id, job.clone());
        Ok(JobInsert { job, created: true })
    }

    async fn upsert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut st = self.state.write().await;
        if let Some(existing) = st.jobs.get(&job.id) {
            return Ok(existing.clone());
        }
        let job = job.into_job(Utc::now());
        st.job_order.push(job.id);
        st.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn update_job_status(&self,
                               id: Uuid,
                               status: JobStatus,
                               checkpoint: Option<u32>)
                               -> Result<Job, StoreError> {
        let mut st = self.state.write().await;
        let job = st.jobs
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job.status = status;
        if checkpoint.is_some() {
            job.checkpoint = checkpoint;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn list_jobs(&self, workflow_id: i64, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let st = self.state.read().await;
        Ok(st.job_order
             .iter()
             .filter_map(|id| st.jobs.get(id))
             .filter(|j| j.workflow_id == workflow_id)
             .filter(|j| status.map_or(true, |s| j.status == s))
             .cloned()
             .collect())
    }

    async fn start_step(&self, job_id: Uuid, name: &str, index: u32, is_retry: bool) -> Result<JobStep, StoreError> {
        let mut st = self.state.write().await;
        if !st.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        let key = (job_id, name.to_string());
        let now = Utc::now();
        if let Some(step) = st.steps.get_mut(&key) {
            step.status = JobStepStatus::Running;
            step.step_index = index;
            step.runs += 1;
            if is_retry {
                step.retries += 1;
            }
            step.started_at = now;
            step.finished_at = None;
            return Ok(step.clone());
        }
        let step = JobStep { id: st.next_id(),
                             job_id,
                             name: name.to_string(),
                             step_index: index,
                             status: JobStepStatus::Running,
                             runs: 1,
                             retries: u32::from(is_retry),
                             result: None,
                             resume: None,
                             started_at: now,
                             finished_at: None };
        st.steps.insert(key, step.clone());
        Ok(step)
    }

    async fn finish_step(&self,
                         job_id: Uuid,
                         name: &str,
                         status: JobStepStatus,
                         result: Option<Value>)
                         -> Result<JobStep, StoreError> {
        let mut st = self.state.write().await;
        let step = st.step_mut(job_id, name)?;
        step.status = status;
        if result.is_some() {
            step.result = result;
        }
        step.finished_at = Some(Utc::now());
        Ok(step.clone())
    }

    async fn get_step(&self, job_id: Uuid, name: &str) -> Result<Option<JobStep>, StoreError> {
        Ok(self.state.read().await.steps.get(&(job_id, name.to_string())).cloned())
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>, StoreError> {
        let st = self.state.read().await;
        let mut steps: Vec<JobStep> = st.steps.values().filter(|s| s.job_id == job_id).cloned().collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn set_step_resume(&self, job_id: Uuid, name: &str, data: Value) -> Result<JobStep, StoreError> {
        let mut st = self.state.write().await;
        let step = st.step_mut(job_id, name)?;
        step.resume = Some(data);
        Ok(step.clone())
    }

    async fn upsert_schedule(&self, schedule: NewSchedule) -> Result<Schedule, StoreError> {
        let mut st = self.state.write().await;
        let now = Utc::now();
        if let Some(existing) = st.schedules
                                  .iter_mut()
                                  .find(|s| {
                                      s.workflow_id == schedule.workflow_id
                                      && s.cron_expression == schedule.cron_expression
                                  })
        {
            existing.timezone = schedule.timezone;
            existing.active = schedule.active;
            existing.max_retries = schedule.max_retries;
            existing.context = schedule.context;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let row = Schedule { id: st.next_id(),
                             workflow_id: schedule.workflow_id,
                             cron_expression: schedule.cron_expression,
                             timezone: schedule.timezone,
                             active: schedule.active,
                             skip_next_run: 0,
                             max_retries: schedule.max_retries,
                             context: schedule.context,
                             created_at: now,
                             updated_at: now };
        st.schedules.push(row.clone());
        Ok(row)
    }

    async fn replace_schedule_pattern(&self,
                                      old_pattern: &str,
                                      schedule: NewSchedule)
                                      -> Result<Option<Schedule>, StoreError> {
        let mut st = self.state.write().await;
        let clash = st.schedules.iter().any(|s| {
                                           s.workflow_id == schedule.workflow_id
                                           && s.cron_expression == schedule.cron_expression
                                       });
        let Some(row) = st.schedules
                          .iter_mut()
                          .find(|s| s.workflow_id == schedule.workflow_id && s.cron_expression == old_pattern)
        else {
            return Ok(None);
        };
        if clash && old_pattern != schedule.cron_expression {
            return Err(StoreError::UniqueViolation(format!("schedule {} '{}'",
                                                           schedule.workflow_id, schedule.cron_expression)));
        }
        row.cron_expression = schedule.cron_expression;
        row.timezone = schedule.timezone;
        row.active = schedule.active;
        row.max_retries = schedule.max_retries;
        row.context = schedule.context;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError> {
        Ok(self.state.read().await.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn list_schedules(&self, workflow_id: i64) -> Result<Vec<Schedule>, StoreError> {
        let st = self.state.read().await;
        Ok(st.schedules.iter().filter(|s| s.workflow_id == workflow_id).cloned().collect())
    }

    async fn set_schedule_active(&self, id: i64, active: bool) -> Result<Schedule, StoreError> {
        let mut st = self.state.write().await;
        let row = st.schedule_mut(id)?;
        row.active = active;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn set_skip_next_run(&self, id: i64, count: u32) -> Result<Schedule, StoreError> {
        let mut st = self.state.write().await;
        let row = st.schedule_mut(id)?;
        row.skip_next_run = count;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn consume_skip(&self, id: i64) -> Result<bool, StoreError> {
        let mut st = self.state.write().await;
        let row = st.schedule_mut(id)?;
        if row.skip_next_run == 0 {
            return Ok(false);
        }
        row.skip_next_run -= 1;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_or_create_subscription(&self,
                                        workflow_id: i64,
                                        name: &str,
                                        provider: Option<&str>,
                                        connection: Option<&str>)
                                        -> Result<EventSubscription, StoreError> {
        let mut st = self.state.write().await;
        if let Some(existing) = st.subscriptions.iter().find(|s| {
                                                           s.workflow_id == workflow_id
                                                           && s.name == name
                                                           && s.provider.as_deref() == provider
                                                           && s.connection.as_deref() == connection
                                                       })
        {
            return Ok(existing.clone());
        }
        let sub = EventSubscription { id: st.next_id(),
                                      workflow_id,
                                      name: name.to_string(),
                                      provider: provider.map(str::to_string),
                                      connection: connection.map(str::to_string),
                                      active: true,
                                      created_at: Utc::now() };
        st.subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn set_subscription_active(&self, id: i64, active: bool) -> Result<EventSubscription, StoreError> {
        let mut st = self.state.write().await;
        let sub = st.subscriptions
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or_else(|| StoreError::NotFound(format!("subscription {id}")))?;
        sub.active = active;
        Ok(sub.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobOptions, JobTrigger};
    use serde_json::json;

    fn new_job(workflow_id: i64, dedupe: Option<&str>) -> NewJob {
        NewJob { id: Uuid::new_v4(),
                 workflow_id,
                 parent_id: None,
                 status: JobStatus::Waiting,
                 trigger: JobTrigger::Manual,
                 trigger_id: None,
                 payload: json!({}),
                 dedupe_id: dedupe.map(str::to_string),
                 options: JobOptions::default(),
                 context: json!({}) }
    }

    fn sched(workflow_id: i64, cron: &str) -> NewSchedule {
        NewSchedule { workflow_id,
                      cron_expression: cron.into(),
                      timezone: None,
                      active: true,
                      max_retries: None,
                      context: json!({}) }
    }

    #[tokio::test]
    async fn dedupe_returns_active_job_until_terminal() {
        let gw = InMemoryGateway::new();
        let first = gw.insert_job(new_job(1, Some("d"))).await.unwrap();
        assert!(first.created);
        let again = gw.insert_job(new_job(1, Some("d"))).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.job.id, first.job.id);

        // Otro workflow con el mismo dedupe id no colisiona.
        assert!(gw.insert_job(new_job(2, Some("d"))).await.unwrap().created);

        gw.update_job_status(first.job.id, JobStatus::Succeeded, None).await.unwrap();
        let fresh = gw.insert_job(new_job(1, Some("d"))).await.unwrap();
        assert!(fresh.created);
        assert_ne!(fresh.job.id, first.job.id);
    }

    #[tokio::test]
    async fn upsert_job_is_idempotent_by_id() {
        let gw = InMemoryGateway::new();
        let nj = new_job(1, None);
        let a = gw.upsert_job(nj.clone()).await.unwrap();
        let b = gw.upsert_job(nj).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(gw.list_jobs(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn step_upsert_counts_runs_and_retries() {
        let gw = InMemoryGateway::new();
        let job = gw.insert_job(new_job(1, None)).await.unwrap().job;
        gw.start_step(job.id, "b", 2, false).await.unwrap();
        gw.finish_step(job.id, "b", JobStepStatus::WaitingRerun, None).await.unwrap();
        let s = gw.start_step(job.id, "b", 2, true).await.unwrap();
        assert_eq!((s.runs, s.retries), (2, 1));
        assert_eq!(s.status, JobStepStatus::Running);
        assert_eq!(gw.list_steps(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_pattern_detects_missing_and_clashing_rows() {
        let gw = InMemoryGateway::new();
        gw.upsert_schedule(sched(1, "0 * * * * *")).await.unwrap();
        gw.upsert_schedule(sched(1, "0 0 * * * *")).await.unwrap();

        let missing = gw.replace_schedule_pattern("0 5 * * * *", sched(1, "0 9 * * * *")).await.unwrap();
        assert!(missing.is_none());

        let clash = gw.replace_schedule_pattern("0 * * * * *", sched(1, "0 0 * * * *")).await;
        assert!(matches!(clash, Err(StoreError::UniqueViolation(_))));

        let moved = gw.replace_schedule_pattern("0 * * * * *", sched(1, "0 30 * * * *"))
                      .await
                      .unwrap()
                      .unwrap();
        assert_eq!(moved.cron_expression, "0 30 * * * *");
        assert_eq!(gw.list_schedules(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn consume_skip_decrements_until_zero() {
        let gw = InMemoryGateway::new();
        let s = gw.upsert_schedule(sched(1, "0 * * * * *")).await.unwrap();
        gw.set_skip_next_run(s.id, 2).await.unwrap();
        assert!(gw.consume_skip(s.id).await.unwrap());
        assert!(gw.consume_skip(s.id).await.unwrap());
        assert!(!gw.consume_skip(s.id).await.unwrap());
    }

    #[tokio::test]
    async fn subscriptions_are_created_once() {
        let gw = InMemoryGateway::new();
        let a = gw.get_or_create_subscription(1, "push", Some("github"), Some("main")).await.unwrap();
        let b = gw.get_or_create_subscription(1, "push", Some("github"), Some("main")).await.unwrap();
        assert_eq!(a.id, b.id);
        let c = gw.get_or_create_subscription(1, "push", None, None).await.unwrap();
        assert_ne!(a.id, c.id);
    }
}
