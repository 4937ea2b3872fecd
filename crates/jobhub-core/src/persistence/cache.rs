//! Cache read-through sobre cualquier gateway.
//!
//! Sólo se cachean lecturas de workflows y schedules (alta frecuencia desde
//! los ticks cron y los dispatch de eventos). Jobs y steps nunca se cachean:
//! el engine necesita siempre el estado autoritativo. Cada escritura invalida
//! las entradas afectadas.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::trace;
use serde_json::Value;
use uuid::Uuid;

use super::{JobInsert, PersistenceGateway};
use crate::constants::DEFAULT_CACHE_TTL;
use crate::errors::StoreError;
use crate::model::{EventSubscription, Job, JobStatus, JobStep, JobStepStatus, NewJob, NewSchedule, Schedule,
                   WorkflowRecord};

struct Entry<T> {
    value: T,
    at: Instant,
}

struct TtlMap<K, V> {
    ttl: Duration,
    inner: DashMap<K, Entry<V>>,
}

impl<K, V> TtlMap<K, V>
    where K: std::hash::Hash + Eq,
          V: Clone
{
    fn new(ttl: Duration) -> Self {
        Self { ttl,
               inner: DashMap::new() }
    }

    fn get(&self, key: &K) -> Option<V> {
        let hit = self.inner.get(key).and_then(|e| {
                                         if e.at.elapsed() < self.ttl {
                                             Some(e.value.clone())
                                         } else {
                                             None
                                         }
                                     });
        if hit.is_none() {
            self.inner.remove(key);
        }
        hit
    }

    fn put(&self, key: K, value: V) {
        self.inner.insert(key,
                          Entry { value,
                                  at: Instant::now() });
    }

    fn invalidate(&self, key: &K) {
        self.inner.remove(key);
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

pub struct CachedGateway<G> {
    inner: Arc<G>,
    workflows: TtlMap<i64, WorkflowRecord>,
    workflow_keys: TtlMap<String, WorkflowRecord>,
    schedules: TtlMap<i64, Schedule>,
}

impl<G> CachedGateway<G> where G: PersistenceGateway
{
    pub fn new(inner: Arc<G>) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<G>, ttl: Duration) -> Self {
        Self { inner,
               workflows: TtlMap::new(ttl),
               workflow_keys: TtlMap::new(ttl),
               schedules: TtlMap::new(ttl) }
    }

    pub fn inner(&self) -> &Arc<G> {
        &self.inner
    }

    fn remember_workflow(&self, wf: &WorkflowRecord) {
        self.workflows.put(wf.id, wf.clone());
        self.workflow_keys.put(wf.key.clone(), wf.clone());
    }

    fn forget_workflow(&self, id: i64) {
        self.workflows.invalidate(&id);
        // La clave no se conoce sin otra lectura; se vacía el índice entero.
        self.workflow_keys.clear();
    }
}

#[async_trait]
impl<G> PersistenceGateway for CachedGateway<G> where G: PersistenceGateway
{
    async fn upsert_workflow(&self, key: &str, name: &str, internal: bool) -> Result<WorkflowRecord, StoreError> {
        let wf = self.inner.upsert_workflow(key, name, internal).await?;
        self.remember_workflow(&wf);
        Ok(wf)
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowRecord>, StoreError> {
        if let Some(wf) = self.workflows.get(&id) {
            trace!("cache:hit workflow id={id}");
            return Ok(Some(wf));
        }
        let found = self.inner.get_workflow(id).await?;
        if let Some(wf) = &found {
            self.remember_workflow(wf);
        }
        Ok(found)
    }

    async fn get_workflow_by_key(&self, key: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        if let Some(wf) = self.workflow_keys.get(&key.to_string()) {
            trace!("cache:hit workflow key={key}");
            return Ok(Some(wf));
        }
        let found = self.inner.get_workflow_by_key(key).await?;
        if let Some(wf) = &found {
            self.remember_workflow(wf);
        }
        Ok(found)
    }

    async fn set_workflow_active(&self, id: i64, active: bool) -> Result<WorkflowRecord, StoreError> {
        self.forget_workflow(id);
        let wf = self.inner.set_workflow_active(id, active).await?;
        self.remember_workflow(&wf);
        Ok(wf)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        self.inner.list_workflows().await
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobInsert, StoreError> {
        self.inner.insert_job(job).await
    }

    async fn upsert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        self.inner.upsert_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn update_job_status(&self,
                               id: Uuid,
                               status: JobStatus,
                               checkpoint: Option<u32>)
                               -> Result<Job, StoreError> {
        self.inner.update_job_status(id, status, checkpoint).await
    }

    async fn list_jobs(&self, workflow_id: i64, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        self.inner.list_jobs(workflow_id, status).await
    }

    async fn start_step(&self, job_id: Uuid, name: &str, index: u32, is_retry: bool) -> Result<JobStep, StoreError> {
        self.inner.start_step(job_id, name, index, is_retry).await
    }

    async fn finish_step(&self,
                         job_id: Uuid,
                         name: &str,
                         status: JobStepStatus,
                         result: Option<Value>)
                         -> Result<JobStep, StoreError> {
        self.inner.finish_step(job_id, name, status, result).await
    }

    async fn get_step(&self, job_id: Uuid, name: &str) -> Result<Option<JobStep>, StoreError> {
        self.inner.get_step(job_id, name).await
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>, StoreError> {
        self.inner.list_steps(job_id).await
    }

    async fn set_step_resume(&self, job_id: Uuid, name: &str, data: Value) -> Result<JobStep, StoreError> {
        self.inner.set_step_resume(job_id, name, data).await
    }

    async fn upsert_schedule(&self, schedule: NewSchedule) -> Result<Schedule, StoreError> {
        let row = self.inner.upsert_schedule(schedule).await?;
        self.schedules.put(row.id, row.clone());
        Ok(row)
    }

    async fn replace_schedule_pattern(&self,
                                      old_pattern: &str,
                                      schedule: NewSchedule)
                                      -> Result<Option<Schedule>, StoreError> {
        let row = self.inner.replace_schedule_pattern(old_pattern, schedule).await?;
        if let Some(r) = &row {
            self.schedules.put(r.id, r.clone());
        }
        Ok(row)
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError> {
        if let Some(row) = self.schedules.get(&id) {
            trace!("cache:hit schedule id={id}");
            return Ok(Some(row));
        }
        let found = self.inner.get_schedule(id).await?;
        if let Some(row) = &found {
            self.schedules.put(row.id, row.clone());
        }
        Ok(found)
    }

    async fn list_schedules(&self, workflow_id: i64) -> Result<Vec<Schedule>, StoreError> {
        self.inner.list_schedules(workflow_id).await
    }

    async fn set_schedule_active(&self, id: i64, active: bool) -> Result<Schedule, StoreError> {
        self.schedules.invalidate(&id);
        let row = self.inner.set_schedule_active(id, active).await?;
        self.schedules.put(row.id, row.clone());
        Ok(row)
    }

    async fn set_skip_next_run(&self, id: i64, count: u32) -> Result<Schedule, StoreError> {
        self.schedules.invalidate(&id);
        let row = self.inner.set_skip_next_run(id, count).await?;
        self.schedules.put(row.id, row.clone());
        Ok(row)
    }

    async fn consume_skip(&self, id: i64) -> Result<bool, StoreError> {
        self.schedules.invalidate(&id);
        self.inner.consume_skip(id).await
    }

    async fn get_or_create_subscription(&self,
                                        workflow_id: i64,
                                        name: &str,
                                        provider: Option<&str>,
                                        connection: Option<&str>)
                                        -> Result<EventSubscription, StoreError> {
        self.inner.get_or_create_subscription(workflow_id, name, provider, connection).await
    }

    async fn set_subscription_active(&self, id: i64, active: bool) -> Result<EventSubscription, StoreError> {
        self.inner.set_subscription_active(id, active).await
    }
}
