//! Filas Diesel y su conversión al modelo del core.
//!
//! Los enums se guardan como texto (mismo literal que `as_str`) y las opciones
//! del job como JSONB; una fila que no decodifica produce
//! `PersistenceError::Decode`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use jobhub_core::model::{EventSubscription, Job, JobStep, Schedule, WorkflowRecord};
use jobhub_core::queue::{BrokerHandle, BrokerJob, QueueMessage, RecurringSpec};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::schema::{event_subscriptions, job_steps, jobs, queue_jobs, queue_recurring, schedules, workflows};

fn decode_u32(field: &str, v: i32) -> Result<u32, PersistenceError> {
    u32::try_from(v).map_err(|_| PersistenceError::Decode(format!("{field}={v}")))
}

pub(crate) fn encode_u32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = workflows)]
pub(crate) struct WorkflowRow {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub internal: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WorkflowRow> for WorkflowRecord {
    fn from(row: WorkflowRow) -> Self {
        WorkflowRecord { id: row.id,
                         key: row.key,
                         name: row.name,
                         internal: row.internal,
                         active: row.active,
                         created_at: row.created_at }
    }
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = jobs)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub workflow_id: i64,
    pub parent_id: Option<Uuid>,
    pub status: String,
    pub trigger_kind: String,
    pub trigger_id: Option<String>,
    pub payload: Value,
    pub dedupe_id: Option<String>,
    pub options: Value,
    pub checkpoint: Option<i32>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = PersistenceError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job { id: row.id,
                 workflow_id: row.workflow_id,
                 parent_id: row.parent_id,
                 status: row.status.parse().map_err(|e| PersistenceError::Decode(format!("{e}")))?,
                 trigger: row.trigger_kind.parse().map_err(|e| PersistenceError::Decode(format!("{e}")))?,
                 trigger_id: row.trigger_id,
                 payload: row.payload,
                 dedupe_id: row.dedupe_id,
                 options: serde_json::from_value(row.options)?,
                 checkpoint: row.checkpoint.map(|c| decode_u32("checkpoint", c)).transpose()?,
                 context: row.context,
                 created_at: row.created_at,
                 updated_at: row.updated_at })
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = jobs)]
pub(crate) struct NewJobRow<'a> {
    pub id: Uuid,
    pub workflow_id: i64,
    pub parent_id: Option<Uuid>,
    pub status: &'a str,
    pub trigger_kind: &'a str,
    pub trigger_id: Option<&'a str>,
    pub payload: &'a Value,
    pub dedupe_id: Option<&'a str>,
    pub options: &'a Value,
    pub context: &'a Value,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = job_steps)]
pub(crate) struct StepRow {
    pub id: i64,
    pub job_id: Uuid,
    pub name: String,
    pub step_index: i32,
    pub status: String,
    pub runs: i32,
    pub retries: i32,
    pub result: Option<Value>,
    pub resume: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for JobStep {
    type Error = PersistenceError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(JobStep { id: row.id,
                     job_id: row.job_id,
                     name: row.name,
                     step_index: decode_u32("step_index", row.step_index)?,
                     status: row.status.parse().map_err(|e| PersistenceError::Decode(format!("{e}")))?,
                     runs: decode_u32("runs", row.runs)?,
                     retries: decode_u32("retries", row.retries)?,
                     result: row.result,
                     resume: row.resume,
                     started_at: row.started_at,
                     finished_at: row.finished_at })
    }
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = schedules)]
pub(crate) struct ScheduleRow {
    pub id: i64,
    pub workflow_id: i64,
    pub cron_expression: String,
    pub timezone: Option<String>,
    pub active: bool,
    pub skip_next_run: i32,
    pub max_retries: Option<i32>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = PersistenceError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Schedule { id: row.id,
                      workflow_id: row.workflow_id,
                      cron_expression: row.cron_expression,
                      timezone: row.timezone,
                      active: row.active,
                      skip_next_run: decode_u32("skip_next_run", row.skip_next_run)?,
                      max_retries: row.max_retries.map(|m| decode_u32("max_retries", m)).transpose()?,
                      context: row.context,
                      created_at: row.created_at,
                      updated_at: row.updated_at })
    }
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = event_subscriptions)]
pub(crate) struct SubscriptionRow {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    pub provider: Option<String>,
    pub connection: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for EventSubscription {
    fn from(row: SubscriptionRow) -> Self {
        EventSubscription { id: row.id,
                            workflow_id: row.workflow_id,
                            name: row.name,
                            provider: row.provider,
                            connection: row.connection,
                            active: row.active,
                            created_at: row.created_at }
    }
}

#[derive(Queryable, Selectable, QueryableByName, Debug, Clone)]
#[diesel(table_name = queue_jobs)]
pub(crate) struct QueueJobRow {
    pub queue: String,
    pub id: String,
    pub seq: i64,
    pub message: Value,
    pub state: String,
    pub attempts: i32,
    pub attempts_made: i32,
    pub dedupe: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueJobRow {
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(self.queue.clone(), self.id.clone())
    }
}

impl TryFrom<QueueJobRow> for BrokerJob {
    type Error = PersistenceError;

    fn try_from(row: QueueJobRow) -> Result<Self, Self::Error> {
        let handle = row.handle();
        Ok(BrokerJob { handle,
                       message: serde_json::from_value::<QueueMessage>(row.message)?,
                       state: row.state.parse().map_err(|e| PersistenceError::Decode(format!("{e}")))?,
                       attempts: decode_u32("attempts", row.attempts)?,
                       attempts_made: decode_u32("attempts_made", row.attempts_made)?,
                       dedupe: row.dedupe,
                       due_at: row.due_at,
                       locked_until: row.locked_until,
                       failed_reason: row.failed_reason,
                       created_at: row.created_at })
    }
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = queue_recurring)]
pub(crate) struct RecurringRow {
    pub queue: String,
    pub id: String,
    pub pattern: String,
    pub timezone: Option<String>,
    pub immediate: bool,
    pub attempts: i32,
    pub message: Value,
    pub next_run: Option<DateTime<Utc>>,
}

impl TryFrom<RecurringRow> for RecurringSpec {
    type Error = PersistenceError;

    fn try_from(row: RecurringRow) -> Result<Self, Self::Error> {
        Ok(RecurringSpec { id: row.id,
                           pattern: row.pattern,
                           timezone: row.timezone,
                           immediate: row.immediate,
                           attempts: decode_u32("attempts", row.attempts)?,
                           message: serde_json::from_value(row.message)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhub_core::model::{JobStatus, JobTrigger};
    use serde_json::json;

    fn job_row(status: &str) -> JobRow {
        JobRow { id: Uuid::nil(),
                 workflow_id: 1,
                 parent_id: None,
                 status: status.into(),
                 trigger_kind: "EVENT".into(),
                 trigger_id: Some("7".into()),
                 payload: json!({"a": 1}),
                 dedupe_id: None,
                 options: json!({"scheduled_at": null, "max_retries": 2}),
                 checkpoint: Some(3),
                 context: Value::Null,
                 created_at: Utc::now(),
                 updated_at: Utc::now() }
    }

    #[test]
    fn job_row_decodes_text_columns() {
        let job = Job::try_from(job_row("WAITING_RERUN")).unwrap();
        assert_eq!(job.status, JobStatus::WaitingRerun);
        assert_eq!(job.trigger, JobTrigger::Event);
        assert_eq!(job.options.max_retries, 2);
        assert_eq!(job.checkpoint, Some(3));
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let err = Job::try_from(job_row("LOST")).unwrap_err();
        assert!(matches!(err, PersistenceError::Decode(_)));
    }

    #[test]
    fn negative_counters_are_rejected() {
        assert!(decode_u32("runs", -1).is_err());
        assert_eq!(encode_u32(u32::MAX), i32::MAX);
    }
}
