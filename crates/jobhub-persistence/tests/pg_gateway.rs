mod test_support;

use jobhub_core::errors::StoreError;
use jobhub_core::model::{JobOptions, JobStatus, JobStepStatus, JobTrigger, NewJob, NewSchedule};
use jobhub_core::PersistenceGateway;
use jobhub_persistence::PgGateway;
use serde_json::json;
use test_support::{provider, unique};
use uuid::Uuid;

fn new_job(workflow_id: i64, dedupe: Option<&str>) -> NewJob {
    NewJob { id: Uuid::new_v4(),
             workflow_id,
             parent_id: None,
             status: JobStatus::Waiting,
             trigger: JobTrigger::Manual,
             trigger_id: None,
             payload: json!({"n": 1}),
             dedupe_id: dedupe.map(str::to_string),
             options: JobOptions { scheduled_at: None,
                                   max_retries: 2 },
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
    let Some(provider) = provider() else {
        eprintln!("skip dedupe_returns_active_job_until_terminal (no DATABASE_URL)");
        return;
    };
    let gw = PgGateway::new(provider);
    let wf = gw.upsert_workflow(&unique("dedupe"), "Dedupe", false).await.unwrap();
    assert!(wf.active);

    let first = gw.insert_job(new_job(wf.id, Some("k"))).await.unwrap();
    assert!(first.created);
    assert_eq!(first.job.options.max_retries, 2);
    let again = gw.insert_job(new_job(wf.id, Some("k"))).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.job.id, first.job.id);

    gw.update_job_status(first.job.id, JobStatus::Succeeded, Some(4)).await.unwrap();
    let fresh = gw.insert_job(new_job(wf.id, Some("k"))).await.unwrap();
    assert!(fresh.created);
    assert_ne!(fresh.job.id, first.job.id);

    let done = gw.get_job(first.job.id).await.unwrap().unwrap();
    assert_eq!(done.checkpoint, Some(4));
    assert_eq!(gw.list_jobs(wf.id, Some(JobStatus::Waiting)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn upsert_job_is_idempotent_by_id() {
    let Some(provider) = provider() else {
        eprintln!("skip upsert_job_is_idempotent_by_id (no DATABASE_URL)");
        return;
    };
    let gw = PgGateway::new(provider);
    let wf = gw.upsert_workflow(&unique("upsert"), "Upsert", false).await.unwrap();
    let job = new_job(wf.id, None);
    let a = gw.upsert_job(job.clone()).await.unwrap();
    gw.update_job_status(a.id, JobStatus::Running, None).await.unwrap();
    let b = gw.upsert_job(job).await.unwrap();
    assert_eq!(b.status, JobStatus::Running);
    assert_eq!(gw.list_jobs(wf.id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn start_step_upserts_single_row() {
    let Some(provider) = provider() else {
        eprintln!("skip start_step_upserts_single_row (no DATABASE_URL)");
        return;
    };
    let gw = PgGateway::new(provider);
    let wf = gw.upsert_workflow(&unique("steps"), "Steps", false).await.unwrap();
    let job = gw.insert_job(new_job(wf.id, None)).await.unwrap().job;

    gw.start_step(job.id, "fetch", 1, false).await.unwrap();
    gw.finish_step(job.id, "fetch", JobStepStatus::WaitingRerun, None).await.unwrap();
    let step = gw.start_step(job.id, "fetch", 1, true).await.unwrap();
    assert_eq!((step.runs, step.retries), (2, 1));
    assert!(step.finished_at.is_none());

    let done = gw.finish_step(job.id, "fetch", JobStepStatus::Succeeded, Some(json!({"ok": true})))
                 .await
                 .unwrap();
    assert_eq!(done.result, Some(json!({"ok": true})));
    gw.set_step_resume(job.id, "fetch", json!("later")).await.unwrap();
    let steps = gw.list_steps(job.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].resume, Some(json!("later")));

    let missing = gw.start_step(Uuid::new_v4(), "x", 1, false).await.unwrap_err();
    assert!(matches!(missing, StoreError::NotFound(_)));
}

#[tokio::test]
async fn schedules_upsert_replace_and_skip() {
    let Some(provider) = provider() else {
        eprintln!("skip schedules_upsert_replace_and_skip (no DATABASE_URL)");
        return;
    };
    let gw = PgGateway::new(provider);
    let wf = gw.upsert_workflow(&unique("cron"), "Cron", false).await.unwrap();
    let hourly = gw.upsert_schedule(sched(wf.id, "0 * * * *")).await.unwrap();
    let same = gw.upsert_schedule(sched(wf.id, "0 * * * *")).await.unwrap();
    assert_eq!(hourly.id, same.id);
    gw.upsert_schedule(sched(wf.id, "30 * * * *")).await.unwrap();

    let clash = gw.replace_schedule_pattern("0 * * * *", sched(wf.id, "30 * * * *")).await.unwrap_err();
    assert!(matches!(clash, StoreError::UniqueViolation(_)));
    assert!(gw.replace_schedule_pattern("5 5 * * *", sched(wf.id, "6 6 * * *")).await.unwrap().is_none());
    let moved = gw.replace_schedule_pattern("0 * * * *", sched(wf.id, "0 */2 * * *")).await.unwrap().unwrap();
    assert_eq!(moved.id, hourly.id);

    gw.set_skip_next_run(hourly.id, 1).await.unwrap();
    assert!(gw.consume_skip(hourly.id).await.unwrap());
    assert!(!gw.consume_skip(hourly.id).await.unwrap());
    assert!(matches!(gw.consume_skip(-1).await.unwrap_err(), StoreError::NotFound(_)));

    let off = gw.set_schedule_active(hourly.id, false).await.unwrap();
    assert!(!off.active);
    assert_eq!(gw.list_schedules(wf.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn subscriptions_are_created_once_per_binding() {
    let Some(provider) = provider() else {
        eprintln!("skip subscriptions_are_created_once_per_binding (no DATABASE_URL)");
        return;
    };
    let gw = PgGateway::new(provider);
    let wf = gw.upsert_workflow(&unique("events"), "Events", false).await.unwrap();
    let bare = gw.get_or_create_subscription(wf.id, "order.created", None, None).await.unwrap();
    let again = gw.get_or_create_subscription(wf.id, "order.created", None, None).await.unwrap();
    assert_eq!(bare.id, again.id);
    let scoped = gw.get_or_create_subscription(wf.id, "order.created", Some("shop"), Some("eu"))
                   .await
                   .unwrap();
    assert_ne!(scoped.id, bare.id);
    assert_eq!(scoped.connection.as_deref(), Some("eu"));

    let off = gw.set_subscription_active(bare.id, false).await.unwrap();
    assert!(!off.active);
    let err = gw.set_workflow_active(-1, false).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
