mod support;

use std::time::Duration;

use jobhub_core::errors::QueueError;
use jobhub_core::queue::BrokerState;
use jobhub_core::{DurableQueue, HubError, JobStatus, JobStepStatus, PersistenceGateway, RunOptions,
                  WorkflowDefinition};
use serde_json::{json, Value};
use support::{define, hub, worker};
use tokio::sync::watch;

fn two_steps(key: &str) -> WorkflowDefinition {
    define(WorkflowDefinition::builder(key).step(1, "first").step(2, "second"),
           |step, ctx| Ok(json!({ "step": step, "payload": ctx.payload().clone() })))
}

/// `ask` se pausa hasta recibir datos de resume y los devuelve como resultado.
fn approval() -> WorkflowDefinition {
    define(WorkflowDefinition::builder("approval").step(1, "ask").step(2, "apply"),
           |step, ctx| match step {
               "ask" => match ctx.resume_data() {
                   Some(data) => Ok(data.clone()),
                   None => {
                       ctx.pause();
                       Ok(Value::Null)
                   }
               },
               _ => Ok(ctx.result("ask").cloned().unwrap_or(Value::Null)),
           })
}

fn dedupe(id: &str) -> RunOptions {
    RunOptions { dedupe_id: Some(id.to_string()),
                 ..RunOptions::default() }
}

#[tokio::test]
async fn run_unknown_workflow_is_not_found() {
    let hub = hub(vec![two_steps("known")]);
    let err = hub.coordinator.run("ghost", RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, HubError::WorkflowNotFound(k) if k == "ghost"));
}

#[tokio::test]
async fn concurrent_runs_with_same_dedupe_share_one_job() {
    let hub = hub(vec![two_steps("dd")]);
    let (a, b) = tokio::join!(hub.coordinator.run("dd", dedupe("x")), hub.coordinator.run("dd", dedupe("x")));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.job.id, b.job.id);
    assert_eq!(a.handle, b.handle);
    assert_eq!(hub.coordinator.list_jobs("dd", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dedupe_allows_new_job_after_terminal() {
    let hub = hub(vec![two_steps("dd")]);
    let first = hub.coordinator.run("dd", dedupe("x")).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();
    assert_eq!(hub.coordinator.get_job(first.job.id).await.unwrap().status, JobStatus::Succeeded);

    let second = hub.coordinator.run("dd", dedupe("x")).await.unwrap();
    assert_ne!(first.job.id, second.job.id);
    assert!(second.handle.is_some());
}

#[tokio::test]
async fn draft_runs_wait_for_execute() {
    let hub = hub(vec![two_steps("drafty")]);
    let run = hub.coordinator
                 .run("drafty",
                      RunOptions { draft: true,
                                   payload: json!({"n": 7}),
                                   ..RunOptions::default() })
                 .await
                 .unwrap();
    assert_eq!(run.job.status, JobStatus::Draft);
    assert!(run.handle.is_none());
    assert_eq!(worker(&hub).run_until_idle().await.unwrap(), 0);

    let exec = hub.coordinator.execute_draft(run.job.id).await.unwrap();
    assert_eq!(exec.job.status, JobStatus::Waiting);
    worker(&hub).run_until_idle().await.unwrap();
    let result = hub.coordinator.get_result(run.job.id, "second").await.unwrap().unwrap();
    assert_eq!(result["payload"]["n"], 7);

    let err = hub.coordinator.execute_draft(run.job.id).await.unwrap_err();
    assert!(matches!(err, HubError::NotDraft { status: JobStatus::Succeeded, .. }));
}

#[tokio::test]
async fn pause_then_resume_with_data() {
    let hub = hub(vec![approval()]);
    let run = hub.coordinator.run("approval", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    let ask = hub.store.get_step(job.id, "ask").await.unwrap().unwrap();
    assert_eq!(ask.status, JobStepStatus::WaitingRerun);
    assert!(hub.coordinator.get_resume_data(job.id, "ask").await.unwrap().is_none());
    // Estacionado: nada que reclamar hasta el resume.
    assert_eq!(worker(&hub).run_until_idle().await.unwrap(), 0);

    hub.coordinator.resume(job.id, Some(json!({"approved": true}))).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(hub.coordinator.get_resume_data(job.id, "ask").await.unwrap(),
               Some(json!({"approved": true})));
    assert_eq!(hub.coordinator.get_result(job.id, "apply").await.unwrap(),
               Some(json!({"approved": true})));
    let ask = hub.store.get_step(job.id, "ask").await.unwrap().unwrap();
    assert_eq!(ask.runs, 2);
}

#[tokio::test]
async fn resume_requires_paused_job() {
    let hub = hub(vec![two_steps("plain")]);
    let run = hub.coordinator.run("plain", RunOptions::default()).await.unwrap();
    let err = hub.coordinator.resume(run.job.id, None).await.unwrap_err();
    assert!(matches!(err, HubError::NotPaused { status: JobStatus::Waiting, .. }));
}

#[tokio::test]
async fn resume_reenqueues_lost_message() {
    let hub = hub(vec![approval()]);
    let run = hub.coordinator.run("approval", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();
    let handle = run.handle.unwrap();
    assert!(hub.queue.remove(&handle).await.unwrap());

    hub.coordinator.resume(run.job.id, Some(json!("late"))).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();
    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(hub.coordinator.get_result(job.id, "ask").await.unwrap(), Some(json!("late")));
}

#[tokio::test]
async fn cancel_paused_job_removes_message() {
    let hub = hub(vec![approval()]);
    let run = hub.coordinator.run("approval", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let cancelled = hub.coordinator.cancel(run.job.id).await.unwrap();
    assert_eq!(cancelled.job.status, JobStatus::Cancelled);
    assert!(hub.queue.get(&run.handle.unwrap()).await.unwrap().is_none());
    let err = hub.coordinator.resume(run.job.id, None).await.unwrap_err();
    assert!(matches!(err, HubError::NotPaused { status: JobStatus::Cancelled, .. }));
}

#[tokio::test]
async fn cancel_rejects_waiting_and_terminal_jobs() {
    let hub = hub(vec![two_steps("c")]);
    let run = hub.coordinator.run("c", RunOptions::default()).await.unwrap();
    let err = hub.coordinator.cancel(run.job.id).await.unwrap_err();
    assert!(matches!(err, HubError::NotCancellable { status: JobStatus::Waiting, .. }));

    worker(&hub).run_until_idle().await.unwrap();
    let err = hub.coordinator.cancel(run.job.id).await.unwrap_err();
    assert!(matches!(err, HubError::NotCancellable { status: JobStatus::Succeeded, .. }));
}

#[tokio::test]
async fn cancel_delayed_job() {
    let def = define(WorkflowDefinition::builder("sleepy").step(1, "a").step(2, "b"),
                     |_, ctx| {
                         ctx.delay(Duration::from_secs(60));
                         Ok(Value::Null)
                     });
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("sleepy", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();
    assert_eq!(hub.coordinator.get_job(run.job.id).await.unwrap().status, JobStatus::Delayed);

    hub.coordinator.cancel(run.job.id).await.unwrap();
    assert_eq!(hub.coordinator.get_job(run.job.id).await.unwrap().status, JobStatus::Cancelled);
    assert!(hub.queue.get(&run.handle.unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn scheduled_at_delays_first_delivery() {
    let hub = hub(vec![two_steps("later")]);
    let at = chrono::Utc::now() + chrono::Duration::seconds(3600);
    let run = hub.coordinator
                 .run("later",
                      RunOptions { scheduled_at: Some(at),
                                   ..RunOptions::default() })
                 .await
                 .unwrap();
    let msg = hub.queue.get(run.handle.as_ref().unwrap()).await.unwrap().unwrap();
    assert_eq!(msg.state, BrokerState::Delayed);
    assert_eq!(worker(&hub).run_until_idle().await.unwrap(), 0);
}

#[tokio::test]
async fn wait_for_job_returns_terminal_row() {
    let hub = hub(vec![two_steps("waited")]);
    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn(worker(&hub).run(rx));

    let run = hub.coordinator.run("waited", RunOptions::default()).await.unwrap();
    let job = hub.coordinator.wait_for_job(run.job.id, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    tx.send(true).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn wait_for_job_times_out_on_paused_job() {
    let hub = hub(vec![approval()]);
    let run = hub.coordinator.run("approval", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();
    let err = hub.coordinator
                 .wait_for_job(run.job.id, Some(Duration::from_millis(30)))
                 .await
                 .unwrap_err();
    assert!(matches!(err, HubError::Queue(QueueError::Timeout(_))));
}

#[tokio::test]
async fn listings_hide_internal_workflows() {
    let internal = define(WorkflowDefinition::builder("sys").step(1, "x").internal(), |_, _| Ok(Value::Null));
    let hub = hub(vec![two_steps("public"), internal]);
    let visible = hub.coordinator.list_workflows(false).await.unwrap();
    assert_eq!(visible.iter().map(|w| w.key.as_str()).collect::<Vec<_>>(), vec!["public"]);
    assert_eq!(visible[0].steps, vec!["first".to_string(), "second".to_string()]);
    assert_eq!(hub.coordinator.list_workflows(true).await.unwrap().len(), 2);

    hub.coordinator.run("public", RunOptions::default()).await.unwrap();
    hub.coordinator
       .run("public",
            RunOptions { draft: true,
                         ..RunOptions::default() })
       .await
       .unwrap();
    let drafts = hub.coordinator.list_jobs("public", Some(JobStatus::Draft)).await.unwrap();
    assert_eq!(drafts.len(), 1);
}
