mod support;

use std::time::Duration;

use jobhub_core::queue::{BrokerState, EnqueueOptions, QueueMessage};
use jobhub_core::{DurableQueue, HubEvent, JobStatus, JobStepStatus, JobTrigger, PersistenceGateway, RunOptions,
                  WorkflowDefinition};
use serde_json::{json, Value};
use support::{define, hub, worker, Counter};

#[tokio::test]
async fn rerun_scenario_produces_expected_results() {
    let b_runs = Counter::default();
    let seen = b_runs.clone();
    let def = define(WorkflowDefinition::builder("abc").step(1, "a").step(2, "b").step(3, "c"),
                     move |step, ctx| match step {
                         "a" => Ok(json!(1)),
                         "b" => {
                             if seen.bump() == 1 {
                                 ctx.rerun();
                                 return Ok(Value::Null);
                             }
                             Ok(json!(2))
                         }
                         "c" => {
                             let a: i64 = ctx.result_as("a")?;
                             let b: i64 = ctx.result_as("b")?;
                             Ok(json!(a + b))
                         }
                         other => Err(format!("unknown step {other}").into()),
                     });
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("abc", RunOptions::default()).await.unwrap();
    assert_eq!(run.job.status, JobStatus::Waiting);
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let steps: Vec<_> = hub.coordinator
                           .list_steps(job.id)
                           .await
                           .unwrap()
                           .into_iter()
                           .map(|s| (s.name, s.status, s.runs))
                           .collect();
    assert_eq!(steps,
               vec![("a".to_string(), JobStepStatus::Succeeded, 1),
                    ("b".to_string(), JobStepStatus::Succeeded, 2),
                    ("c".to_string(), JobStepStatus::Succeeded, 1)]);
    let results = hub.coordinator.get_results(job.id).await.unwrap();
    assert_eq!(results["a"], json!(1));
    assert_eq!(results["b"], json!(2));
    assert_eq!(results["c"], json!(3));
    assert_eq!(b_runs.get(), 2);
}

#[tokio::test]
async fn rerun_keeps_checkpoint_on_same_step() {
    let def = define(WorkflowDefinition::builder("later").step(10, "first").step(20, "again").step(30, "last"),
                     |step, ctx| {
                         if step == "again" {
                             ctx.rerun_after(Duration::from_secs(3600));
                         }
                         Ok(json!(step))
                     });
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("later", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::WaitingRerun);
    assert_eq!(job.checkpoint, Some(20));
    let handle = run.handle.unwrap();
    let msg = hub.queue.get(&handle).await.unwrap().unwrap();
    assert_eq!(msg.state, BrokerState::Delayed);
    assert_eq!(msg.message.step_index, Some(20));
    let step = hub.store.get_step(job.id, "again").await.unwrap().unwrap();
    assert_eq!(step.status, JobStepStatus::WaitingRerun);
}

#[tokio::test]
async fn step_errors_retry_until_budget_then_fail() {
    let def = define(WorkflowDefinition::builder("flaky").step(1, "boom").max_retries(2),
                     |_, _| Err("upstream down".into()));
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("flaky", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let step = hub.store.get_step(job.id, "boom").await.unwrap().unwrap();
    assert_eq!(step.status, JobStepStatus::Failed);
    assert_eq!(step.runs, 3);
    assert_eq!(step.retries, 2);
    assert_eq!(step.result.unwrap()["error"], "upstream down");
    let msg = hub.queue.get(&run.handle.unwrap()).await.unwrap().unwrap();
    assert_eq!(msg.state, BrokerState::Failed);
}

#[tokio::test]
async fn retry_recovers_and_counts_retries() {
    let def = define(WorkflowDefinition::builder("recover").step(1, "fetch").step(2, "store").max_retries(1),
                     |step, ctx| {
                         if step == "store" && ctx.attempt() == 1 {
                             return Err("timeout".into());
                         }
                         Ok(json!(ctx.attempt()))
                     });
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("recover", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let fetch = hub.store.get_step(job.id, "fetch").await.unwrap().unwrap();
    let store = hub.store.get_step(job.id, "store").await.unwrap().unwrap();
    assert_eq!((fetch.runs, fetch.retries), (1, 0));
    assert_eq!((store.runs, store.retries), (2, 1));
    assert_eq!(store.result, Some(json!(2)));
}

fn counted_four_steps(counters: [Counter; 4]) -> WorkflowDefinition {
    define(WorkflowDefinition::builder("four").step(1, "s1")
                                              .step(2, "s2")
                                              .step(3, "s3")
                                              .step(4, "s4")
                                              .max_retries(1),
           move |step, ctx| {
               let i: usize = step[1..].parse().map_err(|_| "bad step name")?;
               counters[i - 1].bump();
               if i == 4 && ctx.attempt() == 1 {
                   return Err("first delivery of s4 fails".into());
               }
               Ok(json!(i))
           })
}

#[tokio::test]
async fn redelivery_resumes_from_checkpoint() {
    let counters: [Counter; 4] = Default::default();
    let hub = hub(vec![counted_four_steps(counters.clone())]);
    let run = hub.coordinator.run("four", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let runs: Vec<u32> = counters.iter().map(Counter::get).collect();
    assert_eq!(runs, vec![1, 1, 1, 2]);

    // Una segunda entrega del mismo job no ejecuta nada ni crea otro job.
    hub.queue
       .enqueue("four",
                QueueMessage::for_job(job.id, "four", JobTrigger::Manual),
                EnqueueOptions { id: Some("dup".into()),
                                 ..Default::default() })
       .await
       .unwrap();
    worker(&hub).run_until_idle().await.unwrap();
    let runs: Vec<u32> = counters.iter().map(Counter::get).collect();
    assert_eq!(runs, vec![1, 1, 1, 2]);
    assert_eq!(hub.coordinator.list_jobs("four", None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn message_checkpoint_skips_lower_steps() {
    let counters: [Counter; 4] = Default::default();
    let hub = hub(vec![counted_four_steps(counters.clone())]);
    let run = hub.coordinator.run("four", RunOptions::default()).await.unwrap();
    let handle = run.handle.unwrap();
    let mut message = hub.queue.get(&handle).await.unwrap().unwrap().message;
    message.step_index = Some(3);
    hub.queue.update_data(&handle, message).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let runs: Vec<u32> = counters.iter().map(Counter::get).collect();
    assert_eq!(runs, vec![0, 0, 1, 2]);
    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(hub.store.get_step(job.id, "s1").await.unwrap().is_none());
}

#[tokio::test]
async fn stalled_delivery_is_redelivered_and_finishes() {
    let def = define(WorkflowDefinition::builder("stall").step(1, "only"), |_, _| Ok(json!("done")));
    let hub = hub(vec![def]);
    let mut events = hub.bus.subscribe();
    let run = hub.coordinator.run("stall", RunOptions::default()).await.unwrap();

    // Un worker que reclama y muere sin renovar el lock.
    let lost = hub.queue.claim(&["stall".to_string()], Duration::ZERO).await.unwrap();
    assert!(lost.is_some());
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let mut saw_stalled = false;
    while let Ok(ev) = events.try_recv() {
        if let HubEvent::JobStatusChanged { status: JobStatus::Stalled, job_id, .. } = ev {
            saw_stalled = job_id == job.id;
        }
    }
    assert!(saw_stalled);
}

#[tokio::test]
async fn delay_defers_next_step() {
    let def = define(WorkflowDefinition::builder("slow").step(1, "wait").step(2, "go"),
                     |step, ctx| {
                         if step == "wait" {
                             ctx.delay(Duration::from_millis(40));
                         }
                         Ok(json!(step))
                     });
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("slow", RunOptions::default()).await.unwrap();
    let worker = worker(&hub);
    worker.run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Delayed);
    assert_eq!(job.checkpoint, Some(2));
    assert!(hub.queue.is_delayed(run.handle.as_ref().unwrap()).await.unwrap());

    tokio::time::sleep(Duration::from_millis(60)).await;
    worker.run_until_idle().await.unwrap();
    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn cancel_signal_wins_over_delay() {
    let after = Counter::default();
    let seen = after.clone();
    let def = define(WorkflowDefinition::builder("stop").step(1, "decide").step(2, "never"),
                     move |step, ctx| {
                         if step == "decide" {
                             ctx.delay(Duration::from_secs(60));
                             ctx.cancel("nothing to do");
                         } else {
                             seen.bump();
                         }
                         Ok(Value::Null)
                     });
    let hub = hub(vec![def]);
    let run = hub.coordinator.run("stop", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let job = hub.coordinator.get_job(run.job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(after.get(), 0);
    let msg = hub.queue.get(&run.handle.unwrap()).await.unwrap().unwrap();
    assert_eq!(msg.state, BrokerState::Completed);
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let def = define(WorkflowDefinition::builder("events").step(1, "one"), |_, _| Ok(json!(1)));
    let hub = hub(vec![def]);
    let mut rx = hub.bus.subscribe();
    let run = hub.coordinator.run("events", RunOptions::default()).await.unwrap();
    worker(&hub).run_until_idle().await.unwrap();

    let mut names = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        names.push(ev.name());
    }
    assert_eq!(names.first(), Some(&"job.created"));
    assert!(names.contains(&"step.started"));
    assert!(names.contains(&"step.finished"));
    assert_eq!(hub.coordinator.get_job(run.job.id).await.unwrap().status, JobStatus::Succeeded);
}
