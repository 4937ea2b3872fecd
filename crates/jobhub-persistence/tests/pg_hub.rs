mod test_support;

use std::time::Duration;

use async_trait::async_trait;
use jobhub_core::{HubSettings, JobStatus, RunOptions, StepContext, StepError, WorkerSettings, Workflow,
                  WorkflowCatalog, WorkflowDefinition};
use jobhub_persistence::postgres_hub;
use serde_json::{json, Value};
use test_support::{unique, TEST_POOL};

/// `ask` se pausa hasta recibir datos de resume; `sum` combina resultados previos.
struct Approval;

#[async_trait]
impl Workflow for Approval {
    async fn run_step(&mut self, step: &str, ctx: &mut StepContext) -> Result<Value, StepError> {
        match step {
            "ask" => match ctx.resume_data() {
                Some(data) => Ok(data.clone()),
                None => {
                    ctx.pause();
                    Ok(Value::Null)
                }
            },
            "sum" => {
                let base: i64 = ctx.payload_as()?;
                let extra: i64 = ctx.result_as("ask")?;
                Ok(json!(base + extra))
            }
            other => Err(format!("unknown step {other}").into()),
        }
    }
}

fn settings() -> WorkerSettings {
    WorkerSettings { concurrency: 2,
                     poll_interval: Duration::from_millis(10),
                     lock_duration: Duration::from_secs(30) }
}

#[tokio::test]
async fn pause_resume_roundtrip_over_postgres() {
    let Some(pool) = TEST_POOL.clone() else {
        eprintln!("skip pause_resume_roundtrip_over_postgres (no DATABASE_URL)");
        return;
    };
    let key = unique("approval");
    let def = WorkflowDefinition::builder(&key).step(1, "ask")
                                               .step(2, "sum")
                                               .build(|_| Box::new(Approval) as Box<dyn Workflow>)
                                               .unwrap();
    let catalog = WorkflowCatalog::builder().register(def).unwrap().build();
    let hub = postgres_hub(catalog, pool, &HubSettings::default());
    let worker = hub.worker(settings());

    let run = hub.coordinator.run(key.as_str(), RunOptions::with_payload(json!(40))).await.unwrap();
    worker.run_until_idle().await.unwrap();
    assert_eq!(hub.coordinator.get_job(run.job.id).await.unwrap().status, JobStatus::Paused);

    hub.coordinator.resume(run.job.id, Some(json!(2))).await.unwrap();
    worker.run_until_idle().await.unwrap();
    let job = hub.coordinator.wait_for_job(run.job.id, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(hub.coordinator.get_result(job.id, "sum").await.unwrap(), Some(json!(42)));
    let steps = hub.coordinator.list_steps(job.id).await.unwrap();
    assert_eq!(steps[0].runs, 2);
}
