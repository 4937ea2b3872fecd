#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobhub_core::workflow::WorkflowBuilder;
use jobhub_core::{HubSettings, InMemoryQueue, JobHub, StepContext, StepError, Worker, WorkerSettings, Workflow,
                  WorkflowCatalog, WorkflowDefinition};
use serde_json::Value;

pub type StepFn = Arc<dyn Fn(&str, &mut StepContext) -> Result<Value, StepError> + Send + Sync>;

/// Workflow cuyos steps son una sola closure que despacha por nombre.
struct FnWorkflow(StepFn);

#[async_trait]
impl Workflow for FnWorkflow {
    async fn run_step(&mut self, step: &str, ctx: &mut StepContext) -> Result<Value, StepError> {
        (self.0)(step, ctx)
    }
}

pub fn define<F>(builder: WorkflowBuilder, body: F) -> WorkflowDefinition
    where F: Fn(&str, &mut StepContext) -> Result<Value, StepError> + Send + Sync + 'static
{
    let body: StepFn = Arc::new(body);
    builder.build(move |_| Box::new(FnWorkflow(body.clone())) as Box<dyn Workflow>)
           .expect("valid workflow")
}

/// Hub en memoria sin backoff, para que los reintentos se reclamen enseguida.
pub fn hub(defs: Vec<WorkflowDefinition>) -> JobHub {
    let mut builder = WorkflowCatalog::builder();
    for def in defs {
        builder = builder.register(def).expect("unique keys");
    }
    let queue = InMemoryQueue::new().with_backoff(Duration::ZERO, Duration::ZERO);
    JobHub::in_memory_with_queue(builder.build(), queue, &HubSettings::default())
}

pub fn worker(hub: &JobHub) -> Arc<Worker> {
    hub.worker(WorkerSettings { concurrency: 4,
                                poll_interval: Duration::from_millis(5),
                                lock_duration: Duration::from_secs(30) })
}

/// Contador compartido entre la closure del workflow y el test.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
