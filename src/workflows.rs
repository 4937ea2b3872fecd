//! Workflows de operación que trae el worker. Los workflows de negocio se
//! registran desde fuera junto a estos.

use std::time::Duration;

use async_trait::async_trait;
use jobhub_core::{HubError, StepContext, StepError, Workflow, WorkflowDefinition};
use serde::Deserialize;
use serde_json::{json, Value};

pub const ECHO: &str = "echo";
pub const APPROVAL: &str = "approval";
pub const WAIT: &str = "wait";

/// Devuelve el payload tal cual. Útil para smoke tests del despliegue.
struct Echo;

#[async_trait]
impl Workflow for Echo {
    async fn run_step(&mut self, _step: &str, ctx: &mut StepContext) -> Result<Value, StepError> {
        Ok(ctx.payload().clone())
    }
}

/// `request` se pausa hasta que un operador reanuda el job con su decisión;
/// `record` la deja como resultado final.
struct Approval;

#[async_trait]
impl Workflow for Approval {
    async fn run_step(&mut self, step: &str, ctx: &mut StepContext) -> Result<Value, StepError> {
        match step {
            "request" => match ctx.resume_data() {
                Some(decision) => Ok(decision.clone()),
                None => {
                    ctx.pause();
                    Ok(json!({ "requested": ctx.payload().clone() }))
                }
            },
            "record" => {
                let decision = ctx.result("request").cloned().unwrap_or(Value::Null);
                let approved = decision.get("approved").and_then(Value::as_bool).unwrap_or(false);
                Ok(json!({ "approved": approved, "decision": decision }))
            }
            other => Err(StepError::new(format!("unknown step '{other}'"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WaitPayload {
    seconds: u64,
}

/// Difiere el segundo step `seconds` segundos sin ocupar un worker.
struct Wait;

#[async_trait]
impl Workflow for Wait {
    async fn run_step(&mut self, step: &str, ctx: &mut StepContext) -> Result<Value, StepError> {
        let WaitPayload { seconds } = ctx.payload_as()?;
        match step {
            "sleep" => {
                ctx.delay(Duration::from_secs(seconds));
                Ok(json!({ "until_s": seconds }))
            }
            "done" => Ok(json!({ "waited_s": seconds })),
            other => Err(StepError::new(format!("unknown step '{other}'"))),
        }
    }
}

pub fn builtin_workflows() -> Result<Vec<WorkflowDefinition>, HubError> {
    Ok(vec![WorkflowDefinition::builder(ECHO).name("Echo")
                                             .step(1, "echo")
                                             .concurrency(4)
                                             .build(|_| Box::new(Echo) as Box<dyn Workflow>)?,
            WorkflowDefinition::builder(APPROVAL).name("Manual approval")
                                                 .step(1, "request")
                                                 .step(2, "record")
                                                 .concurrency(4)
                                                 .build(|_| Box::new(Approval) as Box<dyn Workflow>)?,
            WorkflowDefinition::builder(WAIT).name("Wait")
                                             .step(1, "sleep")
                                             .step(2, "done")
                                             .concurrency(4)
                                             .build(|_| Box::new(Wait) as Box<dyn Workflow>)?])
}
