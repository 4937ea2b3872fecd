//! CLI de operación sobre el backend configurado (normalmente Postgres).
//!
//! Códigos de salida: 0 ok, 2 uso, 3 JSON inválido, 4 rechazado por estado o
//! inexistente, 5 error de backend.

mod args;

use std::process::exit;

use args::{ArgsError, Command, USAGE};
use env_logger::Env;
use jobhub::{build_hub, builtin_workflows, AppConfig, AppError, Backend};
use jobhub_core::{HubError, JobHub, RepeatOptions, RunOptions};
use log::warn;
use serde_json::{json, Value};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let command = match args::parse(&argv) {
        Ok(c) => c,
        Err(e @ ArgsError::Json(_)) => {
            eprintln!("[jobhub] {e}");
            exit(3);
        }
        Err(e) => {
            eprintln!("[jobhub] {e}\n{USAGE}");
            exit(2);
        }
    };

    let hub = match connect() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("[jobhub] backend: {e}");
            exit(5);
        }
    };
    match execute(&hub, command).await {
        Ok(out) => {
            println!("{}", serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string()));
        }
        Err(e) => {
            eprintln!("[jobhub] {e}");
            exit(exit_code(&e));
        }
    }
}

fn connect() -> Result<JobHub, AppError> {
    let cfg = AppConfig::from_env()?;
    if cfg.backend == Backend::Memory {
        warn!("cli: backend en memoria, los jobs no sobreviven al proceso");
    }
    build_hub(&cfg, builtin_workflows()?)
}

fn exit_code(err: &HubError) -> i32 {
    match err {
        HubError::WorkflowNotFound(_)
        | HubError::JobNotFound(_)
        | HubError::ScheduleNotFound(_)
        | HubError::NotPaused { .. }
        | HubError::NotCancellable { .. }
        | HubError::NotDraft { .. }
        | HubError::InvalidCron(_) => 4,
        _ => 5,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, HubError> {
    serde_json::to_value(value).map_err(|e| HubError::Internal(format!("json: {e}")))
}

async fn execute(hub: &JobHub, command: Command) -> Result<Value, HubError> {
    let coordinator = &hub.coordinator;
    match command {
        Command::Run { workflow,
                       payload,
                       dedupe,
                       at,
                       max_retries,
                       draft, } => {
            let opts = RunOptions { payload,
                                    dedupe_id: dedupe,
                                    scheduled_at: at,
                                    max_retries,
                                    draft,
                                    ..RunOptions::default() };
            let run = coordinator.run(workflow, opts).await?;
            Ok(json!({ "job": to_json(&run.job)?, "handle": run.handle.map(|h| h.to_string()) }))
        }
        Command::Execute { job } => {
            let run = coordinator.execute_draft(job).await?;
            Ok(json!({ "job": to_json(&run.job)?, "handle": run.handle.map(|h| h.to_string()) }))
        }
        Command::Resume { job, data } => {
            let run = coordinator.resume(job, data).await?;
            Ok(json!({ "job_id": run.job.id, "resumed": true }))
        }
        Command::Cancel { job } => {
            let run = coordinator.cancel(job).await?;
            Ok(json!({ "job_id": run.job.id, "status": run.job.status }))
        }
        Command::Repeat { workflow,
                          cron,
                          old,
                          tz,
                          immediate,
                          active, } => {
            let mut opts = RepeatOptions::new(cron);
            opts.old_pattern = old;
            opts.timezone = tz;
            opts.immediate = immediate;
            opts.active = active;
            let out = coordinator.repeat(workflow, opts).await?;
            Ok(json!({ "schedule": to_json(&out.schedule)?, "handle": out.handle.map(|h| h.to_string()) }))
        }
        Command::Skip { schedule, count } => to_json(&coordinator.skip_next_runs(schedule, count).await?),
        Command::Results { job, step: Some(step) } => Ok(coordinator.get_result(job, &step).await?.unwrap_or(Value::Null)),
        Command::Results { job, step: None } => Ok(Value::Object(coordinator.get_results(job).await?.into_iter().collect())),
        Command::Wait { job, timeout } => to_json(&coordinator.wait_for_job(job, timeout).await?),
        Command::Jobs { workflow, status } => to_json(&coordinator.list_jobs(workflow, status).await?),
        Command::Workflows { all } => {
            let list = coordinator.list_workflows(all).await?;
            Ok(Value::Array(list.into_iter()
                                .map(|w| {
                                    json!({ "id": w.id, "key": w.key, "name": w.name,
                                            "internal": w.internal, "active": w.active, "steps": w.steps })
                                })
                                .collect()))
        }
    }
}
