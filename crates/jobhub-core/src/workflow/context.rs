//! Contexto de ejecución de un step.
//!
//! Expone al código del step la entrada del job, los resultados durables de
//! steps anteriores, los datos de resume y las primitivas de control del
//! engine (pausa, rerun, delay, cancelación). El engine lee las señales
//! después de ejecutar el step.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::StepError;
use crate::model::{Job, JobTrigger};

use super::StepDescriptor;

/// Banderas que el step puede fijar durante su ejecución.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSignals {
    /// Repetir este mismo step (distinto de un reintento por error).
    pub needs_rerun: bool,
    pub paused: bool,
    pub delay: Option<Duration>,
    /// Motivo de cancelación pedida por el step.
    pub cancelled: Option<String>,
}

impl StepSignals {
    pub fn delay_ms(&self) -> u64 {
        self.delay.map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

pub struct StepContext {
    job: Job,
    workflow_key: String,
    step: StepDescriptor,
    attempt: u32,
    is_retry: bool,
    results: HashMap<String, Value>,
    resume: Option<Value>,
    signals: StepSignals,
}

impl StepContext {
    pub fn new(job: Job,
               workflow_key: impl Into<String>,
               step: StepDescriptor,
               attempt: u32,
               is_retry: bool,
               results: HashMap<String, Value>,
               resume: Option<Value>)
               -> Self {
        Self { job,
               workflow_key: workflow_key.into(),
               step,
               attempt,
               is_retry,
               results,
               resume,
               signals: StepSignals::default() }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn workflow_key(&self) -> &str {
        &self.workflow_key
    }

    pub fn step_name(&self) -> &str {
        &self.step.name
    }

    pub fn trigger(&self) -> JobTrigger {
        self.job.trigger
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Intento actual de la entrega (1 = primera).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_retry(&self) -> bool {
        self.is_retry
    }

    /// Resultado durable de un step anterior del mismo job.
    pub fn result(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }

    pub fn result_as<T: DeserializeOwned>(&self, step: &str) -> Result<T, StepError> {
        let v = self.results
                    .get(step)
                    .ok_or_else(|| StepError::new(format!("no result recorded for step '{step}'")))?;
        Ok(serde_json::from_value(v.clone())?)
    }

    /// Datos entregados por `resume` para este step, si los hay.
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume.as_ref()
    }

    /// Pausa el job; al reanudarse este mismo step vuelve a ejecutarse y puede
    /// leer `resume_data`.
    pub fn pause(&mut self) {
        self.signals.paused = true;
    }

    /// Pide repetir este step en una nueva entrega, sin contar como reintento.
    pub fn rerun(&mut self) {
        self.signals.needs_rerun = true;
    }

    /// Rerun del mismo step diferido `after`.
    pub fn rerun_after(&mut self, after: Duration) {
        self.signals.needs_rerun = true;
        self.signals.delay = Some(after);
    }

    /// Difiere el siguiente step.
    pub fn delay(&mut self, by: Duration) {
        self.signals.delay = Some(by);
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.signals.cancelled = Some(reason.into());
    }

    pub fn signals(&self) -> &StepSignals {
        &self.signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobOptions, JobStatus, NewJob};
    use chrono::Utc;
    use serde_json::json;

    fn ctx() -> StepContext {
        let job = NewJob { id: Uuid::new_v4(),
                           workflow_id: 1,
                           parent_id: None,
                           status: JobStatus::Running,
                           trigger: JobTrigger::Manual,
                           trigger_id: None,
                           payload: json!({"n": 3}),
                           dedupe_id: None,
                           options: JobOptions::default(),
                           context: Value::Null }.into_job(Utc::now());
        let mut results = HashMap::new();
        results.insert("a".to_string(), json!(1));
        StepContext::new(job,
                         "wf",
                         StepDescriptor { name: "b".into(),
                                          index: 2 },
                         1,
                         false,
                         results,
                         None)
    }

    #[test]
    fn reads_payload_and_previous_results() {
        let c = ctx();
        #[derive(serde::Deserialize)]
        struct P {
            n: u32,
        }
        assert_eq!(c.payload_as::<P>().unwrap().n, 3);
        assert_eq!(c.result_as::<i64>("a").unwrap(), 1);
        assert!(c.result_as::<i64>("zzz").is_err());
    }

    #[test]
    fn rerun_after_sets_both_flags() {
        let mut c = ctx();
        c.rerun_after(Duration::from_millis(250));
        assert!(c.signals().needs_rerun);
        assert_eq!(c.signals().delay_ms(), 250);
    }
}
