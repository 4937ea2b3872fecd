//! Definición inmutable de un workflow y su builder.
//!
//! Un workflow es una lista ordenada de steps con nombre (ordenados por el
//! índice declarado, no por orden de declaración), configuración de
//! concurrencia/rate limit/reintentos y sus triggers. La instancia que ejecuta
//! los steps se crea con una factory explícita, una por entrega de la cola.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{HubError, StepError};
use crate::notify::NotificationBus;
use crate::persistence::PersistenceGateway;
use crate::queue::DurableQueue;

use super::StepContext;

/// Contrato de autoría: el engine llama `run_step` con el nombre del step en
/// curso. Devolver `Ok` fija el resultado durable del step; devolver `Err` es
/// la señal de fallo (sujeta a reintentos). Pausa, rerun, delay y cancelación
/// se piden a través del `StepContext`.
#[async_trait]
pub trait Workflow: Send {
    async fn run_step(&mut self, step: &str, ctx: &mut StepContext) -> Result<Value, StepError>;
}

/// Dependencias explícitas que recibe la factory de instancias.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub store: Arc<dyn PersistenceGateway>,
    pub queue: Arc<dyn DurableQueue>,
    pub bus: NotificationBus,
}

pub type WorkflowFactory = Arc<dyn Fn(&WorkflowDeps) -> Box<dyn Workflow> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    Cron { pattern: String, timezone: Option<String> },
    Event { name: String, provider: Option<String>, connection: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

pub struct WorkflowDefinition {
    pub key: String,
    pub name: String,
    /// Steps ordenados por `index` ascendente.
    pub steps: Vec<StepDescriptor>,
    pub concurrency: u32,
    pub rate_limit: Option<RateLimit>,
    pub max_retries: u32,
    pub triggers: Vec<TriggerSpec>,
    /// Workflows de sistema, ocultos en los listados por defecto.
    pub internal: bool,
    factory: WorkflowFactory,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
         .field("key", &self.key)
         .field("steps", &self.steps)
         .field("concurrency", &self.concurrency)
         .field("rate_limit", &self.rate_limit)
         .field("max_retries", &self.max_retries)
         .field("triggers", &self.triggers)
         .field("internal", &self.internal)
         .finish()
    }
}

impl WorkflowDefinition {
    pub fn builder(key: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(key)
    }

    /// Crea una instancia nueva (sin estado compartido entre jobs).
    pub fn instantiate(&self, deps: &WorkflowDeps) -> Box<dyn Workflow> {
        (self.factory)(deps)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Posición del primer step cuyo índice es >= `checkpoint`.
    pub fn resume_position(&self, checkpoint: Option<u32>) -> Option<usize> {
        match checkpoint {
            None => if self.steps.is_empty() { None } else { Some(0) },
            Some(cp) => self.steps.iter().position(|s| s.index >= cp),
        }
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn cron_triggers(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.triggers.iter().filter_map(|t| match t {
                                TriggerSpec::Cron { pattern, timezone } => Some((pattern.as_str(), timezone.as_deref())),
                                _ => None,
                            })
    }
}

/// Builder sin reflexión: los steps y triggers se declaran explícitamente.
pub struct WorkflowBuilder {
    key: String,
    name: Option<String>,
    steps: Vec<StepDescriptor>,
    concurrency: u32,
    rate_limit: Option<RateLimit>,
    max_retries: u32,
    triggers: Vec<TriggerSpec>,
    internal: bool,
}

impl WorkflowBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(),
               name: None,
               steps: Vec::new(),
               concurrency: 1,
               rate_limit: None,
               max_retries: 0,
               triggers: Vec::new(),
               internal: false }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declara un step. Se permiten huecos entre índices.
    pub fn step(mut self, index: u32, name: impl Into<String>) -> Self {
        self.steps.push(StepDescriptor { name: name.into(),
                                         index });
        self
    }

    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn rate_limit(mut self, max: u32, per: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max, per });
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn cron(mut self, pattern: impl Into<String>) -> Self {
        self.triggers.push(TriggerSpec::Cron { pattern: pattern.into(),
                                               timezone: None });
        self
    }

    pub fn cron_tz(mut self, pattern: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.triggers.push(TriggerSpec::Cron { pattern: pattern.into(),
                                               timezone: Some(timezone.into()) });
        self
    }

    pub fn on_event(mut self, name: impl Into<String>) -> Self {
        self.triggers.push(TriggerSpec::Event { name: name.into(),
                                                provider: None,
                                                connection: None });
        self
    }

    pub fn on_provider_event(mut self,
                             provider: impl Into<String>,
                             connection: Option<String>,
                             name: impl Into<String>)
                             -> Self {
        self.triggers.push(TriggerSpec::Event { name: name.into(),
                                                provider: Some(provider.into()),
                                                connection });
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Valida y congela la definición.
    pub fn build<F>(mut self, factory: F) -> Result<WorkflowDefinition, HubError>
        where F: Fn(&WorkflowDeps) -> Box<dyn Workflow> + Send + Sync + 'static
    {
        if self.steps.is_empty() {
            return Err(HubError::Internal(format!("workflow '{}' declares no steps", self.key)));
        }
        let mut names = HashSet::new();
        let mut indexes = HashSet::new();
        for s in &self.steps {
            if !names.insert(s.name.clone()) {
                return Err(HubError::Internal(format!("workflow '{}' declares step '{}' twice", self.key, s.name)));
            }
            if !indexes.insert(s.index) {
                return Err(HubError::Internal(format!("workflow '{}' reuses step index {}", self.key, s.index)));
            }
        }
        for trigger in &self.triggers {
            if let TriggerSpec::Cron { pattern, .. } = trigger {
                crate::queue::parse_cron(pattern).map_err(|_| HubError::InvalidCron(pattern.clone()))?;
            }
        }
        self.steps.sort_by_key(|s| s.index);
        Ok(WorkflowDefinition { name: self.name.unwrap_or_else(|| self.key.clone()),
                                key: self.key,
                                steps: self.steps,
                                concurrency: self.concurrency,
                                rate_limit: self.rate_limit,
                                max_retries: self.max_retries,
                                triggers: self.triggers,
                                internal: self.internal,
                                factory: Arc::new(factory) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Workflow for Noop {
        async fn run_step(&mut self, _step: &str, _ctx: &mut StepContext) -> Result<Value, StepError> {
            Ok(Value::Null)
        }
    }

    fn noop(_: &WorkflowDeps) -> Box<dyn Workflow> {
        Box::new(Noop)
    }

    #[test]
    fn steps_are_ordered_by_index_not_declaration() {
        let def = WorkflowDefinition::builder("wf").step(30, "c")
                                                    .step(10, "a")
                                                    .step(20, "b")
                                                    .build(noop)
                                                    .unwrap();
        let names: Vec<&str> = def.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn resume_position_skips_lower_indexes() {
        let def = WorkflowDefinition::builder("wf").step(1, "a")
                                                    .step(5, "b")
                                                    .step(9, "c")
                                                    .build(noop)
                                                    .unwrap();
        assert_eq!(def.resume_position(None), Some(0));
        assert_eq!(def.resume_position(Some(5)), Some(1));
        assert_eq!(def.resume_position(Some(6)), Some(2));
        assert_eq!(def.resume_position(Some(10)), None);
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let res = WorkflowDefinition::builder("wf").step(1, "a").step(2, "a").build(noop);
        assert!(res.is_err());
    }

    #[test]
    fn invalid_cron_trigger_is_rejected() {
        let res = WorkflowDefinition::builder("wf").step(1, "a").cron("not a cron").build(noop);
        assert!(matches!(res, Err(HubError::InvalidCron(_))));
    }
}
