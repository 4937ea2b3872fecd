//! Trigger Manager: schedules cron, suscripciones a eventos y activación de
//! workflows.
//!
//! Los nombres de evento se resuelven a un nombre totalmente calificado
//! `provider.connection.event`; una declaración sin connection acepta
//! cualquier connection del provider, y una sin provider acepta el evento
//! desde cualquier origen.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::catalog::{WorkflowCatalog, WorkflowRef};
use crate::coordinator::{RepeatOptions, RunCoordinator, RunHandle, RunOptions};
use crate::errors::{HubError, StoreError};
use crate::model::{JobTrigger, Schedule};
use crate::notify::{HubEvent, NotificationBus};
use crate::workflow::TriggerSpec;

/// Nombre calificado de un evento.
pub fn qualified_event_name(provider: Option<&str>, connection: Option<&str>, name: &str) -> String {
    match (provider, connection) {
        (Some(p), Some(c)) => format!("{p}.{c}.{name}"),
        (Some(p), None) => format!("{p}.*.{name}"),
        (None, _) => name.to_string(),
    }
}

pub struct TriggerManager {
    coordinator: Arc<RunCoordinator>,
    bus: NotificationBus,
    /// Nombre calificado -> claves de workflow suscritas.
    routes: DashMap<String, Vec<String>>,
}

impl TriggerManager {
    pub fn new(coordinator: Arc<RunCoordinator>, bus: NotificationBus) -> Self {
        let manager = Self { coordinator,
                             bus,
                             routes: DashMap::new() };
        manager.index_events();
        manager
    }

    fn catalog(&self) -> &Arc<WorkflowCatalog> {
        self.coordinator.catalog()
    }

    fn index_events(&self) {
        for def in self.catalog().list(true) {
            for trigger in &def.triggers {
                if let TriggerSpec::Event { name, provider, connection } = trigger {
                    let fq = qualified_event_name(provider.as_deref(), connection.as_deref(), name);
                    debug!("triggers:route event={fq} workflow={}", def.key);
                    self.routes.entry(fq).or_default().push(def.key.clone());
                }
            }
        }
    }

    /// Materializa los workflows, pausa las colas de los inactivos y registra
    /// los schedules cron declarados. Un schedule que un operador desactivó
    /// sigue inactivo.
    pub async fn bootstrap(&self) -> Result<Vec<Schedule>, HubError> {
        let mut registered = Vec::new();
        for def in self.catalog().list(true) {
            let rec = self.coordinator.ensure_workflow(&def).await?;
            let queue = self.coordinator.queue();
            if !rec.active {
                queue.pause_queue(&def.key).await?;
            }
            let existing = self.coordinator.store().list_schedules(rec.id).await?;
            for (pattern, timezone) in def.cron_triggers() {
                let known = existing.iter().find(|s| s.cron_expression == pattern);
                if let Some(s) = known.filter(|s| !s.active) {
                    info!("triggers:schedule {} '{}' left inactive", def.key, s.cron_expression);
                    continue;
                }
                let mut opts = RepeatOptions::new(pattern);
                opts.timezone = timezone.map(str::to_string);
                let out = self.coordinator.repeat(WorkflowRef::Definition(def.clone()), opts).await?;
                registered.push(out.schedule);
            }
            // Schedules creados con `repeat` en tiempo de ejecución.
            for s in existing.iter().filter(|s| s.active) {
                if def.cron_triggers().any(|(p, _)| p == s.cron_expression) {
                    continue;
                }
                self.coordinator.sync_schedule(&def, &rec, s, false).await?;
                registered.push(s.clone());
            }
        }
        info!("triggers:bootstrap schedules={} event_routes={}", registered.len(), self.routes.len());
        Ok(registered)
    }

    fn routed(&self, name: &str, provider: Option<&str>, connection: Option<&str>) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let mut candidates = vec![qualified_event_name(None, None, name)];
        if let Some(p) = provider {
            candidates.push(qualified_event_name(Some(p), None, name));
            if let Some(c) = connection {
                candidates.push(qualified_event_name(Some(p), Some(c), name));
            }
        }
        for fq in candidates {
            if let Some(entry) = self.routes.get(&fq) {
                for key in entry.value() {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
        }
        keys
    }

    /// Entrega un evento externo a los workflows suscritos. Una suscripción
    /// inactiva produce un job DRAFT.
    pub async fn dispatch(&self,
                          name: &str,
                          provider: Option<&str>,
                          connection: Option<&str>,
                          payload: Value)
                          -> Result<Vec<RunHandle>, HubError> {
        let keys = self.routed(name, provider, connection);
        if keys.is_empty() {
            debug!("triggers:dispatch event={name} has no subscribers");
        }
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let def = self.coordinator.resolve(&WorkflowRef::Key(key))?;
            let rec = self.coordinator.ensure_workflow(&def).await?;
            let sub = self.coordinator
                          .store()
                          .get_or_create_subscription(rec.id, name, provider, connection)
                          .await?;
            let opts = RunOptions { payload: payload.clone(),
                                    trigger: JobTrigger::Event,
                                    trigger_id: Some(sub.id.to_string()),
                                    draft: !sub.active,
                                    ..RunOptions::default() };
            let run = self.coordinator.run(WorkflowRef::Definition(def.clone()), opts).await?;
            info!("triggers:dispatch event={name} workflow={} job_id={} draft={}",
                  def.key, run.job.id, !sub.active);
            out.push(run);
        }
        Ok(out)
    }

    /// Activa o desactiva una suscripción de eventos.
    pub async fn set_subscription_active(&self, id: i64, active: bool) -> Result<(), HubError> {
        self.coordinator.store().set_subscription_active(id, active).await?;
        Ok(())
    }

    /// Activa o desactiva un workflow: su cola y sus entradas recurrentes
    /// siguen al flag.
    pub async fn set_active(&self, workflow: impl Into<WorkflowRef>, active: bool) -> Result<(), HubError> {
        let def = self.coordinator.resolve(&workflow.into())?;
        let rec = self.coordinator.ensure_workflow(&def).await?;
        let rec = self.coordinator.store().set_workflow_active(rec.id, active).await?;
        let queue = self.coordinator.queue();
        if active {
            queue.resume_queue(&def.key).await?;
        } else {
            queue.pause_queue(&def.key).await?;
        }
        for s in self.coordinator.store().list_schedules(rec.id).await? {
            self.coordinator.sync_schedule(&def, &rec, &s, false).await?;
        }
        info!("triggers:workflow {} active={active}", def.key);
        Ok(())
    }

    /// Activa o desactiva un schedule y refleja el cambio en el broker.
    pub async fn set_schedule_active(&self, schedule_id: i64, active: bool) -> Result<Schedule, HubError> {
        let store = self.coordinator.store();
        let schedule = match store.set_schedule_active(schedule_id, active).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => return Err(HubError::ScheduleNotFound(schedule_id)),
            Err(e) => return Err(e.into()),
        };
        let rec = store.get_workflow(schedule.workflow_id)
                       .await?
                       .ok_or_else(|| HubError::WorkflowNotFound(format!("#{}", schedule.workflow_id)))?;
        let def = self.coordinator.resolve(&WorkflowRef::Key(rec.key.clone()))?;
        self.coordinator.sync_schedule(&def, &rec, &schedule, false).await?;
        Ok(schedule)
    }

    /// Re-pausa la cola si el workflow está inactivo. Devuelve `true` si tuvo
    /// que hacerlo.
    pub async fn on_queue_resumed(&self, queue: &str) -> Result<bool, HubError> {
        let Some(rec) = self.coordinator.store().get_workflow_by_key(queue).await? else {
            return Ok(false);
        };
        if rec.active {
            return Ok(false);
        }
        warn!("triggers:queue {queue} resumed while workflow inactive, pausing again");
        self.coordinator.queue().pause_queue(queue).await?;
        Ok(true)
    }

    /// Tarea que vigila las notificaciones `QueueResumed`.
    pub fn spawn_resume_guard(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(HubEvent::QueueResumed { queue }) => {
                        if let Err(e) = self.on_queue_resumed(&queue).await {
                            warn!("triggers:resume guard queue={queue} error={e}");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("triggers:resume guard lagged {n} events"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_include_provider_and_connection() {
        assert_eq!(qualified_event_name(Some("shop"), Some("eu"), "order"), "shop.eu.order");
        assert_eq!(qualified_event_name(Some("shop"), None, "order"), "shop.*.order");
        assert_eq!(qualified_event_name(None, Some("eu"), "order"), "order");
    }
}
