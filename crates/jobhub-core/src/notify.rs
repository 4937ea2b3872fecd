//! Bus de notificaciones tipado, con alcance de una instancia del hub.
//!
//! Fire-and-forget: publicar sin suscriptores no es un error. Lo consumen el
//! Trigger Manager (guardia de reanudación de colas), el Token Refresh
//! Coordinator (despertar a los que esperan) y cualquier colaborador de
//! observabilidad.

use log::trace;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::NOTIFICATION_CAPACITY;
use crate::model::{JobStatus, JobStepStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    JobCreated { job_id: Uuid, workflow_key: String, status: JobStatus },
    JobStatusChanged { job_id: Uuid, workflow_key: String, status: JobStatus },
    StepStarted { job_id: Uuid, workflow_key: String, step: String, attempt: u32 },
    StepFinished { job_id: Uuid, workflow_key: String, step: String, status: JobStepStatus },
    QueuePaused { queue: String },
    QueueResumed { queue: String },
    /// Refresh de credencial completado; `credential` es el valor nuevo serializado.
    TokenRefreshed { connection: String, job_id: Uuid, credential: Value },
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::JobCreated { .. } => "job.created",
            HubEvent::JobStatusChanged { .. } => "job.status_changed",
            HubEvent::StepStarted { .. } => "step.started",
            HubEvent::StepFinished { .. } => "step.finished",
            HubEvent::QueuePaused { .. } => "queue.paused",
            HubEvent::QueueResumed { .. } => "queue.resumed",
            HubEvent::TokenRefreshed { .. } => "token.refreshed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<HubEvent>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(NOTIFICATION_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: HubEvent) {
        trace!("bus:publish event={}", event.name());
        // Sin receptores activos el envío falla; es esperado.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = NotificationBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(HubEvent::QueueResumed { queue: "wf".into() });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, HubEvent::QueueResumed { queue: "wf".into() });
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = NotificationBus::new(1);
        bus.publish(HubEvent::QueuePaused { queue: "wf".into() });
        assert_eq!(bus.receiver_count(), 0);
    }
}
