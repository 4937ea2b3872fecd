//! Ensamblado de una instancia del hub: catálogo, gateway, broker, bus,
//! engine, coordinador y triggers compartiendo las mismas dependencias.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::WorkflowCatalog;
use crate::constants::DEFAULT_CACHE_TTL;
use crate::coordinator::RunCoordinator;
use crate::engine::{ExecutionEngine, Worker, WorkerSettings};
use crate::notify::NotificationBus;
use crate::persistence::{CachedGateway, InMemoryGateway, PersistenceGateway};
use crate::queue::{DurableQueue, InMemoryQueue};
use crate::triggers::TriggerManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSettings {
    pub worker: WorkerSettings,
    pub cache_ttl: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self { worker: WorkerSettings::default(),
               cache_ttl: DEFAULT_CACHE_TTL }
    }
}

pub struct JobHub {
    pub catalog: Arc<WorkflowCatalog>,
    pub store: Arc<dyn PersistenceGateway>,
    pub queue: Arc<dyn DurableQueue>,
    pub bus: NotificationBus,
    pub coordinator: Arc<RunCoordinator>,
    pub engine: Arc<ExecutionEngine>,
    pub triggers: Arc<TriggerManager>,
}

impl JobHub {
    pub fn new(catalog: Arc<WorkflowCatalog>,
               store: Arc<dyn PersistenceGateway>,
               queue: Arc<dyn DurableQueue>,
               bus: NotificationBus)
               -> Self {
        let coordinator = Arc::new(RunCoordinator::new(catalog.clone(), store.clone(), queue.clone(), bus.clone()));
        let engine = Arc::new(ExecutionEngine::new(catalog.clone(), store.clone(), queue.clone(), bus.clone()));
        let triggers = Arc::new(TriggerManager::new(coordinator.clone(), bus.clone()));
        Self { catalog,
               store,
               queue,
               bus,
               coordinator,
               engine,
               triggers }
    }

    /// Hub completamente en memoria (tests, demos). El broker publica sus
    /// pausas en el bus del hub.
    pub fn in_memory(catalog: WorkflowCatalog, settings: &HubSettings) -> Self {
        let bus = NotificationBus::default();
        let store = CachedGateway::with_ttl(Arc::new(InMemoryGateway::new()), settings.cache_ttl);
        let queue = InMemoryQueue::new().with_bus(bus.clone());
        Self::new(Arc::new(catalog), Arc::new(store), Arc::new(queue), bus)
    }

    /// Igual que `in_memory` pero con un broker ya construido (p. ej. sin
    /// backoff).
    pub fn in_memory_with_queue(catalog: WorkflowCatalog, queue: InMemoryQueue, settings: &HubSettings) -> Self {
        let bus = NotificationBus::default();
        let store = CachedGateway::with_ttl(Arc::new(InMemoryGateway::new()), settings.cache_ttl);
        Self::new(Arc::new(catalog), Arc::new(store), Arc::new(queue.with_bus(bus.clone())), bus)
    }

    pub fn worker(&self, settings: WorkerSettings) -> Arc<Worker> {
        Arc::new(Worker::new(self.engine.clone(), settings))
    }
}
