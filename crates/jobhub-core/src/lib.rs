//! jobhub-core: motor de workflows durable y reanudable por steps.
pub mod catalog;
pub mod constants;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod hashing;
pub mod hub;
pub mod model;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod triggers;
pub mod workflow;

pub use catalog::{CatalogBuilder, WorkflowCatalog, WorkflowRef};
pub use coordinator::{RepeatHandle, RepeatOptions, RunCoordinator, RunHandle, RunOptions, WorkflowSummary};
pub use engine::{Disposition, ExecutionEngine, Worker, WorkerSettings};
pub use errors::{HubError, QueueError, StepError, StoreError};
pub use hub::{HubSettings, JobHub};
pub use model::{EventSubscription, Job, JobOptions, JobStatus, JobStep, JobStepStatus, JobTrigger, Schedule,
                WorkflowRecord};
pub use notify::{HubEvent, NotificationBus};
pub use persistence::{CachedGateway, InMemoryGateway, PersistenceGateway};
pub use queue::{BrokerHandle, DurableQueue, InMemoryQueue};
pub use triggers::{qualified_event_name, TriggerManager};
pub use workflow::{StepContext, Workflow, WorkflowDefinition, WorkflowDeps};
