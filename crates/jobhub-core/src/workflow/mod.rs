//! Autoría de workflows: definición, builder y contexto de step.

mod context;
mod definition;

pub use context::{StepContext, StepSignals};
pub use definition::{RateLimit, StepDescriptor, TriggerSpec, Workflow, WorkflowBuilder, WorkflowDefinition, WorkflowDeps,
                     WorkflowFactory};
