//! Modelo persistido: filas que el Persistence Gateway guarda y devuelve.
//!
//! El engine es el único que escribe `Job`/`JobStep` durante la ejecución; el
//! coordinador crea los `Job`; el Trigger Manager administra `Schedule` y
//! `EventSubscription`.

mod job;
mod schedule;
mod step;
mod workflow_record;

pub use job::{Job, JobOptions, JobStatus, JobTrigger, NewJob};
pub use schedule::{EventSubscription, NewSchedule, Schedule};
pub use step::{JobStep, JobStepStatus};
pub use workflow_record::WorkflowRecord;

/// Error al interpretar un estado almacenado como texto.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}
