//! Worker: reclama entregas del broker y las pasa al engine.
//!
//! Hasta `concurrency` entregas en paralelo (tareas tokio acotadas por un
//! semáforo). Cada entrega se cierra según la `Disposition` del engine; los
//! errores de steps con presupuesto vuelven al broker como fallo reintentable.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Semaphore};

use super::{Disposition, ExecutionEngine};
use crate::constants::{DEFAULT_LOCK_DURATION, DEFAULT_POLL_INTERVAL};
use crate::errors::{HubError, QueueError};
use crate::queue::Delivery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lock_duration: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { concurrency: 8,
               poll_interval: DEFAULT_POLL_INTERVAL,
               lock_duration: DEFAULT_LOCK_DURATION }
    }
}

pub struct Worker {
    engine: Arc<ExecutionEngine>,
    queues: Vec<String>,
    settings: WorkerSettings,
}

impl Worker {
    /// Escucha las colas de todos los workflows del catálogo.
    pub fn new(engine: Arc<ExecutionEngine>, settings: WorkerSettings) -> Self {
        let queues = engine.catalog().keys().map(str::to_string).collect();
        Self { engine,
               queues,
               settings }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Procesa una entrega y la cierra en el broker.
    pub async fn handle(&self, delivery: Delivery) -> Result<(), QueueError> {
        let outcome = self.engine.process(&delivery).await;
        settle(&self.engine, &delivery, outcome).await
    }

    /// Procesa entregas de a una hasta que no quede ninguna lista. Devuelve el
    /// número de entregas procesadas.
    pub async fn run_until_idle(&self) -> Result<usize, QueueError> {
        let mut handled = 0;
        while let Some(delivery) = self.engine.queue().claim(&self.queues, self.settings.lock_duration).await? {
            self.handle(delivery).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Bucle principal. Termina cuando `shutdown` pasa a `true`, esperando a
    /// las entregas en curso.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let slots = self.settings.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(slots));
        info!("worker:start queues={} concurrency={slots}", self.queues.len());

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                p = permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.engine.queue().claim(&self.queues, self.settings.lock_duration).await {
                Ok(Some(delivery)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let handle = delivery.handle.clone();
                        if let Err(e) = worker.handle(delivery).await {
                            error!("worker:settle id={handle} error={e}");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        res = shutdown.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("worker:claim error={e}");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }

        info!("worker:draining");
        // Todas las entregas en curso devuelven su permiso al terminar.
        let _all = permits.acquire_many(slots as u32).await;
        info!("worker:stopped");
    }
}

async fn settle(engine: &ExecutionEngine,
                delivery: &Delivery,
                outcome: Result<Disposition, HubError>)
                -> Result<(), QueueError> {
    let queue = engine.queue();
    match outcome {
        Ok(Disposition::Completed) => queue.complete(delivery).await,
        Ok(Disposition::Deferred) => queue.release(delivery).await,
        Ok(Disposition::Failed(reason)) => queue.fail(delivery, &reason, false).await,
        Err(e @ HubError::StepExecution { .. }) => {
            debug!("worker:retry id={} error={e}", delivery.handle);
            queue.fail(delivery, &e.to_string(), true).await
        }
        Err(e) if e.is_fatal() => {
            error!("worker:fatal id={} error={e}", delivery.handle);
            queue.fail(delivery, &e.to_string(), false).await
        }
        Err(e) => {
            warn!("worker:bookkeeping id={} error={e}", delivery.handle);
            queue.fail(delivery, &e.to_string(), true).await
        }
    }
}
