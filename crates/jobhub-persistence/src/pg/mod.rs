//! Implementaciones Postgres (Diesel) de los contratos durables del core.
//!
//! - `PgGateway`: `PersistenceGateway` con paridad 1:1 respecto al backend en
//!   memoria (mismas reglas de dedupe, upsert de steps y consumo de skips).
//! - `PgQueue`: `DurableQueue` sobre tablas `queue_*`, con reclamo por
//!   `FOR UPDATE SKIP LOCKED` para que varios workers compitan sin bloquearse.
//!
//! Diesel es síncrono: cada operación corre en `spawn_blocking` y atraviesa
//! `with_retry` ante errores transitorios.

mod gateway;
mod queue;
mod rows;

pub use gateway::PgGateway;
pub use queue::PgQueue;

use std::sync::Arc;
use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager, PooledConnection};
use jobhub_core::{CachedGateway, HubSettings, JobHub, NotificationBus, WorkflowCatalog};
use log::{debug, warn};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
///
/// Al construirlo se corren las migraciones pendientes (una sola vez).
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Contrato: devolver una conexión válida o `PersistenceError::TransientIo`.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, PersistenceError>;
}

/// Implementación concreta de `ConnectionProvider` respaldada por un `PgPool`.
#[derive(Clone)]
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Retry simple con backoff muy pequeño (hasta 3 reintentos).
///
/// Política:
/// - Backoff: 15ms, 30ms, 45ms.
/// - Logs: se emite `warn!` por intento.
fn with_retry<F, T>(op: &str, mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("{op}: retryable error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

/// Ejecuta `f` con una conexión del provider en el pool de hilos bloqueantes
/// de tokio, reintentando errores transitorios.
pub(crate) async fn run_blocking<P, F, T>(provider: Arc<P>, op: &'static str, mut f: F) -> Result<T, PersistenceError>
    where P: ConnectionProvider,
          F: FnMut(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static,
          T: Send + 'static
{
    tokio::task::spawn_blocking(move || {
        with_retry(op, || {
            let mut conn = provider.connection()?;
            f(&mut conn)
        })
    }).await
      .map_err(|e| PersistenceError::Unknown(format!("{op}: blocking task: {e}")))?
}

/// Construye un pool r2d2 y corre las migraciones pendientes.
///
/// Comportamiento:
/// - Tamaños en cero se elevan a 1; si `min_size > max_size`, usa `min_size =
///   max_size`.
/// - Ejecuta migraciones inmediatamente tras el primer `get()`.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("build_pool: min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    debug!("build_pool: ready min={final_min} max={validated_max}");
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee configuración (DATABASE_URL,
/// tamaños) y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}

/// Hub respaldado por Postgres: gateway con cache read-through y broker que
/// publica sus pausas en el bus del hub. Ambos comparten el mismo pool.
pub fn postgres_hub(catalog: WorkflowCatalog, pool: PgPool, settings: &HubSettings) -> JobHub {
    let provider = Arc::new(PoolProvider { pool });
    let bus = NotificationBus::default();
    let store = CachedGateway::with_ttl(Arc::new(PgGateway::from_shared(provider.clone())), settings.cache_ttl);
    let queue = PgQueue::from_shared(provider).with_bus(bus.clone());
    JobHub::new(Arc::new(catalog), Arc::new(store), Arc::new(queue), bus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_transient_errors_then_succeeds() {
        let calls = Cell::new(0);
        let out = with_retry("test", || {
                      calls.set(calls.get() + 1);
                      if calls.get() < 3 {
                          Err(PersistenceError::SerializationConflict)
                      } else {
                          Ok(7)
                      }
                  });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let out: Result<(), _> = with_retry("test", || {
                                     calls.set(calls.get() + 1);
                                     Err(PersistenceError::UniqueViolation("dup".into()))
                                 });
        assert!(matches!(out, Err(PersistenceError::UniqueViolation(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_three_retries() {
        let calls = Cell::new(0);
        let out: Result<(), _> = with_retry("test", || {
                                     calls.set(calls.get() + 1);
                                     Err(PersistenceError::TransientIo("down".into()))
                                 });
        assert!(out.is_err());
        assert_eq!(calls.get(), 4);
    }
}
