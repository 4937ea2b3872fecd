//! jobhub-persistence
//!
//! Backend Postgres (Diesel) de los dos contratos durables del core:
//! `PersistenceGateway` (workflows, jobs, steps, schedules, suscripciones) y
//! `DurableQueue` (broker con locks de visibilidad, cron y límites por cola).
//!
//! Módulos:
//! - `pg`: pool, gateway y broker sobre Postgres.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas a mano.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, postgres_hub, ConnectionProvider, PgGateway, PgPool, PgQueue,
             PoolProvider};
