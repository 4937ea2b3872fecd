//! jobhub
//!
//! Librería del proceso worker:
//! - `config` traduce variables de entorno a settings de cada componente.
//! - `app` arma el hub sobre el backend elegido (memoria o Postgres).
//! - `workflows` trae los workflows de operación (`echo`, `approval`, `wait`).
//!
//! El binario `jobhub-worker` y `jobhub-cli` se construyen sobre esto.

pub mod app;
pub mod config;
pub mod error;
pub mod workflows;

pub use app::{build_catalog, build_hub, token_coordinator};
pub use config::{AppConfig, Backend};
pub use error::AppError;
pub use workflows::builtin_workflows;
