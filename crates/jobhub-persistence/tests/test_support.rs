#![allow(dead_code)]

use jobhub_persistence::config::DbConfig;
use jobhub_persistence::pg::{build_pool, PgPool, PoolProvider};
use once_cell::sync::Lazy;
use uuid::Uuid;

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    let cfg = DbConfig::from_env().ok()?;
    match build_pool(&cfg.url, 1, 4) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

pub fn provider() -> Option<PoolProvider> {
    TEST_POOL.as_ref().map(|pool| PoolProvider { pool: pool.clone() })
}

/// Nombre único por test: las tablas se comparten entre corridas.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
