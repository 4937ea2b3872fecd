//! Configuración del proceso worker.
//! Carga variables de entorno (.env) una sola vez y las traduce a los structs
//! de settings de cada componente.

use std::env;
use std::time::Duration;

use jobhub_adapters::TokenRefreshSettings;
use jobhub_core::{HubSettings, WorkerSettings};
use log::warn;
use once_cell::sync::Lazy;

use crate::error::AppError;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub backend: Backend,
    pub worker: WorkerSettings,
    /// TTL de la caché de lectura delante del gateway.
    pub cache_ttl: Duration,
    pub token_refresh: TokenRefreshSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Lazy::force(&DOTENV_LOADED);
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Igual que `from_env` pero leyendo de una función arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
        where F: Fn(&str) -> Option<String>
    {
        let backend = match lookup("JOBHUB_BACKEND").as_deref().map(str::trim) {
            Some("memory") => Backend::Memory,
            Some("postgres") => Backend::Postgres,
            Some(other) => return Err(AppError::Config(format!("JOBHUB_BACKEND desconocido: '{other}'"))),
            None if lookup("DATABASE_URL").is_some() => Backend::Postgres,
            None => Backend::Memory,
        };
        let defaults = WorkerSettings::default();
        let worker = WorkerSettings { concurrency: number(&lookup, "JOBHUB_WORKER_CONCURRENCY", defaults.concurrency as u64)
                                                   .max(1) as usize,
                                      poll_interval: millis(&lookup, "JOBHUB_POLL_INTERVAL_MS", 250),
                                      lock_duration: millis(&lookup, "JOBHUB_LOCK_DURATION_MS", 30_000) };
        let token_defaults = TokenRefreshSettings::default();
        let token_refresh = TokenRefreshSettings { timeout: millis(&lookup, "JOBHUB_TOKEN_REFRESH_TIMEOUT_MS", 30_000),
                                                   expiry_margin: Duration::from_secs(number(&lookup,
                                                                                             "JOBHUB_TOKEN_EXPIRY_MARGIN_S",
                                                                                             60)),
                                                   ..token_defaults };
        Ok(Self { backend,
                  worker,
                  cache_ttl: millis(&lookup, "JOBHUB_CACHE_TTL_MS", 5_000),
                  token_refresh })
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings { worker: self.worker.clone(),
                      cache_ttl: self.cache_ttl }
    }
}

// Valores ilegibles caen al default con un warning.
fn number<F>(lookup: &F, name: &str, default: u64) -> u64
    where F: Fn(&str) -> Option<String>
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                                           warn!("config: {name}='{raw}' no es un número, usando {default}");
                                           default
                                       }),
    }
}

fn millis<F>(lookup: &F, name: &str, default: u64) -> Duration
    where F: Fn(&str) -> Option<String>
{
    Duration::from_millis(number(lookup, name, default))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_database_use_memory() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.worker.concurrency, 8);
        assert_eq!(cfg.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.cache_ttl, Duration::from_secs(5));
        assert_eq!(cfg.token_refresh.timeout, Duration::from_secs(30));
        assert_eq!(cfg.token_refresh.expiry_margin, Duration::from_secs(60));
    }

    #[test]
    fn database_url_selects_postgres_unless_overridden() {
        let cfg = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(cfg.backend, Backend::Postgres);
        let cfg = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x"), ("JOBHUB_BACKEND", "memory")])).unwrap();
        assert_eq!(cfg.backend, Backend::Memory);
        assert!(AppConfig::from_lookup(lookup(&[("JOBHUB_BACKEND", "redis")])).is_err());
    }

    #[test]
    fn numeric_overrides_and_fallbacks() {
        let cfg = AppConfig::from_lookup(lookup(&[("JOBHUB_WORKER_CONCURRENCY", "0"),
                                                  ("JOBHUB_LOCK_DURATION_MS", "1500"),
                                                  ("JOBHUB_CACHE_TTL_MS", "soon")])).unwrap();
        assert_eq!(cfg.worker.concurrency, 1);
        assert_eq!(cfg.worker.lock_duration, Duration::from_millis(1500));
        assert_eq!(cfg.hub_settings().cache_ttl, Duration::from_secs(5));
    }
}
