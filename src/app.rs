//! Ensamblado del hub según el backend configurado.

use std::sync::Arc;

use jobhub_adapters::{CredentialStore, TokenRefreshCoordinator};
use jobhub_core::{JobHub, WorkflowCatalog, WorkflowDefinition};
use log::info;

use crate::config::{AppConfig, Backend};
use crate::error::AppError;

/// Catálogo con las definiciones dadas. Falla con `DuplicateWorkflowKey` si
/// dos comparten clave.
pub fn build_catalog(defs: Vec<WorkflowDefinition>) -> Result<WorkflowCatalog, AppError> {
    let mut builder = WorkflowCatalog::builder();
    for def in defs {
        builder = builder.register(def)?;
    }
    Ok(builder.build())
}

pub fn build_hub(cfg: &AppConfig, defs: Vec<WorkflowDefinition>) -> Result<JobHub, AppError> {
    let catalog = build_catalog(defs)?;
    let settings = cfg.hub_settings();
    let hub = match cfg.backend {
        Backend::Memory => JobHub::in_memory(catalog, &settings),
        Backend::Postgres => {
            let pool = jobhub_persistence::build_dev_pool_from_env()?;
            jobhub_persistence::postgres_hub(catalog, pool, &settings)
        }
    };
    info!("app:hub backend={:?} workflows={}", cfg.backend, hub.catalog.list(true).len());
    Ok(hub)
}

/// Coordinador de tokens sobre un hub cuyo catálogo ya incluye
/// `token_refresh_definition`.
pub fn token_coordinator(hub: &JobHub,
                         credentials: Arc<dyn CredentialStore>,
                         cfg: &AppConfig)
                         -> TokenRefreshCoordinator {
    TokenRefreshCoordinator::new(hub.coordinator.clone(),
                                 credentials,
                                 hub.bus.clone(),
                                 cfg.token_refresh.clone())
}
