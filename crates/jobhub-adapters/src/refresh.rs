//! Single-flight de renovación de credenciales.
//!
//! Cada llamador revisa la expiración local; si está vencida (o dentro del
//! margen) dispara `token-refresh` con un dedupe fijo por conexión, de modo
//! que los llamadores concurrentes colapsan en un único job. Todos esperan la
//! notificación `TokenRefreshed` (o el fallo terminal del job) acotados por un
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobhub_core::{HubError, HubEvent, JobStatus, NotificationBus, RunCoordinator, RunOptions};
use log::{debug, warn};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

use crate::credentials::{Credential, CredentialStore};
use crate::workflow::{TOKEN_REFRESH_STEP, TOKEN_REFRESH_WORKFLOW};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRefreshSettings {
    /// Tiempo máximo que un llamador espera la renovación.
    pub timeout: Duration,
    /// Una credencial que expira dentro de este margen se considera vencida.
    pub expiry_margin: Duration,
    pub max_retries: u32,
    /// Renovaciones simultáneas de conexiones distintas.
    pub concurrency: u32,
}

impl Default for TokenRefreshSettings {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30),
               expiry_margin: Duration::from_secs(60),
               max_retries: 2,
               concurrency: 4 }
    }
}

impl TokenRefreshSettings {
    pub(crate) fn margin(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.expiry_margin).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

pub fn dedupe_id(connection: &str) -> String {
    format!("{TOKEN_REFRESH_WORKFLOW}:{connection}")
}

pub struct TokenRefreshCoordinator {
    coordinator: Arc<RunCoordinator>,
    credentials: Arc<dyn CredentialStore>,
    bus: NotificationBus,
    settings: TokenRefreshSettings,
}

impl TokenRefreshCoordinator {
    pub fn new(coordinator: Arc<RunCoordinator>,
               credentials: Arc<dyn CredentialStore>,
               bus: NotificationBus,
               settings: TokenRefreshSettings)
               -> Self {
        Self { coordinator,
               credentials,
               bus,
               settings }
    }

    /// Credencial vigente de `connection`, renovándola si hace falta.
    pub async fn access_token(&self, connection: &str) -> Result<Credential, HubError> {
        if let Some(c) = self.fresh_credential(connection).await? {
            return Ok(c);
        }
        self.refresh(connection).await
    }

    /// Fuerza la renovación aunque la credencial local siga vigente.
    pub async fn refresh(&self, connection: &str) -> Result<Credential, HubError> {
        // Suscribirse antes de `run`: la notificación no puede perderse entre
        // el encolado y la espera.
        let mut events = self.bus.subscribe();
        let opts = RunOptions { payload: json!({ "connection": connection }),
                                trigger_id: Some(connection.to_string()),
                                dedupe_id: Some(dedupe_id(connection)),
                                ..RunOptions::default() };
        let run = self.coordinator.run(TOKEN_REFRESH_WORKFLOW, opts).await?;
        let job_id = run.job.id;
        debug!("token-refresh:await connection={connection} job={job_id}");

        match tokio::time::timeout(self.settings.timeout, self.await_outcome(&mut events, connection, job_id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("token-refresh:timeout connection={connection} job={job_id}");
                Err(HubError::TokenRefreshTimeout(connection.to_string()))
            }
        }
    }

    async fn fresh_credential(&self, connection: &str) -> Result<Option<Credential>, HubError> {
        let current = self.credentials.load(connection).await?;
        Ok(current.filter(|c| c.is_fresh(Utc::now(), self.settings.margin())))
    }

    async fn await_outcome(&self,
                           events: &mut Receiver<HubEvent>,
                           connection: &str,
                           job_id: Uuid)
                           -> Result<Credential, HubError> {
        loop {
            let event = match events.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("token-refresh:lagged skipped={skipped}");
                    continue;
                }
                Err(RecvError::Closed) => return Err(self.failed(connection, "notification bus closed")),
            };
            match event {
                HubEvent::TokenRefreshed { connection: c, credential, .. } if c == connection => {
                    return serde_json::from_value(credential).map_err(|e| self.failed(connection, &e.to_string()));
                }
                HubEvent::JobStatusChanged { job_id: id, status, .. } if id == job_id => match status {
                    // La notificación de la credencial salió antes de suscribirnos.
                    JobStatus::Succeeded => {
                        return self.credentials
                                   .load(connection)
                                   .await?
                                   .ok_or_else(|| self.failed(connection, "refresh succeeded without credential"));
                    }
                    JobStatus::Failed => {
                        let reason = self.failure_reason(job_id).await;
                        return Err(self.failed(connection, &reason));
                    }
                    JobStatus::Cancelled => return Err(self.failed(connection, "refresh job cancelled")),
                    _ => {}
                },
                _ => {}
            }
        }
    }

    async fn failure_reason(&self, job_id: Uuid) -> String {
        match self.coordinator.get_result(job_id, TOKEN_REFRESH_STEP).await {
            Ok(Some(result)) => result.get("error")
                                      .and_then(|e| e.as_str())
                                      .map(str::to_string)
                                      .unwrap_or_else(|| result.to_string()),
            _ => "refresh job failed".to_string(),
        }
    }

    fn failed(&self, connection: &str, reason: &str) -> HubError {
        HubError::TokenRefreshFailed { connection: connection.to_string(),
                                       reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_is_scoped_per_connection() {
        assert_eq!(dedupe_id("shop-eu"), "token-refresh:shop-eu");
        assert_ne!(dedupe_id("a"), dedupe_id("b"));
    }

    #[test]
    fn oversized_margin_falls_back() {
        let settings = TokenRefreshSettings { expiry_margin: Duration::MAX,
                                              ..TokenRefreshSettings::default() };
        assert_eq!(settings.margin(), chrono::Duration::seconds(60));
    }
}
