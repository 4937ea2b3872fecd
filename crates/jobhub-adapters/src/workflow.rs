//! Workflow interno `token-refresh`: un único step que renueva la credencial
//! de una conexión, la guarda y publica `TokenRefreshed` en el bus.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jobhub_core::{HubError, HubEvent, NotificationBus, StepContext, StepError, Workflow, WorkflowDefinition};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::credentials::{CredentialStore, TokenRefresher};
use crate::refresh::TokenRefreshSettings;

pub const TOKEN_REFRESH_WORKFLOW: &str = "token-refresh";
pub const TOKEN_REFRESH_STEP: &str = "refresh";

#[derive(Debug, Deserialize)]
struct RefreshPayload {
    connection: String,
}

struct TokenRefreshWorkflow {
    credentials: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    bus: NotificationBus,
    margin: chrono::Duration,
}

#[async_trait]
impl Workflow for TokenRefreshWorkflow {
    async fn run_step(&mut self, step: &str, ctx: &mut StepContext) -> Result<Value, StepError> {
        if step != TOKEN_REFRESH_STEP {
            return Err(StepError::new(format!("unknown step '{step}'")));
        }
        let RefreshPayload { connection } = ctx.payload_as()?;
        let current = self.credentials
                          .load(&connection)
                          .await
                          .map_err(|e| StepError::new(format!("load credential: {e}")))?;

        // Otra renovación pudo terminar entre el chequeo del llamador y este job.
        let credential = match current {
            Some(c) if c.is_fresh(Utc::now(), self.margin) => {
                debug!("token-refresh:still-fresh connection={connection}");
                c
            }
            other => {
                let fresh = self.refresher.refresh(&connection, other.as_ref()).await?;
                self.credentials
                    .save(&connection, &fresh)
                    .await
                    .map_err(|e| StepError::new(format!("save credential: {e}")))?;
                info!("token-refresh:renewed connection={connection} job={}", ctx.job_id());
                fresh
            }
        };

        self.bus.publish(HubEvent::TokenRefreshed { connection: connection.clone(),
                                                    job_id: ctx.job_id(),
                                                    credential: serde_json::to_value(&credential)? });
        // El token no se persiste como resultado del step.
        Ok(json!({ "connection": connection, "expires_at": credential.expires_at }))
    }
}

/// Definición lista para registrar en el catálogo.
pub fn token_refresh_definition(credentials: Arc<dyn CredentialStore>,
                                refresher: Arc<dyn TokenRefresher>,
                                settings: &TokenRefreshSettings)
                                -> Result<WorkflowDefinition, HubError> {
    let margin = settings.margin();
    WorkflowDefinition::builder(TOKEN_REFRESH_WORKFLOW).name("Token refresh")
                                                       .step(1, TOKEN_REFRESH_STEP)
                                                       .max_retries(settings.max_retries)
                                                       .concurrency(settings.concurrency)
                                                       .internal()
                                                       .build(move |deps| {
                                                           Box::new(TokenRefreshWorkflow { credentials: credentials.clone(),
                                                                                           refresher: refresher.clone(),
                                                                                           bus: deps.bus.clone(),
                                                                                           margin })
                                                           as Box<dyn Workflow>
                                                       })
}
