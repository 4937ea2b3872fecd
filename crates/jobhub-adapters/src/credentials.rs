//! Credenciales de conexiones externas y los contratos para guardarlas y
//! renovarlas.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jobhub_core::{StepError, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// `None` = no expira.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { access_token: access_token.into(),
               refresh_token: None,
               expires_at }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Vigente si no expira dentro de `margin` a partir de `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => at > now + margin,
        }
    }
}

/// Almacén de credenciales por conexión lógica.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, connection: &str) -> Result<Option<Credential>, StoreError>;
    async fn save(&self, connection: &str, credential: &Credential) -> Result<(), StoreError>;
}

/// Llamada al proveedor que emite la credencial nueva. Un `Err` se trata como
/// fallo del step y cuenta contra los reintentos del workflow.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, connection: &str, current: Option<&Credential>) -> Result<Credential, StepError>;
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    entries: DashMap<String, Credential>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, connection: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.entries.get(connection).map(|c| c.value().clone()))
    }

    async fn save(&self, connection: &str, credential: &Credential) -> Result<(), StoreError> {
        self.entries.insert(connection.to_string(), credential.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_honours_margin() {
        let now = Utc::now();
        let cred = Credential::new("t", Some(now + Duration::seconds(90)));
        assert!(cred.is_fresh(now, Duration::seconds(60)));
        assert!(!cred.is_fresh(now, Duration::seconds(120)));
        assert!(Credential::new("t", None).is_fresh(now, Duration::days(365)));
    }

    #[tokio::test]
    async fn memory_store_overwrites() {
        let store = InMemoryCredentialStore::new();
        assert!(store.load("shop").await.unwrap().is_none());
        store.save("shop", &Credential::new("a", None)).await.unwrap();
        store.save("shop", &Credential::new("b", None).with_refresh_token("r"))
             .await
             .unwrap();
        let got = store.load("shop").await.unwrap().unwrap();
        assert_eq!(got.access_token, "b");
        assert_eq!(got.refresh_token.as_deref(), Some("r"));
    }
}
