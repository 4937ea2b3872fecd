//! jobhub-adapters: colaboradores que se apoyan en el motor.
//!
//! Este crate provee:
//! - `Credential` y los contratos `CredentialStore` / `TokenRefresher`.
//! - El workflow interno `token-refresh`, un único step que renueva la
//!   credencial de una conexión y anuncia el resultado en el bus.
//! - `TokenRefreshCoordinator`: single-flight sobre el dedupe del coordinador;
//!   todos los llamadores concurrentes esperan la misma renovación.

pub mod credentials;
pub mod refresh;
pub mod workflow;

pub use credentials::{Credential, CredentialStore, InMemoryCredentialStore, TokenRefresher};
pub use refresh::{TokenRefreshCoordinator, TokenRefreshSettings};
pub use workflow::{token_refresh_definition, TOKEN_REFRESH_STEP, TOKEN_REFRESH_WORKFLOW};
