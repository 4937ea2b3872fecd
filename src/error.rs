use jobhub_core::HubError;
use jobhub_persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuración inválida: {0}")]
    Config(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
