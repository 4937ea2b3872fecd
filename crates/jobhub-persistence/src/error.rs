//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y de ahí a los
//! errores de adaptador del core (`StoreError`, `QueueError`).

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use jobhub_core::errors::{QueueError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("configuration: {0}")]
    Config(String),
    /// Una fila con texto o JSON que no corresponde al modelo.
    #[error("decode: {0}")]
    Decode(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl PersistenceError {
    /// Determina si un error es transitorio (recomendado reintentar con backoff).
    ///
    /// Además de los conflictos de serialización y los errores del pool, se
    /// reconocen por texto los mensajes típicos de deadlock y desconexión que
    /// el driver entrega como `Unknown`.
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::SerializationConflict => true,
            PersistenceError::TransientIo(_) => true,
            PersistenceError::Unknown(msg) => {
                let m = msg.to_lowercase();
                m.contains("deadlock detected")
                || m.contains("could not serialize access due to concurrent update")
                || m.contains("terminating connection due to administrator command")
                || m.contains("connection closed")
                || m.contains("connection refused")
                || m.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::ForeignKeyViolation => Self::ForeignKeyViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Decode(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Unknown(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            DieselError::RollbackErrorOnCommit { rollback_error,
                                                 commit_error, } => {
                Self::Unknown(format!("rollback={rollback_error}; commit={commit_error}"))
            }
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("json: {err}"))
    }
}

impl From<PersistenceError> for StoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::UniqueViolation(m) => StoreError::UniqueViolation(m),
            PersistenceError::NotFound => StoreError::NotFound("row".into()),
            PersistenceError::ForeignKeyViolation(m) => StoreError::NotFound(m),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<PersistenceError> for QueueError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound => QueueError::NotFound("row".into()),
            other => QueueError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_transient_and_text_matches() {
        assert!(PersistenceError::SerializationConflict.is_retryable());
        assert!(PersistenceError::TransientIo("pool".into()).is_retryable());
        assert!(PersistenceError::Unknown("ERROR: deadlock detected".into()).is_retryable());
        assert!(!PersistenceError::UniqueViolation("dup".into()).is_retryable());
        assert!(!PersistenceError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn maps_to_store_error_kinds() {
        assert!(matches!(StoreError::from(PersistenceError::UniqueViolation("x".into())),
                         StoreError::UniqueViolation(_)));
        assert!(matches!(StoreError::from(PersistenceError::NotFound), StoreError::NotFound(_)));
        assert!(matches!(StoreError::from(PersistenceError::TransientIo("x".into())), StoreError::Backend(_)));
        assert!(matches!(QueueError::from(PersistenceError::Config("x".into())), QueueError::Backend(_)));
    }
}
