//! Constantes del core.
//!
//! Valores por defecto de los settings; las aplicaciones los sobreescriben
//! desde su configuración.

use std::time::Duration;

/// Capacidad del canal broadcast de notificaciones.
pub const NOTIFICATION_CAPACITY: usize = 1024;

/// Tiempo máximo que un worker retiene un mensaje antes de considerarlo stalled.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// TTL de la cache read-through del gateway.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Backoff base de re-entrega tras un fallo; se duplica por intento.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1_000);

/// Tope del backoff exponencial.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Intervalo de sondeo del worker cuando la cola está vacía.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Intervalo de sondeo de `wait_until_finished` en brokers sin push.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

