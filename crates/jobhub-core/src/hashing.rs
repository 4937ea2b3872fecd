//! Ids derivados con blake3.

use blake3::Hasher;
use uuid::Uuid;

/// Id determinista de job para trabajo originado en el broker (ticks cron):
/// la misma entrega repetida produce el mismo id, de modo que el upsert del
/// job es idempotente.
pub fn derive_job_id(queue: &str, message_id: &str) -> Uuid {
    let mut h = Hasher::new();
    h.update(queue.as_bytes());
    h.update(b"\x1f");
    h.update(message_id.as_bytes());
    let digest = h.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    uuid::Builder::from_custom_bytes(bytes).into_uuid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_scoped_by_queue() {
        let a = derive_job_id("sync", "schedule:1:1700000000");
        let b = derive_job_id("sync", "schedule:1:1700000000");
        let c = derive_job_id("other", "schedule:1:1700000000");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn separator_keeps_fields_apart() {
        assert_ne!(derive_job_id("ab", "c"), derive_job_id("a", "bc"));
    }
}
