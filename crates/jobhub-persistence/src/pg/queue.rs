//! `DurableQueue` sobre Postgres.
//!
//! Cada mensaje es una fila de `queue_jobs`; el orden de entrega lo da `seq`.
//! `claim` corre en una transacción que:
//! 1. dispara las entradas de `queue_recurring` vencidas,
//! 2. toma candidatos con `FOR UPDATE SKIP LOCKED` (varios workers compiten
//!    sin bloquearse entre sí),
//! 3. aplica concurrencia y rate limit bajo un advisory lock por cola,
//! 4. marca la fila `active` con su lock de visibilidad.
//!
//! `wait_until_finished` sondea cada `WAIT_POLL_INTERVAL`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types;
use jobhub_core::constants::{DEFAULT_BACKOFF_BASE, MAX_BACKOFF, WAIT_POLL_INTERVAL};
use jobhub_core::errors::QueueError;
use jobhub_core::notify::{HubEvent, NotificationBus};
use jobhub_core::queue::{backoff_delay, next_tick, BrokerHandle, BrokerJob, BrokerState, Delivery, DurableQueue,
                         EnqueueOptions, QueueLimits, QueueMessage, RecurringSpec};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use super::rows::{encode_u32, QueueJobRow, RecurringRow};
use super::{run_blocking, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::{queue_jobs, queue_recurring, queue_state};

/// Candidatos examinados por reclamo.
const CLAIM_BATCH: i64 = 32;

const CANDIDATES_SQL: &str = "SELECT * FROM queue_jobs \
     WHERE queue = ANY($1) AND NOT (queue = ANY($2)) \
       AND (state = 'waiting' \
            OR (state = 'delayed' AND due_at IS NOT NULL AND due_at <= $3) \
            OR (state = 'active' AND (locked_until IS NULL OR locked_until <= $3))) \
     ORDER BY seq \
     LIMIT $4 \
     FOR UPDATE SKIP LOCKED";

fn shift(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn to_json(message: &QueueMessage) -> Result<Value, QueueError> {
    serde_json::to_value(message).map_err(|e| QueueError::Backend(format!("message: {e}")))
}

/// Inserta un mensaje respetando id explícito y dedupe. Devuelve el handle
/// existente cuando alguno de los dos ya está ocupado.
fn push(conn: &mut PgConnection,
        queue: &str,
        message: &Value,
        opts: &EnqueueOptions,
        now: DateTime<Utc>)
        -> Result<BrokerHandle, PersistenceError> {
    if let Some(id) = &opts.id {
        let exists: i64 = queue_jobs::table.find((queue, id.as_str())).count().get_result(conn)?;
        if exists > 0 {
            debug!("queue:enqueue duplicate id={queue}/{id}");
            return Ok(BrokerHandle::new(queue, id.clone()));
        }
    }
    if let Some(key) = &opts.dedupe {
        let existing: Option<String> =
            queue_jobs::table.filter(queue_jobs::queue.eq(queue))
                             .filter(queue_jobs::dedupe.eq(key))
                             .filter(queue_jobs::state.ne_all([BrokerState::Completed.as_str(),
                                                               BrokerState::Failed.as_str()]))
                             .select(queue_jobs::id)
                             .first(conn)
                             .optional()?;
        if let Some(id) = existing {
            debug!("queue:enqueue dedupe hit key={key} id={queue}/{id}");
            return Ok(BrokerHandle::new(queue, id));
        }
    }
    let id = opts.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let delayed = opts.delay.filter(|d| !d.is_zero());
    let state = if delayed.is_some() { BrokerState::Delayed } else { BrokerState::Waiting };
    diesel::insert_into(queue_jobs::table).values((queue_jobs::queue.eq(queue),
                                                   queue_jobs::id.eq(&id),
                                                   queue_jobs::message.eq(message),
                                                   queue_jobs::state.eq(state.as_str()),
                                                   queue_jobs::attempts.eq(encode_u32(opts.attempts.max(1))),
                                                   queue_jobs::dedupe.eq(opts.dedupe.as_deref()),
                                                   queue_jobs::due_at.eq(delayed.map(|d| shift(now, d))),
                                                   queue_jobs::created_at.eq(now)))
                                          .on_conflict_do_nothing()
                                          .execute(conn)?;
    Ok(BrokerHandle::new(queue, id))
}

/// Encola un mensaje por cada entrada recurrente vencida y avanza su `next_run`.
fn fire_recurring(conn: &mut PgConnection, queues: &[String], now: DateTime<Utc>) -> Result<(), PersistenceError> {
    let due: Vec<RecurringRow> = queue_recurring::table.filter(queue_recurring::queue.eq_any(queues))
                                                       .filter(queue_recurring::next_run.le(now))
                                                       .select(RecurringRow::as_select())
                                                       .for_update()
                                                       .skip_locked()
                                                       .load(conn)?;
    for rec in due {
        let Some(at) = rec.next_run else {
            continue;
        };
        let attempts = u32::try_from(rec.attempts).unwrap_or(1);
        push(conn,
             &rec.queue,
             &rec.message,
             &EnqueueOptions { id: Some(format!("{}:{}", rec.id, at.timestamp_millis())),
                               attempts,
                               ..EnqueueOptions::default() },
             now)?;
        let next = match next_tick(&rec.pattern, rec.timezone.as_deref(), now) {
            Ok(next) => next,
            Err(e) => {
                warn!("queue:recurring id={} disabled: {e}", rec.id);
                None
            }
        };
        diesel::update(queue_recurring::table.find((rec.queue.as_str(), rec.id.as_str())))
            .set(queue_recurring::next_run.eq(next))
            .execute(conn)?;
    }
    Ok(())
}

/// Fila de `queue_state` relevante para el reclamo.
struct QueueGate {
    paused: bool,
    concurrency: Option<i32>,
    rate: Option<(i32, i64)>,
}

fn load_gates(conn: &mut PgConnection, queues: &[String]) -> Result<HashMap<String, QueueGate>, PersistenceError> {
    let rows: Vec<(String, bool, Option<i32>, Option<i32>, Option<i64>)> =
        queue_state::table.filter(queue_state::queue.eq_any(queues))
                          .select((queue_state::queue,
                                   queue_state::paused,
                                   queue_state::concurrency,
                                   queue_state::rate_max,
                                   queue_state::rate_per_ms))
                          .load(conn)?;
    Ok(rows.into_iter()
           .map(|(queue, paused, concurrency, rate_max, rate_per)| {
               let rate = rate_max.zip(rate_per);
               (queue,
                QueueGate { paused,
                            concurrency,
                            rate })
           })
           .collect())
}

/// Verifica concurrencia y rate limit de `queue`. El advisory lock serializa
/// a los reclamadores de la misma cola hasta el commit.
fn gate_allows(conn: &mut PgConnection,
               queue: &str,
               gate: Option<&QueueGate>,
               now: DateTime<Utc>)
               -> Result<bool, PersistenceError> {
    let Some(gate) = gate.filter(|g| g.concurrency.is_some() || g.rate.is_some()) else {
        return Ok(true);
    };
    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))").bind::<sql_types::Text, _>(queue)
                                                                   .execute(conn)?;
    if let Some(limit) = gate.concurrency {
        let active: i64 = queue_jobs::table.filter(queue_jobs::queue.eq(queue))
                                           .filter(queue_jobs::state.eq(BrokerState::Active.as_str()))
                                           .filter(queue_jobs::locked_until.gt(now))
                                           .count()
                                           .get_result(conn)?;
        if active >= i64::from(limit.max(1)) {
            return Ok(false);
        }
    }
    if let Some((max, per_ms)) = gate.rate {
        let window_start = now - chrono::Duration::milliseconds(per_ms);
        let started: i64 = queue_jobs::table.filter(queue_jobs::queue.eq(queue))
                                            .filter(queue_jobs::last_claimed_at.gt(window_start))
                                            .count()
                                            .get_result(conn)?;
        if started >= i64::from(max) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Implementación Postgres de `DurableQueue`.
pub struct PgQueue<P: ConnectionProvider> {
    provider: Arc<P>,
    bus: Option<NotificationBus>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<P: ConnectionProvider> PgQueue<P> {
    pub fn new(provider: P) -> Self {
        Self::from_shared(Arc::new(provider))
    }

    /// Comparte el provider con un `PgGateway`.
    pub fn from_shared(provider: Arc<P>) -> Self {
        Self { provider,
               bus: None,
               backoff_base: DEFAULT_BACKOFF_BASE,
               backoff_cap: MAX_BACKOFF }
    }

    /// Publica `QueuePaused`/`QueueResumed` en `bus`.
    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Mensajes de una cola en orden de encolado.
    pub async fn jobs(&self, queue: &str) -> Result<Vec<BrokerJob>, QueueError> {
        let queue = queue.to_string();
        self.run("jobs", move |conn| {
                let rows = queue_jobs::table.filter(queue_jobs::queue.eq(&queue))
                                            .order(queue_jobs::seq.asc())
                                            .select(QueueJobRow::as_select())
                                            .load(conn)?;
                rows.into_iter().map(BrokerJob::try_from).collect()
            })
            .await
    }

    async fn run<F, T>(&self, op: &'static str, f: F) -> Result<T, QueueError>
        where F: FnMut(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static,
              T: Send + 'static
    {
        run_blocking(self.provider.clone(), op, f).await.map_err(QueueError::from)
    }

    fn publish(&self, event: HubEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

#[async_trait]
impl<P: ConnectionProvider> DurableQueue for PgQueue<P> {
    async fn enqueue(&self,
                     queue: &str,
                     message: QueueMessage,
                     opts: EnqueueOptions)
                     -> Result<BrokerHandle, QueueError> {
        let queue = queue.to_string();
        let message = to_json(&message)?;
        self.run("enqueue", move |conn| {
                conn.transaction(|tx| push(tx, &queue, &message, &opts, Utc::now()))
            })
            .await
    }

    async fn add_recurring(&self, queue: &str, spec: RecurringSpec) -> Result<BrokerHandle, QueueError> {
        let now = Utc::now();
        let next_run = next_tick(&spec.pattern, spec.timezone.as_deref(), now)?;
        let message = to_json(&spec.message)?;
        let handle = BrokerHandle::new(queue, spec.id.clone());
        let queue = queue.to_string();
        debug!("queue:recurring add id={handle} pattern='{}' next={next_run:?}", spec.pattern);
        self.run("add_recurring", move |conn| {
                conn.transaction(|tx| {
                        if spec.immediate {
                            let opts = EnqueueOptions { id: Some(format!("{}:immediate:{}",
                                                                         spec.id,
                                                                         now.timestamp_millis())),
                                                        attempts: spec.attempts,
                                                        ..EnqueueOptions::default() };
                            push(tx, &queue, &message, &opts, now)?;
                        }
                        diesel::insert_into(queue_recurring::table)
                            .values((queue_recurring::queue.eq(&queue),
                                     queue_recurring::id.eq(&spec.id),
                                     queue_recurring::pattern.eq(&spec.pattern),
                                     queue_recurring::timezone.eq(spec.timezone.as_deref()),
                                     queue_recurring::immediate.eq(spec.immediate),
                                     queue_recurring::attempts.eq(encode_u32(spec.attempts.max(1))),
                                     queue_recurring::message.eq(&message),
                                     queue_recurring::next_run.eq(next_run)))
                            .on_conflict((queue_recurring::queue, queue_recurring::id))
                            .do_update()
                            .set((queue_recurring::pattern.eq(&spec.pattern),
                                  queue_recurring::timezone.eq(spec.timezone.as_deref()),
                                  queue_recurring::immediate.eq(spec.immediate),
                                  queue_recurring::attempts.eq(encode_u32(spec.attempts.max(1))),
                                  queue_recurring::message.eq(&message),
                                  queue_recurring::next_run.eq(next_run)))
                            .execute(tx)?;
                        Ok(())
                    })
            })
            .await?;
        Ok(handle)
    }

    async fn remove_recurring(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let (queue, id) = (queue.to_string(), id.to_string());
        self.run("remove_recurring", move |conn| {
                let n = diesel::delete(queue_recurring::table.find((queue.as_str(), id.as_str()))).execute(conn)?;
                Ok(n > 0)
            })
            .await
    }

    async fn list_recurring(&self, queue: &str) -> Result<Vec<RecurringSpec>, QueueError> {
        let queue = queue.to_string();
        self.run("list_recurring", move |conn| {
                let rows = queue_recurring::table.filter(queue_recurring::queue.eq(&queue))
                                                 .order(queue_recurring::id.asc())
                                                 .select(RecurringRow::as_select())
                                                 .load(conn)?;
                rows.into_iter().map(RecurringSpec::try_from).collect()
            })
            .await
    }

    async fn get(&self, handle: &BrokerHandle) -> Result<Option<BrokerJob>, QueueError> {
        let handle = handle.clone();
        self.run("get", move |conn| {
                queue_jobs::table.find((handle.queue.as_str(), handle.id.as_str()))
                                 .select(QueueJobRow::as_select())
                                 .first(conn)
                                 .optional()?
                                 .map(BrokerJob::try_from)
                                 .transpose()
            })
            .await
    }

    async fn is_delayed(&self, handle: &BrokerHandle) -> Result<bool, QueueError> {
        let handle = handle.clone();
        self.run("is_delayed", move |conn| {
                let state: Option<String> = queue_jobs::table.find((handle.queue.as_str(), handle.id.as_str()))
                                                             .select(queue_jobs::state)
                                                             .first(conn)
                                                             .optional()?;
                Ok(state.as_deref() == Some(BrokerState::Delayed.as_str()))
            })
            .await
    }

    async fn change_delay(&self, handle: &BrokerHandle, delay: Duration) -> Result<(), QueueError> {
        let target = handle.clone();
        let found = self.run("change_delay", move |conn| {
                            let key = (target.queue.as_str(), target.id.as_str());
                            let state: Option<String> =
                                queue_jobs::table.find(key).select(queue_jobs::state).first(conn).optional()?;
                            let Some(state) = state else {
                                return Ok(false);
                            };
                            if state != BrokerState::Delayed.as_str() {
                                debug!("queue:change_delay ignored id={target} state={state}");
                                return Ok(true);
                            }
                            let (next_state, due) = if delay.is_zero() {
                                (BrokerState::Waiting, None)
                            } else {
                                (BrokerState::Delayed, Some(shift(Utc::now(), delay)))
                            };
                            diesel::update(queue_jobs::table.find(key).filter(queue_jobs::state.eq(&state)))
                                .set((queue_jobs::state.eq(next_state.as_str()), queue_jobs::due_at.eq(due)))
                                .execute(conn)?;
                            Ok(true)
                        })
                        .await?;
        if !found {
            return Err(QueueError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, handle: &BrokerHandle) -> Result<bool, QueueError> {
        let handle = handle.clone();
        self.run("remove", move |conn| {
                let n = diesel::delete(queue_jobs::table.find((handle.queue.as_str(), handle.id.as_str())))
                    .execute(conn)?;
                Ok(n > 0)
            })
            .await
    }

    async fn move_to_delayed(&self, handle: &BrokerHandle, until: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        let target = handle.clone();
        let n = self.run("move_to_delayed", move |conn| {
                        diesel::update(queue_jobs::table.find((target.queue.as_str(), target.id.as_str())))
                            .set((queue_jobs::state.eq(BrokerState::Delayed.as_str()),
                                  queue_jobs::due_at.eq(until),
                                  queue_jobs::locked_until.eq(None::<DateTime<Utc>>)))
                            .execute(conn)
                            .map_err(PersistenceError::from)
                    })
                    .await?;
        if n == 0 {
            return Err(QueueError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn update_data(&self, handle: &BrokerHandle, message: QueueMessage) -> Result<(), QueueError> {
        let target = handle.clone();
        let message = to_json(&message)?;
        let n = self.run("update_data", move |conn| {
                        diesel::update(queue_jobs::table.find((target.queue.as_str(), target.id.as_str())))
                            .set(queue_jobs::message.eq(&message))
                            .execute(conn)
                            .map_err(PersistenceError::from)
                    })
                    .await?;
        if n == 0 {
            return Err(QueueError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn wait_until_finished(&self,
                                 handle: &BrokerHandle,
                                 ttl: Option<Duration>)
                                 -> Result<Option<BrokerState>, QueueError> {
        let deadline = ttl.map(|t| tokio::time::Instant::now() + t);
        loop {
            match self.get(handle).await? {
                None => return Ok(None),
                Some(job) if job.state.is_finished() => return Ok(Some(job.state)),
                Some(_) => {}
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(QueueError::Timeout(handle.to_string()));
            }
            let nap = match deadline {
                Some(d) => WAIT_POLL_INTERVAL.min(d.saturating_duration_since(tokio::time::Instant::now())),
                None => WAIT_POLL_INTERVAL,
            };
            tokio::time::sleep(nap).await;
        }
    }

    async fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        let name = queue.to_string();
        let newly = self.run("pause_queue", move |conn| {
                            conn.transaction(|tx| {
                                    let was: Option<bool> = queue_state::table.find(&name)
                                                                              .select(queue_state::paused)
                                                                              .for_update()
                                                                              .first(tx)
                                                                              .optional()?;
                                    if was == Some(true) {
                                        return Ok(false);
                                    }
                                    diesel::insert_into(queue_state::table)
                                        .values((queue_state::queue.eq(&name), queue_state::paused.eq(true)))
                                        .on_conflict(queue_state::queue)
                                        .do_update()
                                        .set(queue_state::paused.eq(true))
                                        .execute(tx)?;
                                    Ok(true)
                                })
                        })
                        .await?;
        if newly {
            debug!("queue:pause queue={queue}");
            self.publish(HubEvent::QueuePaused { queue: queue.to_string() });
        }
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        let name = queue.to_string();
        let n = self.run("resume_queue", move |conn| {
                        diesel::update(queue_state::table.find(&name).filter(queue_state::paused.eq(true)))
                            .set(queue_state::paused.eq(false))
                            .execute(conn)
                            .map_err(PersistenceError::from)
                    })
                    .await?;
        if n > 0 {
            debug!("queue:resume queue={queue}");
            self.publish(HubEvent::QueueResumed { queue: queue.to_string() });
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let name = queue.to_string();
        self.run("is_paused", move |conn| {
                let paused: Option<bool> = queue_state::table.find(&name)
                                                             .select(queue_state::paused)
                                                             .first(conn)
                                                             .optional()?;
                Ok(paused.unwrap_or(false))
            })
            .await
    }

    async fn configure_queue(&self, queue: &str, limits: QueueLimits) -> Result<(), QueueError> {
        let name = queue.to_string();
        let concurrency = Some(encode_u32(limits.concurrency));
        let rate_max = limits.rate_limit.map(|r| encode_u32(r.max));
        let rate_per = limits.rate_limit
                             .map(|r| i64::try_from(r.per.as_millis()).unwrap_or(i64::MAX));
        self.run("configure_queue", move |conn| {
                diesel::insert_into(queue_state::table)
                    .values((queue_state::queue.eq(&name),
                             queue_state::concurrency.eq(concurrency),
                             queue_state::rate_max.eq(rate_max),
                             queue_state::rate_per_ms.eq(rate_per)))
                    .on_conflict(queue_state::queue)
                    .do_update()
                    .set((queue_state::concurrency.eq(concurrency),
                          queue_state::rate_max.eq(rate_max),
                          queue_state::rate_per_ms.eq(rate_per)))
                    .execute(conn)?;
                Ok(())
            })
            .await
    }

    async fn claim(&self, queues: &[String], lock: Duration) -> Result<Option<Delivery>, QueueError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let queues = queues.to_vec();
        self.run("claim", move |conn| {
                conn.transaction(|tx| {
                        let now = Utc::now();
                        fire_recurring(tx, &queues, now)?;
                        let gates = load_gates(tx, &queues)?;
                        let paused: Vec<String> =
                            gates.iter().filter(|(_, g)| g.paused).map(|(q, _)| q.clone()).collect();
                        let candidates: Vec<QueueJobRow> =
                            diesel::sql_query(CANDIDATES_SQL).bind::<sql_types::Array<sql_types::Text>, _>(&queues)
                                                             .bind::<sql_types::Array<sql_types::Text>, _>(&paused)
                                                             .bind::<sql_types::Timestamptz, _>(now)
                                                             .bind::<sql_types::BigInt, _>(CLAIM_BATCH)
                                                             .load(tx)?;
                        for row in candidates {
                            if !gate_allows(tx, &row.queue, gates.get(&row.queue), now)? {
                                continue;
                            }
                            let stalled = row.state == BrokerState::Active.as_str();
                            let handle = row.handle();
                            if stalled {
                                warn!("queue:stalled redeliver id={handle}");
                            }
                            diesel::update(queue_jobs::table.find((row.queue.as_str(), row.id.as_str())))
                                .set((queue_jobs::state.eq(BrokerState::Active.as_str()),
                                      queue_jobs::due_at.eq(None::<DateTime<Utc>>),
                                      queue_jobs::locked_until.eq(Some(shift(now, lock))),
                                      queue_jobs::last_claimed_at.eq(Some(now))))
                                .execute(tx)?;
                            let job = BrokerJob::try_from(row)?;
                            return Ok(Some(Delivery { handle,
                                                      message: job.message,
                                                      attempt: job.attempts_made + 1,
                                                      attempts: job.attempts,
                                                      stalled }));
                        }
                        Ok(None)
                    })
            })
            .await
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let handle = delivery.handle.clone();
        self.run("complete", move |conn| {
                diesel::update(queue_jobs::table.find((handle.queue.as_str(), handle.id.as_str()))
                                                .filter(queue_jobs::state.eq(BrokerState::Active.as_str())))
                    .set((queue_jobs::state.eq(BrokerState::Completed.as_str()),
                          queue_jobs::locked_until.eq(None::<DateTime<Utc>>)))
                    .execute(conn)?;
                Ok(())
            })
            .await
    }

    async fn fail(&self, delivery: &Delivery, reason: &str, retry: bool) -> Result<(), QueueError> {
        let handle = delivery.handle.clone();
        let reason = reason.to_string();
        let (base, cap) = (self.backoff_base, self.backoff_cap);
        self.run("fail", move |conn| {
                conn.transaction(|tx| {
                        let key = (handle.queue.as_str(), handle.id.as_str());
                        let counts: Option<(i32, i32)> =
                            queue_jobs::table.find(key)
                                             .select((queue_jobs::attempts, queue_jobs::attempts_made))
                                             .for_update()
                                             .first(tx)
                                             .optional()?;
                        let Some((attempts, made)) = counts else {
                            return Ok(());
                        };
                        let made = made.saturating_add(1);
                        let now = Utc::now();
                        let (state, due) = if retry && made < attempts {
                            let wait = backoff_delay(base, u32::try_from(made).unwrap_or(1), cap);
                            debug!("queue:retry id={handle} attempt={made} in={wait:?}");
                            (BrokerState::Delayed, Some(shift(now, wait)))
                        } else {
                            (BrokerState::Failed, None)
                        };
                        diesel::update(queue_jobs::table.find(key))
                            .set((queue_jobs::attempts_made.eq(made),
                                  queue_jobs::failed_reason.eq(Some(&reason)),
                                  queue_jobs::locked_until.eq(None::<DateTime<Utc>>),
                                  queue_jobs::state.eq(state.as_str()),
                                  queue_jobs::due_at.eq(due)))
                            .execute(tx)?;
                        Ok(())
                    })
            })
            .await
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let handle = delivery.handle.clone();
        self.run("release", move |conn| {
                diesel::update(queue_jobs::table.find((handle.queue.as_str(), handle.id.as_str()))
                                                .filter(queue_jobs::state.eq(BrokerState::Active.as_str())))
                    .set((queue_jobs::state.eq(BrokerState::Waiting.as_str()),
                          queue_jobs::locked_until.eq(None::<DateTime<Utc>>)))
                    .execute(conn)?;
                Ok(())
            })
            .await
    }
}
