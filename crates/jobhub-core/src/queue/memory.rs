//! Broker en memoria.
//!
//! Implementa el contrato completo de `DurableQueue` dentro del proceso:
//! mensajes diferidos y estacionados, reintentos con backoff, reentrega de
//! locks vencidos, límites de concurrencia y rate limit por cola, ticks cron
//! y pausa/reanudación con notificación en el bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, warn};
use tokio::sync::{Mutex, Notify};

use super::{backoff_delay, next_tick, BrokerHandle, BrokerJob, BrokerState, Delivery, DurableQueue,
            EnqueueOptions, QueueLimits, QueueMessage, RecurringSpec};
use crate::constants::{DEFAULT_BACKOFF_BASE, MAX_BACKOFF};
use crate::errors::QueueError;
use crate::notify::{HubEvent, NotificationBus};

struct Slot {
    seq: u64,
    job: BrokerJob,
}

struct Recurring {
    spec: RecurringSpec,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    seq: u64,
    jobs: HashMap<BrokerHandle, Slot>,
    recurring: IndexMap<BrokerHandle, Recurring>,
    paused: HashSet<String>,
    limits: HashMap<String, QueueLimits>,
    /// Inicios recientes por cola, para el rate limit.
    started: HashMap<String, VecDeque<DateTime<Utc>>>,
}

fn shift(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl State {
    fn push(&mut self, queue: &str, message: QueueMessage, opts: EnqueueOptions, now: DateTime<Utc>) -> BrokerHandle {
        if let Some(id) = &opts.id {
            let handle = BrokerHandle::new(queue, id.clone());
            if self.jobs.contains_key(&handle) {
                debug!("queue:enqueue duplicate id={handle}");
                return handle;
            }
        }
        if let Some(key) = &opts.dedupe {
            let existing = self.jobs.values().find(|s| {
                                                 s.job.handle.queue == queue
                                                 && s.job.dedupe.as_deref() == Some(key.as_str())
                                                 && !s.job.state.is_finished()
                                             });
            if let Some(slot) = existing {
                debug!("queue:enqueue dedupe hit key={key} id={}", slot.job.handle);
                return slot.job.handle.clone();
            }
        }
        self.seq += 1;
        let handle = BrokerHandle::new(queue, opts.id.clone().unwrap_or_else(|| self.seq.to_string()));
        let delayed = opts.delay.filter(|d| !d.is_zero());
        let job = BrokerJob { handle: handle.clone(),
                              message,
                              state: if delayed.is_some() { BrokerState::Delayed } else { BrokerState::Waiting },
                              attempts: opts.attempts.max(1),
                              attempts_made: 0,
                              dedupe: opts.dedupe,
                              due_at: delayed.map(|d| shift(now, d)),
                              locked_until: None,
                              failed_reason: None,
                              created_at: now };
        self.jobs.insert(handle.clone(), Slot { seq: self.seq, job });
        handle
    }

    fn fire_recurring(&mut self, queues: &[String], now: DateTime<Utc>) {
        let mut due = Vec::new();
        for (handle, rec) in self.recurring.iter_mut() {
            if !queues.contains(&handle.queue) {
                continue;
            }
            let Some(at) = rec.next_run.filter(|t| *t <= now) else {
                continue;
            };
            due.push((handle.queue.clone(),
                      format!("{}:{}", rec.spec.id, at.timestamp_millis()),
                      rec.spec.attempts,
                      rec.spec.message.clone()));
            rec.next_run = match next_tick(&rec.spec.pattern, rec.spec.timezone.as_deref(), now) {
                Ok(next) => next,
                Err(e) => {
                    warn!("queue:recurring id={} disabled: {e}", rec.spec.id);
                    None
                }
            };
        }
        for (queue, id, attempts, message) in due {
            self.push(&queue,
                      message,
                      EnqueueOptions { id: Some(id),
                                       attempts,
                                       ..EnqueueOptions::default() },
                      now);
        }
    }

    fn active_in(&self, queue: &str, now: DateTime<Utc>) -> usize {
        self.jobs
            .values()
            .filter(|s| {
                s.job.handle.queue == queue
                && s.job.state == BrokerState::Active
                && s.job.locked_until.is_some_and(|t| t > now)
            })
            .count()
    }

    fn rate_allows(&mut self, queue: &str, now: DateTime<Utc>) -> bool {
        let Some(rl) = self.limits.get(queue).and_then(|l| l.rate_limit) else {
            return true;
        };
        let window_start = now - chrono::Duration::from_std(rl.per).unwrap_or_else(|_| chrono::Duration::zero());
        let starts = self.started.entry(queue.to_string()).or_default();
        while starts.front().is_some_and(|t| *t <= window_start) {
            starts.pop_front();
        }
        (starts.len() as u32) < rl.max
    }

    fn slot_mut(&mut self, handle: &BrokerHandle) -> Result<&mut Slot, QueueError> {
        self.jobs.get_mut(handle).ok_or_else(|| QueueError::NotFound(handle.to_string()))
    }
}

pub struct InMemoryQueue {
    state: Mutex<State>,
    changed: Notify,
    bus: Option<NotificationBus>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()),
               changed: Notify::new(),
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
    pub async fn jobs(&self, queue: &str) -> Vec<BrokerJob> {
        let st = self.state.lock().await;
        let mut slots: Vec<&Slot> = st.jobs.values().filter(|s| s.job.handle.queue == queue).collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.job.clone()).collect()
    }

    fn publish(&self, event: HubEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self,
                     queue: &str,
                     message: QueueMessage,
                     opts: EnqueueOptions)
                     -> Result<BrokerHandle, QueueError> {
        let handle = self.state.lock().await.push(queue, message, opts, Utc::now());
        self.changed.notify_waiters();
        Ok(handle)
    }

    async fn add_recurring(&self, queue: &str, spec: RecurringSpec) -> Result<BrokerHandle, QueueError> {
        let now = Utc::now();
        let next_run = next_tick(&spec.pattern, spec.timezone.as_deref(), now)?;
        let handle = BrokerHandle::new(queue, spec.id.clone());
        let mut st = self.state.lock().await;
        if spec.immediate {
            let id = format!("{}:immediate:{}", spec.id, now.timestamp_millis());
            st.push(queue,
                    spec.message.clone(),
                    EnqueueOptions { id: Some(id),
                                     attempts: spec.attempts,
                                     ..EnqueueOptions::default() },
                    now);
        }
        debug!("queue:recurring add id={handle} pattern='{}' next={next_run:?}", spec.pattern);
        st.recurring.insert(handle.clone(), Recurring { spec, next_run });
        drop(st);
        self.changed.notify_waiters();
        Ok(handle)
    }

    async fn remove_recurring(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let mut st = self.state.lock().await;
        Ok(st.recurring.shift_remove(&BrokerHandle::new(queue, id)).is_some())
    }

    async fn list_recurring(&self, queue: &str) -> Result<Vec<RecurringSpec>, QueueError> {
        let st = self.state.lock().await;
        Ok(st.recurring
             .iter()
             .filter(|(h, _)| h.queue == queue)
             .map(|(_, r)| r.spec.clone())
             .collect())
    }

    async fn get(&self, handle: &BrokerHandle) -> Result<Option<BrokerJob>, QueueError> {
        Ok(self.state.lock().await.jobs.get(handle).map(|s| s.job.clone()))
    }

    async fn is_delayed(&self, handle: &BrokerHandle) -> Result<bool, QueueError> {
        let st = self.state.lock().await;
        Ok(st.jobs.get(handle).is_some_and(|s| s.job.state == BrokerState::Delayed))
    }

    async fn change_delay(&self, handle: &BrokerHandle, delay: Duration) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        let slot = st.slot_mut(handle)?;
        if slot.job.state != BrokerState::Delayed {
            debug!("queue:change_delay ignored id={handle} state={}", slot.job.state.as_str());
            return Ok(());
        }
        if delay.is_zero() {
            slot.job.state = BrokerState::Waiting;
            slot.job.due_at = None;
        } else {
            slot.job.due_at = Some(shift(Utc::now(), delay));
        }
        drop(st);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn remove(&self, handle: &BrokerHandle) -> Result<bool, QueueError> {
        let removed = self.state.lock().await.jobs.remove(handle).is_some();
        self.changed.notify_waiters();
        Ok(removed)
    }

    async fn move_to_delayed(&self, handle: &BrokerHandle, until: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        let slot = st.slot_mut(handle)?;
        slot.job.state = BrokerState::Delayed;
        slot.job.due_at = until;
        slot.job.locked_until = None;
        drop(st);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn update_data(&self, handle: &BrokerHandle, message: QueueMessage) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        st.slot_mut(handle)?.job.message = message;
        Ok(())
    }

    async fn wait_until_finished(&self,
                                 handle: &BrokerHandle,
                                 ttl: Option<Duration>)
                                 -> Result<Option<BrokerState>, QueueError> {
        let deadline = ttl.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock().await;
                match st.jobs.get(handle) {
                    None => return Ok(None),
                    Some(s) if s.job.state.is_finished() => return Ok(Some(s.job.state)),
                    Some(_) => {}
                }
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Err(QueueError::Timeout(handle.to_string()));
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        let newly = self.state.lock().await.paused.insert(queue.to_string());
        if newly {
            debug!("queue:pause queue={queue}");
            self.publish(HubEvent::QueuePaused { queue: queue.to_string() });
        }
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        let was_paused = self.state.lock().await.paused.remove(queue);
        if was_paused {
            debug!("queue:resume queue={queue}");
            self.publish(HubEvent::QueueResumed { queue: queue.to_string() });
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        Ok(self.state.lock().await.paused.contains(queue))
    }

    async fn configure_queue(&self, queue: &str, limits: QueueLimits) -> Result<(), QueueError> {
        self.state.lock().await.limits.insert(queue.to_string(), limits);
        Ok(())
    }

    async fn claim(&self, queues: &[String], lock: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let mut st = self.state.lock().await;
        st.fire_recurring(queues, now);

        let mut candidates: Vec<(u64, BrokerHandle)> =
            st.jobs
              .values()
              .filter(|s| queues.contains(&s.job.handle.queue) && !st.paused.contains(&s.job.handle.queue))
              .filter(|s| match s.job.state {
                  BrokerState::Waiting => true,
                  BrokerState::Delayed => s.job.due_at.is_some_and(|t| t <= now),
                  BrokerState::Active => s.job.locked_until.map_or(true, |t| t <= now),
                  BrokerState::Completed | BrokerState::Failed => false,
              })
              .map(|s| (s.seq, s.job.handle.clone()))
              .collect();
        candidates.sort_by_key(|(seq, _)| *seq);

        for (_, handle) in candidates {
            let queue = handle.queue.clone();
            let concurrency = st.limits.get(&queue).map_or(u32::MAX, |l| l.concurrency.max(1));
            if st.active_in(&queue, now) as u32 >= concurrency || !st.rate_allows(&queue, now) {
                continue;
            }
            if st.limits.get(&queue).is_some_and(|l| l.rate_limit.is_some()) {
                st.started.entry(queue.clone()).or_default().push_back(now);
            }
            let slot = st.slot_mut(&handle)?;
            let stalled = slot.job.state == BrokerState::Active;
            if stalled {
                warn!("queue:stalled redeliver id={handle}");
            }
            slot.job.state = BrokerState::Active;
            slot.job.due_at = None;
            slot.job.locked_until = Some(shift(now, lock));
            return Ok(Some(Delivery { handle,
                                      message: slot.job.message.clone(),
                                      attempt: slot.job.attempts_made + 1,
                                      attempts: slot.job.attempts,
                                      stalled }));
        }
        Ok(None)
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        if let Some(slot) = st.jobs.get_mut(&delivery.handle) {
            if slot.job.state == BrokerState::Active {
                slot.job.state = BrokerState::Completed;
                slot.job.locked_until = None;
            }
        }
        drop(st);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str, retry: bool) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut st = self.state.lock().await;
        let Some(slot) = st.jobs.get_mut(&delivery.handle) else {
            return Ok(());
        };
        slot.job.attempts_made += 1;
        slot.job.failed_reason = Some(reason.to_string());
        slot.job.locked_until = None;
        if retry && slot.job.attempts_made < slot.job.attempts {
            let wait = backoff_delay(self.backoff_base, slot.job.attempts_made, self.backoff_cap);
            debug!("queue:retry id={} attempt={} in={wait:?}", delivery.handle, slot.job.attempts_made);
            slot.job.state = BrokerState::Delayed;
            slot.job.due_at = Some(shift(now, wait));
        } else {
            slot.job.state = BrokerState::Failed;
        }
        drop(st);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut st = self.state.lock().await;
        if let Some(slot) = st.jobs.get_mut(&delivery.handle) {
            if slot.job.state == BrokerState::Active {
                slot.job.state = BrokerState::Waiting;
                slot.job.locked_until = None;
            }
        }
        drop(st);
        self.changed.notify_waiters();
        Ok(())
    }
}
