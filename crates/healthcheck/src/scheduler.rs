//! Per-entity periodic action scheduling.
//!
//! A single driver task owns the timer table (a [`DelayQueue`]) and the
//! entity registrations. The public handle only sends commands to it, and
//! callbacks report completion back through the same channel, so neither
//! timers nor running callbacks keep the scheduler alive. Dropping or
//! disposing the handle stops the driver and cancels every timer.

use common::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::{Future, poll_fn};
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

type EntityAction<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How an entity's timer behaves after it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// The entity is removed before its action runs; schedule again to rearm
    RunOnce,
    /// The timer is rearmed after each successful completion
    Repeating,
}

enum Command<T> {
    Schedule { entity: T, period: Duration },
    ChangePeriod { entity: T, period: Duration },
    Unschedule { entity: T },
    Start,
    Completed { entity: T, generation: u64, failed: bool },
    IsScheduled { entity: T, reply: oneshot::Sender<bool> },
}

/// Runs an async action for each registered entity on its own timer.
pub struct EntityActionScheduler<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    shutdown: CancellationToken,
}

impl<T> EntityActionScheduler<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a scheduler and spawn its driver on the current tokio runtime.
    ///
    /// An action returning an error or panicking unschedules its entity.
    pub fn new<F, Fut>(mode: SchedulerMode, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let action: EntityAction<T> = Arc::new(move |entity| action(entity).boxed());

        let driver = Driver {
            mode,
            action,
            started: false,
            entries: HashMap::new(),
            timers: DelayQueue::new(),
            next_generation: 0,
            receiver,
            completions: commands.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run());

        Self { commands, shutdown }
    }

    /// Register `entity`, replacing any existing registration.
    pub fn schedule(&self, entity: T, period: Duration) {
        self.send(Command::Schedule { entity, period });
    }

    /// Change the period of `entity`, registering it if unknown.
    pub fn change_period(&self, entity: T, period: Duration) {
        self.send(Command::ChangePeriod { entity, period });
    }

    pub fn unschedule(&self, entity: &T) {
        self.send(Command::Unschedule {
            entity: entity.clone(),
        });
    }

    /// Arm every queued registration; later registrations start immediately.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Whether `entity` is currently registered.
    pub async fn is_scheduled(&self, entity: &T) -> bool {
        let (reply, response) = oneshot::channel();
        self.send(Command::IsScheduled {
            entity: entity.clone(),
            reply,
        });
        response.await.unwrap_or(false)
    }

    /// Stop the driver and cancel all outstanding timers.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    fn send(&self, command: Command<T>) {
        if self.commands.send(command).is_err() {
            debug!("Scheduler already disposed, command dropped");
        }
    }
}

impl<T> Drop for EntityActionScheduler<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Entry {
    key: Option<delay_queue::Key>,
    period: Duration,
    generation: u64,
    running: bool,
}

struct Driver<T> {
    mode: SchedulerMode,
    action: EntityAction<T>,
    started: bool,
    entries: HashMap<T, Entry>,
    timers: DelayQueue<(T, u64)>,
    next_generation: u64,
    receiver: mpsc::UnboundedReceiver<Command<T>>,
    completions: mpsc::UnboundedSender<Command<T>>,
    shutdown: CancellationToken,
}

impl<T> Driver<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.receiver.recv() => self.handle(command),
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)), if !self.timers.is_empty() => {
                    let (entity, generation) = expired.into_inner();
                    self.fire(entity, generation);
                }
            }
        }

        debug!(entities = self.entries.len(), "Scheduler stopped");
    }

    fn handle(&mut self, command: Command<T>) {
        match command {
            Command::Schedule { entity, period } => self.schedule(entity, period),
            Command::ChangePeriod { entity, period } => match self.entries.get_mut(&entity) {
                Some(entry) => {
                    entry.period = period;
                    if let Some(key) = &entry.key {
                        self.timers.reset(key, period);
                    }
                }
                None => self.schedule(entity, period),
            },
            Command::Unschedule { entity } => {
                if let Some(entry) = self.entries.remove(&entity) {
                    if let Some(key) = entry.key {
                        self.timers.remove(&key);
                    }
                }
            }
            Command::Start => {
                if !self.started {
                    self.started = true;
                    for (entity, entry) in self.entries.iter_mut() {
                        if entry.key.is_none() && !entry.running {
                            entry.key = Some(
                                self.timers
                                    .insert((entity.clone(), entry.generation), entry.period),
                            );
                        }
                    }
                    info!(entities = self.entries.len(), "Scheduler started");
                }
            }
            Command::Completed {
                entity,
                generation,
                failed,
            } => self.completed(entity, generation, failed),
            Command::IsScheduled { entity, reply } => {
                let _ = reply.send(self.entries.contains_key(&entity));
            }
        }
    }

    fn schedule(&mut self, entity: T, period: Duration) {
        if let Some(previous) = self.entries.remove(&entity) {
            if let Some(key) = previous.key {
                self.timers.remove(&key);
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let key = self
            .started
            .then(|| self.timers.insert((entity.clone(), generation), period));

        self.entries.insert(
            entity,
            Entry {
                key,
                period,
                generation,
                running: false,
            },
        );
    }

    fn fire(&mut self, entity: T, generation: u64) {
        let Some(entry) = self.entries.get_mut(&entity) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.key = None;

        let report = match self.mode {
            SchedulerMode::RunOnce => {
                self.entries.remove(&entity);
                false
            }
            SchedulerMode::Repeating => {
                entry.running = true;
                true
            }
        };

        let action = self.action.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async { action(entity.clone()).await })
                .catch_unwind()
                .await;

            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    warn!(error = %e, "Scheduled action failed, unscheduling entity");
                    true
                }
                Err(_) => {
                    warn!("Scheduled action panicked, unscheduling entity");
                    true
                }
            };

            if report {
                let _ = completions.send(Command::Completed {
                    entity,
                    generation,
                    failed,
                });
            }
        });
    }

    fn completed(&mut self, entity: T, generation: u64, failed: bool) {
        let Some(entry) = self.entries.get_mut(&entity) else {
            // Unscheduled while running.
            return;
        };
        if entry.generation != generation {
            // Rescheduled while running; the new registration owns the timer.
            return;
        }

        entry.running = false;
        if failed {
            self.entries.remove(&entity);
            return;
        }

        if self.started {
            entry.key = Some(self.timers.insert((entity, generation), entry.period));
        }
    }
}
