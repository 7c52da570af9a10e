use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::event::{Event, EventType};
use crate::services::{CallbackRef, Scheduler};

/// Error returned by an observer; logged by the dispatcher and never propagated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Observer {observer} failed: {reason}")]
pub struct ObserverError {
    pub observer: String,
    pub reason: String,
}

impl ObserverError {
    pub fn new(observer: &str, reason: impl Into<String>) -> Self {
        Self {
            observer: observer.to_string(),
            reason: reason.into(),
        }
    }
}

/// Subscriber on the event bus
#[async_trait]
pub trait EventObserver: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first
    fn priority(&self) -> i32 {
        0
    }

    fn interested_in(&self, _event_type: EventType) -> bool {
        true
    }

    async fn on_event(&self, event: &Event) -> Result<(), ObserverError>;
}

/// How an event is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Invoke observers before returning
    Sync,
    /// Enqueue and let a scheduler tick drain it
    Async,
}

/// Outcome of a synchronous delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Recent events kept for diagnostics
    pub ring_capacity: usize,
    /// Queued async events before the oldest is dropped
    pub max_pending: usize,
    /// Events delivered per drain tick
    pub drain_batch: usize,
    pub drain_delay_secs: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100,
            max_pending: 1_000,
            drain_batch: 50,
            drain_delay_secs: 1,
        }
    }
}

/// Publish/subscribe bus
///
/// Observers are registered once at startup and invoked in priority order.
/// A failing or panicking observer is logged and skipped.
pub struct EventDispatcher {
    observers: RwLock<Vec<Arc<dyn EventObserver>>>,
    pending: Mutex<VecDeque<Event>>,
    recent: Mutex<VecDeque<Event>>,
    drain_scheduled: AtomicBool,
    scheduler: Option<Arc<dyn Scheduler>>,
    config: EventConfig,
}

impl EventDispatcher {
    pub fn new(config: EventConfig) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            recent: Mutex::new(VecDeque::new()),
            drain_scheduled: AtomicBool::new(false),
            scheduler: None,
            config,
        }
    }

    /// Attach the scheduler used to drain async events
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn register(&self, observer: Arc<dyn EventObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|p| p.into_inner());
        debug!(observer = observer.name(), "Registered event observer");
        observers.push(observer);
        observers.sort_by_key(|o| std::cmp::Reverse(o.priority()));
    }

    pub fn observer_names(&self) -> Vec<String> {
        self.observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|o| o.name().to_string())
            .collect()
    }

    /// Publish an event
    pub async fn dispatch(&self, event: Event, mode: DispatchMode) -> DispatchReport {
        match mode {
            DispatchMode::Sync => self.deliver(event).await,
            DispatchMode::Async => {
                self.enqueue(event).await;
                DispatchReport::default()
            }
        }
    }

    /// Synchronous publish
    pub async fn emit(&self, event: Event) -> DispatchReport {
        self.dispatch(event, DispatchMode::Sync).await
    }

    async fn deliver(&self, event: Event) -> DispatchReport {
        self.remember(&event);

        // Snapshot so no lock is held across observer awaits
        let observers: Vec<Arc<dyn EventObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|o| o.interested_in(event.event_type))
            .cloned()
            .collect();

        let mut report = DispatchReport::default();
        for observer in observers {
            let outcome = AssertUnwindSafe(observer.on_event(&event)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(observer = observer.name(), event = %event.event_type, error = %e, "Observer failed");
                    report.failed += 1;
                }
                Err(_) => {
                    error!(observer = observer.name(), event = %event.event_type, "Observer panicked");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn enqueue(&self, event: Event) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.len() >= self.config.max_pending
                && let Some(dropped) = pending.pop_front()
            {
                warn!(event = %dropped.event_type, "Async event queue full; dropping oldest");
            }
            pending.push_back(event);
        }
        self.request_drain().await;
    }

    async fn request_drain(&self) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if self.drain_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let delay = Duration::from_secs(self.config.drain_delay_secs);
        if let Err(e) = scheduler.schedule_once(delay, CallbackRef::DrainEvents).await {
            warn!(error = %e, "Could not schedule event drain");
            self.drain_scheduled.store(false, Ordering::Release);
        }
    }

    /// Deliver up to one batch of queued async events; returns how many were delivered
    pub async fn drain_pending(&self) -> usize {
        self.drain_scheduled.store(false, Ordering::Release);

        let batch: Vec<Event> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            let take = pending.len().min(self.config.drain_batch);
            pending.drain(..take).collect()
        };

        let drained = batch.len();
        for event in batch {
            self.deliver(event).await;
        }

        if self.pending_len() > 0 {
            self.request_drain().await;
        }
        drained
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn remember(&self, event: &Event) {
        if self.config.ring_capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() >= self.config.ring_capacity {
            recent.pop_front();
        }
        recent.push_back(event.clone());
    }

    /// Recently delivered events, oldest first
    pub fn recent(&self) -> Vec<Event> {
        self.recent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn recent_of(&self, event_type: EventType) -> Vec<Event> {
        self.recent()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn clear_recent(&self) -> usize {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        let cleared = recent.len();
        recent.clear();
        cleared
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}
