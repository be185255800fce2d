//! Explicit lifecycle listeners.
//!
//! The orchestrator emits typed [`LifecycleEvent`]s to the listeners registered
//! on it. Listeners run inline on the worker thread that produced the event,
//! so implementations must be cheap and must not block; anything slow belongs
//! behind an [`EventBus`] via [`BusListener`].

use std::sync::{Arc, Mutex};

use forgeflow_core::TenantId;

use crate::bus::EventBus;
use crate::lifecycle::{LifecycleEvent, LifecycleEventKind};
use crate::tenant::TenantScoped;

/// Receives lifecycle events.
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<L> LifecycleListener for Arc<L>
where
    L: LifecycleListener + ?Sized,
{
    fn on_event(&self, event: &LifecycleEvent) {
        (**self).on_event(event)
    }
}

/// Ordered set of listeners; emitting fans out to each in registration order.
#[derive(Clone, Default)]
pub struct Listeners {
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl core::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<L>(mut self, listener: L) -> Self
    where
        L: LifecycleListener + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn register(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}

impl LifecycleListener for Listeners {
    fn on_event(&self, event: &LifecycleEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

/// Forwards lifecycle events onto an [`EventBus`].
///
/// Publish failures are logged and dropped: lifecycle events are an
/// observability surface, not the source of truth.
pub struct BusListener<B> {
    bus: B,
}

impl<B> BusListener<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> LifecycleListener for BusListener<B>
where
    B: EventBus<LifecycleEvent>,
{
    fn on_event(&self, event: &LifecycleEvent) {
        if let Err(e) = self.bus.publish(event.clone()) {
            tracing::warn!(
                kind = event.kind().as_str(),
                correlation_id = %event.correlation_id(),
                error = ?e,
                "failed to publish lifecycle event"
            );
        }
    }
}

/// Keeps every event in memory. Intended for tests and local inspection.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<LifecycleEventKind> {
        self.events().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: LifecycleEventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    /// Events of one firm, in emission order.
    pub fn events_for(&self, tenant_id: TenantId) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.belongs_to(tenant_id))
            .collect()
    }
}

impl LifecycleListener for RecordingListener {
    fn on_event(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
