//! Lifecycle events emitted by the workflow engine.
//!
//! - [`LifecycleEvent`]: typed, firm-scoped record of something the
//!   orchestrator did (`execution.started`, `step.failed`, ...).
//! - [`LifecycleListener`]: explicit, registered receivers of those events.
//! - [`EventBus`]: transport-agnostic pub/sub for out-of-process consumers.

pub mod bus;
pub mod in_memory_bus;
pub mod lifecycle;
pub mod listener;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{LifecycleEvent, LifecycleEventKind};
pub use listener::{BusListener, LifecycleListener, Listeners, RecordingListener};
pub use tenant::TenantScoped;
