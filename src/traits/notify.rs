//! Client notification.
//!
//! The dispatcher reports coarse "model changed" events; whoever renders the
//! layout decides what to re-read. Notifiers must not block: they are called
//! from the dispatcher loop and from trip tasks.

use serde::{Deserialize, Serialize};

/// A model change worth telling clients about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Occupancy records changed.
    OccChanged,
    /// Route flags (occupied/disabled) changed.
    RoutesChanged,
    /// A route became active and should be highlighted.
    RouteShown(String),
    /// A route was released.
    RouteReset(String),
    /// Diagnostic message.
    Debug(String),
    /// User-facing message.
    Info(String),
}

/// Sink for [`ModelEvent`]s.
pub trait Notifier: Send + Sync {
    /// Publish one event.
    fn notify(&self, event: ModelEvent);
}

/// Notifier that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: ModelEvent) {}
}
