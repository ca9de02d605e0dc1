//! Fan-out notifier for external clients.

use tokio::sync::broadcast;

use crate::traits::{ModelEvent, Notifier};

/// [`Notifier`] publishing on a [`tokio::sync::broadcast`] channel.
///
/// Each UI connection calls [`subscribe`](Self::subscribe). Slow receivers
/// lag and lose old events; events sent with no receiver are dropped.
///
/// ```
/// use rs_autoplay::hal::BroadcastNotifier;
/// use rs_autoplay::traits::{ModelEvent, Notifier};
///
/// let notifier = BroadcastNotifier::new(16);
/// let mut rx = notifier.subscribe();
/// notifier.notify(ModelEvent::OccChanged);
/// assert_eq!(rx.try_recv().unwrap(), ModelEvent::OccChanged);
/// ```
#[derive(Clone, Debug)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ModelEvent>,
}

impl BroadcastNotifier {
    /// Creates a channel holding up to `capacity` unread events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: ModelEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_receivers_is_harmless() {
        let notifier = BroadcastNotifier::new(4);
        notifier.notify(ModelEvent::RoutesChanged);
        assert_eq!(notifier.receiver_count(), 0);
    }

    #[tokio::test]
    async fn every_receiver_sees_events() {
        let notifier = BroadcastNotifier::new(4);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        notifier.notify(ModelEvent::Debug("x".into()));
        assert_eq!(a.recv().await.unwrap(), ModelEvent::Debug("x".into()));
        assert_eq!(b.recv().await.unwrap(), ModelEvent::Debug("x".into()));
    }
}
