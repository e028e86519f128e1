//! Settings change notifications.
//!
//! Every successful setter broadcasts a `SettingChanged` to all live
//! subscribers. Each subscriber owns its own channel, so a slow observer
//! never holds up the settings store. Subscribers whose receiver has been
//! dropped are pruned on the next broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::settings::SettingKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingChanged {
    pub key: SettingKey,
}

/// Registry of settings observers. Cloneable; clones share subscribers.
#[derive(Clone, Default)]
pub struct SettingsNotifier {
    subscribers: Arc<Mutex<Vec<(u64, Sender<SettingChanged>)>>>,
    next_id: Arc<AtomicU64>,
}

impl SettingsNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> SettingsSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.lock().push((id, tx));
        SettingsSubscription { id, rx }
    }

    /// Remove an observer explicitly.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Deliver a change to every observer.
    pub fn broadcast(&self, key: SettingKey) {
        let mut subscribers = self.lock();
        subscribers.retain(|(id, tx)| {
            let delivered = tx.send(SettingChanged { key }).is_ok();
            if !delivered {
                log::debug!("Pruning disconnected settings subscriber {}", id);
            }
            delivered
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Sender<SettingChanged>)>> {
        self.subscribers.lock()
    }
}

/// Receiving end of a settings subscription.
pub struct SettingsSubscription {
    id: u64,
    rx: Receiver<SettingChanged>,
}

impl SettingsSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drain all pending notifications without blocking.
    pub fn drain(&self) -> Vec<SettingChanged> {
        self.rx.try_iter().collect()
    }

    /// Wait for the next notification.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SettingChanged> {
        match self.rx.recv_timeout(timeout) {
            Ok(change) => Some(change),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let notifier = SettingsNotifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();

        notifier.broadcast(SettingKey::DailyCheckInEnabled);

        assert_eq!(a.drain(), vec![SettingChanged { key: SettingKey::DailyCheckInEnabled }]);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let notifier = SettingsNotifier::new();
        let kept = notifier.subscribe();
        {
            let _dropped = notifier.subscribe();
        }
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.broadcast(SettingKey::ReminderLeadMinutes);
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let notifier = SettingsNotifier::new();
        let sub = notifier.subscribe();
        notifier.unsubscribe(sub.id());
        notifier.broadcast(SettingKey::OnboardingComplete);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_no_subscribers_is_noop() {
        let notifier = SettingsNotifier::new();
        notifier.broadcast(SettingKey::OnboardingComplete);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_registry_survives_panicking_observer_thread() {
        let notifier = SettingsNotifier::new();
        let kept = notifier.subscribe();

        let shared = notifier.clone();
        let worker = std::thread::spawn(move || {
            let _sub = shared.subscribe();
            shared.broadcast(SettingKey::OnboardingComplete);
            panic!("observer crashed");
        });
        assert!(worker.join().is_err());

        // The panicking thread's subscription is gone; the registry is not poisoned
        notifier.broadcast(SettingKey::DailyCheckInEnabled);
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.drain().len(), 2);
    }
}
