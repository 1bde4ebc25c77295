//! Notification broadcasting for runtime subscribers.

use parking_lot::Mutex;
use serde::Serialize;
use statechart_core::{Notification, Observer, StateChart, StateId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// A notification as seen by subscribers, with the state resolved to its name.
#[derive(Debug, Clone, Serialize)]
pub struct MachineNotification {
    /// Position in the machine's notification stream, starting at 1.
    pub sequence: u64,
    pub kind: &'static str,
    pub state: Option<String>,
    #[serde(skip)]
    pub notification: Notification,
}

/// Filter for subscriptions.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    /// Only these kinds, e.g. `entered` (empty = all).
    pub kinds: Vec<String>,
    /// Only notifications about these states (empty = all).
    pub states: Vec<String>,
}

impl NotificationFilter {
    /// A filter accepting only the given kinds.
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Returns true if the notification matches this filter.
    pub fn matches(&self, notification: &MachineNotification) -> bool {
        (self.kinds.is_empty() || self.kinds.iter().any(|k| k == notification.kind))
            && (self.states.is_empty()
                || notification
                    .state
                    .as_ref()
                    .map_or(false, |s| self.states.contains(s)))
    }
}

/// Fans interpreter notifications out to any number of subscribers.
pub struct NotificationBroadcaster {
    sender: broadcast::Sender<MachineNotification>,
    subscriptions: Mutex<HashMap<String, NotificationFilter>>,
    sequence: AtomicU64,
}

impl NotificationBroadcaster {
    /// Creates a broadcaster with the given channel capacity.
    pub fn new(channel_capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Arc::new(Self {
            sender,
            subscriptions: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Subscribes to notifications published from now on.
    pub fn subscribe(self: &Arc<Self>, filter: NotificationFilter) -> NotificationSubscription {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        let receiver = self.sender.subscribe();
        self.subscriptions
            .lock()
            .insert(subscription_id.clone(), filter.clone());
        NotificationSubscription {
            subscription_id,
            filter,
            receiver,
            broadcaster: Arc::clone(self),
        }
    }

    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.lock().remove(subscription_id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Publishes one notification. Dropped silently when nobody listens.
    pub fn publish(&self, notification: Notification, state: Option<String>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.sender.send(MachineNotification {
            sequence,
            kind: notification.kind(),
            state,
            notification,
        });
    }

    /// An observer that publishes everything a machine running `chart` emits.
    pub fn observer(self: &Arc<Self>, chart: &StateChart) -> impl Observer + 'static {
        let names: HashMap<StateId, String> = chart
            .state_ids()
            .map(|s| (s, chart.name(s).to_string()))
            .collect();
        let broadcaster = Arc::clone(self);
        move |notification: &Notification| {
            let state = notification.state().and_then(|s| names.get(&s).cloned());
            broadcaster.publish(notification.clone(), state);
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct NotificationSubscription {
    subscription_id: String,
    filter: NotificationFilter,
    receiver: broadcast::Receiver<MachineNotification>,
    broadcaster: Arc<NotificationBroadcaster>,
}

impl NotificationSubscription {
    pub fn id(&self) -> &str {
        &self.subscription_id
    }

    /// Next matching notification, or `None` once the broadcaster is gone.
    /// Lagged notifications are skipped with a warning.
    pub async fn recv(&mut self) -> Option<MachineNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => {
                    if self.filter.matches(&notification) {
                        return Some(notification);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        subscription = %self.subscription_id,
                        skipped = n,
                        "subscription lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching notification already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<MachineNotification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => {
                    if self.filter.matches(&notification) {
                        return Some(notification);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(
                        subscription = %self.subscription_id,
                        skipped = n,
                        "subscription lagged"
                    );
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.subscription_id);
    }
}
