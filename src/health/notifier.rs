//! Debounced problem notifications.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{elapsed_between, Clock};
use crate::health::sink::{deliver, NotificationSink};

/// A message the notifier decided to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// First sighting of a problem.
    Detected(String),
    /// The problem persisted for another reminder interval.
    Reminder(String),
    /// Problems that went away since the last check.
    Recovered(Vec<String>),
}

/// Debounces a set of problem keys (crashed modules, modules in error).
///
/// Owned by a single task; `check` is pure over the given set and the injected clock.
#[derive(Debug)]
pub struct CrashNotifier {
    template: String,
    reminder_interval: Duration,
    ok_alerts: bool,
    clock: Arc<dyn Clock>,
    tracked: HashMap<String, DateTime<Utc>>,
}

impl CrashNotifier {
    /// Creates a notifier rendering messages from `template`, where `{}` stands for
    /// the problem key.
    pub fn new(template: impl Into<String>, reminder_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            template: template.into(),
            reminder_interval,
            ok_alerts: false,
            clock,
            tracked: HashMap::new(),
        }
    }

    /// Also announce keys that disappeared.
    pub fn with_ok_alerts(mut self, enabled: bool) -> Self {
        self.ok_alerts = enabled;
        self
    }

    /// Updates the tracked set from the current problem keys and returns what to send.
    ///
    /// New keys notify immediately, keys present for at least the reminder interval
    /// since their last notification produce a reminder, vanished keys are dropped
    /// (and batched into one `Recovered` when ok-alerts are enabled).
    pub fn check(&mut self, problems: &BTreeSet<String>) -> Vec<Notification> {
        let now = self.clock.now();
        let mut out = Vec::new();

        for key in problems {
            let due = match self.tracked.get(key) {
                None => Some(Notification::Detected(key.clone())),
                Some(last) if elapsed_between(*last, now) >= self.reminder_interval => {
                    Some(Notification::Reminder(key.clone()))
                }
                Some(_) => None,
            };
            if let Some(notification) = due {
                self.tracked.insert(key.clone(), now);
                out.push(notification);
            }
        }

        let mut recovered: Vec<String> = self
            .tracked
            .keys()
            .filter(|k| !problems.contains(*k))
            .cloned()
            .collect();
        recovered.sort();
        for key in &recovered {
            self.tracked.remove(key);
        }
        if self.ok_alerts && !recovered.is_empty() {
            out.push(Notification::Recovered(recovered));
        }

        out
    }

    /// Renders a notification as a chat message.
    pub fn render(&self, notification: &Notification) -> String {
        match notification {
            Notification::Detected(key) => self.template.replace("{}", key),
            Notification::Reminder(key) => format!("{} (reminder)", self.template.replace("{}", key)),
            Notification::Recovered(keys) => format!(":white_check_mark: Recovered: {}", keys.join(", ")),
        }
    }

    /// Runs [`check`](Self::check) and posts every resulting message to `sink`.
    /// Delivery failures are logged, never raised.
    pub async fn check_and_notify(
        &mut self,
        problems: &BTreeSet<String>,
        sink: &dyn NotificationSink,
    ) -> Vec<Notification> {
        let notifications = self.check(problems);
        for notification in &notifications {
            let message = self.render(notification);
            debug!(%message, "Sending notification");
            deliver(sink, &message).await;
        }
        notifications
    }

    /// Keys currently tracked.
    pub fn tracked(&self) -> BTreeSet<String> {
        self.tracked.keys().cloned().collect()
    }
}
