//! Module health notifications
//!
//! Crashed and erroring modules are announced on a notification sink, debounced so
//! a persistent problem produces one message plus periodic reminders rather than a
//! message per control-loop tick.

pub mod notifier;
pub mod sink;

pub use notifier::{CrashNotifier, Notification};
pub use sink::{deliver, sink_from_settings, LogSink, NotificationSink, WebhookSink};
