//! Process-wide orchestrator context.
//!
//! One [`OrchestratorContext`] is built at startup and shared (`Arc`) by the
//! executor, the control loop, the operator surface and the sequencer. It owns the
//! single-transition flag, the interlock, the published run state and run metadata,
//! the external collaborators and the event bus subscribers listen on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::SecondsFormat;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::{AppResult, RunControlError};
use crate::health::sink::{deliver, sink_from_settings, NotificationSink};
use crate::interlock::Interlock;
use crate::messages::{LogLevel, StateEvent};
use crate::registrar::{registrar_from_settings, Registrar};
use crate::run_info::{NoStatistics, RunInfo, RunStatistics};
use crate::state::RunState;

const EVENT_CAPACITY: usize = 256;

/// Marks a composite command in flight; clears the transition flag when dropped.
#[must_use = "the transition ends when the guard is dropped"]
#[derive(Debug)]
pub struct TransitionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Shared state and collaborators of the run control.
pub struct OrchestratorContext {
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
    interlock: Interlock,
    registrar: Arc<dyn Registrar>,
    sink: Arc<dyn NotificationSink>,
    statistics: Arc<dyn RunStatistics>,
    transition: AtomicBool,
    run_state: RwLock<RunState>,
    run_info: RwLock<RunInfo>,
    config_name: RwLock<Option<String>>,
    events: broadcast::Sender<StateEvent>,
}

/// Builder overriding the collaborators derived from the settings.
pub struct ContextBuilder {
    settings: Settings,
    clock: Option<Arc<dyn Clock>>,
    registrar: Option<Arc<dyn Registrar>>,
    sink: Option<Arc<dyn NotificationSink>>,
    statistics: Option<Arc<dyn RunStatistics>>,
}

impl ContextBuilder {
    /// Injects the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Injects the run registrar.
    pub fn registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Injects the notification sink.
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Injects the event counter source.
    pub fn statistics(mut self, statistics: Arc<dyn RunStatistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Builds the context; unset collaborators come from the settings.
    pub fn build(self) -> Arc<OrchestratorContext> {
        let settings = self.settings;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registrar = self
            .registrar
            .unwrap_or_else(|| registrar_from_settings(&settings.registrar));
        let sink = self
            .sink
            .unwrap_or_else(|| sink_from_settings(&settings.notifications));
        let statistics = self.statistics.unwrap_or_else(|| Arc::new(NoStatistics));
        let interlock = Interlock::new(settings.interlock.ttl, Arc::clone(&clock));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(OrchestratorContext {
            settings: Arc::new(settings),
            clock,
            interlock,
            registrar,
            sink,
            statistics,
            transition: AtomicBool::new(false),
            run_state: RwLock::new(RunState::Down),
            run_info: RwLock::new(RunInfo::default()),
            config_name: RwLock::new(None),
            events,
        })
    }
}

impl OrchestratorContext {
    /// Starts building a context from settings.
    pub fn builder(settings: Settings) -> ContextBuilder {
        ContextBuilder {
            settings,
            clock: None,
            registrar: None,
            sink: None,
            statistics: None,
        }
    }

    /// Context with every collaborator derived from the settings.
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::builder(settings).build()
    }

    /// Loaded settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Injected clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Operator interlock.
    pub fn interlock(&self) -> &Interlock {
        &self.interlock
    }

    /// Run registrar.
    pub fn registrar(&self) -> &Arc<dyn Registrar> {
        &self.registrar
    }

    /// Notification sink.
    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    /// Event counter source.
    pub fn statistics(&self) -> &Arc<dyn RunStatistics> {
        &self.statistics
    }

    /// Marks a composite command in flight.
    ///
    /// Fails with `TransitionInProgress` if one already is.
    pub fn begin_transition(&self) -> AppResult<TransitionGuard<'_>> {
        self.transition
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RunControlError::TransitionInProgress)?;
        Ok(TransitionGuard {
            flag: &self.transition,
        })
    }

    /// Whether a composite command is in flight.
    pub fn in_transition(&self) -> bool {
        self.transition.load(Ordering::SeqCst)
    }

    /// Currently published run state.
    pub fn run_state(&self) -> RunState {
        *self.run_state.read()
    }

    /// Publishes a new run state if it differs from the current one.
    pub fn set_run_state(&self, state: RunState) {
        let changed = {
            let mut current = self.run_state.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            info!(run_state = %state, "Run state changed");
            self.emit(StateEvent::RunStateChanged(state));
        }
    }

    /// Metadata of the current or last run.
    pub fn run_info(&self) -> RunInfo {
        self.run_info.read().clone()
    }

    /// Replaces the run metadata and publishes it.
    pub fn set_run_info(&self, info: RunInfo) {
        *self.run_info.write() = info.clone();
        self.emit(StateEvent::RunInfoChanged(info));
    }

    /// Marks the current run as ended; published only if one was ongoing.
    pub fn end_run(&self) {
        let info = {
            let mut info = self.run_info.write();
            if !info.run_ongoing {
                return;
            }
            info.run_ongoing = false;
            info.clone()
        };
        self.emit(StateEvent::RunInfoChanged(info));
    }

    /// Name of the loaded configuration.
    pub fn config_name(&self) -> Option<String> {
        self.config_name.read().clone()
    }

    pub(crate) fn set_config_name(&self, name: &str) {
        *self.config_name.write() = Some(name.to_string());
        self.emit(StateEvent::ConfigChanged(name.to_string()));
    }

    /// Subscribes to state events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Publishes an event; dropped silently without subscribers.
    pub fn emit(&self, event: StateEvent) {
        let _ = self.events.send(event);
    }

    /// Logs an operator-facing message and publishes it as a log line.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
        let level_name = match level {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        let line = format!(
            "[{}] {} {}: {}",
            self.config_name().unwrap_or_else(|| self.settings.application.name.clone()),
            self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level_name,
            message
        );
        self.emit(StateEvent::Log {
            level,
            message: line,
        });
    }

    /// Posts a message to the notification sink; failures are only logged.
    pub async fn notify(&self, message: &str) {
        deliver(self.sink.as_ref(), message).await;
    }
}
