//! Run-control configuration using Figment
//!
//! Engine settings are loaded from:
//! 1. `config/runcontrol.toml` (base configuration)
//! 2. Environment variables (prefixed with `RUNCTL_`, nested keys split on `__`)
//!
//! Deployment descriptions (control tree, FSM rules, component configuration) are
//! separate JSON documents, see [`bundle`] and [`fsm`].
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RUNCTL_APPLICATION__LOG_LEVEL=debug
//! RUNCTL_APPLICATION__LOCAL_ONLY=true
//! RUNCTL_INTERLOCK__TTL=30m
//! RUNCTL_REGISTRAR__URL=http://runregistry:5002
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_runcontrol::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Configurations under {}", settings.application.config_root.display());
//! # Ok::<(), daq_runcontrol::error::RunControlError>(())
//! ```

pub mod bundle;
pub mod fsm;

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, RunControlError};

/// Top-level engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Polling cadences of the checker, executor and monitor
    pub timing: TimingConfig,
    /// Operator interlock
    pub interlock: InterlockConfig,
    /// Chat notifications for crashed and erroring modules
    pub notifications: NotificationConfig,
    /// Run-number registrar
    pub registrar: RegistrarConfig,
    /// Run statistics counters
    pub statistics: StatisticsConfig,
    /// Automated run sequences
    pub sequencer: SequencerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name, used as the log prefix
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory holding one sub-directory per deployment configuration
    pub config_root: PathBuf,
    /// Skip the run registrar and use the local run number
    pub local_only: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "runcontrol".to_string(),
            log_level: "info".to_string(),
            config_root: PathBuf::from("config/deployments"),
            local_only: false,
        }
    }
}

/// Polling cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// State checker tick per node
    #[serde(with = "humantime_serde")]
    pub checker_interval: Duration,
    /// Root state poll while a command step waits
    #[serde(with = "humantime_serde")]
    pub step_poll_interval: Duration,
    /// Control loop (delta publisher, notifiers, interlock expiry)
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            checker_interval: Duration::from_millis(100),
            step_poll_interval: Duration::from_millis(200),
            monitor_interval: Duration::from_millis(300),
        }
    }
}

/// Operator interlock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockConfig {
    /// Lock lifetime, refreshed by every command from the holder
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
        }
    }
}

/// Notification sink and debouncing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Incoming-webhook URL; notifications are only logged when unset
    pub webhook_url: Option<String>,
    /// Interval between reminders for a still-present problem
    #[serde(with = "humantime_serde")]
    pub reminder_interval: Duration,
    /// Also announce modules that recovered
    pub ok_alerts: bool,
    /// Message for a crashed module, `{}` is replaced by the module name
    pub crash_template: String,
    /// Message for a module in error state, `{}` is replaced by the module name
    pub error_template: String,
    /// Announce run starts and stops on the sink
    pub announce_runs: bool,
    /// HTTP timeout for webhook posts
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            reminder_interval: Duration::from_secs(3600),
            ok_alerts: false,
            crash_template: ":warning: Module __{}__ has CRASHED".to_string(),
            error_template: ":warning: Module __{}__ is in ERROR STATE".to_string(),
            announce_runs: false,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Run-number registrar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Base URL; a local registrar is used when unset
    pub url: Option<String>,
    /// Basic-auth user
    pub username: String,
    /// Basic-auth password
    pub password: String,
    /// Software version reported with every new run
    pub version: String,
    /// HTTP timeout for registrar requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: String::new(),
            password: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Run statistics counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Counter compared against a sequence step's event limit
    pub physics_counter: String,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            physics_counter: "Events_sent_Physics".to_string(),
        }
    }
}

/// Automated run sequences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Identity the sequencer presents to the interlock
    pub identity: String,
    /// Run statistics poll while waiting for a run to end
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay before retrying a failed shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_retry_delay: Duration,
    /// Shutdown attempts per step, including the first
    pub shutdown_attempts: u32,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            identity: "sequencer".to_string(),
            poll_interval: Duration::from_secs(5),
            shutdown_retry_delay: Duration::from_secs(10),
            shutdown_attempts: 2,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from `config/runcontrol.toml` and environment variables
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`RUNCTL_` prefix)
    /// 2. `config/runcontrol.toml`
    /// 3. Built-in defaults
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/runcontrol.toml")
    }

    /// Load settings from a specific file path
    ///
    /// A missing file is not an error: defaults and environment overrides apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUNCTL_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Polling intervals are non-zero
    /// - Interlock TTL is non-zero
    /// - Templates contain the `{}` placeholder
    /// - The sequencer makes at least one shutdown attempt
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RunControlError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let intervals = [
            ("timing.checker_interval", self.timing.checker_interval),
            ("timing.step_poll_interval", self.timing.step_poll_interval),
            ("timing.monitor_interval", self.timing.monitor_interval),
            ("interlock.ttl", self.interlock.ttl),
            ("sequencer.poll_interval", self.sequencer.poll_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(RunControlError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        for (name, template) in [
            ("notifications.crash_template", &self.notifications.crash_template),
            ("notifications.error_template", &self.notifications.error_template),
        ] {
            if !template.contains("{}") {
                return Err(RunControlError::Configuration(format!(
                    "{name} must contain a '{{}}' placeholder"
                )));
            }
        }

        if self.sequencer.shutdown_attempts == 0 {
            return Err(RunControlError::Configuration(
                "sequencer.shutdown_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.timing.step_poll_interval, Duration::from_millis(200));
        assert_eq!(settings.statistics.physics_counter, "Events_sent_Physics");
    }

    #[test]
    fn test_load_from_toml_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
local_only = true

[interlock]
ttl = "30m"

[notifications]
reminder_interval = "2h"
ok_alerts = true
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert!(settings.application.local_only);
        assert_eq!(settings.interlock.ttl, Duration::from_secs(1800));
        assert_eq!(
            settings.notifications.reminder_interval,
            Duration::from_secs(7200)
        );
        assert!(settings.notifications.ok_alerts);
        // Untouched sections keep their defaults
        assert_eq!(settings.sequencer.shutdown_attempts, 2);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level 'verbose'"));
    }

    #[test]
    fn test_template_requires_placeholder() {
        let mut settings = Settings::default();
        settings.notifications.crash_template = "something crashed".to_string();
        assert!(matches!(
            settings.validate(),
            Err(RunControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut settings = Settings::default();
        settings.timing.checker_interval = Duration::ZERO;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("timing.checker_interval"));
    }
}
