//! Run-number registrar.
//!
//! Every run gets its number from the registrar at START and reports its end-of-run
//! information at STOP. The HTTP registrar speaks the run-service protocol:
//!
//! - `POST <url>/NewRunNumber` with a [`NewRunRequest`] body, answered with
//!   status 201 and the new run number as the body
//! - `POST <url>/AddRunInfo/<run>` with a [`RunEndInfo`] body, answered with 200
//!
//! Local-only deployments use [`LocalRegistrar`], which never leaves the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::RegistrarConfig;
use crate::error::{AppResult, RunControlError};
use crate::run_info::EventCounts;

/// Run number used when no registrar is involved.
pub const LOCAL_RUN_NUMBER: u64 = 1_000_000_000;

/// Body of a new-run request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewRunRequest {
    /// Software version of the run control.
    pub version: String,
    /// Run type.
    #[serde(rename = "type")]
    pub run_type: String,
    /// Identity starting the run.
    pub username: String,
    /// Start comment, already truncated.
    #[serde(rename = "startcomment")]
    pub start_comment: String,
    /// Sequence number, if the run belongs to a sequence.
    #[serde(rename = "seqnumber")]
    pub seq_number: Option<u64>,
    /// Step within the sequence.
    #[serde(rename = "seqstep")]
    pub seq_step: u32,
    /// Sub-step within the sequence step.
    #[serde(rename = "seqsubstep")]
    pub seq_substep: u32,
    /// Detector identifiers taking part.
    pub detectors: Vec<String>,
    /// Name of the loaded configuration.
    #[serde(rename = "configName")]
    pub config_name: String,
    /// Full component configuration.
    pub configuration: Value,
}

/// End-of-run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Event builder counters at the end of the run.
    #[serde(rename = "eventCounts")]
    pub event_counts: EventCounts,
}

/// Body of an end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEndInfo {
    /// End comment.
    #[serde(rename = "endcomment")]
    pub end_comment: String,
    /// Run type.
    #[serde(rename = "type")]
    pub run_type: String,
    /// Statistics.
    #[serde(rename = "runinfo")]
    pub run_info: RunStats,
}

/// Issues run numbers and stores end-of-run information.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Registers a new run and returns its number.
    async fn new_run_number(&self, request: &NewRunRequest) -> AppResult<u64>;

    /// Stores the end-of-run information of `run_number`.
    async fn add_run_info(&self, run_number: u64, info: &RunEndInfo) -> AppResult<()>;
}

/// HTTP client of the run service.
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpRegistrar {
    /// Creates a client for the service at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> AppResult<(StatusCode, String)> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "Registrar request");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| RunControlError::registrar(format!("{url}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RunControlError::registrar(format!("{url}: {e}")))?;
        Ok((status, text))
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn new_run_number(&self, request: &NewRunRequest) -> AppResult<u64> {
        let (status, body) = self.post("NewRunNumber", request).await?;
        if status != StatusCode::CREATED {
            return Err(RunControlError::registrar(format!(
                "NewRunNumber returned {status}: {}",
                body.trim()
            )));
        }
        let run_number = body
            .trim()
            .parse::<u64>()
            .map_err(|e| RunControlError::registrar(format!("invalid run number '{}': {e}", body.trim())))?;
        info!(run_number, "Run number assigned");
        Ok(run_number)
    }

    async fn add_run_info(&self, run_number: u64, info: &RunEndInfo) -> AppResult<()> {
        let (status, body) = self.post(&format!("AddRunInfo/{run_number}"), info).await?;
        if status != StatusCode::OK {
            return Err(RunControlError::registrar(format!(
                "AddRunInfo/{run_number} returned {status}: {}",
                body.trim()
            )));
        }
        Ok(())
    }
}

/// Registrar for local-only operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRegistrar;

#[async_trait]
impl Registrar for LocalRegistrar {
    async fn new_run_number(&self, _request: &NewRunRequest) -> AppResult<u64> {
        Ok(LOCAL_RUN_NUMBER)
    }

    async fn add_run_info(&self, run_number: u64, _info: &RunEndInfo) -> AppResult<()> {
        debug!(run_number, "Local run ended, nothing to register");
        Ok(())
    }
}

/// HTTP registrar if a URL is configured, local registrar otherwise.
pub fn registrar_from_settings(config: &RegistrarConfig) -> Arc<dyn Registrar> {
    match &config.url {
        Some(url) if !url.is_empty() => Arc::new(HttpRegistrar::new(
            url.clone(),
            config.username.clone(),
            config.password.clone(),
            config.request_timeout,
        )),
        _ => Arc::new(LocalRegistrar),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_run_request_uses_service_field_names() {
        let request = NewRunRequest {
            version: "0.1.0".into(),
            run_type: "Physics".into(),
            username: "shifter".into(),
            start_comment: "beam".into(),
            seq_number: Some(42),
            seq_step: 3,
            seq_substep: 0,
            detectors: vec!["TLB".into()],
            config_name: "combined".into(),
            configuration: json!({"group": "faser"}),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["type"], "Physics");
        assert_eq!(body["startcomment"], "beam");
        assert_eq!(body["seqnumber"], 42);
        assert_eq!(body["configName"], "combined");
    }

    #[test]
    fn run_end_info_nests_event_counts() {
        let mut counts = EventCounts::new();
        counts.insert("Events_sent_Physics".into(), 10);
        let info = RunEndInfo {
            end_comment: "done".into(),
            run_type: "Physics".into(),
            run_info: RunStats {
                event_counts: counts,
            },
        };
        let body = serde_json::to_value(&info).unwrap();
        assert_eq!(body["runinfo"]["eventCounts"]["Events_sent_Physics"], 10);
        assert_eq!(body["endcomment"], "done");
    }

    #[tokio::test]
    async fn local_registrar_uses_fixed_number() {
        let request = NewRunRequest {
            version: String::new(),
            run_type: "Test".into(),
            username: "me".into(),
            start_comment: String::new(),
            seq_number: None,
            seq_step: 0,
            seq_substep: 0,
            detectors: Vec::new(),
            config_name: "local".into(),
            configuration: Value::Null,
        };
        assert_eq!(LocalRegistrar.new_run_number(&request).await.unwrap(), LOCAL_RUN_NUMBER);
    }

    #[tokio::test]
    async fn unreachable_registrar_is_external_service_error() {
        // Port 9 (discard) on localhost is not expected to speak HTTP
        let registrar = HttpRegistrar::new("http://127.0.0.1:9", "u", "p", Duration::from_millis(200));
        let err = registrar
            .add_run_info(1, &RunEndInfo {
                end_comment: String::new(),
                run_type: String::new(),
                run_info: RunStats::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RunControlError::ExternalService { .. }));
    }
}
