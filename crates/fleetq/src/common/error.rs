use std::time::Duration;

use thiserror::Error;

use crate::common::error::FleetError::GenericError;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Queue `{0}` cannot be resolved, run `setup` first")]
    QueueUnavailable(String),
    #[error("Service `{service}` was not found in cluster `{cluster}`, run `setup` first")]
    ServiceNotFound { cluster: String, service: String },
    #[error(
        "Fleet request {request_id} has {active}/{target} active instances after {}",
        format_waited(.waited)
    )]
    FleetProvisioningTimeout {
        request_id: String,
        active: u32,
        target: u32,
        waited: Duration,
    },
    #[error("Fleet request was rejected: {0:#}")]
    FleetSubmissionRejected(anyhow::Error),
    #[error("Fleet request {request_id} failed: {reason}")]
    FleetRequestFailed { request_id: String, reason: String },
    #[error("Retention policy could not be set on log group(s): {}", format_log_failures(.failures))]
    PartialLogSetupFailure { failures: Vec<(String, String)> },
    #[error("No active cluster found, checkpoint file {0} does not exist")]
    NoActiveCluster(String),
    #[error("All instances of fleet {request_id} are gone, but {remaining} message(s) remain")]
    InstancesLost { request_id: String, remaining: u64 },
    #[error("Invalid fleet configuration: {0}")]
    InvalidFleetConfig(String),
    #[error("Invalid job file: {0}")]
    InvalidJobFile(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Cloud provider error: {0:#}")]
    Provider(#[from] anyhow::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

fn format_waited(waited: &Duration) -> String {
    humantime::format_duration(*waited).to_string()
}

fn format_log_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(group, error)| format!("{group} ({error})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::error::Error> for FleetError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(error: toml::de::Error) -> Self {
        Self::Config(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
