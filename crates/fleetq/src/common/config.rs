use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::common::error::FleetError;

/// Dead-lettering threshold of the primary queue.
pub const MAX_RECEIVE_COUNT: u32 = 10;
/// Retention applied to both log groups.
pub const LOG_RETENTION_DAYS: u32 = 60;

fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    humantime::parse_duration(&buf).map_err(serde::de::Error::custom)
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_cluster() -> String {
    "default".to_string()
}

fn default_message_visibility() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_docker_cores() -> u32 {
    4
}

fn default_memory() -> u32 {
    15000
}

fn default_cluster_machines() -> u32 {
    3
}

fn default_tasks_per_machine() -> u32 {
    1
}

fn default_machine_types() -> Vec<String> {
    vec!["m5.xlarge".to_string()]
}

fn default_machine_price() -> f64 {
    0.10
}

fn default_ebs_vol_size() -> u32 {
    30
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("files")
}

/// Static configuration of one application (one disposable cluster).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub app_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Name of the profile in `~/.aws/config` used for credentials.
    #[serde(default = "default_profile")]
    pub profile: String,
    pub bucket: String,
    pub log_group_name: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default)]
    queue_name: Option<String>,
    #[serde(default)]
    dead_letter_queue: Option<String>,
    #[serde(
        default = "default_message_visibility",
        deserialize_with = "deserialize_human_duration"
    )]
    pub message_visibility: Duration,

    pub docker_image: String,
    #[serde(default = "default_docker_cores")]
    pub docker_cores: u32,
    #[serde(default)]
    cpu_shares: Option<u32>,
    #[serde(default = "default_memory")]
    pub memory: u32,

    #[serde(default = "default_cluster_machines")]
    pub cluster_machines: u32,
    #[serde(default = "default_tasks_per_machine")]
    pub tasks_per_machine: u32,
    #[serde(default = "default_machine_types")]
    pub machine_types: Vec<String>,
    #[serde(default = "default_machine_price")]
    pub machine_price: f64,
    #[serde(default = "default_ebs_vol_size")]
    pub ebs_vol_size: u32,
    pub ssh_key_name: String,

    /// Additional variables passed to every container.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Directory holding the checkpoint file.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    /// How long to wait after a resource was created before it is used.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub settle_time: Duration,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub fleet_poll_interval: Duration,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub fleet_timeout: Duration,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub monitor_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_time: Duration::from_secs(60),
            fleet_poll_interval: Duration::from_secs(20),
            fleet_timeout: Duration::from_secs(30 * 60),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

impl TimingConfig {
    /// Removes every pause between steps and observations.
    ///
    /// `fleet_timeout` is kept, the launcher still waits that long for instances.
    pub fn disable_pauses(&mut self) {
        self.settle_time = Duration::ZERO;
        self.fleet_poll_interval = Duration::ZERO;
        self.monitor_interval = Duration::ZERO;
    }
}

impl AppConfig {
    pub fn parse(str: &str) -> crate::Result<AppConfig> {
        let config: AppConfig = toml::from_str(str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> crate::Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("Cannot read configuration {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.app_name.is_empty() {
            return Err(FleetError::Config("`app_name` must not be empty".into()));
        }
        if self.cluster_machines == 0 {
            return Err(FleetError::Config(
                "`cluster_machines` must be at least 1".into(),
            ));
        }
        if self.tasks_per_machine == 0 {
            return Err(FleetError::Config(
                "`tasks_per_machine` must be at least 1".into(),
            ));
        }
        if self.machine_types.is_empty() {
            return Err(FleetError::Config(
                "`machine_types` must contain at least one instance type".into(),
            ));
        }
        if !(self.machine_price > 0.0) {
            return Err(FleetError::Config("`machine_price` must be positive".into()));
        }
        Ok(())
    }

    pub fn queue_name(&self) -> String {
        self.queue_name
            .clone()
            .unwrap_or_else(|| format!("{}Queue", self.app_name))
    }

    pub fn dead_letter_queue(&self) -> String {
        self.dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}_DeadMessages", self.app_name))
    }

    pub fn task_name(&self) -> String {
        format!("{}Task", self.app_name)
    }

    pub fn service_name(&self) -> String {
        format!("{}Service", self.app_name)
    }

    pub fn per_instance_log_group(&self) -> String {
        format!("{}_perInstance", self.log_group_name)
    }

    pub fn cpu_shares(&self) -> u32 {
        self.cpu_shares.unwrap_or(self.docker_cores * 1024)
    }

    /// Number of service tasks that fill the whole fleet.
    pub fn desired_task_count(&self) -> u32 {
        self.cluster_machines * self.tasks_per_machine
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;
    use crate::common::error::FleetError;
    use std::time::Duration;

    const MINIMAL: &str = r#"
app_name = "Example"
bucket = "example-bucket"
log_group_name = "ExampleLogs"
docker_image = "org/worker:latest"
ssh_key_name = "cluster-key.pem"
"#;

    #[test]
    fn derive_default_names() {
        let config = AppConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.queue_name(), "ExampleQueue");
        assert_eq!(config.dead_letter_queue(), "Example_DeadMessages");
        assert_eq!(config.task_name(), "ExampleTask");
        assert_eq!(config.service_name(), "ExampleService");
        assert_eq!(config.per_instance_log_group(), "ExampleLogs_perInstance");
        assert_eq!(config.cpu_shares(), 4096);
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.timing.monitor_interval, Duration::from_secs(60));
    }

    #[test]
    fn parse_explicit_values() {
        let config = AppConfig::parse(&format!(
            r#"{MINIMAL}
queue_name = "Work"
dead_letter_queue = "Poison"
cluster_machines = 4
tasks_per_machine = 2
machine_types = ["m5.large", "c5.large"]
message_visibility = "10m"

[environment]
CHECK_IF_DONE = "true"

[timing]
settle_time = "0s"
fleet_poll_interval = "5s"
fleet_timeout = "1h"
monitor_interval = "30s"
"#
        ))
        .unwrap();
        assert_eq!(config.queue_name(), "Work");
        assert_eq!(config.dead_letter_queue(), "Poison");
        assert_eq!(config.desired_task_count(), 8);
        assert_eq!(config.machine_types.len(), 2);
        assert_eq!(config.message_visibility, Duration::from_secs(600));
        assert_eq!(config.environment["CHECK_IF_DONE"], "true");
        assert_eq!(config.timing.fleet_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn reject_zero_machines() {
        let result = AppConfig::parse(&format!("{MINIMAL}\ncluster_machines = 0\n"));
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[test]
    fn reject_unknown_field() {
        let result = AppConfig::parse(&format!("{MINIMAL}\nunknown = 1\n"));
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    #[test]
    fn disabled_pauses_keep_fleet_timeout() {
        let mut config = AppConfig::parse(&format!(
            "{MINIMAL}\n[timing]\nsettle_time = \"1m\"\nfleet_poll_interval = \"5s\"\nfleet_timeout = \"1h\"\nmonitor_interval = \"30s\"\n"
        ))
        .unwrap();
        config.timing.disable_pauses();
        assert_eq!(config.timing.settle_time, Duration::ZERO);
        assert_eq!(config.timing.fleet_poll_interval, Duration::ZERO);
        assert_eq!(config.timing.monitor_interval, Duration::ZERO);
        assert_eq!(config.timing.fleet_timeout, Duration::from_secs(3600));
    }
}
