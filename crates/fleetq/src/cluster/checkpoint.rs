use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::error::FleetError;
use crate::common::fsutils::write_atomically;

/// Everything a monitor needs to attach to a running cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "MONITOR_FLEET_ID")]
    pub fleet_request_id: String,
    #[serde(rename = "MONITOR_APP_NAME")]
    pub app_name: String,
    #[serde(rename = "MONITOR_ECS_CLUSTER")]
    pub cluster_id: String,
    #[serde(rename = "MONITOR_QUEUE_NAME")]
    pub queue_name: String,
    #[serde(rename = "MONITOR_BUCKET_NAME")]
    pub bucket_name: String,
    #[serde(rename = "MONITOR_LOG_GROUP_NAME")]
    pub log_group_name: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "MONITOR_START_TIME")]
    pub start_time: i64,
}

/// Location of the checkpoint of one application.
///
/// A single process writes the checkpoint, any number of processes may read it. The record is
/// always replaced as a whole.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_app(state_dir: &Path, app_name: &str) -> Self {
        Self::new(state_dir.join(format!("{app_name}SpotFleetRequestId.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, checkpoint: &Checkpoint) -> crate::Result<()> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        write_atomically(&self.path, &data)?;
        log::debug!("Checkpoint written to {}", self.path.display());
        Ok(())
    }

    pub fn read(&self) -> crate::Result<Option<Checkpoint>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let checkpoint = serde_json::from_slice(&data).map_err(|error| {
            FleetError::SerializationError(format!(
                "Checkpoint {} is corrupted: {error}",
                self.path.display()
            ))
        })?;
        Ok(Some(checkpoint))
    }

    /// Like [`CheckpointStore::read`], but a missing checkpoint is an error.
    pub fn require(&self) -> crate::Result<Checkpoint> {
        self.read()?
            .ok_or_else(|| FleetError::NoActiveCluster(self.path.display().to_string()))
    }

    /// Removes the checkpoint. Returns false if there was none.
    pub fn clear(&self) -> crate::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Checkpoint, CheckpointStore};
    use crate::common::error::FleetError;
    use tempfile::TempDir;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            fleet_request_id: "sfr-1234".into(),
            app_name: "Example".into(),
            cluster_id: "default".into(),
            queue_name: "ExampleQueue".into(),
            bucket_name: "example-bucket".into(),
            log_group_name: "ExampleLogs".into(),
            start_time: 1_700_000_000_000,
        }
    }

    #[test]
    fn write_read_clear() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let store = CheckpointStore::for_app(dir.path(), "Example");
        assert!(store.read().unwrap().is_none());

        store.write(&checkpoint()).unwrap();
        assert_eq!(store.read().unwrap(), Some(checkpoint()));

        assert!(store.clear().unwrap());
        assert!(store.read().unwrap().is_none());
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn file_layout() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let store = CheckpointStore::for_app(dir.path(), "Example");
        store.write(&checkpoint()).unwrap();

        assert!(store.path().ends_with("ExampleSpotFleetRequestId.json"));
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(value["MONITOR_FLEET_ID"], "sfr-1234");
        assert_eq!(value["MONITOR_ECS_CLUSTER"], "default");
        assert_eq!(value["MONITOR_START_TIME"], 1_700_000_000_000i64);
    }

    #[test]
    fn missing_checkpoint() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let store = CheckpointStore::for_app(dir.path(), "Example");
        assert!(matches!(store.require(), Err(FleetError::NoActiveCluster(_))));
    }

    #[test]
    fn corrupted_checkpoint() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let store = CheckpointStore::for_app(dir.path(), "Example");
        std::fs::write(store.path(), "{\"MONITOR_FLEET_ID\":").unwrap();
        assert!(matches!(
            store.read(),
            Err(FleetError::SerializationError(_))
        ));
    }
}
