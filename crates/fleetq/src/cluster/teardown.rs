//! Explicit cleanup of a launched cluster.
//!
//! The service is scaled down to zero tasks, the fleet request is cancelled together with its
//! instances and the checkpoint is removed. Queues, the container cluster, the task definition
//! and log groups are kept, so that the next launch only needs `start-cluster`.
use crate::cloud::Cloud;
use crate::cluster::checkpoint::{Checkpoint, CheckpointStore};
use crate::common::config::AppConfig;

#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub checkpoint: Option<Checkpoint>,
    pub service_scaled_down: bool,
    pub cancelled_request: Option<String>,
    pub checkpoint_cleared: bool,
}

pub async fn teardown(
    cloud: &Cloud,
    config: &AppConfig,
    checkpoints: &CheckpointStore,
    request_id: Option<String>,
) -> crate::Result<TeardownReport> {
    let checkpoint = checkpoints.read()?;
    let cluster = checkpoint
        .as_ref()
        .map(|c| c.cluster_id.clone())
        .unwrap_or_else(|| config.cluster.clone());
    let service = config.service_name();

    let mut report = TeardownReport::default();

    let services = cloud
        .containers
        .describe_services(&cluster, std::slice::from_ref(&service))
        .await?;
    let active = services
        .iter()
        .find(|s| s.name == service && s.is_active());
    if let Some(description) = active {
        cloud.containers.update_service(&cluster, &service, 0).await?;
        log::info!(
            "Service {service} scaled down from {} to 0 tasks",
            description.desired_count
        );
        report.service_scaled_down = true;
    } else {
        log::info!("Service {service} does not exist in cluster {cluster}, nothing to scale down");
    }

    let request_id = request_id.or_else(|| checkpoint.as_ref().map(|c| c.fleet_request_id.clone()));
    match request_id {
        Some(request_id) => {
            cloud.fleet.cancel_fleet_request(&request_id, true).await?;
            log::info!("Fleet request {request_id} cancelled, its instances are terminating");
            report.cancelled_request = Some(request_id);
        }
        None => log::info!("No fleet request to cancel"),
    }

    report.checkpoint_cleared = checkpoints.clear()?;
    report.checkpoint = checkpoint;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::teardown;
    use crate::cluster::checkpoint::CheckpointStore;
    use crate::tests::cloud::FakeCloud;
    use crate::tests::utils::{launched_cluster, test_config};
    use tempfile::TempDir;

    #[tokio::test]
    async fn teardown_launched_cluster() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let (config, request_id) = launched_cluster(&fake, dir.path()).await;
        let cloud = fake.bundle();
        let store = CheckpointStore::for_app(&config.state_dir, &config.app_name);

        let report = teardown(&cloud, &config, &store, None).await.unwrap();
        assert!(report.service_scaled_down);
        assert!(report.checkpoint_cleared);
        assert_eq!(report.cancelled_request.as_deref(), Some(request_id.as_str()));
        assert!(store.read().unwrap().is_none());

        assert_eq!(fake.service_desired_count("ExampleService"), Some(0));
        assert_eq!(fake.fleet_state(&request_id).as_deref(), Some("cancelled_terminating"));
    }

    #[tokio::test]
    async fn teardown_without_anything() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let cloud = fake.bundle();
        let config = test_config();
        let store = CheckpointStore::for_app(dir.path(), &config.app_name);

        let report = teardown(&cloud, &config, &store, None).await.unwrap();
        assert!(!report.service_scaled_down);
        assert!(report.cancelled_request.is_none());
        assert!(!report.checkpoint_cleared);
    }
}
