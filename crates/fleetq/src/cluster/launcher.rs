use chrono::{DateTime, Utc};

use crate::cloud::{Cloud, FleetInstance};
use crate::cluster::ResourceSet;
use crate::cluster::checkpoint::{Checkpoint, CheckpointStore};
use crate::cluster::fleet::{
    FleetRequest, FleetTemplate, build_fleet_request, ecs_config_blob, ecs_config_key,
    object_endpoint,
};
use crate::common::config::{AppConfig, LOG_RETENTION_DAYS};
use crate::common::error::FleetError;
use crate::common::poll::PollPolicy;

/// Progress of a fleet launch. The states are passed strictly in this order; any step may end
/// in [`LaunchState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Pending,
    ConfigBuilt,
    RequestSubmitted,
    LogDestinationsReady,
    ServiceScaled,
    InstancesActive,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub request: FleetRequest,
    pub request_id: String,
    pub desired_tasks: u32,
    pub instances: Vec<FleetInstance>,
    pub checkpoint: Checkpoint,
}

/// Starts a spot fleet for a reconciled application and records it in a checkpoint.
pub struct FleetLauncher<'a> {
    cloud: &'a Cloud,
    config: &'a AppConfig,
    checkpoints: CheckpointStore,
    poll: PollPolicy,
    state: LaunchState,
    request_id: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
}

impl<'a> FleetLauncher<'a> {
    pub fn new(
        cloud: &'a Cloud,
        config: &'a AppConfig,
        checkpoints: CheckpointStore,
        poll: PollPolicy,
    ) -> Self {
        Self {
            cloud,
            config,
            checkpoints,
            poll,
            state: LaunchState::Pending,
            request_id: None,
            submitted_at: None,
        }
    }

    /// Waits for instances according to the configured timing.
    pub fn from_config(cloud: &'a Cloud, config: &'a AppConfig) -> Self {
        let poll = PollPolicy::new(config.timing.fleet_poll_interval)
            .with_deadline(config.timing.fleet_timeout);
        let checkpoints = CheckpointStore::for_app(&config.state_dir, &config.app_name);
        Self::new(cloud, config, checkpoints, poll)
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    fn advance(&mut self, state: LaunchState) {
        log::debug!("Fleet launch: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Uploads the container agent configuration read by the instances at boot.
    async fn upload_ecs_config(&self, bucket: &str, key: &str) -> crate::Result<()> {
        let blob = ecs_config_blob(&self.config.cluster);
        self.cloud
            .storage
            .put_object(bucket, key, blob.as_bytes())
            .await?;
        log::debug!("Container agent configuration uploaded to {bucket}/{key}");
        Ok(())
    }

    pub async fn build_request(
        &mut self,
        template: &FleetTemplate,
        resources: &ResourceSet,
    ) -> crate::Result<FleetRequest> {
        if resources.cluster_arn.is_none() {
            return Err(FleetError::InvalidFleetConfig(format!(
                "cluster `{}` does not exist, run `setup` first",
                self.config.cluster
            )));
        }
        let bucket = resources.bucket.as_deref().unwrap_or(&self.config.bucket);
        let key = ecs_config_key(&self.config.app_name);
        let endpoint = object_endpoint(bucket, &key);
        let request = build_fleet_request(template, self.config, &endpoint, Utc::now())?;
        self.upload_ecs_config(bucket, &key).await?;
        log::debug!(
            "Fleet request: {}",
            serde_json::to_string(&request).unwrap_or_default()
        );
        self.advance(LaunchState::ConfigBuilt);
        Ok(request)
    }

    /// Submits the request. A rejected request is not retried.
    pub async fn submit(&mut self, request: &FleetRequest) -> crate::Result<String> {
        let submitted_at = Utc::now();
        let request_id = self
            .cloud
            .fleet
            .request_fleet(request)
            .await
            .map_err(FleetError::FleetSubmissionRejected)?;
        log::info!("Fleet request {request_id} submitted");
        self.request_id = Some(request_id.clone());
        self.submitted_at = Some(submitted_at);
        self.advance(LaunchState::RequestSubmitted);
        Ok(request_id)
    }

    async fn ensure_log_group(&self, name: &str) -> crate::Result<()> {
        let existing = self.cloud.logs.describe_log_groups(name).await?;
        if existing.iter().any(|group| group == name) {
            log::info!("log group `{name}` already exists");
        } else {
            self.cloud.logs.create_log_group(name).await?;
            log::info!("log group `{name}` created");
        }
        Ok(())
    }

    /// Creates the aggregate and the per instance log group and sets their retention.
    ///
    /// Retention is attempted on both groups even if the first one fails.
    pub async fn prepare_log_groups(&mut self) -> crate::Result<()> {
        let groups = [
            self.config.log_group_name.clone(),
            self.config.per_instance_log_group(),
        ];
        for group in &groups {
            self.ensure_log_group(group).await?;
        }

        let mut failures = Vec::new();
        for group in groups {
            if let Err(error) = self
                .cloud
                .logs
                .put_retention_policy(&group, LOG_RETENTION_DAYS)
                .await
            {
                log::warn!("Cannot set retention of log group {group}: {error:#}");
                failures.push((group, format!("{error:#}")));
            }
        }
        if !failures.is_empty() {
            return Err(FleetError::PartialLogSetupFailure { failures });
        }
        self.advance(LaunchState::LogDestinationsReady);
        Ok(())
    }

    /// Sets the number of service tasks so that every machine runs its share.
    pub async fn scale_service(&mut self) -> crate::Result<u32> {
        let cluster = &self.config.cluster;
        let service = self.config.service_name();
        let services = self
            .cloud
            .containers
            .describe_services(cluster, std::slice::from_ref(&service))
            .await?;
        let Some(running) = services
            .iter()
            .find(|s| s.name == service && s.is_active())
            .map(|s| s.running_count)
        else {
            return Err(FleetError::ServiceNotFound {
                cluster: cluster.clone(),
                service,
            });
        };

        let desired = self.config.desired_task_count();
        self.cloud
            .containers
            .update_service(cluster, &service, desired)
            .await?;
        log::info!("Service {service} scaled to {desired} task(s), {running} running");
        self.advance(LaunchState::ServiceScaled);
        Ok(desired)
    }

    async fn check_request_health(
        &self,
        request_id: &str,
        since: DateTime<Utc>,
    ) -> crate::Result<()> {
        let errors = self
            .cloud
            .fleet
            .describe_fleet_history_errors(request_id, since)
            .await?;
        if !errors.is_empty() {
            let reason = errors
                .iter()
                .map(|e| format!("{}: {}", e.sub_type, e.description))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(FleetError::FleetRequestFailed {
                request_id: request_id.to_string(),
                reason,
            });
        }
        match self.cloud.fleet.describe_fleet_request(request_id).await? {
            Some(status) if status.is_terminal_failure() => Err(FleetError::FleetRequestFailed {
                request_id: request_id.to_string(),
                reason: format!("request is {}", status.state),
            }),
            _ => Ok(()),
        }
    }

    /// Polls the fleet until it has `target` active instances.
    pub async fn wait_for_instances(
        &mut self,
        request_id: &str,
        target: u32,
    ) -> crate::Result<Vec<FleetInstance>> {
        let since = self.submitted_at.unwrap_or_else(Utc::now);
        let mut poll = self.poll.start();
        let mut last_active = None;
        loop {
            poll.attempt();
            self.check_request_health(request_id, since).await?;

            let instances = self
                .cloud
                .fleet
                .describe_fleet_instances(request_id)
                .await?;
            let active = instances.len() as u32;
            if active >= target {
                log::info!("Fleet {request_id} has {active} active instance(s)");
                self.advance(LaunchState::InstancesActive);
                return Ok(instances);
            }
            if last_active != Some(active) {
                log::info!("Waiting for instances of fleet {request_id}: {active}/{target} active");
                last_active = Some(active);
            }
            if poll.is_exhausted() {
                return Err(FleetError::FleetProvisioningTimeout {
                    request_id: request_id.to_string(),
                    active,
                    target,
                    waited: poll.elapsed(),
                });
            }
            poll.sleep().await;
        }
    }

    async fn run_steps(
        &mut self,
        template: &FleetTemplate,
        resources: &ResourceSet,
    ) -> crate::Result<LaunchReport> {
        let request = self.build_request(template, resources).await?;
        let request_id = self.submit(&request).await?;
        self.prepare_log_groups().await?;
        let desired_tasks = self.scale_service().await?;
        let instances = self
            .wait_for_instances(&request_id, request.target_capacity)
            .await?;

        let checkpoint = Checkpoint {
            fleet_request_id: request_id.clone(),
            app_name: self.config.app_name.clone(),
            cluster_id: self.config.cluster.clone(),
            queue_name: self.config.queue_name(),
            bucket_name: self.config.bucket.clone(),
            log_group_name: self.config.log_group_name.clone(),
            start_time: self
                .submitted_at
                .unwrap_or_else(Utc::now)
                .timestamp_millis(),
        };
        self.checkpoints.write(&checkpoint)?;
        log::info!(
            "Cluster is running, checkpoint stored in {}",
            self.checkpoints.path().display()
        );

        Ok(LaunchReport {
            request,
            request_id,
            desired_tasks,
            instances,
            checkpoint,
        })
    }

    /// Runs the whole launch. The checkpoint is written only when every step succeeded.
    pub async fn launch(
        &mut self,
        template: &FleetTemplate,
        resources: &ResourceSet,
    ) -> crate::Result<LaunchReport> {
        let result = self.run_steps(template, resources).await;
        if result.is_err() {
            let failed_in = self.state;
            self.advance(LaunchState::Failed);
            if let Some(request_id) = &self.request_id {
                log::error!(
                    "Fleet launch failed after {failed_in:?}, fleet request {request_id} was not cancelled (use `fleetq teardown --fleet-request-id {request_id}`)"
                );
            }
        }
        result
    }
}
