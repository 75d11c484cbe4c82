use crate::cloud::{Cloud, QueueAttributes, resource_name};
use crate::cluster::checkpoint::{Checkpoint, CheckpointStore};
use crate::common::error::FleetError;
use crate::common::poll::PollPolicy;

/// State of a running cluster sampled in one monitor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub visible: u64,
    pub in_flight: u64,
    pub dead_letter: u64,
    pub active_instances: u32,
}

impl Observation {
    pub fn queue_depth(&self) -> u64 {
        self.visible + self.in_flight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    /// The queue is empty and no instance is running.
    Drained,
    /// No instance is running but work remains in the queue.
    InstancesLost,
}

/// Poisoned messages alone never stop the monitor.
pub fn decide(observation: &Observation) -> Decision {
    match (observation.active_instances, observation.queue_depth()) {
        (0, 0) => Decision::Drained,
        (0, _) => Decision::InstancesLost,
        _ => Decision::Continue,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Drained { cycles: u32 },
    /// The poll policy allowed no further cycle before the cluster drained.
    CycleLimitReached { cycles: u32 },
}

/// Queues watched by the monitor, resolved from the checkpoint.
struct WatchedQueues {
    queue_url: String,
    /// `None` until the redrive policy of the queue was read.
    dead_letter_url: Option<Option<String>>,
}

/// Watches a cluster recorded in a checkpoint until its queue is drained.
///
/// The monitor only reads; it never changes the checkpoint or any cloud resource.
pub struct ClusterMonitor<'a> {
    cloud: &'a Cloud,
    checkpoints: CheckpointStore,
    poll: PollPolicy,
}

impl<'a> ClusterMonitor<'a> {
    pub fn new(cloud: &'a Cloud, checkpoints: CheckpointStore, poll: PollPolicy) -> Self {
        Self {
            cloud,
            checkpoints,
            poll,
        }
    }

    /// Finds the dead letter queue through the redrive policy of the work queue.
    async fn locate_dead_letter_queue(
        &self,
        queue_name: &str,
        attributes: &QueueAttributes,
    ) -> crate::Result<Option<String>> {
        let url = match &attributes.redrive_policy {
            Some(policy) => {
                let name = resource_name(&policy.dead_letter_target_arn);
                self.cloud.queues.get_queue_url(name).await?
            }
            None => None,
        };
        if url.is_none() {
            log::warn!("Queue {queue_name} has no dead letter queue, failed messages are not reported");
        }
        Ok(url)
    }

    async fn observe(
        &self,
        checkpoint: &Checkpoint,
        queues: &mut WatchedQueues,
    ) -> crate::Result<Observation> {
        let attributes = self
            .cloud
            .queues
            .get_queue_attributes(&queues.queue_url)
            .await?;
        if queues.dead_letter_url.is_none() {
            let url = self
                .locate_dead_letter_queue(&checkpoint.queue_name, &attributes)
                .await?;
            queues.dead_letter_url = Some(url);
        }
        let dead_letter = match queues.dead_letter_url.as_ref().and_then(|url| url.as_deref()) {
            Some(url) => self.cloud.queues.get_queue_attributes(url).await?.depth(),
            None => 0,
        };
        let instances = self
            .cloud
            .fleet
            .describe_fleet_instances(&checkpoint.fleet_request_id)
            .await?;
        Ok(Observation {
            visible: attributes.visible,
            in_flight: attributes.in_flight,
            dead_letter,
            active_instances: instances.len() as u32,
        })
    }

    fn report(&self, previous: Option<&Observation>, current: &Observation) {
        let queue_changed = previous.is_none_or(|p| {
            (p.visible, p.in_flight, p.active_instances)
                != (current.visible, current.in_flight, current.active_instances)
        });
        if queue_changed {
            log::info!(
                "Queue: {} visible, {} in flight; {} active instance(s)",
                current.visible,
                current.in_flight,
                current.active_instances
            );
        }
        let dead_letter_changed = previous.is_none_or(|p| p.dead_letter != current.dead_letter);
        if current.dead_letter > 0 && dead_letter_changed {
            log::warn!(
                "{} message(s) failed repeatedly and were moved to the dead letter queue",
                current.dead_letter
            );
        }
    }

    /// Observes the cluster every cycle until it is drained.
    ///
    /// Fails with [`FleetError::NoActiveCluster`] without a checkpoint and with
    /// [`FleetError::InstancesLost`] when the instances disappear before the work is done.
    pub async fn run(&self) -> crate::Result<MonitorOutcome> {
        let checkpoint = self.checkpoints.require()?;
        log::info!(
            "Monitoring fleet {} of application {}",
            checkpoint.fleet_request_id,
            checkpoint.app_name
        );
        let queue_url = self
            .cloud
            .queues
            .get_queue_url(&checkpoint.queue_name)
            .await?
            .ok_or_else(|| FleetError::QueueUnavailable(checkpoint.queue_name.clone()))?;
        let mut queues = WatchedQueues {
            queue_url,
            dead_letter_url: None,
        };

        let mut poll = self.poll.start();
        let mut previous: Option<Observation> = None;
        loop {
            let cycle = poll.attempt();
            let observation = self.observe(&checkpoint, &mut queues).await?;
            self.report(previous.as_ref(), &observation);

            match decide(&observation) {
                Decision::Drained => {
                    log::info!("Queue is empty and all instances are gone, cluster is drained");
                    return Ok(MonitorOutcome::Drained { cycles: cycle });
                }
                Decision::InstancesLost => {
                    return Err(FleetError::InstancesLost {
                        request_id: checkpoint.fleet_request_id.clone(),
                        remaining: observation.queue_depth(),
                    });
                }
                Decision::Continue => {}
            }
            if poll.is_exhausted() {
                return Ok(MonitorOutcome::CycleLimitReached { cycles: cycle });
            }
            previous = Some(observation);
            poll.sleep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterMonitor, Decision, MonitorOutcome, Observation, decide};
    use crate::cluster::checkpoint::CheckpointStore;
    use crate::common::error::FleetError;
    use crate::common::poll::PollPolicy;
    use crate::tests::cloud::FakeCloud;
    use crate::tests::utils::{launched_cluster, test_config};
    use tempfile::TempDir;

    fn observation(depth: u64, dead_letter: u64, active_instances: u32) -> Observation {
        Observation {
            visible: depth,
            in_flight: 0,
            dead_letter,
            active_instances,
        }
    }

    #[test]
    fn decisions() {
        assert_eq!(decide(&observation(5, 0, 2)), Decision::Continue);
        assert_eq!(decide(&observation(0, 0, 2)), Decision::Continue);
        assert_eq!(decide(&observation(0, 3, 1)), Decision::Continue);
        assert_eq!(decide(&observation(0, 3, 0)), Decision::Drained);
        assert_eq!(decide(&observation(0, 0, 0)), Decision::Drained);
        assert_eq!(decide(&observation(1, 0, 0)), Decision::InstancesLost);

        let in_flight = Observation {
            visible: 0,
            in_flight: 2,
            dead_letter: 0,
            active_instances: 0,
        };
        assert_eq!(decide(&in_flight), Decision::InstancesLost);
    }

    #[tokio::test]
    async fn fail_without_checkpoint() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let cloud = fake.bundle();
        let config = test_config();
        let monitor = ClusterMonitor::new(
            &cloud,
            CheckpointStore::for_app(dir.path(), &config.app_name),
            PollPolicy::no_wait(),
        );
        assert!(matches!(
            monitor.run().await,
            Err(FleetError::NoActiveCluster(_))
        ));
    }

    async fn monitor_launched(
        depth: &[u64],
        dead_letter: &[u64],
        instances: &[u32],
        poll: PollPolicy,
    ) -> crate::Result<MonitorOutcome> {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let (config, _) = launched_cluster(&fake, dir.path()).await;
        fake.script_depth(&config.queue_name(), depth);
        fake.script_depth(&config.dead_letter_queue(), dead_letter);
        fake.script_instances(instances);

        let cloud = fake.bundle();
        let store = CheckpointStore::for_app(dir.path(), &config.app_name);
        let result = ClusterMonitor::new(&cloud, store.clone(), poll).run().await;
        // The monitor never removes the checkpoint
        assert!(store.read().unwrap().is_some());
        result
    }

    #[tokio::test]
    async fn detect_drain() {
        let result =
            monitor_launched(&[5, 3, 1, 0], &[0], &[2, 2, 1, 0], PollPolicy::no_wait()).await;
        assert_eq!(result.unwrap(), MonitorOutcome::Drained { cycles: 4 });
    }

    #[tokio::test]
    async fn empty_queue_waits_for_instances() {
        let result =
            monitor_launched(&[0], &[0], &[3, 2, 2, 1, 0], PollPolicy::no_wait()).await;
        assert_eq!(result.unwrap(), MonitorOutcome::Drained { cycles: 5 });
    }

    #[tokio::test]
    async fn dead_letters_do_not_stop_monitoring() {
        let result =
            monitor_launched(&[2, 1, 0], &[1, 2], &[1, 1, 0], PollPolicy::no_wait()).await;
        assert_eq!(result.unwrap(), MonitorOutcome::Drained { cycles: 3 });
    }

    #[tokio::test]
    async fn report_lost_instances() {
        let result = monitor_launched(&[4], &[0], &[2, 0], PollPolicy::no_wait()).await;
        match result {
            Err(FleetError::InstancesLost { remaining, .. }) => assert_eq!(remaining, 4),
            other => panic!("Unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_at_cycle_limit() {
        let result = monitor_launched(
            &[5],
            &[0],
            &[2],
            PollPolicy::no_wait().with_max_attempts(3),
        )
        .await;
        assert_eq!(
            result.unwrap(),
            MonitorOutcome::CycleLimitReached { cycles: 3 }
        );
    }
}
