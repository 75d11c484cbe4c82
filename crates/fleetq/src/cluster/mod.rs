//! Lifecycle of a disposable queue driven cluster.
//!
//! [`reconcile::ResourceReconciler`] converges the long lived resources (queues, container
//! cluster, task definition, service, bucket), [`jobqueue::JobQueue`] fills the work queue,
//! [`launcher::FleetLauncher`] starts a spot fleet that consumes it and records a
//! [`checkpoint::Checkpoint`], which [`monitor::ClusterMonitor`] uses to watch the cluster until
//! the queue is drained. [`teardown`] removes the running part again.
pub mod checkpoint;
pub mod fleet;
pub mod jobqueue;
pub mod launcher;
pub mod monitor;
pub mod reconcile;
pub mod taskdef;
pub mod teardown;

/// Identifiers of the reconciled resources of one application.
///
/// A field is `None` until the resource is known to exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    pub queue_url: Option<String>,
    pub dead_letter_queue_url: Option<String>,
    pub dead_letter_queue_arn: Option<String>,
    pub cluster_arn: Option<String>,
    pub task_definition_arn: Option<String>,
    pub service_arn: Option<String>,
    pub bucket: Option<String>,
}

impl ResourceSet {
    /// Names of the resources that do not exist yet.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("queue", self.queue_url.is_none()),
            ("dead letter queue", self.dead_letter_queue_url.is_none()),
            ("cluster", self.cluster_arn.is_none()),
            ("task definition", self.task_definition_arn.is_none()),
            ("service", self.service_arn.is_none()),
            ("bucket", self.bucket.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, missing)| missing.then_some(name))
        .collect()
    }
}
