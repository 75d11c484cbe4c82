//! Interfaces of the cloud services that a cluster is built from.
//!
//! Each service is represented by a handler trait. The [`awscli`] module implements all of them
//! on top of the `aws` command line tool; tests replace them with an in-memory fake.
pub mod awscli;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};

use crate::cluster::fleet::FleetRequest;
use crate::cluster::taskdef::TaskDefinition;

pub type CloudResult<T> = anyhow::Result<T>;
pub type CloudFuture<'a, T> = LocalBoxFuture<'a, CloudResult<T>>;

pub type QueueAttributeMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedrivePolicy {
    #[serde(rename = "deadLetterTargetArn")]
    pub dead_letter_target_arn: String,
    #[serde(rename = "maxReceiveCount", with = "string_number")]
    pub max_receive_count: u32,
}

/// `maxReceiveCount` is a string in requests but a number in some responses.
mod string_number {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Value {
            Number(u32),
            String(String),
        }
        match Value::deserialize(deserializer)? {
            Value::Number(n) => Ok(n),
            Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueAttributes {
    pub arn: Option<String>,
    /// Messages waiting to be received.
    pub visible: u64,
    /// Messages received by a worker but not yet deleted.
    pub in_flight: u64,
    pub redrive_policy: Option<RedrivePolicy>,
}

impl QueueAttributes {
    pub fn depth(&self) -> u64 {
        self.visible + self.in_flight
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescription {
    pub name: String,
    pub status: String,
    pub desired_count: u32,
    pub running_count: u32,
}

impl ServiceDescription {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetInstance {
    pub instance_id: String,
    pub instance_type: String,
    pub health: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetRequestStatus {
    /// Provider state of the request (`submitted`, `active`, `cancelled`, ...).
    pub state: String,
    pub target_capacity: u32,
}

impl FleetRequestStatus {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self.state.as_str(),
            "failed" | "cancelled" | "cancelled_running" | "cancelled_terminating"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetHistoryError {
    pub sub_type: String,
    pub description: String,
}

pub trait QueueService {
    /// Creates a queue and returns its URL.
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        attributes: &'a QueueAttributeMap,
    ) -> CloudFuture<'a, String>;

    fn get_queue_url<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<String>>;

    fn get_queue_attributes<'a>(&'a self, queue_url: &'a str) -> CloudFuture<'a, QueueAttributes>;

    fn set_queue_attributes<'a>(
        &'a self,
        queue_url: &'a str,
        attributes: &'a QueueAttributeMap,
    ) -> CloudFuture<'a, ()>;

    /// Sends a message and returns its ID.
    fn send_message<'a>(&'a self, queue_url: &'a str, body: &'a str) -> CloudFuture<'a, String>;
}

pub trait ContainerService {
    /// Returns ARNs of all clusters.
    fn list_clusters(&self) -> CloudFuture<'_, Vec<String>>;

    fn create_cluster<'a>(&'a self, name: &'a str) -> CloudFuture<'a, String>;

    /// Returns ARNs of active revisions of the given task family.
    fn list_task_definitions<'a>(&'a self, family: &'a str) -> CloudFuture<'a, Vec<String>>;

    fn register_task_definition<'a>(
        &'a self,
        definition: &'a TaskDefinition,
    ) -> CloudFuture<'a, String>;

    /// Returns ARNs of all services of a cluster.
    fn list_services<'a>(&'a self, cluster: &'a str) -> CloudFuture<'a, Vec<String>>;

    fn create_service<'a>(
        &'a self,
        cluster: &'a str,
        service: &'a str,
        task_definition: &'a str,
        desired_count: u32,
    ) -> CloudFuture<'a, String>;

    fn update_service<'a>(
        &'a self,
        cluster: &'a str,
        service: &'a str,
        desired_count: u32,
    ) -> CloudFuture<'a, ()>;

    fn describe_services<'a>(
        &'a self,
        cluster: &'a str,
        services: &'a [String],
    ) -> CloudFuture<'a, Vec<ServiceDescription>>;
}

pub trait FleetService {
    /// Submits a fleet request and returns its ID.
    fn request_fleet<'a>(&'a self, request: &'a FleetRequest) -> CloudFuture<'a, String>;

    fn describe_fleet_request<'a>(
        &'a self,
        request_id: &'a str,
    ) -> CloudFuture<'a, Option<FleetRequestStatus>>;

    fn describe_fleet_instances<'a>(
        &'a self,
        request_id: &'a str,
    ) -> CloudFuture<'a, Vec<FleetInstance>>;

    /// Error events recorded for the request since `since`.
    fn describe_fleet_history_errors<'a>(
        &'a self,
        request_id: &'a str,
        since: DateTime<Utc>,
    ) -> CloudFuture<'a, Vec<FleetHistoryError>>;

    fn cancel_fleet_request<'a>(
        &'a self,
        request_id: &'a str,
        terminate_instances: bool,
    ) -> CloudFuture<'a, ()>;
}

pub trait LogService {
    /// Returns names of log groups starting with `prefix`.
    fn describe_log_groups<'a>(&'a self, prefix: &'a str) -> CloudFuture<'a, Vec<String>>;

    fn create_log_group<'a>(&'a self, name: &'a str) -> CloudFuture<'a, ()>;

    fn put_retention_policy<'a>(&'a self, name: &'a str, days: u32) -> CloudFuture<'a, ()>;
}

pub trait StorageService {
    fn list_buckets(&self) -> CloudFuture<'_, Vec<String>>;

    fn create_bucket<'a>(&'a self, name: &'a str, region: &'a str) -> CloudFuture<'a, ()>;

    fn put_object<'a>(&'a self, bucket: &'a str, key: &'a str, data: &'a [u8])
    -> CloudFuture<'a, ()>;

    fn get_object<'a>(&'a self, bucket: &'a str, key: &'a str)
    -> CloudFuture<'a, Option<Vec<u8>>>;
}

/// Handles to every service used by a cluster.
pub struct Cloud {
    pub queues: Box<dyn QueueService>,
    pub containers: Box<dyn ContainerService>,
    pub fleet: Box<dyn FleetService>,
    pub logs: Box<dyn LogService>,
    pub storage: Box<dyn StorageService>,
}

impl Cloud {
    pub fn aws(cli: awscli::AwsCli) -> Self {
        Self {
            queues: Box::new(cli.clone()),
            containers: Box::new(cli.clone()),
            fleet: Box::new(cli.clone()),
            logs: Box::new(cli.clone()),
            storage: Box::new(cli),
        }
    }
}

/// Returns the last component of an ARN or URL (`.../name` or `...:name`).
pub fn resource_name(identifier: &str) -> &str {
    identifier
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(identifier)
}
