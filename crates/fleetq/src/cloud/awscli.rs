use std::path::PathBuf;
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;

use crate::cloud::{
    CloudFuture, CloudResult, ContainerService, FleetHistoryError, FleetInstance,
    FleetRequestStatus, FleetService, LogService, QueueAttributeMap, QueueAttributes,
    QueueService, RedrivePolicy, ServiceDescription, StorageService, resource_name,
};
use crate::cluster::fleet::FleetRequest;
use crate::cluster::taskdef::TaskDefinition;

/// Talks to AWS by running the `aws` command line tool with JSON output.
#[derive(Clone, Debug)]
pub struct AwsCli {
    program: PathBuf,
    region: String,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(region: String, profile: Option<String>) -> Self {
        Self {
            program: PathBuf::from("aws"),
            region,
            profile,
        }
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    fn create_command(&self, arguments: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(arguments);
        command.args(["--output", "json", "--region", &self.region]);
        if let Some(profile) = &self.profile {
            command.args(["--profile", profile]);
        }
        command
    }

    async fn run(&self, arguments: Vec<String>) -> CloudResult<Output> {
        let description = arguments.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        log::debug!("Running command `aws {}`", arguments.join(" "));

        let output = self
            .create_command(&arguments)
            .output()
            .await
            .with_context(|| format!("aws {description} start failed"))?;
        let output = check_command_output(output)
            .with_context(|| format!("aws {description} execution failed"))?;

        log::trace!(
            "aws {description} output\nStdout\n{}Stderr\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(output)
    }

    /// Runs the command and parses its JSON output.
    async fn call<T: DeserializeOwned + Default>(&self, arguments: Vec<String>) -> CloudResult<T> {
        let output = self.run(arguments).await?;
        parse_output(&output.stdout)
    }
}

fn args<const N: usize>(arguments: [&str; N]) -> Vec<String> {
    arguments.iter().map(|s| s.to_string()).collect()
}

pub fn check_command_output(output: Output) -> CloudResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Commands without a response body print nothing.
fn parse_output<T: DeserializeOwned + Default>(stdout: &[u8]) -> CloudResult<T> {
    if stdout.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(stdout).context("Cannot parse aws JSON output")
}

/// Returns true if the command failed because the addressed resource does not exist.
fn is_not_found(error: &anyhow::Error, codes: &[&str]) -> bool {
    let message = format!("{error:#}");
    codes.iter().any(|code| message.contains(code))
}

// Response shapes

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ListQueuesResponse {
    queue_urls: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct CreateQueueResponse {
    queue_url: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct QueueAttributesResponse {
    attributes: QueueAttributeMap,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct SendMessageResponse {
    message_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListClustersResponse {
    cluster_arns: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ClusterResponse {
    cluster: ClusterDescription,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ClusterDescription {
    cluster_arn: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListTaskDefinitionsResponse {
    task_definition_arns: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RegisterTaskDefinitionResponse {
    task_definition: RegisteredTaskDefinition,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RegisteredTaskDefinition {
    task_definition_arn: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListServicesResponse {
    service_arns: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ServiceResponse {
    service: ServiceData,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DescribeServicesResponse {
    services: Vec<ServiceData>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ServiceData {
    service_arn: String,
    service_name: String,
    status: String,
    desired_count: u32,
    running_count: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct RequestFleetResponse {
    spot_fleet_request_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct DescribeFleetRequestsResponse {
    spot_fleet_request_configs: Vec<FleetRequestConfigData>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct FleetRequestConfigData {
    spot_fleet_request_state: String,
    spot_fleet_request_config: FleetRequestConfigShape,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct FleetRequestConfigShape {
    target_capacity: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct FleetInstancesResponse {
    active_instances: Vec<ActiveInstanceData>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ActiveInstanceData {
    instance_id: String,
    instance_type: String,
    instance_health: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct FleetHistoryResponse {
    history_records: Vec<HistoryRecordData>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct HistoryRecordData {
    event_information: EventInformationData,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct EventInformationData {
    event_sub_type: String,
    event_description: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DescribeLogGroupsResponse {
    log_groups: Vec<LogGroupData>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LogGroupData {
    log_group_name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct ListBucketsResponse {
    buckets: Vec<BucketData>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct BucketData {
    name: String,
}

pub fn parse_queue_attributes(attributes: &QueueAttributeMap) -> CloudResult<QueueAttributes> {
    let count = |key: &str| -> CloudResult<u64> {
        attributes
            .get(key)
            .map(|value| {
                value
                    .parse::<u64>()
                    .with_context(|| format!("Invalid queue attribute {key}={value}"))
            })
            .transpose()
            .map(|value| value.unwrap_or(0))
    };
    let redrive_policy = attributes
        .get("RedrivePolicy")
        .map(|policy| {
            serde_json::from_str::<RedrivePolicy>(policy).context("Invalid redrive policy")
        })
        .transpose()?;

    Ok(QueueAttributes {
        arn: attributes.get("QueueArn").cloned(),
        visible: count("ApproximateNumberOfMessages")?,
        in_flight: count("ApproximateNumberOfMessagesNotVisible")?,
        redrive_policy,
    })
}

impl QueueService for AwsCli {
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        attributes: &'a QueueAttributeMap,
    ) -> CloudFuture<'a, String> {
        async move {
            let mut arguments = args(["sqs", "create-queue", "--queue-name", name]);
            if !attributes.is_empty() {
                arguments.push("--attributes".to_string());
                arguments.push(serde_json::to_string(attributes)?);
            }
            let response: CreateQueueResponse = self.call(arguments).await?;
            Ok(response.queue_url)
        }
        .boxed_local()
    }

    fn get_queue_url<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<String>> {
        async move {
            // A prefix listing also returns longer names, so compare the last URL component.
            let response: ListQueuesResponse = self
                .call(args(["sqs", "list-queues", "--queue-name-prefix", name]))
                .await?;
            Ok(response
                .queue_urls
                .into_iter()
                .find(|url| resource_name(url) == name))
        }
        .boxed_local()
    }

    fn get_queue_attributes<'a>(&'a self, queue_url: &'a str) -> CloudFuture<'a, QueueAttributes> {
        async move {
            let response: QueueAttributesResponse = self
                .call(args([
                    "sqs",
                    "get-queue-attributes",
                    "--queue-url",
                    queue_url,
                    "--attribute-names",
                    "All",
                ]))
                .await?;
            parse_queue_attributes(&response.attributes)
        }
        .boxed_local()
    }

    fn set_queue_attributes<'a>(
        &'a self,
        queue_url: &'a str,
        attributes: &'a QueueAttributeMap,
    ) -> CloudFuture<'a, ()> {
        async move {
            let mut arguments = args(["sqs", "set-queue-attributes", "--queue-url", queue_url]);
            arguments.push("--attributes".to_string());
            arguments.push(serde_json::to_string(attributes)?);
            self.run(arguments).await?;
            Ok(())
        }
        .boxed_local()
    }

    fn send_message<'a>(&'a self, queue_url: &'a str, body: &'a str) -> CloudFuture<'a, String> {
        async move {
            let response: SendMessageResponse = self
                .call(args([
                    "sqs",
                    "send-message",
                    "--queue-url",
                    queue_url,
                    "--message-body",
                    body,
                ]))
                .await?;
            Ok(response.message_id)
        }
        .boxed_local()
    }
}

impl ContainerService for AwsCli {
    fn list_clusters(&self) -> CloudFuture<'_, Vec<String>> {
        async move {
            let response: ListClustersResponse = self.call(args(["ecs", "list-clusters"])).await?;
            Ok(response.cluster_arns)
        }
        .boxed_local()
    }

    fn create_cluster<'a>(&'a self, name: &'a str) -> CloudFuture<'a, String> {
        async move {
            let response: ClusterResponse = self
                .call(args(["ecs", "create-cluster", "--cluster-name", name]))
                .await?;
            Ok(response.cluster.cluster_arn)
        }
        .boxed_local()
    }

    fn list_task_definitions<'a>(&'a self, family: &'a str) -> CloudFuture<'a, Vec<String>> {
        async move {
            let response: ListTaskDefinitionsResponse = self
                .call(args([
                    "ecs",
                    "list-task-definitions",
                    "--family-prefix",
                    family,
                    "--status",
                    "ACTIVE",
                ]))
                .await?;
            Ok(response.task_definition_arns)
        }
        .boxed_local()
    }

    fn register_task_definition<'a>(
        &'a self,
        definition: &'a TaskDefinition,
    ) -> CloudFuture<'a, String> {
        async move {
            let input = serde_json::to_string(definition)?;
            let response: RegisterTaskDefinitionResponse = self
                .call(args([
                    "ecs",
                    "register-task-definition",
                    "--cli-input-json",
                    &input,
                ]))
                .await?;
            Ok(response.task_definition.task_definition_arn)
        }
        .boxed_local()
    }

    fn list_services<'a>(&'a self, cluster: &'a str) -> CloudFuture<'a, Vec<String>> {
        async move {
            let response: ListServicesResponse = self
                .call(args(["ecs", "list-services", "--cluster", cluster]))
                .await?;
            Ok(response.service_arns)
        }
        .boxed_local()
    }

    fn create_service<'a>(
        &'a self,
        cluster: &'a str,
        service: &'a str,
        task_definition: &'a str,
        desired_count: u32,
    ) -> CloudFuture<'a, String> {
        async move {
            let response: ServiceResponse = self
                .call(args([
                    "ecs",
                    "create-service",
                    "--cluster",
                    cluster,
                    "--service-name",
                    service,
                    "--task-definition",
                    task_definition,
                    "--desired-count",
                    &desired_count.to_string(),
                ]))
                .await?;
            Ok(response.service.service_arn)
        }
        .boxed_local()
    }

    fn update_service<'a>(
        &'a self,
        cluster: &'a str,
        service: &'a str,
        desired_count: u32,
    ) -> CloudFuture<'a, ()> {
        async move {
            self.run(args([
                "ecs",
                "update-service",
                "--cluster",
                cluster,
                "--service",
                service,
                "--desired-count",
                &desired_count.to_string(),
            ]))
            .await?;
            Ok(())
        }
        .boxed_local()
    }

    fn describe_services<'a>(
        &'a self,
        cluster: &'a str,
        services: &'a [String],
    ) -> CloudFuture<'a, Vec<ServiceDescription>> {
        async move {
            let mut arguments = args(["ecs", "describe-services", "--cluster", cluster]);
            arguments.push("--services".to_string());
            arguments.extend(services.iter().cloned());

            let response: DescribeServicesResponse = self.call(arguments).await?;
            Ok(response
                .services
                .into_iter()
                .map(|service| ServiceDescription {
                    name: service.service_name,
                    status: service.status,
                    desired_count: service.desired_count,
                    running_count: service.running_count,
                })
                .collect())
        }
        .boxed_local()
    }
}

impl FleetService for AwsCli {
    fn request_fleet<'a>(&'a self, request: &'a FleetRequest) -> CloudFuture<'a, String> {
        async move {
            let config = serde_json::to_string(request)?;
            let response: RequestFleetResponse = self
                .call(args([
                    "ec2",
                    "request-spot-fleet",
                    "--spot-fleet-request-config",
                    &config,
                ]))
                .await?;
            if response.spot_fleet_request_id.is_empty() {
                anyhow::bail!("Fleet request response does not contain a request ID");
            }
            Ok(response.spot_fleet_request_id)
        }
        .boxed_local()
    }

    fn describe_fleet_request<'a>(
        &'a self,
        request_id: &'a str,
    ) -> CloudFuture<'a, Option<FleetRequestStatus>> {
        async move {
            let response: DescribeFleetRequestsResponse = match self
                .call(args([
                    "ec2",
                    "describe-spot-fleet-requests",
                    "--spot-fleet-request-ids",
                    request_id,
                ]))
                .await
            {
                Ok(response) => response,
                Err(error) if is_not_found(&error, &["InvalidSpotFleetRequestId"]) => {
                    return Ok(None);
                }
                Err(error) => return Err(error),
            };
            Ok(response
                .spot_fleet_request_configs
                .into_iter()
                .next()
                .map(|config| FleetRequestStatus {
                    state: config.spot_fleet_request_state,
                    target_capacity: config.spot_fleet_request_config.target_capacity,
                }))
        }
        .boxed_local()
    }

    fn describe_fleet_instances<'a>(
        &'a self,
        request_id: &'a str,
    ) -> CloudFuture<'a, Vec<FleetInstance>> {
        async move {
            let response: FleetInstancesResponse = self
                .call(args([
                    "ec2",
                    "describe-spot-fleet-instances",
                    "--spot-fleet-request-id",
                    request_id,
                ]))
                .await?;
            Ok(response
                .active_instances
                .into_iter()
                .map(|instance| FleetInstance {
                    instance_id: instance.instance_id,
                    instance_type: instance.instance_type,
                    health: instance.instance_health,
                })
                .collect())
        }
        .boxed_local()
    }

    fn describe_fleet_history_errors<'a>(
        &'a self,
        request_id: &'a str,
        since: DateTime<Utc>,
    ) -> CloudFuture<'a, Vec<FleetHistoryError>> {
        async move {
            let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
            let response: FleetHistoryResponse = self
                .call(args([
                    "ec2",
                    "describe-spot-fleet-request-history",
                    "--spot-fleet-request-id",
                    request_id,
                    "--event-type",
                    "error",
                    "--start-time",
                    &since,
                ]))
                .await?;
            Ok(response
                .history_records
                .into_iter()
                .map(|record| FleetHistoryError {
                    sub_type: record.event_information.event_sub_type,
                    description: record.event_information.event_description,
                })
                .collect())
        }
        .boxed_local()
    }

    fn cancel_fleet_request<'a>(
        &'a self,
        request_id: &'a str,
        terminate_instances: bool,
    ) -> CloudFuture<'a, ()> {
        async move {
            let terminate = if terminate_instances {
                "--terminate-instances"
            } else {
                "--no-terminate-instances"
            };
            self.run(args([
                "ec2",
                "cancel-spot-fleet-requests",
                "--spot-fleet-request-ids",
                request_id,
                terminate,
            ]))
            .await?;
            Ok(())
        }
        .boxed_local()
    }
}

impl LogService for AwsCli {
    fn describe_log_groups<'a>(&'a self, prefix: &'a str) -> CloudFuture<'a, Vec<String>> {
        async move {
            let response: DescribeLogGroupsResponse = self
                .call(args([
                    "logs",
                    "describe-log-groups",
                    "--log-group-name-prefix",
                    prefix,
                ]))
                .await?;
            Ok(response
                .log_groups
                .into_iter()
                .map(|group| group.log_group_name)
                .collect())
        }
        .boxed_local()
    }

    fn create_log_group<'a>(&'a self, name: &'a str) -> CloudFuture<'a, ()> {
        async move {
            self.run(args(["logs", "create-log-group", "--log-group-name", name]))
                .await?;
            Ok(())
        }
        .boxed_local()
    }

    fn put_retention_policy<'a>(&'a self, name: &'a str, days: u32) -> CloudFuture<'a, ()> {
        async move {
            self.run(args([
                "logs",
                "put-retention-policy",
                "--log-group-name",
                name,
                "--retention-in-days",
                &days.to_string(),
            ]))
            .await?;
            Ok(())
        }
        .boxed_local()
    }
}

impl StorageService for AwsCli {
    fn list_buckets(&self) -> CloudFuture<'_, Vec<String>> {
        async move {
            let response: ListBucketsResponse = self.call(args(["s3api", "list-buckets"])).await?;
            Ok(response.buckets.into_iter().map(|b| b.name).collect())
        }
        .boxed_local()
    }

    fn create_bucket<'a>(&'a self, name: &'a str, region: &'a str) -> CloudFuture<'a, ()> {
        async move {
            let mut arguments = args(["s3api", "create-bucket", "--bucket", name]);
            // us-east-1 is the default location and is rejected as a location constraint
            if region != "us-east-1" {
                arguments.push("--create-bucket-configuration".to_string());
                arguments.push(format!("LocationConstraint={region}"));
            }
            self.run(arguments).await?;
            Ok(())
        }
        .boxed_local()
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: &'a [u8],
    ) -> CloudFuture<'a, ()> {
        async move {
            let file = tempfile::NamedTempFile::with_prefix("fleetq")?;
            std::fs::write(file.path(), data)
                .with_context(|| format!("Cannot write object into {}", file.path().display()))?;
            let body = file.path().display().to_string();
            self.run(args([
                "s3api",
                "put-object",
                "--bucket",
                bucket,
                "--key",
                key,
                "--body",
                &body,
            ]))
            .await?;
            Ok(())
        }
        .boxed_local()
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> CloudFuture<'a, Option<Vec<u8>>> {
        async move {
            let directory = tempfile::TempDir::with_prefix("fleetq")?;
            let target = directory.path().join("object");
            let target_str = target.display().to_string();
            match self
                .run(args([
                    "s3api",
                    "get-object",
                    "--bucket",
                    bucket,
                    "--key",
                    key,
                    &target_str,
                ]))
                .await
            {
                Ok(_) => Ok(Some(std::fs::read(&target)?)),
                Err(error) if is_not_found(&error, &["NoSuchKey", "Not Found"]) => Ok(None),
                Err(error) => Err(error),
            }
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::{AwsCli, ListQueuesResponse, parse_output, parse_queue_attributes};
    use crate::cloud::{QueueAttributeMap, QueueService};
    use std::path::PathBuf;

    #[test]
    fn empty_output_is_default() {
        let response: ListQueuesResponse = parse_output(b"\n").unwrap();
        assert!(response.queue_urls.is_empty());
    }

    #[test]
    fn parse_attributes() {
        let mut map = QueueAttributeMap::new();
        map.insert("QueueArn".into(), "arn:aws:sqs:us-east-1:1:Q".into());
        map.insert("ApproximateNumberOfMessages".into(), "3".into());
        map.insert("ApproximateNumberOfMessagesNotVisible".into(), "2".into());
        map.insert(
            "RedrivePolicy".into(),
            r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:1:D","maxReceiveCount":10}"#.into(),
        );
        let attributes = parse_queue_attributes(&map).unwrap();
        assert_eq!(attributes.depth(), 5);
        assert_eq!(
            attributes.redrive_policy.unwrap().dead_letter_target_arn,
            "arn:aws:sqs:us-east-1:1:D"
        );
    }

    #[test]
    fn parse_invalid_count() {
        let mut map = QueueAttributeMap::new();
        map.insert("ApproximateNumberOfMessages".into(), "many".into());
        assert!(parse_queue_attributes(&map).is_err());
    }

    #[tokio::test]
    async fn failed_command_reports_error() {
        let cli = AwsCli::new("us-east-1".into(), None)
            .with_program(PathBuf::from("/nonexistent/fleetq-aws"));
        let error = cli.get_queue_url("queue").await.unwrap_err();
        assert!(format!("{error:#}").contains("sqs list-queues start failed"));
    }
}
