//! The fleet request document and the bootstrap data embedded into every instance.
//!
//! The operator provides a fleet template (a JSON file with the account specific parts: fleet
//! role, instance profile, image, network placement and volumes). The launcher fills in the
//! capacity, price, validity window, instance types and bootstrap data derived from the
//! application configuration.
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::config::AppConfig;
use crate::common::error::FleetError;

/// Fields of a template that are always computed from the configuration.
const COMPUTED_FIELDS: [&str; 4] = ["ValidFrom", "ValidUntil", "TargetCapacity", "SpotPrice"];
const FLEET_VALIDITY_DAYS: i64 = 365;
const MIME_BOUNDARY: &str = "==BOUNDARY==";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IamInstanceProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EbsVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockDeviceMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs: Option<EbsVolume>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchSpecification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<IamInstanceProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Account specific part of a fleet request, loaded from the fleet file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FleetTemplate {
    #[serde(default)]
    pub iam_fleet_role: Option<String>,
    #[serde(default)]
    pub launch_specifications: Vec<LaunchSpecification>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Complete fleet request, as submitted to the fleet service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FleetRequest {
    pub iam_fleet_role: String,
    pub valid_from: String,
    pub valid_until: String,
    pub target_capacity: u32,
    pub spot_price: String,
    pub launch_specifications: Vec<LaunchSpecification>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FleetTemplate {
    pub fn parse(data: &str) -> crate::Result<Self> {
        serde_json::from_str(data)
            .map_err(|error| FleetError::InvalidFleetConfig(format!("Cannot parse fleet file: {error}")))
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|error| {
            FleetError::InvalidFleetConfig(format!(
                "Cannot read fleet file {}: {error}",
                path.display()
            ))
        })?;
        Self::parse(&data)
    }
}

/// Storage key of the container agent configuration of an application.
pub fn ecs_config_key(app_name: &str) -> String {
    format!("ecsconfigs/{app_name}_ecs.config")
}

/// Container agent configuration that joins an instance to `cluster`.
pub fn ecs_config_blob(cluster: &str) -> String {
    format!("ECS_CLUSTER={cluster}\nECS_AVAILABLE_LOGGING_DRIVERS=[\"json-file\",\"awslogs\"]")
}

pub fn object_endpoint(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// Docker storage per container in GB, leaving headroom on the data volume.
pub fn docker_base_size(ebs_vol_size: u32, tasks_per_machine: u32) -> crate::Result<u32> {
    let share = (f64::from(ebs_vol_size) / f64::from(tasks_per_machine)).round() as i64;
    let size = share - 2;
    if size < 1 {
        return Err(FleetError::InvalidFleetConfig(format!(
            "Volume of {ebs_vol_size} GB is too small for {tasks_per_machine} task(s) per machine"
        )));
    }
    Ok(size as u32)
}

/// Multipart cloud-init document executed when an instance boots.
pub fn user_data(config_endpoint: &str, base_size: u32) -> String {
    format!(
        "Content-Type: multipart/mixed; boundary=\"{MIME_BOUNDARY}\"\n\
MIME-Version: 1.0\n\
\n\
--{MIME_BOUNDARY}\n\
Content-Type: text/cloud-boothook; charset=\"us-ascii\"\n\
\n\
#cloud-boothook\n\
cloud-init-per once docker_options echo 'OPTIONS=\"${{OPTIONS}} --storage-opt dm.basesize={base_size}G\"' >> /etc/sysconfig/docker\n\
\n\
--{MIME_BOUNDARY}\n\
Content-Type: text/x-shellscript; charset=\"us-ascii\"\n\
\n\
#!/bin/bash\n\
sudo yum install -y aws-cli\n\
sudo yum install -y awslogs\n\
aws s3 cp {config_endpoint} /etc/ecs/ecs.config\n\
\n\
--{MIME_BOUNDARY}--\n"
    )
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn invalid<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(FleetError::InvalidFleetConfig(message.into()))
}

fn validate_specification(index: usize, spec: &LaunchSpecification) -> crate::Result<()> {
    let profile_ok = spec
        .iam_instance_profile
        .as_ref()
        .is_some_and(|profile| profile.arn.is_some() || profile.name.is_some());
    if !profile_ok {
        return invalid(format!("Launch specification {index} has no IamInstanceProfile"));
    }
    if spec.image_id.as_deref().is_none_or(str::is_empty) {
        return invalid(format!("Launch specification {index} has no ImageId"));
    }
    if spec.network_interfaces.is_empty() {
        return invalid(format!("Launch specification {index} has no NetworkInterfaces"));
    }
    for interface in &spec.network_interfaces {
        if interface.subnet_id.is_none() || interface.groups.is_empty() {
            return invalid(format!(
                "Every network interface of launch specification {index} needs a SubnetId and Groups"
            ));
        }
    }
    let root_snapshot = spec
        .block_device_mappings
        .first()
        .and_then(|mapping| mapping.ebs.as_ref())
        .and_then(|ebs| ebs.snapshot_id.as_ref());
    if root_snapshot.is_none() {
        return invalid(format!(
            "The first block device of launch specification {index} must be created from a SnapshotId"
        ));
    }
    if spec.block_device_mappings.len() < 2 {
        return invalid(format!(
            "Launch specification {index} needs a second block device for data"
        ));
    }
    Ok(())
}

/// Fills the template with the values derived from the configuration.
///
/// There is one launch specification per configured machine type. Types without a matching
/// template specification reuse the first one.
pub fn build_fleet_request(
    template: &FleetTemplate,
    config: &AppConfig,
    config_endpoint: &str,
    now: DateTime<Utc>,
) -> crate::Result<FleetRequest> {
    let Some(iam_fleet_role) = template.iam_fleet_role.clone() else {
        return invalid("The fleet file has no IamFleetRole");
    };
    if template.launch_specifications.is_empty() {
        return invalid("The fleet file has no LaunchSpecifications");
    }
    if template.launch_specifications.len() > config.machine_types.len() {
        log::warn!(
            "The fleet file has {} launch specifications but only {} machine type(s) are configured, extra specifications are ignored",
            template.launch_specifications.len(),
            config.machine_types.len()
        );
    }

    let base_size = docker_base_size(config.ebs_vol_size, config.tasks_per_machine)?;
    let encoded_user_data = STANDARD.encode(user_data(config_endpoint, base_size));
    let key_name = config
        .ssh_key_name
        .strip_suffix(".pem")
        .unwrap_or(&config.ssh_key_name)
        .to_string();

    let launch_specifications = config
        .machine_types
        .iter()
        .enumerate()
        .map(|(index, machine_type)| {
            let mut spec = template
                .launch_specifications
                .get(index)
                .unwrap_or(&template.launch_specifications[0])
                .clone();
            validate_specification(index, &spec)?;

            spec.instance_type = Some(machine_type.clone());
            spec.key_name = Some(key_name.clone());
            spec.user_data = Some(encoded_user_data.clone());
            let data_volume = spec.block_device_mappings[1]
                .ebs
                .get_or_insert_with(|| EbsVolume {
                    snapshot_id: None,
                    volume_size: None,
                    extra: Default::default(),
                });
            data_volume.volume_size = Some(config.ebs_vol_size);
            Ok(spec)
        })
        .collect::<crate::Result<Vec<_>>>()?;

    let mut extra = template.extra.clone();
    for field in COMPUTED_FIELDS {
        extra.remove(field);
    }

    Ok(FleetRequest {
        iam_fleet_role,
        valid_from: format_time(now),
        valid_until: format_time(now + ChronoDuration::days(FLEET_VALIDITY_DAYS)),
        target_capacity: config.cluster_machines,
        spot_price: format!("{:.2}", config.machine_price),
        launch_specifications,
        extra,
    })
}
