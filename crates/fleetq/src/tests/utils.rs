use std::path::Path;

use crate::cluster::checkpoint::CheckpointStore;
use crate::cluster::fleet::FleetTemplate;
use crate::cluster::launcher::FleetLauncher;
use crate::cluster::reconcile::{ResourceReconciler, SetupReport};
use crate::common::config::AppConfig;
use crate::common::poll::PollPolicy;
use crate::tests::cloud::FakeCloud;

pub const TEST_CONFIG: &str = r#"
app_name = "Example"
bucket = "example-bucket"
log_group_name = "ExampleLogs"
docker_image = "org/worker:latest"
ssh_key_name = "cluster-key.pem"
"#;

pub const TEST_FLEET_FILE: &str = r#"{
    "IamFleetRole": "arn:aws:iam::123456789012:role/aws-ec2-spot-fleet-tagging-role",
    "AllocationStrategy": "lowestPrice",
    "Type": "maintain",
    "TerminateInstancesWithExpiration": true,
    "LaunchSpecifications": [
        {
            "IamInstanceProfile": {
                "Arn": "arn:aws:iam::123456789012:instance-profile/ecsInstanceRole"
            },
            "ImageId": "ami-0ce03502c5bb5e188",
            "NetworkInterfaces": [
                {
                    "DeviceIndex": 0,
                    "SubnetId": "subnet-0123456789abcdef0",
                    "DeleteOnTermination": true,
                    "AssociatePublicIpAddress": true,
                    "Groups": ["sg-0123456789abcdef0"]
                }
            ],
            "BlockDeviceMappings": [
                {
                    "DeviceName": "/dev/xvda",
                    "Ebs": {
                        "DeleteOnTermination": true,
                        "VolumeType": "gp2",
                        "VolumeSize": 8,
                        "SnapshotId": "snap-0a7b4ece894d62882"
                    }
                },
                {
                    "DeviceName": "/dev/xvdcz",
                    "Ebs": {
                        "DeleteOnTermination": true,
                        "VolumeType": "gp2"
                    }
                }
            ]
        }
    ]
}"#;

/// Configuration of the `Example` application that never pauses.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::parse(TEST_CONFIG).expect("Invalid test configuration");
    config.timing.disable_pauses();
    config
}

pub fn test_reconciler<'a>(
    cloud: &'a crate::cloud::Cloud,
    config: &'a AppConfig,
    aws_dir: &Path,
) -> ResourceReconciler<'a> {
    ResourceReconciler::new(cloud, config).with_aws_directory(aws_dir.to_path_buf())
}

pub async fn setup_cluster(fake: &FakeCloud, config: &AppConfig, aws_dir: &Path) -> SetupReport {
    let cloud = fake.bundle();
    test_reconciler(&cloud, config, aws_dir)
        .setup()
        .await
        .expect("Setup failed")
}

/// Reconciles and launches the `Example` application with its state in `state_dir`.
/// Returns the configuration and the fleet request ID.
pub async fn launched_cluster(fake: &FakeCloud, state_dir: &Path) -> (AppConfig, String) {
    let mut config = test_config();
    config.state_dir = state_dir.to_path_buf();
    let report = setup_cluster(fake, &config, &state_dir.join("aws")).await;

    let cloud = fake.bundle();
    let template = FleetTemplate::parse(TEST_FLEET_FILE).expect("Invalid fleet file");
    let mut launcher = FleetLauncher::new(
        &cloud,
        &config,
        CheckpointStore::for_app(state_dir, &config.app_name),
        PollPolicy::no_wait().with_max_attempts(5),
    );
    let launch = launcher
        .launch(&template, &report.resources)
        .await
        .expect("Launch failed");
    (config, launch.request_id)
}
