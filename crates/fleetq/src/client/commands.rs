use tokio::signal::ctrl_c;

use crate::client::globalsettings::GlobalSettings;
use crate::cluster::fleet::FleetTemplate;
use crate::cluster::jobqueue::{JobDescription, JobQueue};
use crate::cluster::launcher::FleetLauncher;
use crate::cluster::monitor::{ClusterMonitor, MonitorOutcome};
use crate::cluster::teardown::teardown;
use crate::common::cli::{MonitorOpts, StartClusterOpts, SubmitJobOpts, TeardownOpts};
use crate::common::error::error;
use crate::common::poll::PollPolicy;

pub async fn command_setup(gsettings: &GlobalSettings) -> crate::Result<()> {
    let report = gsettings.reconciler().setup().await?;
    let created = report.created().count();
    log::info!(
        "Setup finished: {created} resource(s) created, {} already existed",
        report.outcomes.len() - created
    );
    if report.anonymous_tasks {
        log::warn!(
            "Profile `{}` has neither a role nor access keys, tasks run without AWS credentials",
            gsettings.config().profile
        );
    }
    Ok(())
}

pub async fn command_submit_job(gsettings: &GlobalSettings, opts: SubmitJobOpts) -> crate::Result<()> {
    let job = JobDescription::from_file(&opts.job_file)?;
    let config = gsettings.config();
    let queue = JobQueue::open(gsettings.cloud().queues.as_ref(), &config.queue_name()).await?;
    queue.submit(&job).await?;
    log::info!(
        "Queue {} now holds {} message(s)",
        config.queue_name(),
        queue.depth().await?
    );
    Ok(())
}

pub async fn command_start_cluster(
    gsettings: &GlobalSettings,
    opts: StartClusterOpts,
) -> crate::Result<()> {
    let config = gsettings.config();
    let checkpoints = gsettings.checkpoints();
    if let Some(checkpoint) = checkpoints.read()? {
        return error(format!(
            "Fleet request {} of application {} is still recorded in {}, run `fleetq teardown` first",
            checkpoint.fleet_request_id,
            checkpoint.app_name,
            checkpoints.path().display()
        ));
    }

    let template = FleetTemplate::from_file(&opts.fleet_file)?;
    let resources = gsettings.reconciler().resolve().await?;
    let missing = resources.missing();
    if !missing.is_empty() {
        return error(format!(
            "Missing resources ({}), run `fleetq setup` first",
            missing.join(", ")
        ));
    }

    let mut launcher = FleetLauncher::from_config(gsettings.cloud(), config);
    let report = launcher.launch(&template, &resources).await?;
    log::info!(
        "Fleet request {} runs {} instance(s) with {} task(s)",
        report.request_id,
        report.instances.len(),
        report.desired_tasks
    );
    Ok(())
}

pub async fn command_monitor(gsettings: &GlobalSettings, opts: MonitorOpts) -> crate::Result<()> {
    let config = gsettings.config();
    let monitor = ClusterMonitor::new(
        gsettings.cloud(),
        gsettings.checkpoints(),
        PollPolicy::new(config.timing.monitor_interval),
    );

    let outcome = tokio::select! {
        outcome = monitor.run() => outcome?,
        _ = ctrl_c() => {
            log::info!("Monitoring interrupted, the cluster keeps running");
            return Ok(());
        }
    };
    match outcome {
        MonitorOutcome::Drained { cycles } => {
            log::info!("Cluster drained after {cycles} monitor cycle(s)");
            if opts.teardown {
                command_teardown(
                    gsettings,
                    TeardownOpts {
                        fleet_request_id: None,
                    },
                )
                .await?;
            } else {
                log::info!("Run `fleetq teardown` to cancel the fleet request");
            }
        }
        MonitorOutcome::CycleLimitReached { cycles } => {
            log::warn!("Monitoring stopped after {cycles} cycle(s), the cluster is still running");
        }
    }
    Ok(())
}

pub async fn command_teardown(gsettings: &GlobalSettings, opts: TeardownOpts) -> crate::Result<()> {
    let report = teardown(
        gsettings.cloud(),
        gsettings.config(),
        &gsettings.checkpoints(),
        opts.fleet_request_id,
    )
    .await?;
    if report.cancelled_request.is_none() && !report.service_scaled_down {
        log::info!("Nothing to tear down");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use super::{command_setup, command_start_cluster, command_submit_job, command_teardown};
    use crate::client::globalsettings::GlobalSettings;
    use crate::common::cli::{StartClusterOpts, SubmitJobOpts, TeardownOpts};
    use crate::common::error::FleetError;
    use crate::tests::cloud::FakeCloud;
    use crate::tests::utils::{TEST_FLEET_FILE, test_config};

    fn settings(fake: &FakeCloud, dir: &Path) -> GlobalSettings {
        let mut config = test_config();
        config.state_dir = dir.to_path_buf();
        GlobalSettings::new(config, fake.bundle()).with_aws_directory(dir.join("aws"))
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn start_opts(dir: &Path) -> StartClusterOpts {
        StartClusterOpts {
            fleet_file: write_file(dir, "fleet.json", TEST_FLEET_FILE),
        }
    }

    #[tokio::test]
    async fn cluster_lifecycle() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let gsettings = settings(&fake, dir.path());
        let config = gsettings.config();

        command_setup(&gsettings).await.unwrap();
        command_setup(&gsettings).await.unwrap();
        assert_eq!(fake.queue_count(&config.queue_name()), 1);

        let job_file = write_file(
            dir.path(),
            "job.json",
            r#"{"_comment": "x", "script": "run.sh", "groups": [{"id": 1}, {"id": 2}]}"#,
        );
        command_submit_job(&gsettings, SubmitJobOpts { job_file })
            .await
            .unwrap();

        command_start_cluster(&gsettings, start_opts(dir.path()))
            .await
            .unwrap();
        let checkpoint = gsettings.checkpoints().require().unwrap();
        assert_eq!(fake.fleet_state(&checkpoint.fleet_request_id).unwrap(), "active");

        command_teardown(
            &gsettings,
            TeardownOpts {
                fleet_request_id: None,
            },
        )
        .await
        .unwrap();
        assert!(gsettings.checkpoints().read().unwrap().is_none());
        assert_eq!(fake.service_desired_count(&config.service_name()), Some(0));
        assert_ne!(
            fake.fleet_state(&checkpoint.fleet_request_id).unwrap(),
            "active"
        );
    }

    #[tokio::test]
    async fn start_cluster_requires_setup() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let gsettings = settings(&fake, dir.path());

        let result = command_start_cluster(&gsettings, start_opts(dir.path())).await;
        match result {
            Err(FleetError::GenericError(message)) => assert!(message.contains("fleetq setup")),
            other => panic!("Unexpected result {other:?}"),
        }
        assert_eq!(fake.count_mutations("request_fleet"), 0);
    }

    #[tokio::test]
    async fn start_cluster_refuses_running_cluster() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let gsettings = settings(&fake, dir.path());
        command_setup(&gsettings).await.unwrap();
        command_start_cluster(&gsettings, start_opts(dir.path()))
            .await
            .unwrap();

        let result = command_start_cluster(&gsettings, start_opts(dir.path())).await;
        assert!(matches!(result, Err(FleetError::GenericError(_))));
        assert_eq!(fake.count_mutations("request_fleet"), 1);
    }

    #[tokio::test]
    async fn submit_job_requires_queue() {
        let dir = TempDir::with_prefix("fleetq").unwrap();
        let fake = FakeCloud::default();
        let gsettings = settings(&fake, dir.path());
        let job_file = write_file(dir.path(), "job.json", r#"{"groups": [{}]}"#);

        let result = command_submit_job(&gsettings, SubmitJobOpts { job_file }).await;
        assert!(matches!(result, Err(FleetError::QueueUnavailable(_))));
    }
}
