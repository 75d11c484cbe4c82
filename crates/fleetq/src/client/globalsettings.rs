use std::path::PathBuf;

use crate::cloud::Cloud;
use crate::cloud::awscli::AwsCli;
use crate::cluster::checkpoint::CheckpointStore;
use crate::cluster::reconcile::ResourceReconciler;
use crate::common::cli::CommonOpts;
use crate::common::config::AppConfig;
use crate::common::fsutils::absolute_path;

/// State shared by every command of one invocation.
pub struct GlobalSettings {
    config: AppConfig,
    cloud: Cloud,
    aws_dir: Option<PathBuf>,
}

impl GlobalSettings {
    pub fn new(config: AppConfig, cloud: Cloud) -> Self {
        GlobalSettings {
            config,
            cloud,
            aws_dir: None,
        }
    }

    /// Profiles are read from this directory instead of `~/.aws`.
    pub fn with_aws_directory(mut self, aws_dir: PathBuf) -> Self {
        self.aws_dir = Some(aws_dir);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cloud(&self) -> &Cloud {
        &self.cloud
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::for_app(&self.config.state_dir, &self.config.app_name)
    }

    pub fn reconciler(&self) -> ResourceReconciler<'_> {
        let reconciler = ResourceReconciler::new(&self.cloud, &self.config);
        match &self.aws_dir {
            Some(dir) => reconciler.with_aws_directory(dir.clone()),
            None => reconciler,
        }
    }
}

/// Loads the configuration and connects it to the `aws` command line tool.
pub fn make_global_settings(opts: &CommonOpts) -> crate::Result<GlobalSettings> {
    let mut config = AppConfig::load(&opts.config)?;
    config.state_dir = absolute_path(config.state_dir);
    if opts.no_wait {
        config.timing.disable_pauses();
    }
    log::debug!(
        "Using application {} in region {} (profile {})",
        config.app_name,
        config.region,
        config.profile
    );
    let cli = AwsCli::new(config.region.clone(), Some(config.profile.clone()));
    Ok(GlobalSettings::new(config, Cloud::aws(cli)))
}
