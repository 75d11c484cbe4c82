use std::path::PathBuf;

use clap::Parser;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the application configuration
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "FLEETQ_CONFIG",
        default_value = "config.toml",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: PathBuf,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "FLEETQ_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,

    /// Skip settle delays and poll without pauses (the fleet timeout still applies)
    #[arg(long, global = true, help_heading("GLOBAL OPTIONS"), hide_short_help(true))]
    pub no_wait: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::FLEETQ_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Create the queues, cluster, task definition, service and bucket if they do not exist
    Setup,
    /// Send one message per group of a job file to the work queue
    SubmitJob(SubmitJobOpts),
    /// Start a spot fleet that processes the work queue
    StartCluster(StartClusterOpts),
    /// Watch a started cluster until its queue is drained
    Monitor(MonitorOpts),
    /// Scale the service down, cancel the fleet and remove the checkpoint
    Teardown(TeardownOpts),
}

#[derive(Parser)]
pub struct SubmitJobOpts {
    /// JSON job file
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub job_file: PathBuf,
}

#[derive(Parser)]
pub struct StartClusterOpts {
    /// JSON fleet file with the account specific parts of the fleet request
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub fleet_file: PathBuf,
}

#[derive(Parser)]
pub struct MonitorOpts {
    /// Tear the cluster down once it is drained
    #[arg(long)]
    pub teardown: bool,
}

#[derive(Parser)]
pub struct TeardownOpts {
    /// Fleet request to cancel instead of the one stored in the checkpoint
    #[arg(long)]
    pub fleet_request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{RootOptions, SubCommand};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn parse_subcommands() {
        let opts =
            RootOptions::try_parse_from(["fleetq", "--no-wait", "submit-job", "job.json"]).unwrap();
        assert!(opts.common.no_wait);
        match opts.subcmd {
            SubCommand::SubmitJob(opts) => assert_eq!(opts.job_file, PathBuf::from("job.json")),
            _ => panic!("Unexpected subcommand"),
        }

        let opts = RootOptions::try_parse_from([
            "fleetq",
            "teardown",
            "--fleet-request-id",
            "sfr-1",
            "--config",
            "app.toml",
        ])
        .unwrap();
        assert_eq!(opts.common.config, PathBuf::from("app.toml"));
        assert!(matches!(
            opts.subcmd,
            SubCommand::Teardown(ref t) if t.fleet_request_id.as_deref() == Some("sfr-1")
        ));
    }
}
