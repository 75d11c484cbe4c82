use clap::{CommandFactory, FromArgMatches};

use fleetq::client::commands::{
    command_monitor, command_setup, command_start_cluster, command_submit_job, command_teardown,
};
use fleetq::client::globalsettings::make_global_settings;
use fleetq::common::cli::{RootOptions, SubCommand};
use fleetq::common::setup::setup_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> fleetq::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let gsettings = match make_global_settings(&top_opts.common) {
        Ok(gsettings) => gsettings,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let result = match top_opts.subcmd {
        SubCommand::Setup => command_setup(&gsettings).await,
        SubCommand::SubmitJob(opts) => command_submit_job(&gsettings, opts).await,
        SubCommand::StartCluster(opts) => command_start_cluster(&gsettings, opts).await,
        SubCommand::Monitor(opts) => command_monitor(&gsettings, opts).await,
        SubCommand::Teardown(opts) => command_teardown(&gsettings, opts).await,
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}
