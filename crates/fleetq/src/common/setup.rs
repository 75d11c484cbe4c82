use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::AnsiColor;
use log::LevelFilter;
use std::io::Write;

/// Configures logging of `fleetq` itself; other crates only report warnings.
///
/// `RUST_LOG` is applied last and can override both.
pub fn setup_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = env_logger::Builder::default();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module("fleetq", level);

    let env_debug = std::env::var(DEFAULT_FILTER_ENV).is_ok_and(|v| v.contains("debug"));
    if debug || env_debug {
        builder.format_timestamp_millis().format_target(true);
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let time_style = AnsiColor::BrightBlack.on_default();
            writeln!(
                buf,
                "{time_style}{}{time_style:#} {level_style}{:<5}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}
