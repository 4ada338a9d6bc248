//! Per-channel on-chain resolution daemon.
//!
//! Spawned by the parent once a channel's funding output is spent, with
//! fd 0 already wired to the parent's duplex socket.  Drives every
//! output of the close to irrevocable resolution, then exits.

use clap::{App, AppSettings, Arg};
use log::{error, info};
use time::macros::format_description;
use time::OffsetDateTime;

use onchaind::client::StdinClient;

fn setup_logging(who: &'static str, level_arg: &str) {
    use fern::colors::{Color, ColoredLevelConfig};
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);
    let level = level_arg.parse::<log::LevelFilter>().unwrap_or(log::LevelFilter::Info);
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                OffsetDateTime::now_utc().format(&format).unwrap_or_default(),
                who,
                colors.color(record.level()),
                message
            ))
        })
        .level(level)
        // fd 0 carries the wire protocol, so logs go to stderr only
        .chain(std::io::stderr())
        .apply()
        .expect("logging setup");
}

pub fn main() {
    let app = App::new("onchaind")
        .setting(AppSettings::NoAutoVersion)
        .about("Lightning channel on-chain resolution daemon")
        .arg(Arg::new("version").long("version").help("print version string and exit"))
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info")
                .help("trace|debug|info|warn|error"),
        );
    let matches = app.get_matches();
    if matches.is_present("version") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    setup_logging("onchaind", matches.value_of("log-level").unwrap_or("info"));
    info!("starting, pid {}", std::process::id());

    let client = StdinClient::new();
    match onchaind::run(client) {
        Ok(()) => info!("done"),
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}
