use clap::{Arg, Command};

use crate::config::DEFAULT_CONFIG_PATH;

pub const ARG_CONFIG: &str = "config";

#[must_use]
pub fn command() -> Command {
    Command::new("start")
        .about("Run the gateway daemon")
        .arg(
            Arg::new(ARG_CONFIG)
                .short('c')
                .long("config")
                .help("Path to the configuration file")
                .env("PORDISTO_CONFIG")
                .default_value(DEFAULT_CONFIG_PATH),
        )
}
