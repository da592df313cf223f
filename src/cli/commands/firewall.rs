use clap::{Arg, ArgAction, ArgGroup, Command};

#[must_use]
pub fn command() -> Command {
    Command::new("firewall")
        .about("Inspect the packet-path decision table")
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("Dump every device's rules and session check result"),
        )
        .arg(
            Arg::new("digest")
                .long("digest")
                .action(ArgAction::SetTrue)
                .help("Show the hash of the loaded enforcement object"),
        )
        .group(ArgGroup::new("action").args(["list", "digest"]).required(true))
}
