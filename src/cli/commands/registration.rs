use clap::{Arg, ArgAction, ArgGroup, Command};

#[must_use]
pub fn command() -> Command {
    Command::new("registration")
        .about("Manage registration tokens")
        .arg(
            Arg::new("username")
                .long("username")
                .help("Username the token registers"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .help("Use a fixed token value instead of a generated one"),
        )
        .arg(
            Arg::new("groups")
                .long("groups")
                .value_delimiter(',')
                .help("Comma separated group memberships, each with the group: prefix"),
        )
        .arg(
            Arg::new("uses")
                .long("uses")
                .value_parser(clap::value_parser!(u32))
                .default_value("1")
                .help("Number of redemptions before the token is destroyed"),
        )
        .arg(
            Arg::new("overwrite")
                .long("overwrite")
                .help("Existing device address whose key this registration replaces"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List outstanding tokens"),
        )
        .arg(
            Arg::new("add")
                .long("add")
                .action(ArgAction::SetTrue)
                .requires("username")
                .help("Create a token"),
        )
        .arg(
            Arg::new("del")
                .long("del")
                .action(ArgAction::SetTrue)
                .requires("token")
                .help("Delete a token"),
        )
        .group(
            ArgGroup::new("action")
                .args(["list", "add", "del"])
                .required(true),
        )
}
