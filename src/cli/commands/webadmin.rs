use clap::{Arg, ArgAction, ArgGroup, Command};

#[must_use]
pub fn command() -> Command {
    Command::new("webadmin")
        .about("Manage management-UI admin accounts")
        .arg(Arg::new("username").long("username").help("Admin username"))
        .arg(
            Arg::new("password")
                .long("password")
                .help("Password for --add"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List admin accounts"),
        )
        .arg(
            Arg::new("add")
                .long("add")
                .action(ArgAction::SetTrue)
                .requires("username")
                .requires("password")
                .help("Add an admin account"),
        )
        .arg(
            Arg::new("del")
                .long("del")
                .action(ArgAction::SetTrue)
                .requires("username")
                .help("Delete an admin account"),
        )
        .arg(
            Arg::new("lock")
                .long("lock")
                .action(ArgAction::SetTrue)
                .requires("username")
                .help("Lock an admin account"),
        )
        .arg(
            Arg::new("unlock")
                .long("unlock")
                .action(ArgAction::SetTrue)
                .requires("username")
                .help("Unlock an admin account"),
        )
        .group(
            ArgGroup::new("action")
                .args(["list", "add", "del", "lock", "unlock"])
                .required(true),
        )
}
