use clap::{Arg, ArgAction, ArgGroup, Command};

#[must_use]
pub fn command() -> Command {
    Command::new("devices")
        .about("Manage registered devices")
        .arg(
            Arg::new("device")
                .long("device")
                .help("Device tunnel address"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List devices and their session state"),
        )
        .arg(
            Arg::new("sessions")
                .long("sessions")
                .action(ArgAction::SetTrue)
                .help("List currently authorised sessions"),
        )
        .arg(
            Arg::new("del")
                .long("del")
                .action(ArgAction::SetTrue)
                .requires("device")
                .help("Completely remove a device, blocking its WireGuard access"),
        )
        .arg(
            Arg::new("lock")
                .long("lock")
                .action(ArgAction::SetTrue)
                .requires("device")
                .help("Lock a device out of MFA routes"),
        )
        .arg(
            Arg::new("reset")
                .long("reset")
                .action(ArgAction::SetTrue)
                .requires("device")
                .help("Reset a locked device and its owner's account lock"),
        )
        .group(
            ArgGroup::new("action")
                .args(["list", "sessions", "del", "lock", "reset"])
                .required(true),
        )
}
