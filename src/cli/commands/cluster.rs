use clap::{Arg, ArgAction, ArgGroup, Command};

#[must_use]
pub fn command() -> Command {
    Command::new("cluster")
        .about("Manage cluster membership and health")
        .arg(Arg::new("node").long("node").help("Member id in hex"))
        .arg(
            Arg::new("error-id")
                .long("error-id")
                .help("Event error id to resolve"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List members with role and drain state"),
        )
        .arg(
            Arg::new("drain")
                .long("drain")
                .action(ArgAction::SetTrue)
                .requires("node")
                .help("Drain a node: existing tunnels keep working, new MFA redemptions are refused"),
        )
        .arg(
            Arg::new("undrain")
                .long("undrain")
                .action(ArgAction::SetTrue)
                .requires("node")
                .help("Clear a node's drain flag"),
        )
        .arg(
            Arg::new("promote")
                .long("promote")
                .action(ArgAction::SetTrue)
                .requires("node")
                .help("Promote a caught-up learner to a voting member"),
        )
        .arg(
            Arg::new("remove")
                .long("remove")
                .action(ArgAction::SetTrue)
                .requires("node")
                .help("Remove a member and clear its node-scoped keys"),
        )
        .arg(
            Arg::new("step-down")
                .long("step-down")
                .action(ArgAction::SetTrue)
                .help("Transfer leadership away from this node"),
        )
        .arg(
            Arg::new("errors")
                .long("errors")
                .action(ArgAction::SetTrue)
                .help("List unresolved replicated-event errors"),
        )
        .arg(
            Arg::new("resolve")
                .long("resolve")
                .action(ArgAction::SetTrue)
                .requires("error-id")
                .help("Mark an event error as resolved"),
        )
        .group(
            ArgGroup::new("action")
                .args([
                    "list",
                    "drain",
                    "undrain",
                    "promote",
                    "remove",
                    "step-down",
                    "errors",
                    "resolve",
                ])
                .required(true),
        )
}
