pub mod cluster;
pub mod devices;
pub mod firewall;
pub mod logging;
pub mod registration;
pub mod start;
pub mod webadmin;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

use crate::config::DEFAULT_CONTROL_SOCKET;

pub const ARG_SOCKET: &str = "socket";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let command = Command::new("pordisto")
        .about("WireGuard gateway with in-kernel MFA enforcement")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new(ARG_SOCKET)
                .long("socket")
                .help("Control socket of the running daemon")
                .env("PORDISTO_SOCKET")
                .default_value(DEFAULT_CONTROL_SOCKET)
                .global(true),
        )
        .subcommand(start::command())
        .subcommand(devices::command())
        .subcommand(registration::command())
        .subcommand(cluster::command())
        .subcommand(firewall::command())
        .subcommand(webadmin::command());

    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        new().debug_assert();
    }

    #[test]
    fn every_admin_subcommand_requires_an_action() {
        for (name, flag) in [
            ("devices", "--list"),
            ("registration", "--list"),
            ("cluster", "--list"),
            ("firewall", "--list"),
            ("webadmin", "--list"),
        ] {
            // Without an action flag the subcommand must not parse.
            assert!(
                new()
                    .try_get_matches_from(["pordisto", name])
                    .is_err(),
                "{name} parsed without an action"
            );
            assert!(
                new()
                    .try_get_matches_from(["pordisto", name, flag])
                    .is_ok(),
                "{name} {flag} did not parse"
            );
        }
    }

    #[test]
    fn action_flags_are_mutually_exclusive() {
        assert!(new()
            .try_get_matches_from(["pordisto", "devices", "--list", "--sessions"])
            .is_err());
    }
}
