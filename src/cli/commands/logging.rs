use clap::{Arg, ArgAction, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .action(ArgAction::Count)
            .global(true)
            .help("Verbosity, repeatable (-v warn, -vv info, -vvv debug, -vvvv trace)"),
    )
}
