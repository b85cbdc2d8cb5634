//! Maps validated CLI matches to an action.

use crate::cli::actions::{run::Args, Action};
use crate::cli::commands::{journey, CMD_RUN};
use anyhow::{anyhow, Result};

/// # Errors
/// Returns an error if the subcommand is unknown or its arguments are invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some((CMD_RUN, sub)) => {
            let options = journey::Options::parse(sub)?;
            Ok(Action::Run(Args::from(options)))
        }
        Some((other, _)) => Err(anyhow!("unknown command: {other}")),
        None => Err(anyhow!("missing command, try --help")),
    }
}
