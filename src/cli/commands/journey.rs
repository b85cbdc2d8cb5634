use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;
use url::Url;

pub const ARG_URL: &str = "url";
pub const ARG_REALM: &str = "realm";
pub const ARG_JOURNEY: &str = "journey";
pub const ARG_PROMPT_TIMEOUT: &str = "prompt-timeout";
pub const ARG_FAIL_CLOSED: &str = "fail-closed";
pub const ARG_FORCE_AUTH: &str = "force-auth";
pub const ARG_NO_SESSION: &str = "no-session";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_URL)
                .short('u')
                .long("url")
                .help("Server base URL, example: https://am.example.com/am")
                .env("WAYFARER_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_REALM)
                .short('r')
                .long("realm")
                .help("Realm path, example: /alpha")
                .env("WAYFARER_REALM")
                .default_value("root"),
        )
        .arg(
            Arg::new(ARG_JOURNEY)
                .short('j')
                .long("journey")
                .help("Journey (authentication tree) to start")
                .env("WAYFARER_JOURNEY")
                .default_value("Login"),
        )
        .arg(
            Arg::new(ARG_PROMPT_TIMEOUT)
                .long("prompt-timeout")
                .help("Seconds a device prompt may wait for an answer, 0 disables the limit")
                .env("WAYFARER_PROMPT_TIMEOUT")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_FAIL_CLOSED)
                .long("fail-closed")
                .help("Stop the journey when an automatic collector action fails")
                .env("WAYFARER_FAIL_CLOSED")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_FORCE_AUTH)
                .long("force-auth")
                .help("Authenticate again even with an existing session")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_NO_SESSION)
                .long("no-session")
                .help("Do not create a session on success")
                .action(ArgAction::SetTrue),
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub url: Url,
    pub realm: String,
    pub journey: String,
    pub prompt_timeout: Option<Duration>,
    pub fail_closed: bool,
    pub force_auth: bool,
    pub no_session: bool,
}

impl Options {
    /// # Errors
    /// Returns an error if the URL is missing or invalid.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let url = matches
            .get_one::<String>(ARG_URL)
            .context("missing required argument: --url")?;
        let url = Url::parse(url).with_context(|| format!("invalid server URL: {url}"))?;

        let prompt_timeout = matches
            .get_one::<u64>(ARG_PROMPT_TIMEOUT)
            .copied()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            url,
            realm: matches
                .get_one::<String>(ARG_REALM)
                .cloned()
                .unwrap_or_else(|| "root".to_string()),
            journey: matches
                .get_one::<String>(ARG_JOURNEY)
                .cloned()
                .unwrap_or_else(|| "Login".to_string()),
            prompt_timeout,
            fail_closed: matches.get_flag(ARG_FAIL_CLOSED),
            force_auth: matches.get_flag(ARG_FORCE_AUTH),
            no_session: matches.get_flag(ARG_NO_SESSION),
        })
    }
}
