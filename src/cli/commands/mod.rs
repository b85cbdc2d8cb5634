pub mod journey;
pub mod logging;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    ColorChoice, Command,
};

pub const CMD_RUN: &str = "run";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("wayfarer")
        .about("Drive server-directed authentication journeys")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(journey::with_args(
            Command::new(CMD_RUN).about("Run a journey interactively from the terminal"),
        ));

    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::journey::Options;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "wayfarer");
        assert_eq!(
            command.get_about().unwrap().to_string(),
            "Drive server-directed authentication journeys"
        );
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_run_args() {
        temp_env::with_vars(
            [
                ("WAYFARER_URL", None::<&str>),
                ("WAYFARER_REALM", None),
                ("WAYFARER_JOURNEY", None),
                ("WAYFARER_PROMPT_TIMEOUT", None),
                ("WAYFARER_FAIL_CLOSED", None),
            ],
            || {
                let matches = new().get_matches_from(vec![
                    "wayfarer",
                    "run",
                    "--url",
                    "https://am.example.com/am",
                    "--realm",
                    "/alpha",
                    "--journey",
                    "Registration",
                    "--prompt-timeout",
                    "30",
                    "--fail-closed",
                ]);
                let (name, sub) = matches.subcommand().unwrap();
                assert_eq!(name, CMD_RUN);

                let options = Options::parse(sub).unwrap();
                assert_eq!(options.url.as_str(), "https://am.example.com/am");
                assert_eq!(options.realm, "/alpha");
                assert_eq!(options.journey, "Registration");
                assert_eq!(options.prompt_timeout, Some(Duration::from_secs(30)));
                assert!(options.fail_closed);
                assert!(!options.force_auth);
            },
        );
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("WAYFARER_URL", Some("http://localhost:8080/am")),
                ("WAYFARER_JOURNEY", Some("Passwordless")),
                ("WAYFARER_PROMPT_TIMEOUT", Some("0")),
                ("WAYFARER_LOG_LEVEL", Some("info")),
                ("WAYFARER_REALM", None),
                ("WAYFARER_FAIL_CLOSED", None),
            ],
            || {
                let matches = new().get_matches_from(vec!["wayfarer", "run"]);
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    Some(2)
                );
                let (_, sub) = matches.subcommand().unwrap();
                let options = Options::parse(sub).unwrap();
                assert_eq!(options.journey, "Passwordless");
                assert_eq!(options.realm, "root");
                assert_eq!(options.prompt_timeout, None);
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        // loop cover all possible value_parse
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars(
                [
                    ("WAYFARER_LOG_LEVEL", Some(level)),
                    ("WAYFARER_URL", Some("http://localhost:8080/am")),
                ],
                || {
                    let matches = new().get_matches_from(vec!["wayfarer", "run"]);
                    assert_eq!(
                        matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                        Some(index as u8)
                    );
                },
            );
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, _) in levels.iter().enumerate() {
            temp_env::with_vars([("WAYFARER_LOG_LEVEL", None::<String>)], || {
                let mut args = vec![
                    "wayfarer".to_string(),
                    "run".to_string(),
                    "--url".to_string(),
                    "http://localhost:8080/am".to_string(),
                ];

                // Add the appropriate number of "-v" flags based on the index
                if index > 0 {
                    args.push(format!("-{}", "v".repeat(index)));
                }

                let matches = new().get_matches_from(args);

                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    Some(index as u8)
                );
            });
        }
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        temp_env::with_vars([("WAYFARER_URL", None::<&str>)], || {
            let matches = new().get_matches_from(vec!["wayfarer", "run", "--url", "not a url"]);
            let (_, sub) = matches.subcommand().unwrap();
            assert!(Options::parse(sub).is_err());
        });
    }
}
