//! Defines the command line app.

use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Relay is a store-and-forward proxy for event ingestion.";

pub fn make_app() -> Command {
    Command::new("relay")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .action(ArgAction::Set)
                .help("The path to the config folder."),
        )
        .subcommand(Command::new("run").about("Run the relay").after_help(
            "This runs the relay in the foreground until it's shut down. It will bind \
             to the port and network interface configured in the config file.",
        ))
        .subcommand(
            Command::new("credentials")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .about("Manage the relay credentials")
                .after_help(
                    "This command can be used to manage the stored credentials of \
                     the relay. These credentials are used to authenticate with the \
                     upstream server. The upstream trusts a certain public key and \
                     each relay is identified with a unique relay ID.",
                )
                .subcommand(
                    Command::new("generate")
                        .about("Generate new credentials")
                        .after_help(
                            "This generates new credentials for the relay and stores \
                             them. If credentials are already stored, this command \
                             keeps the existing credentials.",
                        ),
                )
                .subcommand(
                    Command::new("regenerate")
                        .about("Regenerate the stored credentials")
                        .after_help(
                            "This regenerates the credentials of the relay and \
                             stores them. Any existing credentials are overwritten.",
                        ),
                )
                .subcommand(
                    Command::new("show")
                        .about("Show currently stored credentials")
                        .after_help("This prints out the relay ID and public key."),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_app() {
        make_app().debug_assert();
    }

    #[test]
    fn test_parse_credentials_generate() {
        let matches = make_app()
            .try_get_matches_from(["relay", "-c", "/etc/relay", "credentials", "generate"])
            .unwrap();

        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/etc/relay")
        );

        let (name, submatches) = matches.subcommand().unwrap();
        assert_eq!(name, "credentials");
        assert_eq!(submatches.subcommand_name(), Some("generate"));
    }

    #[test]
    fn test_parse_credentials_regenerate() {
        let matches = make_app()
            .try_get_matches_from(["relay", "credentials", "regenerate"])
            .unwrap();

        let (name, submatches) = matches.subcommand().unwrap();
        assert_eq!(name, "credentials");
        assert_eq!(submatches.subcommand_name(), Some("regenerate"));
    }

    #[test]
    fn test_config_arg_is_global() {
        let matches = make_app()
            .try_get_matches_from(["relay", "run", "-c", "/etc/relay"])
            .unwrap();

        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/etc/relay")
        );
    }
}
