use anyhow::{bail, Result};
use clap::ArgMatches;
use relay_config::{Config, RelayMode};

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(".relay");
    let config = Config::from_path(config_path)?;

    relay_log::init(config.logging());

    match matches.subcommand() {
        Some(("credentials", matches)) => manage_credentials(config, matches),
        Some(("run", matches)) => run(config, matches),
        _ => unreachable!(),
    }
}

#[allow(clippy::print_stdout)]
pub fn manage_credentials(mut config: Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("generate", _)) => {
            if config.ensure_credentials()? {
                println!("Generated new credentials");
            } else {
                println!("Stored credentials:");
            }
            setup::dump_credentials(&config);
            Ok(())
        }
        Some(("regenerate", _)) => {
            config.regenerate_credentials()?;
            println!("Generated new credentials");
            setup::dump_credentials(&config);
            Ok(())
        }
        Some(("show", _)) => {
            if !config.has_credentials() {
                bail!("no stored credentials");
            }

            println!("Stored credentials:");
            setup::dump_credentials(&config);
            Ok(())
        }
        _ => unreachable!(),
    }
}

pub fn run(config: Config, _matches: &ArgMatches) -> Result<()> {
    if config.relay_mode() == RelayMode::Managed && !config.has_credentials() {
        bail!(
            "relay has no credentials, which are required in managed mode. \
             Generate some with \"relay credentials generate\" first."
        );
    }

    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;

    relay_server::run(config)?;

    Ok(())
}
