//! Command-line interface handling for the fleet server node.

use crate::config::AppConfig;
use clap::{Arg, ArgAction, Command};
use fleet_core::ServerRole;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
///
/// Every option other than the config path overrides the matching setting
/// from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub server_id: Option<String>,
    pub role: Option<ServerRole>,
    pub log_level: Option<String>,
    pub store_url: Option<String>,
    pub json_logs: bool,
}

fn command() -> Command {
    Command::new("Fleet Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Game server node with shared-state placement and allocation")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("fleet.toml"),
        )
        .arg(
            Arg::new("server-id")
                .short('i')
                .long("server-id")
                .value_name("ID")
                .help("Unique id of this instance"),
        )
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .help("Server role (spawn, limbo, world_host)")
                .value_parser(|s: &str| s.parse::<ServerRole>()),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("store-url")
                .long("store-url")
                .value_name("URL")
                .help("Shared store address, e.g. redis://10.0.0.5:6379/"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fleet.toml")),
            server_id: matches.get_one::<String>("server-id").cloned(),
            role: matches.get_one::<ServerRole>("role").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            store_url: matches.get_one::<String>("store-url").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }

    /// Applies the overrides given on the command line.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(id) = &self.server_id {
            config.server.id = id.clone();
        }
        if let Some(role) = self.role {
            config.server.role = role;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(url) = &self.store_url {
            config.store.url = url.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
    }
}
