//! Configuration management for the request guard.
//!
//! This module loads the engine configuration from defaults, an optional
//! configuration file and `REQUEST_GUARD_*` environment variables.

use std::collections::HashMap;
use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use dotenv::dotenv;
use crate::models::{EngineConfig, Platform};

const ENV_PREFIX: &str = "REQUEST_GUARD";
const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

fn environment_source(vars: Option<HashMap<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("proxies")
        .with_list_parse_key("characteristics")
        .try_parsing(true)
        .source(vars)
}

fn build_config(config_file: &str, environment: Environment) -> Result<EngineConfig, ConfigError> {
    let mut config: EngineConfig = ConfigBuilder::builder()
        .add_source(File::with_name(config_file).required(false))
        .add_source(environment)
        .set_default("environment", "production")?
        .set_default("characteristics", vec!["ip.src"])?
        .set_default("runtime", "rust")?
        .set_default("delegate_fingerprint", false)?
        .set_default("protocol.report_timeout_ms", 2000)?
        .set_default("protocol.sdk_stack", "RUST")?
        .build()?
        .try_deserialize()?;

    if config.platform.is_none() {
        config.platform = Platform::detect();
    }
    Ok(config)
}

/// Load configuration from the environment and an optional file
///
/// The file is named by `CONFIG_FILE` and defaults to `config/default.toml`;
/// environment variables override it, e.g. `REQUEST_GUARD_PROTOCOL__BASE_URL`.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    dotenv().ok();
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    build_config(&config_file, environment_source(None))
}
