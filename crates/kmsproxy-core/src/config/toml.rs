use std::path::Path;

use crate::error::ConfigError;

use super::Config;

/// Parse a TOML document into a configuration
///
/// Not validated, command line values may still be layered on top.
pub fn parse(input: &str) -> Result<Config, ConfigError> {
    toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Read and parse a TOML configuration file
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let input = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        field: "config".to_string(),
        message: format!("Failed to read `{}`: {e}", path.display()),
    })?;

    parse(&input)
}
