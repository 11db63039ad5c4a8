use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub(crate) mod parse;
mod validate;

pub mod ast {
    pub use crate::validate::*;
}

/// Values given on the command line. Each one that is present replaces the
/// corresponding entry from the configuration file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

/// Validate configuration text. Relative paths in it resolve against
/// `config_root`.
pub fn parse(text: &str, config_root: &Path, overrides: Overrides) -> Result<ast::ServerConfig> {
    let mut parsed: parse::ServerConfig =
        toml::from_str(text).context("Failed to parse server parameters from config file.")?;
    parsed.apply(overrides);
    let validated = ast::ServerConfig::validate(config_root, parsed)
        .context("Failed to validate server parameters.")?;
    debug!("{validated:#?}");
    Ok(validated)
}

/// Read the configuration file if there is one, then layer the command line
/// on top. Without a file, relative paths resolve against the working
/// directory.
pub fn load(file: Option<&Path>, overrides: Overrides) -> Result<ast::ServerConfig> {
    match file {
        Some(file) => {
            let text = std::fs::read_to_string(file).with_context(|| {
                format!("Failed to read config file at \"{}\"", file.display())
            })?;
            let config_root = file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            parse(&text, &config_root, overrides)
        }
        None => parse("", Path::new("."), overrides),
    }
}
