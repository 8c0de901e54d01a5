//! `spanbot config` -- show the resolved configuration.

use super::{config_path, load_config};

/// Print the resolved configuration as pretty JSON.
pub fn run(config_override: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_override)?;
    println!("# {}", config_path(config_override).display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
