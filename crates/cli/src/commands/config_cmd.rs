//! `clawloop config`: show the effective configuration.

use anyhow::Context;
use clawloop_config::AppConfig;

pub fn run(path_only: bool) -> anyhow::Result<()> {
    if path_only {
        println!("{}", AppConfig::config_dir().join("config.toml").display());
        return Ok(());
    }

    let config = AppConfig::load().context("failed to load config")?;
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("{rendered}");
    Ok(())
}
