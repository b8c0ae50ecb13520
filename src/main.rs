use anyhow::Result;
use log::info;
use std::path::Path;

use evse_gateway::cli::{build_cli, handle_subcommands, DEFAULT_CONFIG_PATH};
use evse_gateway::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let default_level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    info!("🖥️  EVSE Modbus Gateway v{}", evse_gateway::VERSION);

    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let mut config = Config::load_or_default(config_path)?;
    config.apply_matches(&matches)?;

    handle_subcommands(&matches, config, Path::new(config_path)).await
}
