pub mod commands;

pub use commands::{build_cli, handle_subcommands, DEFAULT_CONFIG_PATH};
