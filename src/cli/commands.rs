use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::config::Config;
use crate::modbus::protocol::{KEEP_ALIVE_PROBE, MAX_UNIT_ID};
use crate::modbus::rtu::{RtuEvent, RtuMaster, RtuOutcome};
use crate::modbus::serial::{list_ports, SerialPortLink};
use crate::services::GatewayService;
use crate::utils::error::GatewayError;

pub const DEFAULT_CONFIG_PATH: &str = "gateway.toml";

pub fn build_cli() -> Command {
    Command::new("evse-gateway")
        .version(crate::VERSION)
        .about("Modbus RTU <-> TCP gateway for the EV charging controller")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value(DEFAULT_CONFIG_PATH)
                .global(true)
                .help("Configuration file"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("DEVICE")
                .global(true)
                .help("Serial port of the RS-485 adapter"),
        )
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .value_name("RATE")
                .global(true)
                .help("Serial baud rate"),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .value_name("8N1|8E1")
                .global(true)
                .help("Serial framing"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR:PORT")
                .global(true)
                .help("Modbus/TCP listen address"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .value_name("MS")
                .global(true)
                .help("RTU response timeout"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Debug logging"),
        )
        .subcommand(Command::new("run").about("Run the gateway (default)"))
        .subcommand(
            Command::new("init-config")
                .about("Write the effective configuration (defaults plus overrides) to the config file")
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite an existing file"),
                ),
        )
        .subcommand(Command::new("show-config").about("Print the effective configuration"))
        .subcommand(Command::new("list-ports").about("List available serial ports"))
        .subcommand(
            Command::new("probe")
                .about("Send the keep-alive probe to one unit and print the answer")
                .arg(
                    Arg::new("unit")
                        .short('u')
                        .long("unit")
                        .value_name("ID")
                        .required(true)
                        .help("Slave address, 1-247"),
                ),
        )
}

pub async fn handle_subcommands(
    matches: &ArgMatches,
    config: Config,
    config_path: &Path,
) -> Result<()> {
    match matches.subcommand() {
        Some(("init-config", sub)) => {
            if config_path.exists() && !sub.get_flag("force") {
                bail!(
                    "{} already exists, use --force to overwrite",
                    config_path.display()
                );
            }
            config
                .save_to_file(config_path)
                .with_context(|| format!("writing {}", config_path.display()))?;
            println!("✅ Wrote configuration to {}", config_path.display());
        }
        Some(("show-config", _)) => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Some(("list-ports", _)) => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("⚠️  No serial ports found");
            }
            for (index, port) in ports.iter().enumerate() {
                println!("{}. {}", index + 1, port);
            }
        }
        Some(("probe", sub)) => {
            let unit = sub
                .get_one::<String>("unit")
                .map(|s| s.as_str())
                .unwrap_or_default();
            let unit: u8 = unit
                .parse()
                .with_context(|| format!("invalid unit id '{}'", unit))?;
            if unit == 0 || unit > MAX_UNIT_ID {
                bail!("unit id must be between 1 and {}", MAX_UNIT_ID);
            }
            probe(&config, unit).await?;
        }
        Some(("run", _)) | None => run(config).await?,
        Some((other, _)) => bail!("unknown command {}", other),
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    if !config.gateway_active {
        info!("⏸️  Gateway mode is disabled in the configuration, nothing to do");
        return Ok(());
    }
    config.validate()?;

    let mut service = GatewayService::new(config).await?;
    service.run().await?;
    Ok(())
}

async fn probe(config: &Config, unit: u8) -> Result<()> {
    config.validate()?;
    let link = SerialPortLink::open(config)?;
    let mut master = RtuMaster::new(
        Box::new(link),
        config.baud_rate,
        config.rtu_timeout(),
        config.frame_delay(),
    );

    println!("🔍 Probing unit {} with {}", unit, hex::encode(KEEP_ALIVE_PROBE));
    master.raw_request(unit, &KEEP_ALIVE_PROBE, Instant::now())?;

    let outcome = loop {
        sleep(Duration::from_millis(1)).await;
        match master.poll(Instant::now()) {
            Some(RtuEvent::Completed { outcome, .. }) => break outcome,
            Some(RtuEvent::Unsolicited(bytes)) => {
                println!("🗑️  Ignoring stray bytes: {}", hex::encode(bytes));
            }
            None => {}
        }
    };

    match outcome {
        RtuOutcome::Success(pdu) => println!("✅ Unit {} answered: {}", unit, hex::encode(pdu)),
        RtuOutcome::Timeout => {
            return Err(GatewayError::Timeout).with_context(|| {
                format!("unit {} did not answer within {} ms", unit, config.rtu_timeout_ms)
            })
        }
        RtuOutcome::TransportError(reason) => bail!("exchange with unit {} failed: {}", unit, reason),
    }
    Ok(())
}
