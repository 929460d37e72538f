//! linkctl - Modbus device access for VoltageEMS
//!
//! Reads, writes and polls the named points of a device profile. With
//! `--simulate` every command runs against an in-process simulated device
//! instead of the configured transport.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use voltage_comlink::{ConnectionState, DecodedValue, LinkStatus, ProtocolValue};
use voltage_protocols::modbus::mock::{MockConnector, SimulatedDevice};
use voltage_protocols::modbus::{
    DeviceProfile, ModbusClient, PointResolver, PollingDriver, RawData, Region,
};

#[derive(Parser)]
#[command(name = "linkctl")]
#[command(about = "Modbus device access driven by a device profile")]
#[command(long_about = "Modbus device access driven by a device profile

Commands:
  status      Connect and show the link status
  points      List the points of the register map
  read        Read named points
  read-raw    Read raw registers or bits
  write       Write a named point
  poll        Poll points on an interval

Examples:
  linkctl -p profiles/bms.yaml read soc pack_voltage
  linkctl -p profiles/bms.yaml read-raw holding 10 4
  linkctl -p profiles/bms.yaml write charge_limit 120.5
  linkctl -p profiles/bms.yaml --simulate poll --count 3")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Device profile (YAML, TOML or JSON)
    #[arg(short, long, global = true, env = "LINKCTL_PROFILE", default_value = "profiles/bms.yaml")]
    profile: PathBuf,

    /// Talk to a simulated device instead of the configured transport
    #[arg(long, global = true)]
    simulate: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level filter (e.g. info, debug, voltage_protocols=trace); RUST_LOG wins when set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and show the link status
    Status,

    /// List the points of the register map
    Points,

    /// Read named points (all polling points when none are given)
    Read {
        points: Vec<String>,
    },

    /// Read raw registers or bits
    ReadRaw {
        /// coil, discrete, holding or input
        region: Region,
        address: u16,
        #[arg(default_value_t = 1)]
        quantity: u16,
    },

    /// Write a named point
    Write {
        point: String,
        /// Number, true/false, or text for string points
        value: String,
    },

    /// Poll points on an interval until Ctrl-C or `--count` snapshots
    Poll {
        /// Interval in milliseconds (profile default when omitted)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Stop after this many snapshots
        #[arg(short, long)]
        count: Option<u64>,

        /// Points to poll (profile selection when none are given)
        points: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let profile = DeviceProfile::load(&cli.profile)
        .with_context(|| format!("loading profile {}", cli.profile.display()))?;
    debug!("Loaded profile for {}", profile.device.name);

    if let Commands::Points = cli.command {
        return list_points(&profile, cli.json);
    }

    let client = if cli.simulate {
        info!("Using simulated device");
        let device = SimulatedDevice::new(profile.device.protocol, profile.device.unit_id);
        ModbusClient::with_connector(Arc::new(MockConnector::new(device)))
    } else {
        ModbusClient::system()
    };
    let resolver = PointResolver::new(client.clone(), Arc::new(profile.register_map()?));

    let connected = client.connect(profile.device.clone()).await;
    if let Commands::Status = cli.command {
        print_status(&client.status(), cli.json)?;
        return connected.map_err(Into::into);
    }
    connected.with_context(|| format!("connecting to {}", profile.device.name))?;

    let outcome = match cli.command {
        Commands::Read { points } => {
            let names = if points.is_empty() {
                profile.polling_points()
            } else {
                points
            };
            read_points(&resolver, &names, cli.json).await
        },
        Commands::ReadRaw {
            region,
            address,
            quantity,
        } => read_raw(&client, region, address, quantity, cli.json).await,
        Commands::Write { point, value } => write_point(&resolver, &point, &value).await,
        Commands::Poll {
            interval,
            count,
            points,
        } => {
            let interval =
                Duration::from_millis(interval.unwrap_or(profile.polling.interval_ms));
            let names = if points.is_empty() {
                profile.polling_points()
            } else {
                points
            };
            poll(resolver, interval, names, count, cli.json).await
        },
        Commands::Status | Commands::Points => Ok(()),
    };

    client.disconnect().await;
    outcome
}

fn list_points(profile: &DeviceProfile, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&profile.registers)?);
        return Ok(());
    }

    let map = profile.register_map()?;
    println!("{} ({} points)", profile.device.name.bold(), map.len());
    for point in map.iter() {
        let spec = point.spec();
        let access = if point.is_writable() { "rw" } else { "ro" };
        println!(
            "  {:<20} {:<16} {:>5} x{:<3} {} {}",
            point.name().cyan(),
            spec.region().to_string(),
            spec.address(),
            spec.register_count(),
            access.dimmed(),
            point.description().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_status(status: &LinkStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    let state = match status.state {
        ConnectionState::Connected => status.state.to_string().green(),
        ConnectionState::Failed { .. } => status.state.to_string().red(),
        _ => status.state.to_string().yellow(),
    };
    let attempt = status.state.attempt();
    if attempt > 0 {
        println!(
            "{}: {} (attempt {}/{})",
            status.device.bold(),
            state,
            attempt,
            status.max_attempts
        );
    } else {
        println!("{}: {}", status.device.bold(), state);
    }
    if let Some(at) = status.last_connected {
        println!("  last connected: {}", at.to_rfc3339());
    }
    if let Some(error) = &status.last_error {
        let at = status
            .last_error_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!("  last error:     {} ({})", error.to_string().red(), at);
    }
    Ok(())
}

async fn read_points(resolver: &PointResolver, names: &[String], json: bool) -> Result<()> {
    let snapshot = resolver.read_all(names).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        for (name, reading) in &snapshot.metrics {
            println!(
                "{:<20} {} {}",
                name.cyan(),
                reading.value,
                reading.units.as_deref().unwrap_or_default()
            );
        }
        for (name, error) in &snapshot.errors {
            println!("{:<20} {}", name.cyan(), error.to_string().red());
        }
    }

    if !snapshot.is_complete() {
        bail!("{} of {} points failed", snapshot.errors.len(), names.len());
    }
    Ok(())
}

async fn read_raw(
    client: &ModbusClient,
    region: Region,
    address: u16,
    quantity: u16,
    json: bool,
) -> Result<()> {
    let result = client.read_raw(region, address, quantity).await?;
    let rows: Vec<(u16, String)> = match &result.data {
        RawData::Words(words) => words
            .iter()
            .enumerate()
            .map(|(i, w)| (address.wrapping_add(i as u16), format!("0x{:04X} {}", w, w)))
            .collect(),
        RawData::Bits(bits) => bits
            .iter()
            .enumerate()
            .map(|(i, b)| (address.wrapping_add(i as u16), u8::from(*b).to_string()))
            .collect(),
    };

    if json {
        let values: serde_json::Value = match &result.data {
            RawData::Words(words) => serde_json::json!(words),
            RawData::Bits(bits) => serde_json::json!(bits),
        };
        let out = serde_json::json!({
            "region": result.region,
            "address": result.address,
            "values": values,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (addr, value) in rows {
            println!("{} {:>5}  {}", region.to_string().dimmed(), addr, value);
        }
    }
    Ok(())
}

async fn write_point(resolver: &PointResolver, name: &str, input: &str) -> Result<()> {
    let value = ProtocolValue::parse(input).unwrap_or_else(|| ProtocolValue::Text(input.to_string()));
    resolver
        .write_by_name(name, &DecodedValue::Single(value.clone()))
        .await
        .with_context(|| format!("writing {}", name))?;
    println!("{} {} = {}", "OK".green(), name.cyan(), value);
    Ok(())
}

async fn poll(
    resolver: PointResolver,
    interval: Duration,
    names: Vec<String>,
    count: Option<u64>,
    json: bool,
) -> Result<()> {
    let driver = PollingDriver::new(resolver);
    let mut rx = driver.subscribe();
    let handle = driver.start_polling(interval, names).await?;

    let mut seen = 0u64;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }

        let Some(snapshot) = rx.borrow_and_update().clone() else {
            continue;
        };
        if json {
            println!("{}", serde_json::to_string(&snapshot)?);
        } else {
            let values: Vec<String> = snapshot
                .metrics
                .iter()
                .map(|(name, r)| format!("{}={}", name, r.value))
                .chain(
                    snapshot
                        .errors
                        .keys()
                        .map(|name| format!("{}={}", name, "ERR".red())),
                )
                .collect();
            println!(
                "{} {}",
                snapshot.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                values.join(" ")
            );
        }

        seen += 1;
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    driver.stop_polling(handle).await;
    let state = driver.poll_state();
    info!("Polling finished after {} ticks", state.ticks);
    Ok(())
}
