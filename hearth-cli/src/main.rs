//! CLI for the hearth telemetry store.
//!
//! Runs the ingestion daemon, inspects stores, rebuilds rollups, and sends
//! commands to devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use hearth::bus::{Bus, MqttBus, call_topic};
use hearth::config::{HearthConfig, parse_utc_offset};
use hearth::ingest::publish_with_retry;
use hearth::model::{Command, PeriodKind};
use hearth::notify::TracingSink;
use hearth::store::Collection;
use hearth::{IngestionManager, Notifier, RollupEngine, TelemetryStore};
use tracing_subscriber::EnvFilter;

/// hearth — Device telemetry ingestion and inspection CLI.
#[derive(Parser)]
#[command(name = "hearth", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion daemon until interrupted.
    Run {
        /// JSON config file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Store directory (overrides the config).
        #[arg(long)]
        store: Option<PathBuf>,

        /// Broker address as host:port (overrides the config).
        #[arg(long)]
        broker: Option<String>,
    },

    /// List known devices.
    Devices {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Print the samples of one sensor.
    Values {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Device id.
        device: String,

        /// Sensor id.
        sensor: String,

        /// Time range ending now (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "1h")]
        range: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print the most recent sample of one sensor.
    Latest {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Device id.
        device: String,

        /// Sensor id.
        sensor: String,
    },

    /// Print the most recent events of one source.
    Events {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Event source id.
        id: String,

        /// Maximum number of events.
        #[arg(long, default_value = "10")]
        count: usize,
    },

    /// Print rollups of one sensor.
    Meta {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Device id.
        device: String,

        /// Sensor id.
        sensor: String,

        /// Period granularity: hour, day, week or month.
        #[arg(long, default_value = "hour")]
        period: PeriodKind,

        /// Time range ending now (e.g., "1d", "30d").
        #[arg(long, default_value = "1d")]
        range: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Recompute every rollup of one sensor from its raw samples.
    Rebuild {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Device id.
        device: String,

        /// Sensor id; every declared output of the device when omitted.
        sensor: Option<String>,

        /// Offset rollup periods are aligned to.
        #[arg(long, default_value = "+00:00")]
        utc_offset: String,
    },

    /// Print every raw record of one collection.
    Dump {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Collection: devices, values, events or meta.
        collection: Collection,
    },

    /// Publish a command to a device.
    Call {
        /// JSON config file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Broker address as host:port (overrides the config).
        #[arg(long)]
        broker: Option<String>,

        /// Device id.
        device: String,

        /// Method name.
        method: String,

        /// Method parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            store,
            broker,
        } => cmd_run(config.as_deref(), store, broker.as_deref()),
        Commands::Devices { store_path } => cmd_devices(&store_path),
        Commands::Values {
            store_path,
            device,
            sensor,
            range,
            format,
        } => cmd_values(&store_path, &device, &sensor, &range, &format),
        Commands::Latest {
            store_path,
            device,
            sensor,
        } => cmd_latest(&store_path, &device, &sensor),
        Commands::Events {
            store_path,
            id,
            count,
        } => cmd_events(&store_path, &id, count),
        Commands::Meta {
            store_path,
            device,
            sensor,
            period,
            range,
            format,
        } => cmd_meta(&store_path, &device, &sensor, period, &range, &format),
        Commands::Rebuild {
            store_path,
            device,
            sensor,
            utc_offset,
        } => cmd_rebuild(&store_path, &device, sensor.as_deref(), &utc_offset),
        Commands::Dump {
            store_path,
            collection,
        } => cmd_dump(&store_path, collection),
        Commands::Call {
            config,
            broker,
            device,
            method,
            params,
        } => cmd_call(config.as_deref(), broker.as_deref(), &device, &method, &params),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Loads the config file (or defaults) and applies flag overrides.
fn load_config(
    path: Option<&Path>,
    store: Option<PathBuf>,
    broker: Option<&str>,
) -> Result<HearthConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => HearthConfig::load(path)?,
        None => HearthConfig::default(),
    };
    if let Some(store) = store {
        config = config.with_store_path(store);
    }
    if let Some(broker) = broker {
        let (host, port) = parse_broker(broker)?;
        config = config.with_broker(host, port);
    }
    config.validate()?;
    Ok(config)
}

/// Opens an existing store for inspection.
fn open_store(store_path: &Path) -> Result<TelemetryStore, Box<dyn std::error::Error>> {
    if !store_path.exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(TelemetryStore::open(store_path, false)?)
}

/// Implements `hearth run`.
fn cmd_run(
    config_path: Option<&Path>,
    store: Option<PathBuf>,
    broker: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, store, broker)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_daemon(config))
}

async fn run_daemon(config: HearthConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        store = %config.store_path.display(),
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        utc_offset = %config.utc_offset,
        "hearth starting"
    );

    let store = Arc::new(TelemetryStore::open(&config.store_path, config.sync_writes)?);
    let rollup = RollupEngine::new(Arc::clone(&store), config.zone()?);
    let (bus, inbound) = MqttBus::connect(&config.mqtt, config.bus_timeouts());
    let bus = Arc::new(bus);
    let (notifier, _notifications) = Notifier::spawn(Arc::new(TracingSink), config.notify_capacity);

    let manager = IngestionManager::new(
        Arc::clone(&store),
        rollup,
        Arc::clone(&bus) as Arc<dyn Bus>,
        notifier,
        config.publish,
    );

    let outcome = tokio::select! {
        result = async {
            manager.start().await?;
            manager.run(inbound).await
        } => result.map_err(Into::into),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received, shutting down");
            Ok(())
        }
    };

    bus.disconnect().await;
    store.flush()?;
    tracing::info!("store flushed");
    outcome
}

/// Implements `hearth devices <store_path>`.
fn cmd_devices(store_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let devices = store.list_devices()?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

/// Implements `hearth values <store_path> <device> <sensor>`.
fn cmd_values(
    store_path: &Path,
    device: &str,
    sensor: &str,
    range: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let end = Utc::now();
    let start = end - parse_duration(range)?;
    let values = store.values_in_range(device, sensor, start, end)?;

    match format {
        OutputFormat::Csv => {
            println!("# device={device}, sensor={sensor}, points={}", values.len());
            println!("time,value");
            for value in &values {
                let time = value.time.map(|t| t.to_rfc3339()).unwrap_or_default();
                let reading = value.payload.as_ref().map(ToString::to_string).unwrap_or_default();
                println!("{time},{reading}");
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "device": device,
                "sensor": sensor,
                "count": values.len(),
                "data": values,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `hearth latest <store_path> <device> <sensor>`.
fn cmd_latest(store_path: &Path, device: &str, sensor: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let value = store
        .latest_value(device, sensor)?
        .ok_or_else(|| format!("No samples for '{device}/{sensor}'"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Implements `hearth events <store_path> <id>`.
fn cmd_events(store_path: &Path, id: &str, count: usize) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let events = store.last_events(id, count)?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

/// Implements `hearth meta <store_path> <device> <sensor>`.
fn cmd_meta(
    store_path: &Path,
    device: &str,
    sensor: &str,
    period: PeriodKind,
    range: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let end = Utc::now();
    let start = end - parse_duration(range)?;
    let rollups = store.meta_in_range(device, sensor, period, start, end)?;

    match format {
        OutputFormat::Csv => {
            println!("# device={device}, sensor={sensor}, period={period}, windows={}", rollups.len());
            println!("start,min,max,avg,n");
            for (window_start, meta) in &rollups {
                println!(
                    "{},{},{},{},{}",
                    window_start.to_rfc3339(),
                    meta.min,
                    meta.max,
                    meta.avg,
                    meta.n
                );
            }
        }
        OutputFormat::Json => {
            let data: Vec<serde_json::Value> = rollups
                .iter()
                .map(|(window_start, meta)| {
                    serde_json::json!({
                        "start": window_start,
                        "min": meta.min,
                        "max": meta.max,
                        "avg": meta.avg,
                        "n": meta.n,
                    })
                })
                .collect();
            let output = serde_json::json!({
                "device": device,
                "sensor": sensor,
                "period": period,
                "count": rollups.len(),
                "data": data,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `hearth rebuild <store_path> <device> [sensor]`.
fn cmd_rebuild(
    store_path: &Path,
    device: &str,
    sensor: Option<&str>,
    utc_offset: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let zone = parse_utc_offset(utc_offset).ok_or_else(|| format!("Invalid UTC offset '{utc_offset}'"))?;
    let store = Arc::new(open_store(store_path)?);
    let engine = RollupEngine::new(Arc::clone(&store), zone);

    let sensors: Vec<String> = match sensor {
        Some(sensor) => vec![sensor.to_string()],
        None => store
            .get_device(device)?
            .ok_or_else(|| format!("Device '{device}' not found"))?
            .out
            .into_iter()
            .map(|o| o.id)
            .collect(),
    };

    for sensor in &sensors {
        let windows = engine.rebuild_series(device, sensor)?;
        println!("{device}/{sensor}: {windows} windows rebuilt");
    }
    store.flush()?;
    Ok(())
}

/// Implements `hearth dump <store_path> <collection>`.
fn cmd_dump(store_path: &Path, collection: Collection) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(store_path)?;
    let pairs = store.dump(collection)?;
    for (key, value) in &pairs {
        println!("{key}\t{value}");
    }
    eprintln!("{} records in {collection}", pairs.len());
    Ok(())
}

/// Implements `hearth call <device> <method>`.
fn cmd_call(
    config_path: Option<&Path>,
    broker: Option<&str>,
    device: &str,
    method: &str,
    params: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, None, broker)?;
    let params: serde_json::Map<String, serde_json::Value> = serde_json::from_str(params)
        .map_err(|e| format!("--params must be a JSON object: {e}"))?;
    let command = Command {
        method: method.to_string(),
        params,
    };
    let payload = serde_json::to_vec(&command)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (bus, _inbound) = MqttBus::connect(&config.mqtt, config.bus_timeouts());
        // Publishing requires a live connection; give the event loop time to connect.
        if let Err(e) = bus.reconnect().await {
            tracing::warn!(error = %e, "broker not reachable yet");
        }
        let topic = call_topic(device);
        let result = publish_with_retry(&bus, &topic, payload, &config.publish).await;
        bus.disconnect().await;
        let attempt = result?;
        println!("Published {method} to {topic} (attempt {attempt})");
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Parses `host:port`.
fn parse_broker(s: &str) -> Result<(String, u16), Box<dyn std::error::Error>> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("Broker '{s}' must be host:port"))?;
    if host.is_empty() {
        return Err(format!("Broker '{s}' has an empty host").into());
    }
    Ok((host.to_string(), port.parse()?))
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d").
fn parse_duration(s: &str) -> Result<TimeDelta, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }
    if !s.is_ascii() {
        return Err(format!("Invalid duration '{s}'").into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: i64 = num_str.parse()?;

    let delta = match unit {
        "s" => TimeDelta::try_seconds(num),
        "m" => TimeDelta::try_minutes(num),
        "h" => TimeDelta::try_hours(num),
        "d" => TimeDelta::try_days(num),
        "w" => TimeDelta::try_weeks(num),
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, d, or w.").into()),
    };
    delta.ok_or_else(|| format!("Duration '{s}' is out of range").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), TimeDelta::seconds(90));
        assert_eq!(parse_duration("30m").unwrap(), TimeDelta::minutes(30));
        assert_eq!(parse_duration(" 1h ").unwrap(), TimeDelta::hours(1));
        assert_eq!(parse_duration("7d").unwrap(), TimeDelta::days(7));
        assert_eq!(parse_duration("2w").unwrap(), TimeDelta::weeks(2));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5y").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_parse_broker() {
        assert_eq!(parse_broker("broker.local:1883").unwrap(), ("broker.local".to_string(), 1883));
        assert!(parse_broker("broker.local").is_err());
        assert!(parse_broker(":1883").is_err());
        assert!(parse_broker("host:notaport").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["hearth", "meta", "./db", "d1", "temp", "--period", "week"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Meta {
                period: PeriodKind::Week,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["hearth", "dump", "./db", "events"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Dump {
                collection: Collection::Events,
                ..
            }
        ));

        assert!(Cli::try_parse_from(["hearth", "dump", "./db", "nope"]).is_err());
    }
}
