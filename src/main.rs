//! Field Monitor Binary

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use field_monitor::alarm::evaluate;
use field_monitor::fetcher::{ThingSpeakClient, ValueFetcher};
use field_monitor::model::{DEFAULT_GRAPH_POINTS, DEFAULT_UPDATE_INTERVAL_SECS};
use field_monitor::render::ViewState;
use field_monitor::schedule::{ActiveWindows, Day, LocalTime, TimeWindow};
use field_monitor::store::{ConfigStore, JsonFileStore};
use field_monitor::{Config, FieldIndex, InstanceConfig, InstanceId, MonitorError, MonitorService, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Polls ThingSpeak channel fields and raises alarms on threshold crossings.
#[derive(Parser, Debug)]
#[command(name = "field_monitor", version, about)]
struct Cli {
    /// Directory holding instance configurations
    #[arg(long, global = true, env = "MONITOR_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// ThingSpeak API base URL
    #[arg(long, global = true, env = "THINGSPEAK_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitor until Ctrl-C
    Run,
    /// Create or replace an instance configuration; a running monitor
    /// refreshes it on its next store scan
    Save(SaveArgs),
    /// Delete an instance configuration; a running monitor stops polling it
    Delete {
        #[arg(long)]
        id: u32,
    },
    /// Ask a running monitor to refresh an instance now
    Refresh {
        #[arg(long)]
        id: u32,
    },
    /// List configured instances
    List,
    /// Fetch and evaluate an instance once
    Show {
        #[arg(long)]
        id: u32,
    },
    /// Print the most recent entries of an instance's field
    History {
        #[arg(long)]
        id: u32,

        /// Number of entries; defaults to the instance's graph points
        #[arg(long)]
        results: Option<u32>,
    },
}

#[derive(Args, Debug)]
struct SaveArgs {
    #[arg(long)]
    id: u32,

    #[arg(long)]
    channel: String,

    /// Field number 1-8
    #[arg(long, default_value_t = 1)]
    field: u8,

    /// Read API key for private channels
    #[arg(long)]
    api_key: Option<String>,

    /// Update interval in seconds
    #[arg(long, default_value_t = DEFAULT_UPDATE_INTERVAL_SECS)]
    interval: u64,

    #[arg(long, allow_negative_numbers = true)]
    upper: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    lower: Option<f64>,

    /// Active window as DAY=HH:MM-HH:MM, repeatable
    #[arg(long = "window", value_parser = parse_day_window)]
    windows: Vec<(Day, TimeWindow)>,

    #[arg(long)]
    hide_alarms: bool,

    #[arg(long)]
    hide_schedules: bool,

    #[arg(long, default_value_t = DEFAULT_GRAPH_POINTS)]
    graph_points: u32,
}

fn parse_day_window(value: &str) -> std::result::Result<(Day, TimeWindow), String> {
    let (day, window) = value
        .split_once('=')
        .ok_or_else(|| format!("expected DAY=HH:MM-HH:MM, got {}", value))?;
    let day: Day = day.parse().map_err(|e: MonitorError| e.to_string())?;
    let window: TimeWindow = window.parse().map_err(|e: MonitorError| e.to_string())?;
    Ok((day, window))
}

impl SaveArgs {
    fn into_config(self) -> Result<InstanceConfig> {
        let mut config = InstanceConfig::new(self.channel, FieldIndex::new(self.field)?);
        config.api_key = self.api_key.filter(|key| !key.is_empty());
        config.update_interval_secs = self.interval;
        config.upper_limit = self.upper;
        config.lower_limit = self.lower;
        config.active_windows = self.windows.into_iter().collect::<ActiveWindows>();
        config.show_alarms = !self.hide_alarms;
        config.show_schedules = !self.hide_schedules;
        config.graph_points = self.graph_points;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }
    if let Some(url) = cli.base_url {
        config.thingspeak_url = url;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = execute(cli.command, config).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn execute(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Run => {
            info!(
                "Monitor configuration - Store: {}, Source: {}, Min interval: {}s, Fetch timeout: {}s",
                config.store_dir.display(),
                config.thingspeak_url,
                config.min_update_interval.as_secs(),
                config.fetch_timeout.as_secs()
            );
            let service = MonitorService::new(config).await?;
            service.start().await
        }
        Command::Save(args) => {
            let id = InstanceId(args.id);
            let instance = args.into_config()?;
            instance.validate()?;

            let store = JsonFileStore::open(&config.store_dir).await?;
            store.save(id, &instance).await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
            Ok(())
        }
        Command::Delete { id } => {
            let store = JsonFileStore::open(&config.store_dir).await?;
            store.delete(InstanceId(id)).await?;
            info!("Deleted instance {}", id);
            Ok(())
        }
        Command::Refresh { id } => {
            let id = InstanceId(id);
            let store = JsonFileStore::open(&config.store_dir).await?;
            if store.load(id).await?.is_none() {
                return Err(MonitorError::ConfigMissing(id));
            }
            store.request_refresh(id).await?;
            info!(
                "Refresh of instance {} requested, picked up within {}s",
                id,
                config.store_poll_interval.as_secs()
            );
            Ok(())
        }
        Command::List => {
            let store = JsonFileStore::open(&config.store_dir).await?;
            for id in store.list().await? {
                match store.load(id).await {
                    Ok(Some(instance)) => println!(
                        "{}\tchannel {}\tfield {}\tevery {}s",
                        id, instance.channel_id, instance.field, instance.update_interval_secs
                    ),
                    Ok(None) => {}
                    Err(e) => println!("{}\tunreadable: {}", id, e),
                }
            }
            Ok(())
        }
        Command::Show { id } => {
            let (instance, client) = open_instance(&config, InstanceId(id)).await?;

            let view = match client
                .fetch_latest(&instance.channel_id, instance.field, instance.api_key.as_deref())
                .await
            {
                Ok(reading) => {
                    let alarm = evaluate(reading.value, &instance, LocalTime::from_datetime(&Local::now()));
                    ViewState::data(&instance, &reading, &alarm)
                }
                Err(e) => ViewState::Error {
                    message: e.to_string(),
                    last_known: None,
                },
            };

            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Command::History { id, results } => {
            let (instance, client) = open_instance(&config, InstanceId(id)).await?;
            let results = results.unwrap_or(instance.graph_points);

            let history = client
                .fetch_history(&instance.channel_id, instance.field, instance.api_key.as_deref(), results)
                .await?;

            println!(
                "{} / {}",
                history.channel_name.as_deref().unwrap_or("unnamed channel"),
                history.field_name.as_deref().unwrap_or("unnamed field")
            );
            for reading in &history.readings {
                println!(
                    "{}\t{}",
                    reading.observed_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    reading.raw.as_deref().unwrap_or("null")
                );
            }
            Ok(())
        }
    }
}

async fn open_instance(config: &Config, id: InstanceId) -> Result<(InstanceConfig, ThingSpeakClient)> {
    let store = JsonFileStore::open(&config.store_dir).await?;
    let instance = store.load(id).await?.ok_or(MonitorError::ConfigMissing(id))?;
    let client = ThingSpeakClient::new(&config.thingspeak_url, config.http_timeout)?;
    Ok((instance, client))
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
