//! Taste Sensor Hub CLI
//!
//! Runs the ingestion/query server and offers a few offline commands over the
//! reading store.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use taste_sensor_hub::{config::Config, store::TimeSeriesStore, VERSION};

#[cfg(feature = "classifier")]
use taste_sensor_hub::classifier::{BlockingTasteClassifier, ClassifierConfig};

#[derive(Parser)]
#[command(name = "taste-sensor")]
#[command(version = VERSION)]
#[command(about = "Sensor ingestion, time-series queries and taste classification", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Directory holding the reading log
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep readings in memory only
        #[arg(long)]
        in_memory: bool,
    },

    /// Print the most recent stored readings
    Recent {
        /// Number of readings to print
        #[arg(long, short, default_value = "10")]
        limit: usize,

        /// Directory holding the reading log
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Classify the latest stored reading
    Classify {
        /// Directory holding the reading log
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            data_dir,
            in_memory,
        } => {
            cmd_serve(host, port, data_dir, in_memory);
        }
        Commands::Recent { limit, data_dir } => {
            cmd_recent(limit, data_dir);
        }
        Commands::Classify { data_dir } => {
            cmd_classify(data_dir);
        }
        Commands::Config => {
            cmd_config();
        }
    }
}

fn load_config(data_dir: Option<PathBuf>) -> Config {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(dir) = data_dir {
        config.data_path = dir;
    }
    config
}

#[cfg(feature = "server")]
fn open_store(config: &Config) -> TimeSeriesStore {
    if let Err(e) = config.ensure_directories() {
        eprintln!("Error: Could not create data directory: {e}");
        std::process::exit(1);
    }
    match TimeSeriesStore::open_in_dir(&config.data_path) {
        Ok(store) => store.with_sync(config.sync_writes),
        Err(e) => {
            eprintln!("Error opening reading store in {:?}: {e}", config.data_path);
            std::process::exit(1);
        }
    }
}

/// Load the reading store without writing to it, so a running server is
/// left undisturbed.
fn open_snapshot(config: &Config) -> TimeSeriesStore {
    match TimeSeriesStore::open_read_only_in_dir(&config.data_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error reading store in {:?}: {e}", config.data_path);
            std::process::exit(1);
        }
    }
}

#[cfg(feature = "server")]
fn cmd_serve(host: Option<IpAddr>, port: Option<u16>, data_dir: Option<PathBuf>, in_memory: bool) {
    use std::sync::Arc;
    use taste_sensor_hub::server::{self, ServerConfig};

    init_tracing();

    let mut config = load_config(data_dir);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let store = if in_memory {
        tracing::warn!("Running with an in-memory store; readings are lost on exit");
        TimeSeriesStore::in_memory()
    } else {
        open_store(&config)
    };

    let classifier = match ClassifierConfig::from_env() {
        Ok(classifier) => {
            tracing::info!(model = %classifier.model, "Taste classification enabled");
            Some(classifier)
        }
        Err(e) => {
            tracing::info!("Taste classification disabled: {}", e);
            None
        }
    };

    let server_config = ServerConfig::new(config.port, Arc::new(store))
        .with_host(config.host)
        .with_classifier(classifier)
        .with_default_limit(config.default_limit)
        .with_window(config.window);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error creating runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::serve(server_config, shutdown_signal())) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

#[cfg(not(feature = "server"))]
fn cmd_serve(_host: Option<IpAddr>, _port: Option<u16>, _data_dir: Option<PathBuf>, _in_memory: bool) {
    eprintln!("Error: serve requires the server feature");
    std::process::exit(1);
}

fn cmd_recent(limit: usize, data_dir: Option<PathBuf>) {
    let config = load_config(data_dir);
    let store = open_snapshot(&config);

    let readings = match store.latest(limit) {
        Ok(readings) => readings,
        Err(e) => {
            eprintln!("Error reading store: {e}");
            std::process::exit(1);
        }
    };

    if readings.is_empty() {
        println!("No readings stored in {:?}", config.data_path);
        return;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&readings).unwrap_or_else(|_| "Error".to_string())
    );
}

#[cfg(feature = "classifier")]
fn cmd_classify(data_dir: Option<PathBuf>) {
    let classifier = match BlockingTasteClassifier::from_env() {
        Ok(classifier) => classifier,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Set OPENAI_API_KEY to enable taste classification.");
            std::process::exit(1);
        }
    };

    let config = load_config(data_dir);
    let store = open_snapshot(&config);

    let latest = match store.latest(1) {
        Ok(mut readings) => readings.pop(),
        Err(e) => {
            eprintln!("Error reading store: {e}");
            std::process::exit(1);
        }
    };

    let Some(latest) = latest else {
        println!("No readings stored in {:?}", config.data_path);
        return;
    };

    println!(
        "Latest reading: {} at {}",
        latest.id,
        latest.reading.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );

    match classifier.classify(&latest.reading.values) {
        Ok(taste) => println!("Predicted taste: {taste}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(feature = "classifier"))]
fn cmd_classify(_data_dir: Option<PathBuf>) {
    eprintln!("Error: classify requires the classifier feature");
    std::process::exit(1);
}

fn cmd_config() {
    let config = load_config(None);

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );

    #[cfg(feature = "classifier")]
    {
        println!();
        match ClassifierConfig::from_env() {
            Ok(classifier) => println!(
                "Classifier: {} ({}, timeout {}s)",
                classifier.completions_url(),
                classifier.model,
                classifier.timeout.as_secs()
            ),
            Err(e) => println!("Classifier: disabled ({e})"),
        }
    }
}

/// Install the tracing subscriber.
#[cfg(feature = "server")]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taste_sensor_hub=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve when Ctrl+C is received.
#[cfg(feature = "server")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
