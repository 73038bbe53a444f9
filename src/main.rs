use clap::Parser;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tripflow::application::engine::TripEngine;
use tripflow::config::EngineConfig;
use tripflow::domain::money::FeePolicy;
use tripflow::domain::ports::{GatewayHandle, NotifierHandle};
use tripflow::infrastructure::notifier::TracingNotifier;
use tripflow::infrastructure::sandbox_gateway::SandboxGateway;
use tripflow::interfaces::csv::command_reader::CommandReader;
use tripflow::interfaces::csv::report_writer::ReportWriter;
use tripflow::interfaces::replay::ScenarioRunner;
use tripflow::telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file
    input: PathBuf,

    /// Path to persistent database (optional). Requires the `storage-rocksdb` feature.
    #[arg(long, env = "TRIPFLOW_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Share of each collected payment credited to the provider, in (0, 1].
    #[arg(long, env = "TRIPFLOW_PROVIDER_SHARE", default_value = "1")]
    provider_share: Decimal,

    #[arg(long, env = "TRIPFLOW_STORE_TIMEOUT_MS", default_value_t = 2_000)]
    store_timeout_ms: u64,

    #[arg(long, env = "TRIPFLOW_GATEWAY_TIMEOUT_MS", default_value_t = 10_000)]
    gateway_timeout_ms: u64,

    /// Shared secret for signing and verifying gateway callbacks.
    #[arg(long, env = "TRIPFLOW_CALLBACK_SECRET", default_value = "tripflow-sandbox")]
    callback_secret: String,
}

#[cfg(feature = "storage-rocksdb")]
fn build_engine(
    db_path: Option<PathBuf>,
    gateway: GatewayHandle,
    notifier: NotifierHandle,
    config: &EngineConfig,
) -> Result<TripEngine> {
    use tripflow::infrastructure::rocksdb::RocksDbStore;
    use tripflow::infrastructure::timeout::TimeoutStore;

    let Some(db_path) = db_path else {
        return Ok(TripEngine::in_memory(gateway, notifier, config));
    };
    let store = RocksDbStore::open(db_path).into_diagnostic()?;
    let trips = Arc::new(TimeoutStore::new(store.clone(), config.store_timeout));
    let money = Arc::new(TimeoutStore::new(store, config.store_timeout));
    Ok(TripEngine::new(trips, money, gateway, notifier, config))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn build_engine(
    db_path: Option<PathBuf>,
    gateway: GatewayHandle,
    notifier: NotifierHandle,
    config: &EngineConfig,
) -> Result<TripEngine> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: --db-path given but the storage-rocksdb feature is not enabled. Falling back to in-memory storage."
        );
    }
    Ok(TripEngine::in_memory(gateway, notifier, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let config = EngineConfig {
        store_timeout: Duration::from_millis(cli.store_timeout_ms),
        gateway_timeout: Duration::from_millis(cli.gateway_timeout_ms),
        fee_policy: FeePolicy::new(cli.provider_share).into_diagnostic()?,
    };

    let run_id = uuid::Uuid::now_v7().simple().to_string();
    let gateway = SandboxGateway::new().with_namespace(&run_id[run_id.len() - 8..]);
    let notifier: NotifierHandle = Arc::new(TracingNotifier);
    let engine = build_engine(cli.db_path, Arc::new(gateway.clone()), notifier, &config)?;
    let mut runner = ScenarioRunner::new(engine, gateway, cli.callback_secret);

    // Replay commands
    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for cmd_result in reader.commands() {
        match cmd_result {
            Ok(cmd) => {
                if let Err(e) = runner.apply(cmd).await {
                    eprintln!("Error processing command: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
    }

    // Output final state
    let report = runner.engine().report().await.into_diagnostic()?;
    let trips = runner.labelled_trips().await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    writer.write_balances(&report.balances).into_diagnostic()?;
    writer.write_trips(&trips).into_diagnostic()?;

    Ok(())
}
