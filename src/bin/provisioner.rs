use clap::Parser;
use dotenv::dotenv;
use panel_provisioner::config::ProvisionerConfig;
use panel_provisioner::crypto::CredentialCipher;
use panel_provisioner::db::sync_schema;
use panel_provisioner::panel::xui::{LinkSettings, XuiConnector};
use panel_provisioner::provisioning::{LockRegistry, ProvisioningService};
use panel_provisioner::web::create_axum_router;
use panel_provisioner::worker::{DeliveryQueue, ProvisioningWorker};
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "provisioner.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info,sea_orm=warn` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    dotenv().ok();

    let config = match ProvisionerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!("Starting provisioner, version: {}", VERSION);

    let mut options = ConnectOptions::new(config.database_url.clone());
    options
        .max_connections(20)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(options).await?;
    info!("Database connection established.");

    if config.auto_migrate {
        sync_schema(&db).await?;
    }

    let cipher = Arc::new(CredentialCipher::from_hex_key(&config.panel_credentials_key)?);
    let connector = XuiConnector::new(
        cipher,
        config.request_timeout(),
        config.retry_policy(),
        LinkSettings {
            subscription_url_template: config.subscription_url_template.clone(),
        },
    )?;
    let service = Arc::new(ProvisioningService::new(
        db.clone(),
        Arc::new(connector),
        Arc::new(LockRegistry::new()),
        config.dedicated_ports(),
    ));

    let (deliveries, delivery_rx) = DeliveryQueue::channel(config.worker_concurrency * 16);
    let worker = tokio::spawn(
        ProvisioningWorker::new(service.clone(), config.worker_concurrency).run(delivery_rx),
    );

    let app = create_axum_router(db, service, deliveries);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(listen_addr = %config.listen_addr, "Admin API listening.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last queue handle; the worker drains and exits.
    if let Err(e) = worker.await {
        error!(error = %e, "Provisioning worker task failed.");
    }
    info!("Provisioner stopped.");
    Ok(())
}
