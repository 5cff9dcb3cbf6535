//! Main entry point for the Meridian proxy.
//!
//! Parses the CLI, loads configuration, wires the proxy context, and runs
//! the server until a termination signal arrives.

mod cli;
mod config;
mod signals;

use std::sync::Arc;
use std::time::Duration;

use proxy_protocol::Compression;
use proxy_server::backend::tcp::TcpConnector;
use proxy_server::{HookChain, PaletteCatalog, ProxyContext, ProxyServer, StaticRegistry};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::CliArgs;
use config::{AppConfig, LoggingSettings};

/// Initializes the logging system.
fn setup_logging(settings: &LoggingSettings, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);

    if json_format || settings.json_format {
        registry
            .with(fmt::layer().json().with_file(false).with_line_number(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_file(false).with_line_number(false))
            .init();
    }
}

/// The assembled application: configuration plus a ready-to-run server.
struct Application {
    server: ProxyServer,
    bind_address: std::net::SocketAddr,
}

impl Application {
    /// Loads configuration, applies CLI overrides, and builds the server.
    async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.proxy.bind_address = bind_address.parse()?;
        }
        if let Some(default_backend) = args.default_backend {
            config.proxy.default_backend = default_backend;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config.proxy.validate()?;
        setup_logging(&config.logging, args.json_logs);

        info!("Meridian Proxy v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "Config: {} | Backends: {}",
            args.config_path.display(),
            config.proxy.backends.len()
        );

        let registry = Arc::new(StaticRegistry::from_config(&config.proxy));
        let connector = Arc::new(TcpConnector::new(
            Duration::from_secs(config.proxy.transfer.connect_timeout_secs),
            Compression::Zlib,
            false,
        ));
        let bind_address = config.proxy.bind_address;
        let context = ProxyContext::new(
            config.proxy,
            registry,
            connector,
            HookChain::new(),
            PaletteCatalog::identity(),
        );
        Ok(Self {
            server: ProxyServer::new(context),
            bind_address,
        })
    }

    /// Runs until a termination signal arrives.
    async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Starting proxy on {}", self.bind_address);

        let server = Arc::new(self.server);
        let runner = {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("proxy server failed: {e}");
                    std::process::exit(1);
                }
            })
        };

        signals::wait_for_shutdown().await?;
        info!("Shutting down, {} sessions live", server.session_count());
        server.shutdown();
        runner.await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let app = Application::new(args).await?;
    app.run().await
}
