use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mithra::cli::{self, Command};
use mithra::config::Config;
use mithra::relay::UdpRelay;
use mithra::sentinel::{self, Sentinel};
use mithra::sink::{CallSink, LogSink};
use mithra::sip::SipClient;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    if args.help {
        cli::print_help();
        return Ok(());
    }

    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mithra=info".parse().unwrap()),
        )
        .init();

    info!("Mithra caller-ID service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  SIP server: {}:{}", config.sip_host, config.sip_port);
    info!("  cache dir: {:?}", config.cache_dir);

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        match config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    match args.command {
        Command::Check => {
            // the checker shares the client's settings surface
            config.credentials()?;
            let sentinel = Sentinel::new(config.sentinel_path());
            let code = sentinel::check(&sentinel, config.register_expires).await;
            std::process::exit(code);
        }
        Command::Proxy => {
            let listen: SocketAddr = format!("{}:{}", config.proxy_host, config.sip_port)
                .parse()
                .context("invalid relay listen address")?;
            let upstream = format!("{}:{}", config.sip_host, config.sip_port);
            // log only; call records come from the registered client
            let relay = UdpRelay::bind(listen, upstream, None).await?;
            relay.run(shutdown_token()).await
        }
        Command::Run => {
            let sink: Arc<dyn CallSink> = Arc::new(LogSink);
            let mut client = SipClient::new(Arc::new(config), sink)?;
            client.run(shutdown_token()).await
        }
    }
}

/// Cancellation token fired on SIGINT/SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        signal_token.cancel();
    });

    token
}
