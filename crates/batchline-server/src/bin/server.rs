//! batchline server binary.
//!
//! Exit codes: 0 clean shutdown, 1 fatal configuration error, 2 port-bind
//! failure.

use batchline_server::{Service, config::Settings};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "batchline-server")]
#[command(about = "Dynamic batching front end for text-generation inference")]
struct Args {
    /// Server host address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json, pretty, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level, &args.log_format);

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let service = match Service::new(settings).await {
        Ok(service) => service,
        Err(err) => {
            error!(error = %err, "failed to construct service");
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind");
            std::process::exit(2);
        }
    };

    let workers = service.spawn_workers();

    {
        let service = service.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            info!("shutdown signal received");
            service.begin_shutdown();
        });
    }

    if let Err(err) = service.serve(listener).await {
        error!(error = %err, "server error");
        std::process::exit(1);
    }

    // Let the batcher finish its shutdown drain before exiting.
    let _ = workers.batcher.await;
    workers.eviction.abort();
    info!("server stopped");
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

/// Wait for ctrl-c or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
