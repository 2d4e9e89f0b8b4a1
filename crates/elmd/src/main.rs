use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use elmd::gateway::HttpGateway;
use elmd::Config;
use elmd::FeedbackRouter;
use elmd::HomeServer;
use elmd::HomeServerPoller;
use elmd::LogLevel;
use elmd::Scheduler;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "elmd", about = "Electrical load management for instantaneous water heaters")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(default_value = "elmd.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, value_enum)]
    log_level: Option<CliLogLevel>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum CliLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<CliLogLevel> for LogLevel {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Trace => LogLevel::Trace,
            CliLogLevel::Debug => LogLevel::Debug,
            CliLogLevel::Info => LogLevel::Info,
            CliLogLevel::Warn => LogLevel::Warn,
            CliLogLevel::Error => LogLevel::Error,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets(cli.log_level.map(LogLevel::from)))
        .init();

    if cli.check {
        tracing::info!("Configuration {} is valid", cli.config.display());
        return Ok(());
    }

    tracing::info!("elmd starting");
    tracing::info!("Loaded config from: {}", cli.config.display());

    let scheduler = Scheduler::new(config.scheduler.to_scheduler_config())?;

    let mut gateways = Vec::new();
    for gateway_config in &config.gateways {
        let gateway = Arc::new(
            HttpGateway::new(
                &gateway_config.uri,
                &gateway_config.password,
                config.poller.request_timeout(),
            )
            .with_context(|| format!("creating client for {}", gateway_config.uri))?,
        );
        gateways.push((gateway_config, gateway));
    }
    let clients: HashMap<&str, Arc<HttpGateway>> = gateways
        .iter()
        .map(|(gateway_config, gateway)| {
            (gateway_config.uri.trim_end_matches('/'), gateway.clone())
        })
        .collect();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut pollers = Vec::new();
    for (gateway_config, gateway) in &gateways {
        let home_server = Arc::new(HomeServer::new(
            gateway_config.uri.clone(),
            gateway_config.password.clone(),
            gateway_config.name.clone(),
            config.poller.poll_alive_tolerance(),
        ));

        let feedback = Arc::new(FeedbackRouter::new(gateway.clone()));
        for route in &config.feedback_routes {
            if let Some(client) = clients.get(route.gateway.trim_end_matches('/')) {
                feedback.route(route.device_id.clone(), client.clone());
            }
        }

        scheduler.add_home_server(home_server.clone());
        let poller = HomeServerPoller::new(
            home_server,
            gateway.clone(),
            feedback,
            config.poller.to_poller_config(),
            stop_rx.clone(),
        );
        pollers.push((gateway_config.uri.clone(), poller.spawn()));
    }

    scheduler.start();

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = config.api.clone().map(|api| {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = elmd::api::serve(api.listen, api.port, scheduler, api_shutdown_rx).await
            {
                tracing::error!("HTTP API server failed: {}", e);
            }
        })
    });

    tracing::info!("Managing {} gateways", pollers.len());
    tracing::info!("Press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    // The scheduler queues the fail-safe grants; the pollers deliver them on their way out.
    scheduler.stop().await;
    stop_tx.send_replace(true);
    for (uri, handle) in pollers {
        match handle.await {
            Ok(reason) => tracing::info!("[{}] Poller exited: {:?}", uri, reason),
            Err(e) => tracing::error!("[{}] Poller task failed: {}", uri, e),
        }
    }

    if let Some(api_task) = api_task {
        api_shutdown_tx.send(()).ok();
        api_task.await.ok();
    }

    tracing::info!("elmd shutdown complete");

    Ok(())
}
