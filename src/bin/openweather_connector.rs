// openweather_connector - OpenWeather observations connector
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use openweather_connector::client::{check_credentials, OpenWeatherClient, DEFAULT_API_URL};
use openweather_connector::config::{AuthConfig, ConfigError, DownstreamConfig, IntegrationConfig};
use openweather_connector::http::RequestContext;
use openweather_connector::metrics::PullMetrics;
use openweather_connector::pull::{poll, shutdown_requested, PullAction};
use openweather_connector::sender::HttpObservationSender;
use openweather_connector::state::{FileStateStore, MemoryStateStore, StateStore};
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::watch;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9783);
const DEFAULT_REFRESH_SECS: u64 = 1200;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;

#[derive(Debug, Parser)]
#[clap(name = "openweather_connector", version = clap::crate_version!())]
struct OpenWeatherConnectorApplication {
    /// Path to the YAML file describing the integration, its locations and credentials
    #[clap(long)]
    config: PathBuf,

    /// URL of the OpenWeather current weather endpoint
    #[clap(long, default_value = DEFAULT_API_URL)]
    api_url: Url,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Pull observations for all configured locations at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_REFRESH_SECS)]
    refresh_secs: u64,

    /// Timeout for each request to OpenWeather or the downstream service, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to. By default, openweather_connector will bind to public address
    /// since the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,

    /// Pull a single time, print the result of the run as JSON, and exit.
    #[clap(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = OpenWeatherConnectorApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let config = IntegrationConfig::load(&opts.config).unwrap_or_else(|e| {
        tracing::error!(message = "unable to load configuration", path = %opts.config.display(), error = %e);
        process::exit(1)
    });

    let (auth, downstream) = required_sections(&config).unwrap_or_else(|e| {
        tracing::error!(message = "incomplete configuration", path = %opts.config.display(), error = %e);
        process::exit(1)
    });

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    // Make an initial request to verify the credential. A rejected key will never work
    // so there's no point in running indefinitely with it, any other failure might be
    // temporary.
    let client = OpenWeatherClient::new(http_client.clone(), opts.api_url.clone());
    match check_credentials(&client, &auth.api_key).await {
        Ok(res) if !res.valid_credentials => {
            tracing::error!(message = "OpenWeather rejected the configured API key");
            process::exit(1)
        }
        Err(e) => {
            tracing::warn!(message = "failed to verify OpenWeather API key", error = %e);
        }
        Ok(_) => {
            tracing::debug!(message = "verified OpenWeather API key");
        }
    }

    let sender = HttpObservationSender::from_config(http_client, &downstream).unwrap_or_else(|e| {
        tracing::error!(message = "invalid downstream configuration", error = %e);
        process::exit(1)
    });

    let state: Arc<dyn StateStore> = match &config.state_path {
        Some(path) => Arc::new(FileStateStore::open(path).await.unwrap_or_else(|e| {
            tracing::error!(message = "unable to open state file", path = %path.display(), error = %e);
            process::exit(1)
        })),
        None => {
            tracing::warn!(message = "no state_path configured, delivered readings are only remembered until exit");
            Arc::new(MemoryStateStore::new())
        }
    };

    let action = PullAction::new(Arc::new(client), Arc::new(sender), state);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        // Wait for either SIGTERM or SIGINT to shutdown
        tokio::select! {
            _ = sigterm() => {}
            _ = sigint() => {}
        }

        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    if opts.once {
        return match action.run_until(&config, shutdown_requested(shutdown_rx)).await {
            Ok(result) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                Ok(())
            }
            Err(e) => {
                tracing::error!(message = "pull run failed", error = %e);
                process::exit(1)
            }
        };
    }

    let mut registry = Registry::default();
    let metrics = PullMetrics::new(&mut registry);
    let refresh = Duration::from_secs(opts.refresh_secs);
    let poll_shutdown = shutdown_rx.clone();
    let api_url = opts.api_url.clone();

    let polling = tokio::spawn(async move {
        tracing::info!(
            message = "observation polling started",
            api_url = %api_url,
            integration_id = %config.integration_id,
        );

        poll(&action, &config, refresh, poll_shutdown, |res| match res {
            Ok(result) => {
                metrics.observe(&result, chrono::Utc::now().timestamp());
                tracing::info!(
                    message = "pull run completed",
                    observations_extracted = result.observations_extracted,
                    failed_locations = ?result.failed_locations,
                    note = ?result.message,
                );
            }
            Err(e) => {
                metrics.failure();
                tracing::error!(message = "pull run failed", error = %e);
            }
        })
        .await;

        tracing::info!("observation polling stopped");
    });

    let context = Arc::new(RequestContext::new(registry));
    let handler = openweather_connector::http::text_metrics(context);
    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(handler.into_make_service());

    tracing::info!(message = "server started", address = %server.local_addr());
    server
        .with_graceful_shutdown(shutdown_requested(shutdown_rx))
        .await?;

    tracing::info!("server shutdown");

    // Let a cancelled run report its partial result before exiting
    if let Err(e) = polling.await {
        tracing::error!(message = "observation polling task failed", error = %e);
    }

    Ok(())
}

/// Sections the connector can't run without, checked once at startup
fn required_sections(config: &IntegrationConfig) -> Result<(AuthConfig, DownstreamConfig), ConfigError> {
    let auth = config.auth_config()?.clone();
    config.pull_config()?.validate()?;
    let downstream = config.downstream_config()?.clone();
    Ok((auth, downstream))
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
