mod config;
mod controller;
mod error;
mod events;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use common::{CatalogClient, MetadataClient};
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use controller::Controller;
use error::Result;
use events::LifecycleEvent;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let metadata = MetadataClient::new(&config.metadata_url, config.http_timeout())?;
    let catalog = CatalogClient::new(
        &config.consul_addr,
        config.consul_token.clone(),
        config.http_timeout(),
    )?;
    info!(
        "catalog {} metadata {} prefix {:?}",
        config.consul_addr, config.metadata_url, config.prefix
    );

    let mut controller = Controller::new(
        metadata,
        catalog,
        config.derivation(),
        config.settle_delay(),
    );

    loop {
        let docker = events::connect(config.docker_host.as_deref()).await?;
        let connected_at = chrono::Utc::now();
        controller.on_connect().await?;
        info!("controller {:?}", controller.state());

        let mut stream = Box::pin(events::subscribe(&docker, connected_at));
        let disconnected = loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(msg)) => {
                        if let Some(event) = LifecycleEvent::from_message(msg) {
                            controller.on_event(event).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("event stream error: {}", e);
                        break true;
                    }
                    None => break true,
                },
                _ = tokio::signal::ctrl_c() => break false,
            }
        };

        if !disconnected {
            info!("shutting down");
            controller.drain().await;
            return Ok(());
        }

        controller.on_disconnect();
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
