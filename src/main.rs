//! CLI for tidemq
//!
//! Subcommands:
//! - `server`: run a broker behind the WebSocket server
//! - `consume`: run a broker with the sample consumer registered
//! - `produce`: run the sample producer against a remote broker

use std::sync::Arc;

use clap::Parser;
use tidemq::broker::Broker;
use tidemq::client::{Producer, RemoteEndpoint};
use tidemq::config::{Settings, load_config};
use tidemq::samples::consumer;
use tidemq::samples::producer::SampleProducer;
use tidemq::transport::websocket::start_websocket_server;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tidemq")]
enum Command {
    /// Start a broker and its WebSocket server
    Server,
    /// Start a broker with the sample consumer listening on springboot-topic
    Consume,
    /// Send the sample messages to a running broker
    Produce {
        /// Broker WebSocket URL (defaults to producer.endpoint)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            tidemq::utils::logging::init("info");
            error!("Failed to load configuration: {e}");
            return;
        }
    };
    tidemq::utils::logging::init(&settings.logging.level);

    let outcome = match cmd {
        Command::Server => run_server(settings, false).await,
        Command::Consume => run_server(settings, true).await,
        Command::Produce { url } => run_producer(settings, url).await,
    };
    if let Err(e) = outcome {
        error!("tidemq failed: {e}");
    }
}

async fn run_server(settings: Settings, with_sample_consumer: bool) -> tidemq::Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let broker = Broker::open(&settings)?;

    let handle = if with_sample_consumer {
        Some(consumer::register(&broker)?)
    } else {
        None
    };

    tokio::select! {
        result = start_websocket_server(&addr, broker.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.shutdown();
    if let Some(handle) = handle {
        broker.unsubscribe(handle).await;
    }
    Ok(())
}

async fn run_producer(settings: Settings, url: Option<String>) -> tidemq::Result<()> {
    let url = url.unwrap_or_else(|| settings.producer.endpoint.clone());
    let endpoint = Arc::new(RemoteEndpoint::new(url));
    let producer = Producer::new(endpoint, &settings.producer);

    SampleProducer::new(producer).run_all().await?;

    // let the async and one-way sends drain before the runtime goes away
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    Ok(())
}
