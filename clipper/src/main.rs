use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hls_tail::{HttpFetcher, install_rustls_provider};
use stream_clipper::config::Config;
use stream_clipper::logging;
use stream_clipper::orchestrator::{ClipEvent, Orchestrator};
use stream_clipper::persister::LocalFilePersister;
use stream_clipper::webhook;
use tmi_chat::TwitchChatTransport;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EVENT_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads its env fallbacks
    dotenvy::dotenv().ok();

    let config = Config::parse();
    config.validate()?;

    let _log_guard = logging::init_logging(&config.log_dir)?;
    install_rustls_provider();

    let shutdown = CancellationToken::new();
    logging::start_retention_cleanup(&config.log_dir, shutdown.clone());

    info!(
        channel = %config.channel,
        output_dir = %config.output_dir.display(),
        "stream-clipper starting"
    );

    let orchestrator_config = config.orchestrator_config();
    let client = orchestrator_config.poller.build_client()?;
    let fetcher = Arc::new(HttpFetcher::new(
        client.clone(),
        orchestrator_config.poller.request_timeout,
    ));

    let source = config.playlist_source(client)?;

    let mut chat = TwitchChatTransport::connect(&config.channel, config.chat_config())?;
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let orchestrator = Orchestrator::new(
        orchestrator_config,
        source,
        fetcher,
        Arc::new(LocalFilePersister::new(config.output_dir.clone())),
        Arc::new(chat.handle()),
    );

    let chat_forwarder = tokio::spawn({
        let events = events_tx.clone();
        let token = shutdown.clone();
        async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = chat.recv() => event,
                };
                let Some(event) = event else {
                    info!("Chat connection closed");
                    break;
                };
                if events.send(ClipEvent::from(event)).await.is_err() {
                    break;
                }
            }
            chat.shutdown().await;
        }
    });

    let router = webhook::router(&config.eventsub_secret, events_tx);
    let mut webhook_task = tokio::spawn(webhook::serve(config.bind, router, shutdown.clone()));
    let orchestrator_task = tokio::spawn(orchestrator.run(events_rx, shutdown.clone()));

    let webhook_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            None
        }
        result = &mut webhook_task => Some(result),
    };

    shutdown.cancel();
    let webhook_result = match webhook_result {
        Some(result) => result,
        None => webhook_task.await,
    };

    if let Err(e) = orchestrator_task.await {
        warn!(error = %e, "Orchestrator task ended abnormally");
    }
    if let Err(e) = chat_forwarder.await {
        warn!(error = %e, "Chat forwarder ended abnormally");
    }

    match webhook_result.context("webhook task panicked")? {
        Ok(()) => {
            info!("stream-clipper stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Webhook server failed");
            Err(e.into())
        }
    }
}
